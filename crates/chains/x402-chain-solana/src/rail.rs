//! Fee-split settlement of a verified payment.

use solana_pubkey::Pubkey;
use std::str::FromStr;
use tracing::Instrument;
use x402_types::proto::{FeeSplit, PaymentIntent};

use crate::chain::{Address, Confirmation, RetryPolicy, SolanaChainProviderLike};
use crate::transfer::{
    TransferError, TransferLeg, TransferPlan, build_transfer_instructions, compile_transaction,
};

/// Moves a payment out of the payer's token account in one transaction:
/// `recipientAmount` to the recipient, `feeAmount` to the facilitator.
///
/// The facilitator signs as the SPL delegate the payer approved for its token
/// account, and pays the network fee.
#[derive(Debug, Clone)]
pub struct SolanaRail<P> {
    provider: P,
    mint: Address,
    retry: RetryPolicy,
}

impl<P> SolanaRail<P> {
    pub fn new(provider: P, mint: Address) -> Self {
        Self {
            provider,
            mint,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn mint(&self) -> &Address {
        &self.mint
    }
}

impl<P: SolanaChainProviderLike + Sync> SolanaRail<P> {
    fn plan(&self, intent: &PaymentIntent, split: &FeeSplit) -> Result<TransferPlan, TransferError> {
        let mint = Address::parse_field(&intent.token_mint, "tokenMint")
            .map_err(TransferError::InvalidAddress)?;
        if mint != self.mint {
            return Err(TransferError::AssetMismatch {
                expected: self.mint,
                actual: intent.token_mint.clone(),
            });
        }
        let payer = parse_pubkey(&intent.payer, "payer")?;
        let recipient = parse_pubkey(&intent.recipient, "recipient")?;
        Ok(TransferPlan {
            mint: self.mint,
            payer,
            authority: self.provider.pubkey(),
            legs: vec![
                TransferLeg {
                    owner: recipient,
                    amount: split.recipient_amount,
                },
                TransferLeg {
                    owner: self.provider.pubkey(),
                    amount: split.fee_amount,
                },
            ],
        })
    }

    /// Submits the split transfer and waits for confirmation.
    ///
    /// The transaction is built and signed once, on a freshly fetched blockhash.
    /// Transport failures resend those same bytes under the rail's [`RetryPolicy`],
    /// so a payment can land at most once.
    pub async fn settle_split(
        &self,
        intent: &PaymentIntent,
        split: FeeSplit,
    ) -> Result<Confirmation, TransferError> {
        let span = tracing::info_span!(
            "solana_settle",
            otel.kind = "client",
            payment_id = %intent.payment_id,
            amount = split.amount,
            fee = split.fee_amount,
        );
        async {
            let plan = self.plan(intent, &split)?;
            let instructions = build_transfer_instructions(&self.provider, &plan).await?;
            let blockhash = self.provider.get_latest_blockhash().await?;
            let tx = compile_transaction(&self.provider.pubkey(), &instructions, blockhash)?;
            let tx = self.provider.sign(tx)?;
            let confirmation = self.retry.submit(&self.provider, &tx).await?;
            tracing::info!(
                signature = %confirmation.signature,
                slot = confirmation.slot,
                "Payment settled"
            );
            Ok(confirmation)
        }
        .instrument(span)
        .await
    }
}

fn parse_pubkey(value: &str, field: &str) -> Result<Pubkey, TransferError> {
    Pubkey::from_str(value).map_err(|_| TransferError::InvalidAddress(format!("Invalid {field} address: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SolanaChainProviderError;
    use crate::testing::{MockProvider, random_pubkey};
    use crate::transfer::{TransactionInt, TransferCheckedInstruction};
    use solana_signer::Signer;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use x402_types::proto::PlatformFeeBps;
    use x402_types::timestamp::UnixTimestamp;

    fn intent(provider: &MockProvider, payer: Pubkey, recipient: Pubkey) -> PaymentIntent {
        PaymentIntent {
            payment_id: "pay_1".into(),
            payer: payer.to_string(),
            recipient: recipient.to_string(),
            amount: "1000000".into(),
            token_mint: provider.mint().to_string(),
            agent_id: "pdf-summarizer-v1".into(),
            task_metadata: None,
            expires_at: UnixTimestamp::from_secs(u64::MAX),
            nonce: 1,
            payment_intent_signature: None,
        }
    }

    fn rail(provider: Arc<MockProvider>) -> SolanaRail<Arc<MockProvider>> {
        let mint = Address::new(provider.mint());
        SolanaRail::new(provider, mint).with_retry_policy(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
        ))
    }

    fn transfers(tx: &solana_transaction::versioned::VersionedTransaction) -> Vec<TransferCheckedInstruction> {
        let tx = TransactionInt::new(tx.clone());
        (0..tx.instructions_len())
            .filter_map(|i| tx.instruction(i).ok()?.transfer_checked().ok())
            .collect()
    }

    #[tokio::test]
    async fn splits_fee_and_recipient_amount() {
        let provider = Arc::new(MockProvider::new());
        let payer = random_pubkey();
        let recipient = random_pubkey();
        provider.add_token_account(&payer);
        provider.add_token_account(&recipient);
        provider.add_token_account(&provider.pubkey());

        let split = FeeSplit::compute(1_000_000, PlatformFeeBps::default());
        let confirmation = rail(provider.clone())
            .settle_split(&intent(&provider, payer, recipient), split)
            .await
            .unwrap();
        assert_eq!(confirmation.slot, 1_000);

        let sent = provider.last_sent().unwrap();
        assert!(TransactionInt::new(sent.clone()).is_fully_signed());
        let amounts: Vec<u64> = transfers(&sent).iter().map(|t| t.amount).collect();
        assert_eq!(amounts, vec![950_000, 50_000]);
        assert!(transfers(&sent).iter().all(|t| t.authority == provider.pubkey()));
    }

    fn funded_intent(provider: &MockProvider) -> PaymentIntent {
        let payer = random_pubkey();
        provider.add_token_account(&payer);
        intent(provider, payer, random_pubkey())
    }

    fn small_split() -> FeeSplit {
        FeeSplit::compute(1_000, PlatformFeeBps::new(0).unwrap())
    }

    #[tokio::test]
    async fn resends_the_same_transaction_after_transport_errors() {
        let provider = Arc::new(MockProvider::new());
        provider.transport_failures.store(2, Ordering::SeqCst);

        rail(provider.clone())
            .settle_split(&funded_intent(&provider), small_split())
            .await
            .unwrap();
        assert_eq!(provider.sent_count(), 1);
        assert_eq!(provider.blockhashes_fetched(), 1);
        let sent = provider.last_sent().unwrap();
        assert_eq!(*sent.message.recent_blockhash(), solana_message::Hash::new_from_array([1; 32]));
        assert_eq!(transfers(&sent).len(), 1);
    }

    #[tokio::test]
    async fn lost_send_response_is_not_paid_twice() {
        let provider = Arc::new(MockProvider::new());
        provider.lost_acks.store(1, Ordering::SeqCst);

        let confirmation = rail(provider.clone())
            .settle_split(&funded_intent(&provider), small_split())
            .await
            .unwrap();
        assert_eq!(provider.sent_count(), 1);
        assert_eq!(provider.last_sent().unwrap().signatures[0], confirmation.signature);
    }

    #[tokio::test]
    async fn confirmation_failure_after_send_is_not_rebuilt() {
        let provider = Arc::new(MockProvider::new());
        provider.confirm_failures.store(1, Ordering::SeqCst);

        let err = rail(provider.clone())
            .settle_split(&funded_intent(&provider), small_split())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Provider(SolanaChainProviderError::Transport(_))
        ));
        assert_eq!(provider.sent_count(), 1);
        assert_eq!(provider.blockhashes_fetched(), 1);
    }

    #[tokio::test]
    async fn confirmation_timeout_after_send_is_final() {
        let provider = Arc::new(MockProvider::new());
        provider.unconfirmed.store(true, Ordering::SeqCst);

        let err = rail(provider.clone())
            .settle_split(&funded_intent(&provider), small_split())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Provider(SolanaChainProviderError::Timeout(_))
        ));
        assert_eq!(provider.sent_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_sends_wait_for_the_signature_instead_of_rebuilding() {
        let provider = Arc::new(MockProvider::new());
        provider.transport_failures.store(5, Ordering::SeqCst);

        let err = rail(provider.clone())
            .settle_split(&funded_intent(&provider), small_split())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Provider(SolanaChainProviderError::Timeout(_))
        ));
        assert_eq!(provider.sent_count(), 0);
        assert_eq!(provider.blockhashes_fetched(), 1);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let provider = Arc::new(MockProvider::new());
        let payer = random_pubkey();
        provider.add_token_account(&payer);
        provider.reject.store(true, Ordering::SeqCst);

        let split = FeeSplit::compute(1_000, PlatformFeeBps::default());
        let err = rail(provider.clone())
            .settle_split(&intent(&provider, payer, random_pubkey()), split)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Provider(SolanaChainProviderError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn other_mints_are_refused() {
        let provider = Arc::new(MockProvider::new());
        let mut intent = intent(&provider, random_pubkey(), random_pubkey());
        intent.token_mint = random_pubkey().to_string();
        let err = rail(provider.clone())
            .settle_split(&intent, FeeSplit::compute(1, PlatformFeeBps::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::AssetMismatch { .. }));
        assert_eq!(provider.sent_count(), 0);
    }
}
