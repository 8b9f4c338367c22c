//! Fee sponsorship: the payer authorizes a payment, the facilitator pays the network fee.
//!
//! Two flows share the same checks:
//!
//! - [`GaslessSponsorshipEngine::build_and_submit`]: the payer signed only the
//!   payment intent. The facilitator builds the transfer as the payer's SPL delegate
//!   and submits it as fee payer.
//! - [`GaslessSponsorshipEngine::create_pre_signed`] /
//!   [`GaslessSponsorshipEngine::execute_pre_signed`]: the payer signs the transfer
//!   transaction offline; the facilitator checks it, co-signs as fee payer, and
//!   submits it later.

use serde::{Deserialize, Serialize};
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Instrument;
use x402_types::proto::{Features, PaymentError, PaymentIntent, PaymentPayload};

use crate::chain::{
    Address, Confirmation, RetryPolicy, SolanaChainProviderError, SolanaChainProviderLike,
};
use crate::transfer::{
    ExpectedTransfer, TransactionInt, TransferError, TransferLeg, TransferPlan,
    build_transfer_instructions, compile_transaction,
};

/// Fee charged for a single-signature transaction when the cluster can not quote one.
pub const DEFAULT_FEE_LAMPORTS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GaslessConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Highest network fee the facilitator pays for one transaction.
    #[serde(default = "gasless_config::default_max_sponsored_fee_lamports")]
    pub max_sponsored_fee_lamports: u64,
    /// Cumulative cap on sponsored fees for the life of the process.
    #[serde(default)]
    pub sponsorship_budget_lamports: Option<u64>,
    /// Balance the facilitator keeps for itself; sponsorship stops below it.
    #[serde(default = "gasless_config::default_min_reserve_lamports")]
    pub min_reserve_lamports: u64,
}

mod gasless_config {
    pub fn default_max_sponsored_fee_lamports() -> u64 {
        1_000_000
    }

    pub fn default_min_reserve_lamports() -> u64 {
        10_000_000
    }
}

impl Default for GaslessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_sponsored_fee_lamports: gasless_config::default_max_sponsored_fee_lamports(),
            sponsorship_budget_lamports: None,
            min_reserve_lamports: gasless_config::default_min_reserve_lamports(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GaslessReceipt {
    pub signature: String,
    pub slot: u64,
    pub gas_paid_by_facilitator: u64,
    pub user_gas_cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub estimated_fee: u64,
    pub can_sponsor: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Success,
    Failed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusReport {
    pub status: TransactionStatus,
    pub confirmations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorStats {
    pub balance: u64,
    pub total_transactions_sponsored: u64,
    pub total_gas_sponsored: u64,
    pub average_gas_per_transaction: u64,
}

#[derive(Debug, Default)]
struct SponsorshipTotals {
    transactions: AtomicU64,
    gas: AtomicU64,
    /// Fees reserved against the budget, settled or in flight.
    reserved: AtomicU64,
}

pub struct GaslessSponsorshipEngine<P> {
    provider: P,
    mint: Address,
    config: GaslessConfig,
    retry: RetryPolicy,
    totals: SponsorshipTotals,
}

impl<P> GaslessSponsorshipEngine<P> {
    pub fn new(provider: P, mint: Address, config: GaslessConfig) -> Self {
        Self {
            provider,
            mint,
            config,
            retry: RetryPolicy::default(),
            totals: SponsorshipTotals::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &GaslessConfig {
        &self.config
    }

    /// Reserves `fee` against the cumulative budget with a single atomic update.
    fn reserve(&self, fee: u64) -> Result<(), PaymentError> {
        let Some(budget) = self.config.sponsorship_budget_lamports else {
            return Ok(());
        };
        self.totals
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |reserved| {
                reserved.checked_add(fee).filter(|total| *total <= budget)
            })
            .map(|_| ())
            .map_err(|reserved| {
                PaymentError::SponsorshipLimitExceeded(format!(
                    "sponsorship budget of {budget} lamports exhausted ({reserved} reserved)"
                ))
            })
    }

    fn release(&self, fee: u64) {
        if self.config.sponsorship_budget_lamports.is_some() {
            self.totals.reserved.fetch_sub(fee, Ordering::SeqCst);
        }
    }

    fn record(&self, fee: u64) {
        self.totals.transactions.fetch_add(1, Ordering::SeqCst);
        self.totals.gas.fetch_add(fee, Ordering::SeqCst);
    }
}

impl<P: SolanaChainProviderLike + Sync> GaslessSponsorshipEngine<P> {
    /// Checks the payload may be sponsored and returns its amount.
    pub fn validate(&self, payload: &PaymentPayload) -> Result<u64, PaymentError> {
        let mut errors = Vec::new();
        if !self.config.enabled {
            errors.push("Gasless sponsorship is disabled".to_string());
        }
        match &payload.features {
            Features::Gasless { facilitator } if facilitator.is_empty() => {
                errors.push("Gasless payment must name a facilitator".to_string())
            }
            Features::Gasless { facilitator } => {
                let ours = self.provider.pubkey().to_string();
                if *facilitator != ours {
                    errors.push(format!(
                        "Gasless payment names facilitator {facilitator}, this facilitator is {ours}"
                    ));
                }
            }
            _ => errors.push("Payment is not marked gasless".to_string()),
        }
        let amount = payload.payload.amount_value();
        if amount.is_none() {
            errors.push("Invalid amount".to_string());
        }
        match amount {
            Some(amount) if errors.is_empty() => Ok(amount),
            _ => Err(PaymentError::Validation(errors)),
        }
    }

    /// Fails unless the facilitator holds at least its operating reserve.
    pub async fn check_facilitator_balance(&self) -> Result<u64, PaymentError> {
        let balance = self
            .provider
            .get_balance(&self.provider.pubkey())
            .await
            .map_err(|e| PaymentError::Settlement(e.to_string()))?;
        let required = self.config.min_reserve_lamports;
        if balance < required {
            tracing::warn!(balance, required, "Facilitator balance below sponsorship reserve");
            return Err(PaymentError::InsufficientSponsorBalance { balance, required });
        }
        Ok(balance)
    }

    fn plan(&self, intent: &PaymentIntent, amount: u64, authority: Option<Pubkey>) -> Result<TransferPlan, PaymentError> {
        let mint = Address::parse_field(&intent.token_mint, "tokenMint")
            .map_err(|e| PaymentError::Validation(vec![e]))?;
        if mint != self.mint {
            return Err(TransferError::AssetMismatch {
                expected: self.mint,
                actual: intent.token_mint.clone(),
            }
            .into());
        }
        let payer = parse_pubkey(&intent.payer, "payer")?;
        let recipient = parse_pubkey(&intent.recipient, "recipient")?;
        Ok(TransferPlan {
            mint,
            payer,
            authority: authority.unwrap_or(payer),
            legs: vec![TransferLeg {
                owner: recipient,
                amount,
            }],
        })
    }

    /// Quotes the network fee of a sponsored transfer.
    ///
    /// Never fails: problems are reported through `canSponsor` and `reason`.
    pub async fn estimate_gas_cost(&self, payload: &PaymentPayload) -> GasEstimate {
        let amount = match self.validate(payload) {
            Ok(amount) => amount,
            Err(e) => {
                return GasEstimate {
                    estimated_fee: DEFAULT_FEE_LAMPORTS,
                    can_sponsor: false,
                    reason: Some(e.to_string()),
                };
            }
        };
        let estimated_fee = match self.quote(&payload.payload, amount).await {
            Ok(fee) => fee,
            Err(e) => {
                tracing::debug!(error = %e, "Fee quote failed, using default");
                DEFAULT_FEE_LAMPORTS
            }
        };
        let reason = if estimated_fee > self.config.max_sponsored_fee_lamports {
            Some(format!(
                "Estimated fee {estimated_fee} exceeds the sponsorship cap of {}",
                self.config.max_sponsored_fee_lamports
            ))
        } else if let Err(e) = self.check_facilitator_balance().await {
            Some(e.to_string())
        } else {
            None
        };
        GasEstimate {
            estimated_fee,
            can_sponsor: reason.is_none(),
            reason,
        }
    }

    async fn quote(&self, intent: &PaymentIntent, amount: u64) -> Result<u64, PaymentError> {
        let plan = self.plan(intent, amount, Some(self.provider.pubkey()))?;
        let instructions = build_transfer_instructions(&self.provider, &plan).await?;
        let blockhash = self
            .provider
            .get_latest_blockhash()
            .await
            .map_err(TransferError::from)?;
        let tx = compile_transaction(&self.provider.pubkey(), &instructions, blockhash)?;
        self.fee_for(&TransactionInt::new(tx)).await
    }

    async fn fee_for(&self, tx: &TransactionInt) -> Result<u64, PaymentError> {
        let solana_message::VersionedMessage::V0(message) = &tx.inner().message else {
            return Err(PaymentError::Validation(vec![
                "Only versioned (v0) transactions are sponsored".to_string(),
            ]));
        };
        self.provider
            .get_fee_for_message(message)
            .await
            .map_err(|e| PaymentError::Settlement(e.to_string()))
    }

    fn check_fee_cap(&self, fee: u64) -> Result<(), PaymentError> {
        if fee > self.config.max_sponsored_fee_lamports {
            return Err(PaymentError::SponsorshipLimitExceeded(format!(
                "fee of {fee} lamports exceeds the per-transaction cap of {}",
                self.config.max_sponsored_fee_lamports
            )));
        }
        Ok(())
    }

    /// Builds the transfer with the facilitator as delegate and fee payer, then submits it.
    pub async fn build_and_submit(&self, payload: &PaymentPayload) -> Result<GaslessReceipt, PaymentError> {
        let span = tracing::info_span!(
            "gasless_submit",
            otel.kind = "client",
            payment_id = %payload.payload.payment_id,
        );
        async {
            let amount = self.validate(payload)?;
            self.check_facilitator_balance().await?;
            let facilitator = self.provider.pubkey();
            let plan = self.plan(&payload.payload, amount, Some(facilitator))?;
            let instructions = build_transfer_instructions(&self.provider, &plan).await?;

            let blockhash = self
                .provider
                .get_latest_blockhash()
                .await
                .map_err(TransferError::from)?;
            let tx = TransactionInt::new(compile_transaction(&facilitator, &instructions, blockhash)?);
            let fee = self.fee_for(&tx).await?;
            self.check_fee_cap(fee)?;
            self.reserve(fee)?;

            let signed = match tx.sign(&self.provider) {
                Ok(tx) => tx.into_inner(),
                Err(e) => {
                    self.release(fee);
                    return Err(e.into());
                }
            };
            let result = self.retry.submit(&self.provider, &signed).await;
            self.finish(result, fee)
        }
        .instrument(span)
        .await
    }

    /// Builds a transfer with the payer as authority and the facilitator as fee payer,
    /// signed by the payer only. Needs no signature from the facilitator.
    pub async fn create_pre_signed<S: Signer>(
        &self,
        payload: &PaymentPayload,
        payer: &S,
    ) -> Result<String, PaymentError> {
        let amount = self.validate(payload)?;
        let plan = self.plan(&payload.payload, amount, None)?;
        if plan.payer != payer.pubkey() {
            return Err(PaymentError::Validation(vec![
                "Signer does not match the payment's payer".to_string(),
            ]));
        }
        let instructions = build_transfer_instructions(&self.provider, &plan).await?;
        let blockhash = self
            .provider
            .get_latest_blockhash()
            .await
            .map_err(TransferError::from)?;
        let tx = compile_transaction(&self.provider.pubkey(), &instructions, blockhash)?;
        let tx = TransactionInt::new(tx).sign_with_keypair(payer)?;
        Ok(tx.as_base64()?)
    }

    /// Checks a payer-signed transfer against the payment, co-signs it as fee payer,
    /// and submits it.
    ///
    /// The payer's blockhash is kept, so the transaction must be executed before it
    /// expires on the cluster.
    pub async fn execute_pre_signed(
        &self,
        serialized: &str,
        payload: &PaymentPayload,
    ) -> Result<GaslessReceipt, PaymentError> {
        let span = tracing::info_span!(
            "gasless_execute_presigned",
            otel.kind = "client",
            payment_id = %payload.payload.payment_id,
        );
        async {
            let amount = self.validate(payload)?;
            let plan = self.plan(&payload.payload, amount, None)?;
            let recipient = parse_pubkey(&payload.payload.recipient, "recipient")?;
            let tx = TransactionInt::from_base64(serialized)?;
            let facilitator = self.provider.pubkey();
            tx.verify_sponsored_transfer(
                &facilitator,
                &ExpectedTransfer {
                    payer: plan.payer,
                    recipient,
                    mint: *self.mint.pubkey(),
                    amount,
                },
            )?;
            self.check_facilitator_balance().await?;
            let fee = self.fee_for(&tx).await?;
            self.check_fee_cap(fee)?;
            self.reserve(fee)?;

            let tx = match tx.sign(&self.provider) {
                Ok(tx) => tx,
                Err(e) => {
                    self.release(fee);
                    return Err(e.into());
                }
            };
            let result = self.retry.submit(&self.provider, &tx.into_inner()).await;
            self.finish(result, fee)
        }
        .instrument(span)
        .await
    }

    fn finish(
        &self,
        result: Result<Confirmation, SolanaChainProviderError>,
        fee: u64,
    ) -> Result<GaslessReceipt, PaymentError> {
        match result {
            Ok(confirmation) => {
                self.record(fee);
                tracing::info!(
                    signature = %confirmation.signature,
                    slot = confirmation.slot,
                    fee,
                    "Sponsored transaction confirmed"
                );
                Ok(GaslessReceipt {
                    signature: confirmation.signature.to_string(),
                    slot: confirmation.slot,
                    gas_paid_by_facilitator: fee,
                    user_gas_cost: 0,
                })
            }
            Err(e) => {
                // A transaction that may still land keeps its fee reserved.
                if !matches!(e, SolanaChainProviderError::Timeout(_)) {
                    self.release(fee);
                }
                tracing::warn!(error = %e, "Sponsored transaction failed");
                Err(PaymentError::Settlement(e.to_string()))
            }
        }
    }

    pub async fn get_transaction_status(&self, signature: &str) -> TransactionStatusReport {
        let failed = |error: String| TransactionStatusReport {
            status: TransactionStatus::Failed,
            confirmations: 0,
            slot: None,
            error: Some(error),
        };
        let signature = match Signature::from_str(signature) {
            Ok(signature) => signature,
            Err(_) => return failed(format!("Invalid transaction signature: {signature}")),
        };
        match self.provider.get_signature_status(&signature).await {
            Ok(None) => TransactionStatusReport {
                status: TransactionStatus::Pending,
                confirmations: 0,
                slot: None,
                error: None,
            },
            Ok(Some(status)) => TransactionStatusReport {
                status: if status.error.is_some() {
                    TransactionStatus::Failed
                } else {
                    TransactionStatus::Success
                },
                confirmations: status.confirmations.unwrap_or(0) as u64,
                slot: Some(status.slot),
                error: status.error,
            },
            Err(e) => failed(e.to_string()),
        }
    }

    pub async fn get_facilitator_stats(&self) -> Result<FacilitatorStats, PaymentError> {
        let balance = self
            .provider
            .get_balance(&self.provider.pubkey())
            .await
            .map_err(|e| PaymentError::Settlement(e.to_string()))?;
        let transactions = self.totals.transactions.load(Ordering::SeqCst);
        let gas = self.totals.gas.load(Ordering::SeqCst);
        Ok(FacilitatorStats {
            balance,
            total_transactions_sponsored: transactions,
            total_gas_sponsored: gas,
            average_gas_per_transaction: gas.checked_div(transactions).unwrap_or(0),
        })
    }
}

fn parse_pubkey(value: &str, field: &str) -> Result<Pubkey, PaymentError> {
    Address::parse_field(value, field)
        .map(Pubkey::from)
        .map_err(|e| PaymentError::Validation(vec![e]))
}
