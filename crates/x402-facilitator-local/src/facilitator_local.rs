//! The settlement engine behind the facilitator's `/verify` and `/settle` endpoints.
//!
//! [`FacilitatorLocal`] decodes and authenticates payment payloads, claims each
//! `paymentId` in a [`SettlementStore`] before touching the rail, then moves the
//! funds through a [`SettlementRail`]. Without a rail the engine runs in demo mode
//! and answers with synthetic receipts.
//!
//! A payload whose `taskMetadata.invoiceId` names a ledger invoice must pay that
//! invoice exactly: same amount, agent and recipient.
//!
//! ```ignore
//! use x402_facilitator_local::{FacilitatorLocal, SettlementConfig};
//! use x402_facilitator_local::store::InMemorySettlementStore;
//!
//! let rail = SolanaRail::new(provider, mint);
//! let facilitator = FacilitatorLocal::new(Some(rail), Box::new(InMemorySettlementStore::new()), &config);
//! let receipt = facilitator.settle_payment(&x_payment_header).await?;
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::instrument;
use x402_chain_solana::chain::SolanaChainProviderLike;
use x402_chain_solana::rail::SolanaRail;
use x402_types::facilitator::Facilitator;
use x402_types::ledger::{InvoiceStatus, Ledger};
use x402_types::proto::{
    Features, FeeSplit, PaymentError, PaymentIntent, PaymentPayload, PlatformFeeBps,
    SettleReceipt, SettlementMode, SignatureError, VerifiedPayment,
};
use x402_types::signing::verify_intent_signature;
use x402_types::timestamp::UnixTimestamp;
use x402_types::validator::PayloadValidator;

use crate::store::{SettlementStatus, SettlementStore, StoreConfig, StoreError};

/// Base of the synthetic slot numbers reported in demo mode.
const DEMO_SLOT_BASE: u64 = 280_000_000;

/// A confirmed rail transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailReceipt {
    pub signature: String,
    pub slot: u64,
}

/// Moves a verified payment, split between recipient and platform.
pub trait SettlementRail: Send + Sync {
    fn submit(
        &self,
        intent: &PaymentIntent,
        split: FeeSplit,
    ) -> impl Future<Output = Result<RailReceipt, PaymentError>> + Send;
}

impl<P: SolanaChainProviderLike + Send + Sync> SettlementRail for SolanaRail<P> {
    async fn submit(&self, intent: &PaymentIntent, split: FeeSplit) -> Result<RailReceipt, PaymentError> {
        let confirmation = self.settle_split(intent, split).await?;
        Ok(RailReceipt {
            signature: confirmation.signature.to_string(),
            slot: confirmation.slot,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementConfig {
    /// `FACILITATOR_FEE_BPS` when unset, then 500.
    #[serde(default = "settlement_defaults::platform_fee_bps")]
    pub platform_fee_bps: PlatformFeeBps,
    /// Accept intents that carry no payer signature.
    ///
    /// With this on, anyone who knows a payer address can trigger settlement
    /// against the delegation that payer granted. Development only.
    #[serde(default)]
    pub allow_unsigned_intents: bool,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            platform_fee_bps: settlement_defaults::platform_fee_bps(),
            allow_unsigned_intents: false,
            store: StoreConfig::default(),
        }
    }
}

mod settlement_defaults {
    use x402_types::proto::PlatformFeeBps;

    pub fn platform_fee_bps() -> PlatformFeeBps {
        let Ok(raw) = std::env::var("FACILITATOR_FEE_BPS") else {
            return PlatformFeeBps::default();
        };
        match raw.trim().parse::<u16>().ok().and_then(PlatformFeeBps::new) {
            Some(bps) => bps,
            None => {
                tracing::warn!(value = %raw, "Ignoring FACILITATOR_FEE_BPS outside 0..=10000");
                PlatformFeeBps::default()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportedStatus {
    Pending,
    Settled,
    Failed,
    Unknown,
}

impl From<SettlementStatus> for ReportedStatus {
    fn from(status: SettlementStatus) -> Self {
        match status {
            SettlementStatus::Pending => ReportedStatus::Pending,
            SettlementStatus::Settled => ReportedStatus::Settled,
            SettlementStatus::Failed => ReportedStatus::Failed,
        }
    }
}

/// Answer to `GET /settle/{paymentId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementStatusReport {
    pub payment_id: String,
    pub status: ReportedStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SettlementMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub demo_mode: bool,
}

pub struct FacilitatorLocal<R> {
    validator: PayloadValidator,
    rail: Option<R>,
    store: Arc<dyn SettlementStore>,
    ledger: Option<Arc<dyn Ledger>>,
    fee_bps: PlatformFeeBps,
    allow_unsigned_intents: bool,
}

impl<R> FacilitatorLocal<R> {
    /// `rail: None` selects demo mode.
    pub fn new(rail: Option<R>, store: Box<dyn SettlementStore>, config: &SettlementConfig) -> Self {
        if rail.is_none() {
            tracing::warn!("No facilitator key configured, settlements run in DEMO mode and move no funds");
        }
        if config.allow_unsigned_intents {
            tracing::warn!("Unsigned payment intents are accepted");
        }
        Self {
            validator: PayloadValidator::default(),
            rail,
            store: Arc::from(store),
            ledger: None,
            fee_bps: config.platform_fee_bps,
            allow_unsigned_intents: config.allow_unsigned_intents,
        }
    }

    /// Records settlements that reference an invoice on `ledger`.
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn mode(&self) -> SettlementMode {
        if self.rail.is_some() {
            SettlementMode::Real
        } else {
            SettlementMode::Demo
        }
    }

    pub fn is_demo(&self) -> bool {
        self.rail.is_none()
    }

    pub fn rail(&self) -> Option<&R> {
        self.rail.as_ref()
    }

    pub fn fee_bps(&self) -> PlatformFeeBps {
        self.fee_bps
    }

    /// Checks a decoded payload: envelope, then expiry, then every remaining field,
    /// then the payer signature, then multi-signature approval.
    pub fn verify_payload(
        &self,
        payload: &PaymentPayload,
        now: UnixTimestamp,
    ) -> Result<VerifiedPayment, PaymentError> {
        let envelope = self.validator.envelope_errors(payload);
        if !envelope.is_empty() {
            return Err(PaymentError::Validation(envelope));
        }
        if PayloadValidator::is_expired_at(payload, now) {
            return Err(PaymentError::Expired);
        }
        self.validator.validate_at(payload, now).into_result()?;
        let intent = payload.intent();
        match verify_intent_signature(intent) {
            Ok(()) => {}
            Err(SignatureError::Missing) if self.allow_unsigned_intents => {
                tracing::debug!(payment_id = %intent.payment_id, "Accepting unsigned intent");
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(multi_sig) = payload.features.multi_sig() {
            multi_sig.require_approval(intent, now)?;
        }
        Ok(VerifiedPayment::from_intent(intent))
    }

    /// Decodes and verifies an `X-PAYMENT` value, returning the payload.
    pub fn verify_encoded(&self, encoded: &str, now: UnixTimestamp) -> Result<PaymentPayload, PaymentError> {
        let payload = PaymentPayload::decode(encoded)?;
        self.verify_payload(&payload, now)?;
        Ok(payload)
    }

    #[instrument(skip_all, err)]
    pub fn verify_payment(&self, encoded: &str) -> Result<VerifiedPayment, PaymentError> {
        let payload = self.verify_encoded(encoded, UnixTimestamp::now())?;
        Ok(VerifiedPayment::from_intent(payload.intent()))
    }

    /// Runs a store call on the blocking pool.
    async fn with_store<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        F: FnOnce(&dyn SettlementStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || call(store.as_ref())).await?
    }

    pub async fn settlement_status(&self, payment_id: &str) -> Result<SettlementStatusReport, StoreError> {
        let demo_mode = self.is_demo();
        let id = payment_id.to_string();
        let report = match self.with_store(move |store| store.get(&id)).await? {
            Some(record) => SettlementStatusReport {
                payment_id: record.payment_id,
                status: record.status.into(),
                mode: record.mode,
                tx_signature: record.tx_signature,
                slot: record.slot,
                error: record.error,
                demo_mode,
            },
            None => SettlementStatusReport {
                payment_id: payment_id.to_string(),
                status: ReportedStatus::Unknown,
                mode: None,
                tx_signature: None,
                slot: None,
                error: None,
                demo_mode,
            },
        };
        Ok(report)
    }

    /// Verifies `encoded`, claims its `paymentId`, and hands the payload to `submit`.
    ///
    /// `submit` returns the receipt plus whatever else its rail reports. The outcome
    /// is written back to the store. A failed attempt keeps the `paymentId` consumed,
    /// a rejection raised before anything was signed releases it.
    pub async fn settle_via<F, Fut, T>(
        &self,
        encoded: &str,
        submit: F,
    ) -> Result<(SettleReceipt, T), PaymentError>
    where
        F: FnOnce(PaymentPayload) -> Fut,
        Fut: Future<Output = Result<(SettleReceipt, T), PaymentError>>,
    {
        let now = UnixTimestamp::now();
        let payload = self.verify_encoded(encoded, now)?;
        let intent = payload.payload.clone();
        self.check_invoice(&intent, now).await?;
        let payment_id = intent.payment_id.clone();

        let id = payment_id.clone();
        let claimed = self
            .with_store(move |store| store.claim(&id, now))
            .await
            .map_err(|e| PaymentError::Settlement(e.to_string()))?;
        if !claimed {
            tracing::warn!(payment_id = %payment_id, "Duplicate settlement rejected");
            return Err(PaymentError::DuplicateSettlement(payment_id));
        }

        match submit(payload).await {
            Ok((receipt, extra)) => {
                let settled = receipt.clone();
                let recorded = self
                    .with_store(move |store| store.complete(&settled, UnixTimestamp::now()))
                    .await;
                if let Err(e) = recorded {
                    tracing::error!(payment_id = %payment_id, error = %e, "Failed to record settlement");
                }
                self.record_on_ledger(&intent, &receipt).await;
                Ok((receipt, extra))
            }
            Err(error) if error.is_rejection() => {
                tracing::info!(payment_id = %payment_id, error = %error, "Settlement rejected before submission");
                let id = payment_id.clone();
                if let Err(e) = self.with_store(move |store| store.release(&id)).await {
                    tracing::error!(payment_id = %payment_id, error = %e, "Failed to release settlement claim");
                }
                Err(error)
            }
            Err(error) => {
                let (id, message) = (payment_id.clone(), error.to_string());
                let recorded = self
                    .with_store(move |store| store.fail(&id, &message, UnixTimestamp::now()))
                    .await;
                if let Err(e) = recorded {
                    tracing::error!(payment_id = %payment_id, error = %e, "Failed to record settlement failure");
                }
                Err(error)
            }
        }
    }

    /// Refuses an intent that does not pay the invoice named in its metadata.
    async fn check_invoice(&self, intent: &PaymentIntent, now: UnixTimestamp) -> Result<(), PaymentError> {
        let (Some(ledger), Some(invoice_id)) = (&self.ledger, intent.metadata_str("invoiceId")) else {
            return Ok(());
        };
        let invoice = ledger
            .get_invoice(invoice_id)
            .await
            .map_err(|e| PaymentError::Settlement(e.to_string()))?
            .ok_or_else(|| PaymentError::Validation(vec![format!("Unknown invoice {invoice_id}")]))?;
        let mut errors = Vec::new();
        if invoice.status == InvoiceStatus::Paid {
            errors.push(format!("Invoice {invoice_id} is already paid"));
        }
        if invoice.expires_at.is_before(now) {
            errors.push(format!("Invoice {invoice_id} has expired"));
        }
        if intent.amount_value() != Some(invoice.amount) {
            errors.push(format!(
                "Amount {} does not match invoice amount {}",
                intent.amount, invoice.amount
            ));
        }
        if intent.agent_id != invoice.agent_id {
            errors.push(format!(
                "Agent {} does not match invoice agent {}",
                intent.agent_id, invoice.agent_id
            ));
        }
        if intent.recipient != invoice.recipient {
            errors.push(format!(
                "Recipient {} does not match invoice recipient {}",
                intent.recipient, invoice.recipient
            ));
        }
        if errors.is_empty() {
            return Ok(());
        }
        tracing::warn!(invoice_id, payment_id = %intent.payment_id, "Payment does not match its invoice");
        Err(PaymentError::Validation(errors))
    }

    async fn record_on_ledger(&self, intent: &PaymentIntent, receipt: &SettleReceipt) {
        let (Some(ledger), Some(invoice_id)) = (&self.ledger, intent.metadata_str("invoiceId")) else {
            return;
        };
        let record = match ledger.settle_payment(invoice_id, &receipt.tx_signature).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(invoice_id, error = %e, "Ledger did not accept settlement");
                return;
            }
        };
        match ledger.verify_payment(&record).await {
            Ok(true) => tracing::debug!(invoice_id, "Payment escrowed"),
            Ok(false) => tracing::warn!(invoice_id, "Ledger reports payment not escrowed"),
            Err(e) => tracing::warn!(invoice_id, error = %e, "Ledger escrow check failed"),
        }
    }
}

impl<R: SettlementRail> FacilitatorLocal<R> {
    #[instrument(skip_all, err)]
    pub async fn settle_payment(&self, encoded: &str) -> Result<SettleReceipt, PaymentError> {
        let (receipt, ()) = self
            .settle_via(encoded, |payload| async move { Ok((self.submit(payload).await?, ())) })
            .await?;
        Ok(receipt)
    }

    async fn submit(&self, payload: PaymentPayload) -> Result<SettleReceipt, PaymentError> {
        if let Features::Gasless { .. } = payload.features {
            return Err(PaymentError::Validation(vec![
                "Gasless payments settle through /gasless/execute".to_string(),
            ]));
        }
        let intent = payload.intent();
        let Some(rail) = &self.rail else {
            return Ok(demo_receipt(intent));
        };
        let amount = intent
            .amount_value()
            .ok_or_else(|| PaymentError::Validation(vec!["Invalid amount".to_string()]))?;
        let split = FeeSplit::compute(amount, self.fee_bps);
        let confirmed = rail.submit(intent, split).await?;
        tracing::info!(
            payment_id = %intent.payment_id,
            tx = %confirmed.signature,
            fee = split.fee_amount,
            recipient_amount = split.recipient_amount,
            "Payment settled"
        );
        Ok(SettleReceipt {
            payment_id: intent.payment_id.clone(),
            mode: SettlementMode::Real,
            tx_signature: confirmed.signature,
            slot: confirmed.slot,
            fee_amount: Some(split.fee_amount.to_string()),
            recipient_amount: Some(split.recipient_amount.to_string()),
            settled_at: chrono::Utc::now(),
        })
    }
}

fn demo_receipt(intent: &PaymentIntent) -> SettleReceipt {
    let mut rng = rand::rng();
    let mut signature = [0u8; 64];
    rng.fill(&mut signature[..]);
    let receipt = SettleReceipt {
        payment_id: intent.payment_id.clone(),
        mode: SettlementMode::Demo,
        tx_signature: bs58::encode(signature).into_string(),
        slot: DEMO_SLOT_BASE + rng.random_range(0..1_000_000),
        fee_amount: None,
        recipient_amount: None,
        settled_at: chrono::Utc::now(),
    };
    tracing::warn!(
        payment_id = %intent.payment_id,
        tx = %receipt.tx_signature,
        "DEMO settlement, no funds moved"
    );
    receipt
}

impl<R: SettlementRail> Facilitator for FacilitatorLocal<R> {
    type Error = PaymentError;

    async fn verify(&self, payment: &str) -> Result<VerifiedPayment, Self::Error> {
        self.verify_payment(payment)
    }

    async fn settle(&self, payment: &str) -> Result<SettleReceipt, Self::Error> {
        self.settle_payment(payment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::store::InMemorySettlementStore;
    use ed25519_dalek::SigningKey;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use x402_types::codec::CreatePaymentParams;
    use x402_types::ledger::PaymentStatus;
    use x402_types::proto::{Features, MultiSigConfig, Network};
    use x402_types::signing::public_key_base58;

    const RECIPIENT: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";
    const MINT: &str = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU";

    #[derive(Default)]
    struct RecordingRail {
        calls: AtomicUsize,
        fail: AtomicBool,
        splits: Mutex<Vec<FeeSplit>>,
    }

    impl SettlementRail for RecordingRail {
        async fn submit(&self, intent: &PaymentIntent, split: FeeSplit) -> Result<RailReceipt, PaymentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(PaymentError::Settlement("rail unavailable".into()));
            }
            self.splits.lock().unwrap().push(split);
            Ok(RailReceipt {
                signature: format!("sig-{}", intent.payment_id),
                slot: 42,
            })
        }
    }

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn params(payer: &SigningKey, payment_id: &str, amount: &str) -> CreatePaymentParams {
        CreatePaymentParams {
            payment_id: payment_id.into(),
            payer: public_key_base58(payer),
            recipient: RECIPIENT.into(),
            amount: amount.into(),
            token_mint: MINT.into(),
            agent_id: "pdf-summarizer-v1".into(),
            network: Network::Devnet,
            task_metadata: None,
            expiry_seconds: None,
        }
    }

    fn signed(payment_id: &str, amount: &str) -> PaymentPayload {
        let payer = key(1);
        PaymentPayload::create(params(&payer, payment_id, amount)).signed(&payer)
    }

    fn real(rail: RecordingRail) -> FacilitatorLocal<RecordingRail> {
        FacilitatorLocal::new(
            Some(rail),
            Box::new(InMemorySettlementStore::new()),
            &SettlementConfig {
                platform_fee_bps: PlatformFeeBps::default(),
                ..SettlementConfig::default()
            },
        )
    }

    fn demo() -> FacilitatorLocal<RecordingRail> {
        FacilitatorLocal::new(
            None,
            Box::new(InMemorySettlementStore::new()),
            &SettlementConfig {
                platform_fee_bps: PlatformFeeBps::default(),
                ..SettlementConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn real_settlement_splits_the_fee() {
        let facilitator = real(RecordingRail::default());
        let receipt = facilitator
            .settle_payment(&signed("pay_split", "1000000").encode())
            .await
            .unwrap();
        assert_eq!(receipt.mode, SettlementMode::Real);
        assert_eq!(receipt.tx_signature, "sig-pay_split");
        assert_eq!(receipt.fee_amount.as_deref(), Some("50000"));
        assert_eq!(receipt.recipient_amount.as_deref(), Some("950000"));

        let rail = facilitator.rail().unwrap();
        let splits = rail.splits.lock().unwrap();
        assert_eq!(splits[0].fee_amount, 50_000);
        assert_eq!(splits[0].recipient_amount, 950_000);

        let status = facilitator.settlement_status("pay_split").await.unwrap();
        assert_eq!(status.status, ReportedStatus::Settled);
        assert_eq!(status.tx_signature.as_deref(), Some("sig-pay_split"));
        assert!(!status.demo_mode);
    }

    #[tokio::test]
    async fn demo_mode_needs_no_rail() {
        let facilitator = demo();
        let receipt = facilitator
            .settle_payment(&signed("pay_demo", "50000").encode())
            .await
            .unwrap();
        assert_eq!(receipt.mode, SettlementMode::Demo);
        assert!((86..=88).contains(&receipt.tx_signature.len()));
        assert!(receipt.slot >= DEMO_SLOT_BASE);
        assert!(receipt.fee_amount.is_none());
        assert!(facilitator.settlement_status("pay_demo").await.unwrap().demo_mode);
    }

    #[tokio::test]
    async fn second_settlement_is_a_duplicate() {
        let facilitator = real(RecordingRail::default());
        let encoded = signed("pay_twice", "1000").encode();
        facilitator.settle_payment(&encoded).await.unwrap();
        let err = facilitator.settle_payment(&encoded).await.unwrap_err();
        assert_eq!(err, PaymentError::DuplicateSettlement("pay_twice".into()));
        assert_eq!(facilitator.rail().unwrap().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_settlements_submit_once() {
        let facilitator = Arc::new(real(RecordingRail::default()));
        let encoded = signed("pay_race", "1000").encode();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let facilitator = facilitator.clone();
                let encoded = encoded.clone();
                tokio::spawn(async move { facilitator.settle_payment(&encoded).await })
            })
            .collect();
        let mut successes = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(PaymentError::DuplicateSettlement(_)) => duplicates += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((successes, duplicates), (1, 7));
        assert_eq!(facilitator.rail().unwrap().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_settlement_stays_consumed() {
        let rail = RecordingRail::default();
        rail.fail.store(true, Ordering::SeqCst);
        let facilitator = real(rail);
        let encoded = signed("pay_fail", "1000").encode();
        let err = facilitator.settle_payment(&encoded).await.unwrap_err();
        assert_eq!(err.kind(), "settlement_error");

        let status = facilitator.settlement_status("pay_fail").await.unwrap();
        assert_eq!(status.status, ReportedStatus::Failed);
        assert!(status.error.unwrap().contains("rail unavailable"));

        facilitator.rail().unwrap().fail.store(false, Ordering::SeqCst);
        let err = facilitator.settle_payment(&encoded).await.unwrap_err();
        assert!(matches!(err, PaymentError::DuplicateSettlement(_)));
    }

    #[tokio::test]
    async fn invalid_payments_never_reach_the_rail() {
        let facilitator = real(RecordingRail::default());
        let err = facilitator.settle_payment("!!!").await.unwrap_err();
        assert_eq!(err.kind(), "decode_error");

        let mut tampered = signed("pay_tampered", "1000");
        tampered.payload.amount = "2000".into();
        let err = facilitator.settle_payment(&tampered.encode()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_signature");

        let payer = key(2);
        let unsigned = PaymentPayload::create(params(&payer, "pay_unsigned", "1000"));
        let err = facilitator.settle_payment(&unsigned.encode()).await.unwrap_err();
        assert_eq!(err.kind(), "missing_signature");

        assert_eq!(facilitator.rail().unwrap().calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            facilitator.settlement_status("pay_tampered").await.unwrap().status,
            ReportedStatus::Unknown
        );
    }

    #[test]
    fn envelope_errors_come_before_expiry() {
        let facilitator = demo();
        let mut payload = signed("pay_old", "1000");
        payload.version = "2.0".into();
        let later = payload.payload.expires_at + 10;
        let err = facilitator.verify_payload(&payload, later).unwrap_err();
        assert!(matches!(err, PaymentError::Validation(ref errors) if errors[0].contains("version")));

        payload.version = "1.0".into();
        let err = facilitator.verify_payload(&payload, later).unwrap_err();
        assert_eq!(err, PaymentError::Expired);
    }

    #[test]
    fn unsigned_intents_only_when_allowed() {
        let payer = key(3);
        let unsigned = PaymentPayload::create(params(&payer, "pay_open", "1000"));
        let strict = demo();
        assert!(strict.verify_payload(&unsigned, UnixTimestamp::now()).is_err());

        let lenient: FacilitatorLocal<RecordingRail> = FacilitatorLocal::new(
            None,
            Box::new(InMemorySettlementStore::new()),
            &SettlementConfig {
                allow_unsigned_intents: true,
                platform_fee_bps: PlatformFeeBps::default(),
                ..SettlementConfig::default()
            },
        );
        let verified = lenient.verify_payload(&unsigned, UnixTimestamp::now()).unwrap();
        assert_eq!(verified.payment_id, "pay_open");
    }

    #[test]
    fn multi_sig_payments_need_threshold() {
        let now = UnixTimestamp::now();
        let (a, b, c) = (key(10), key(11), key(12));
        let payer = key(1);
        let mut payload = PaymentPayload::create(params(&payer, "pay_multi", "1000"));
        payload.features = Features::MultiSig(MultiSigConfig {
            threshold: 2,
            signers: vec![public_key_base58(&a), public_key_base58(&b), public_key_base58(&c)],
            signatures: Vec::new(),
            deadline: now + 600,
        });
        let mut payload = payload.signed(&payer);
        payload.co_sign(&a, now).unwrap();

        let facilitator = demo();
        let err = facilitator.verify_payload(&payload, now).unwrap_err();
        assert_eq!(err.kind(), "multisig_threshold");

        payload.co_sign(&c, now).unwrap();
        assert!(facilitator.verify_payload(&payload, now).is_ok());
    }

    #[tokio::test]
    async fn settlement_is_recorded_on_the_invoice() {
        let ledger = Arc::new(InMemoryLedger::new());
        let invoice_id = ledger
            .create_invoice("pdf-summarizer-v1", 50_000, RECIPIENT, UnixTimestamp::now() + 300)
            .await
            .unwrap();
        let payer = key(1);
        let mut params = params(&payer, "pay_invoice", "50000");
        let mut metadata = serde_json::Map::new();
        metadata.insert("invoiceId".into(), invoice_id.clone().into());
        params.task_metadata = Some(metadata);
        let encoded = PaymentPayload::create(params).signed(&payer).encode();

        let facilitator = real(RecordingRail::default()).with_ledger(ledger.clone());
        facilitator.settle_payment(&encoded).await.unwrap();

        let record = ledger.get_payment(&invoice_id).await.unwrap().unwrap();
        assert_eq!(record.status, PaymentStatus::Escrowed);
        assert_eq!(record.tx_signature, "sig-pay_invoice");
    }

    async fn invoice_payment(
        ledger: &InMemoryLedger,
        payment_id: &str,
        amount: &str,
        agent_id: &str,
    ) -> (String, String) {
        let invoice_id = ledger
            .create_invoice("pdf-summarizer-v1", 50_000, RECIPIENT, UnixTimestamp::now() + 300)
            .await
            .unwrap();
        let payer = key(1);
        let mut request = params(&payer, payment_id, amount);
        request.agent_id = agent_id.into();
        let mut metadata = serde_json::Map::new();
        metadata.insert("invoiceId".into(), invoice_id.clone().into());
        request.task_metadata = Some(metadata);
        (invoice_id, PaymentPayload::create(request).signed(&payer).encode())
    }

    #[tokio::test]
    async fn underpaying_an_invoice_is_refused() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (invoice_id, encoded) = invoice_payment(&ledger, "pay_cheap", "1", "pdf-summarizer-v1").await;
        let facilitator = real(RecordingRail::default()).with_ledger(ledger.clone());

        let err = facilitator.settle_payment(&encoded).await.unwrap_err();
        assert_eq!(
            err.details(),
            vec!["Amount 1 does not match invoice amount 50000".to_string()]
        );
        assert_eq!(facilitator.rail().unwrap().calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            facilitator.settlement_status("pay_cheap").await.unwrap().status,
            ReportedStatus::Unknown
        );
        let invoice = ledger.get_invoice(&invoice_id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Open);
        assert!(ledger.get_payment(&invoice_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invoice_agent_and_recipient_must_match() {
        let ledger = Arc::new(InMemoryLedger::new());
        let (_, encoded) = invoice_payment(&ledger, "pay_agent", "50000", "image-editor-v1").await;
        let facilitator = real(RecordingRail::default()).with_ledger(ledger.clone());
        let err = facilitator.settle_payment(&encoded).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(
            err.details(),
            vec!["Agent image-editor-v1 does not match invoice agent pdf-summarizer-v1".to_string()]
        );

        let invoice_id = ledger
            .create_invoice("pdf-summarizer-v1", 50_000, MINT, UnixTimestamp::now() + 300)
            .await
            .unwrap();
        let payer = key(1);
        let mut elsewhere = params(&payer, "pay_elsewhere", "50000");
        let mut metadata = serde_json::Map::new();
        metadata.insert("invoiceId".into(), invoice_id.into());
        elsewhere.task_metadata = Some(metadata);
        let encoded = PaymentPayload::create(elsewhere).signed(&payer).encode();
        let err = facilitator.settle_payment(&encoded).await.unwrap_err();
        assert_eq!(
            err.details(),
            vec![format!("Recipient {RECIPIENT} does not match invoice recipient {MINT}")]
        );
        assert_eq!(facilitator.rail().unwrap().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_or_paid_invoices_are_refused() {
        let ledger = Arc::new(InMemoryLedger::new());
        let facilitator = real(RecordingRail::default()).with_ledger(ledger.clone());
        let (_, first) = invoice_payment(&ledger, "pay_first", "50000", "pdf-summarizer-v1").await;
        facilitator.settle_payment(&first).await.unwrap();

        let payer = key(1);
        let invoice_id = PaymentPayload::decode(&first)
            .unwrap()
            .payload
            .metadata_str("invoiceId")
            .unwrap()
            .to_string();
        let mut second = params(&payer, "pay_second", "50000");
        let mut metadata = serde_json::Map::new();
        metadata.insert("invoiceId".into(), invoice_id.clone().into());
        second.task_metadata = Some(metadata);
        let err = facilitator
            .settle_payment(&PaymentPayload::create(second).signed(&payer).encode())
            .await
            .unwrap_err();
        assert_eq!(err.details(), vec![format!("Invoice {invoice_id} is already paid")]);

        let mut ghost = params(&payer, "pay_ghost", "50000");
        let mut metadata = serde_json::Map::new();
        metadata.insert("invoiceId".into(), "inv_missing".into());
        ghost.task_metadata = Some(metadata);
        let err = facilitator
            .settle_payment(&PaymentPayload::create(ghost).signed(&payer).encode())
            .await
            .unwrap_err();
        assert_eq!(err.details(), vec!["Unknown invoice inv_missing".to_string()]);
        assert_eq!(facilitator.rail().unwrap().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsigned_malformed_payload_lists_every_problem() {
        let payer = key(4);
        let mut params = params(&payer, "", "0");
        params.payer = String::new();
        params.recipient = String::new();
        let unsigned = PaymentPayload::create(params);
        let err = demo().verify_payload(&unsigned, UnixTimestamp::now()).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(
            err.details(),
            vec!["Missing paymentId", "Missing payer", "Missing recipient", "Invalid amount"]
        );
    }

    #[tokio::test]
    async fn rejected_submission_can_be_retried() {
        let facilitator = real(RecordingRail::default());
        let encoded = signed("pay_retry", "1000").encode();
        let err = facilitator
            .settle_via(&encoded, |_payload| async {
                Err::<(SettleReceipt, ()), _>(PaymentError::Validation(vec![
                    "Gasless sponsorship is disabled".to_string(),
                ]))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
        assert_eq!(
            facilitator.settlement_status("pay_retry").await.unwrap().status,
            ReportedStatus::Unknown
        );

        let receipt = facilitator.settle_payment(&encoded).await.unwrap();
        assert_eq!(receipt.tx_signature, "sig-pay_retry");
        assert_eq!(facilitator.rail().unwrap().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gasless_payloads_are_not_fee_split() {
        let facilitator = real(RecordingRail::default());
        let payer = key(1);
        let mut payload = PaymentPayload::create(params(&payer, "pay_sponsored", "1000"));
        payload.features = Features::Gasless {
            facilitator: RECIPIENT.into(),
        };
        let encoded = payload.signed(&payer).encode();
        let err = facilitator.settle_payment(&encoded).await.unwrap_err();
        assert_eq!(
            err.details(),
            vec!["Gasless payments settle through /gasless/execute".to_string()]
        );
        assert_eq!(facilitator.rail().unwrap().calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            facilitator.settlement_status("pay_sponsored").await.unwrap().status,
            ReportedStatus::Unknown
        );
    }
}
