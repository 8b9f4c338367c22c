//! The ledger collaborator: authoritative invoice and payment state.
//!
//! The facilitator consults the ledger only through these operations and makes
//! no assumption about how it stores its state. A payment record moves through
//! `Pending → Escrowed → Completed → Claimed`.

use serde::{Deserialize, Serialize};

use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Open,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub invoice_id: String,
    pub agent_id: String,
    pub amount: u64,
    /// Owner of the account the payment must credit.
    pub recipient: String,
    pub expires_at: UnixTimestamp,
    pub created_at: UnixTimestamp,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Settlement observed, funds not yet held in escrow.
    Pending,
    Escrowed,
    /// The paid task produced its result.
    Completed,
    /// Funds released to the agent.
    Claimed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub invoice_id: String,
    pub agent_id: String,
    pub amount: u64,
    pub tx_signature: String,
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_reference: Option<String>,
    pub updated_at: UnixTimestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Unknown invoice {0}")]
    UnknownInvoice(String),
    #[error("Invoice {0} has expired")]
    InvoiceExpired(String),
    #[error("Invoice {0} is already paid")]
    AlreadyPaid(String),
    #[error("Payment for invoice {invoice_id} is {actual:?}, expected {expected:?}")]
    InvalidState {
        invoice_id: String,
        expected: PaymentStatus,
        actual: PaymentStatus,
    },
    #[error("Ledger unavailable: {0}")]
    Remote(String),
}

#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    async fn create_invoice(
        &self,
        agent_id: &str,
        amount: u64,
        recipient: &str,
        expires_at: UnixTimestamp,
    ) -> Result<String, LedgerError>;

    /// Records the on-chain settlement `signature` against an open invoice.
    async fn settle_payment(
        &self,
        invoice_id: &str,
        signature: &str,
    ) -> Result<PaymentRecord, LedgerError>;

    /// Confirms the funds are held; returns whether the payment is escrowed.
    async fn verify_payment(&self, record: &PaymentRecord) -> Result<bool, LedgerError>;

    async fn complete_task(
        &self,
        record: &PaymentRecord,
        result_reference: &str,
    ) -> Result<PaymentRecord, LedgerError>;

    /// Releases escrowed funds; returns whether they were transferred.
    async fn claim_payment(&self, record: &PaymentRecord) -> Result<bool, LedgerError>;

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, LedgerError>;

    async fn get_payment(&self, invoice_id: &str) -> Result<Option<PaymentRecord>, LedgerError>;
}
