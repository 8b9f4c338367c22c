//! Process-local [`Ledger`] with escrow bookkeeping.

use async_trait::async_trait;
use dashmap::DashMap;
use x402_types::ledger::{
    Invoice, InvoiceStatus, Ledger, LedgerError, PaymentRecord, PaymentStatus,
};
use x402_types::timestamp::UnixTimestamp;

use crate::invoice::generate_id;

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    invoices: DashMap<String, Invoice>,
    payments: DashMap<String, PaymentRecord>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the stored record for `invoice_id` from `expected` to `next`.
    fn transition(
        &self,
        invoice_id: &str,
        expected: PaymentStatus,
        next: PaymentStatus,
        result_reference: Option<&str>,
    ) -> Result<PaymentRecord, LedgerError> {
        let mut record = self
            .payments
            .get_mut(invoice_id)
            .ok_or_else(|| LedgerError::UnknownInvoice(invoice_id.to_string()))?;
        if record.status != expected {
            return Err(LedgerError::InvalidState {
                invoice_id: invoice_id.to_string(),
                expected,
                actual: record.status,
            });
        }
        record.status = next;
        if let Some(reference) = result_reference {
            record.result_reference = Some(reference.to_string());
        }
        record.updated_at = UnixTimestamp::now();
        Ok(record.clone())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_invoice(
        &self,
        agent_id: &str,
        amount: u64,
        recipient: &str,
        expires_at: UnixTimestamp,
    ) -> Result<String, LedgerError> {
        let invoice_id = generate_id("inv");
        let invoice = Invoice {
            invoice_id: invoice_id.clone(),
            agent_id: agent_id.to_string(),
            amount,
            recipient: recipient.to_string(),
            expires_at,
            created_at: UnixTimestamp::now(),
            status: InvoiceStatus::Open,
        };
        self.invoices.insert(invoice_id.clone(), invoice);
        tracing::debug!(invoice_id = %invoice_id, agent_id, amount, "Invoice created");
        Ok(invoice_id)
    }

    async fn settle_payment(
        &self,
        invoice_id: &str,
        signature: &str,
    ) -> Result<PaymentRecord, LedgerError> {
        let mut invoice = self
            .invoices
            .get_mut(invoice_id)
            .ok_or_else(|| LedgerError::UnknownInvoice(invoice_id.to_string()))?;
        if invoice.status == InvoiceStatus::Paid {
            return Err(LedgerError::AlreadyPaid(invoice_id.to_string()));
        }
        let now = UnixTimestamp::now();
        if invoice.expires_at.is_before(now) {
            return Err(LedgerError::InvoiceExpired(invoice_id.to_string()));
        }
        invoice.status = InvoiceStatus::Paid;
        let record = PaymentRecord {
            invoice_id: invoice_id.to_string(),
            agent_id: invoice.agent_id.clone(),
            amount: invoice.amount,
            tx_signature: signature.to_string(),
            status: PaymentStatus::Pending,
            result_reference: None,
            updated_at: now,
        };
        self.payments.insert(invoice_id.to_string(), record.clone());
        Ok(record)
    }

    async fn verify_payment(&self, record: &PaymentRecord) -> Result<bool, LedgerError> {
        match self.transition(
            &record.invoice_id,
            PaymentStatus::Pending,
            PaymentStatus::Escrowed,
            None,
        ) {
            Ok(_) => Ok(true),
            Err(LedgerError::InvalidState { actual, .. }) => Ok(actual != PaymentStatus::Pending),
            Err(e) => Err(e),
        }
    }

    async fn complete_task(
        &self,
        record: &PaymentRecord,
        result_reference: &str,
    ) -> Result<PaymentRecord, LedgerError> {
        self.transition(
            &record.invoice_id,
            PaymentStatus::Escrowed,
            PaymentStatus::Completed,
            Some(result_reference),
        )
    }

    async fn claim_payment(&self, record: &PaymentRecord) -> Result<bool, LedgerError> {
        self.transition(
            &record.invoice_id,
            PaymentStatus::Completed,
            PaymentStatus::Claimed,
            None,
        )?;
        Ok(true)
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>, LedgerError> {
        Ok(self.invoices.get(invoice_id).map(|i| i.clone()))
    }

    async fn get_payment(&self, invoice_id: &str) -> Result<Option<PaymentRecord>, LedgerError> {
        Ok(self.payments.get(invoice_id).map(|p| p.clone()))
    }
}
