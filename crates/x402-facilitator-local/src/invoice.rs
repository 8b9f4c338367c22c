//! Invoices: priced, unsigned payment payloads handed to clients.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use x402_chain_solana::networks::format_usdc;
use x402_types::codec::CreatePaymentParams;
use x402_types::ledger::{Ledger, LedgerError};
use x402_types::proto::{DEFAULT_CURRENCY, Network, PaymentPayload, PaymentRequiredHeaders};
use x402_types::timestamp::UnixTimestamp;

/// Recipient used when neither the agent nor the environment names one.
pub const DEFAULT_RECIPIENT: &str = "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH";

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// `<prefix>_<unix millis>_<8 random base36 chars>`, e.g. `pay_1700000000000_k3x9a0zq`.
pub fn generate_id(prefix: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let mut rng = rand::rng();
    let suffix: String = (0..8)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{prefix}_{millis}_{suffix}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPricing {
    /// Base units of USDC.
    pub price: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceConfig {
    #[serde(default = "invoice_defaults::expiry_seconds")]
    pub expiry_seconds: u64,
    #[serde(default = "invoice_defaults::agents")]
    pub agents: HashMap<String, AgentPricing>,
    /// `FACILITATOR_WALLET` when unset.
    #[serde(default = "invoice_defaults::default_recipient")]
    pub default_recipient: String,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            expiry_seconds: invoice_defaults::expiry_seconds(),
            agents: invoice_defaults::agents(),
            default_recipient: invoice_defaults::default_recipient(),
        }
    }
}

mod invoice_defaults {
    use super::{AgentPricing, DEFAULT_RECIPIENT};
    use std::collections::HashMap;

    pub fn expiry_seconds() -> u64 {
        300
    }

    pub fn agents() -> HashMap<String, AgentPricing> {
        [
            ("pdf-summarizer-v1", 50_000),
            ("image-editor-v1", 100_000),
            ("nft-minter-v1", 250_000),
            ("code-debugger-v1", 80_000),
            ("ugv-rover-01", 100_000),
            ("smart-led-array", 50_000),
        ]
        .into_iter()
        .map(|(agent, price)| {
            (
                agent.to_string(),
                AgentPricing {
                    price,
                    recipient: None,
                },
            )
        })
        .collect()
    }

    pub fn default_recipient() -> String {
        std::env::var("FACILITATOR_WALLET").unwrap_or_else(|_| DEFAULT_RECIPIENT.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceRequest {
    pub agent_id: String,
    pub payer: String,
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default)]
    pub task_metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceResponse {
    pub invoice_id: String,
    pub agent_id: String,
    pub amount: u64,
    pub amount_display: String,
    pub currency: String,
    pub payer: String,
    pub recipient: String,
    pub network: Network,
    pub expires_at: UnixTimestamp,
    pub created_at: UnixTimestamp,
    pub payment_payload: PaymentPayload,
    /// `payment_payload`, encoded. The client signs the intent before sending it.
    pub x_payment_header: String,
}

impl InvoiceResponse {
    /// Terms to announce with a `402` for this invoice.
    pub fn payment_required_headers(&self) -> PaymentRequiredHeaders {
        PaymentRequiredHeaders {
            invoice_id: self.invoice_id.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            recipient: self.recipient.clone(),
            agent_id: self.agent_id.clone(),
            network: self.network,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvoiceError {
    #[error("Unknown agent {0}")]
    UnknownAgent(String),
    #[error("Missing {0}")]
    MissingField(&'static str),
    #[error("Invoice amount must be greater than zero")]
    InvalidAmount,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct InvoiceDesk {
    config: InvoiceConfig,
    ledger: Arc<dyn Ledger>,
    network: Network,
    token_mint: String,
}

impl InvoiceDesk {
    pub fn new(config: InvoiceConfig, ledger: Arc<dyn Ledger>, network: Network, token_mint: String) -> Self {
        Self {
            config,
            ledger,
            network,
            token_mint,
        }
    }

    pub fn price_of(&self, agent_id: &str) -> Option<&AgentPricing> {
        self.config.agents.get(agent_id)
    }

    /// Prices the request, opens an invoice on the ledger and builds the payload
    /// the client will sign. The invoice id travels in `taskMetadata.invoiceId`.
    pub async fn create(&self, request: InvoiceRequest) -> Result<InvoiceResponse, InvoiceError> {
        if request.agent_id.is_empty() {
            return Err(InvoiceError::MissingField("agentId"));
        }
        if request.payer.is_empty() {
            return Err(InvoiceError::MissingField("payer"));
        }
        let pricing = self.price_of(&request.agent_id);
        let amount = match (request.amount, pricing) {
            (Some(0), _) => return Err(InvoiceError::InvalidAmount),
            (Some(amount), _) => amount,
            (None, Some(pricing)) => pricing.price,
            (None, None) => return Err(InvoiceError::UnknownAgent(request.agent_id)),
        };
        let recipient = pricing
            .and_then(|p| p.recipient.clone())
            .unwrap_or_else(|| self.config.default_recipient.clone());

        let now = UnixTimestamp::now();
        let expires_at = now + self.config.expiry_seconds;
        let invoice_id = self
            .ledger
            .create_invoice(&request.agent_id, amount, &recipient, expires_at)
            .await?;

        let mut task_metadata = request.task_metadata.unwrap_or_default();
        task_metadata.insert("invoiceId".to_string(), Value::String(invoice_id.clone()));
        let payment_payload = PaymentPayload::create_at(
            CreatePaymentParams {
                payment_id: generate_id("pay"),
                payer: request.payer.clone(),
                recipient: recipient.clone(),
                amount: amount.to_string(),
                token_mint: self.token_mint.clone(),
                agent_id: request.agent_id.clone(),
                network: self.network,
                task_metadata: Some(task_metadata),
                expiry_seconds: Some(self.config.expiry_seconds),
            },
            now,
        );
        tracing::info!(
            invoice_id = %invoice_id,
            payment_id = %payment_payload.payload.payment_id,
            agent_id = %request.agent_id,
            amount,
            "Invoice issued"
        );
        Ok(InvoiceResponse {
            x_payment_header: payment_payload.encode(),
            invoice_id,
            agent_id: request.agent_id,
            amount,
            amount_display: format_usdc(amount),
            currency: DEFAULT_CURRENCY.to_string(),
            payer: request.payer,
            recipient,
            network: self.network,
            expires_at,
            created_at: now,
            payment_payload,
        })
    }
}
