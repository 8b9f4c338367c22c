//! The HTTP header contract between clients, resource servers and facilitators.
//!
//! Header names are matched case-insensitively by HTTP stacks; the constants here
//! use the canonical spelling for responses and lowercase for lookups.

use serde::{Deserialize, Serialize};

use super::Network;
use crate::timestamp::UnixTimestamp;

/// Request header carrying the base64 payment payload.
pub const X_PAYMENT: &str = "x-payment";
/// Response header carrying the base64 settlement receipt.
pub const X_PAYMENT_RESPONSE: &str = "x-payment-response";

pub const X_PAYMENT_REQUIRED: &str = "x-payment-required";
pub const X_PAYMENT_INVOICE: &str = "x-payment-invoice";
pub const X_PAYMENT_AMOUNT: &str = "x-payment-amount";
pub const X_PAYMENT_CURRENCY: &str = "x-payment-currency";
pub const X_PAYMENT_RECIPIENT: &str = "x-payment-recipient";
pub const X_PAYMENT_AGENT: &str = "x-payment-agent";
pub const X_PAYMENT_NETWORK: &str = "x-payment-network";
pub const X_PAYMENT_EXPIRES: &str = "x-payment-expires";

/// Currency label announced in `X-Payment-Currency`.
pub const DEFAULT_CURRENCY: &str = "USDC";

/// Terms of payment announced alongside a `402 Payment Required` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredHeaders {
    pub invoice_id: String,
    /// Base units of the token.
    pub amount: u64,
    pub currency: String,
    pub recipient: String,
    pub agent_id: String,
    pub network: Network,
    pub expires_at: UnixTimestamp,
}

impl PaymentRequiredHeaders {
    /// The eight `X-Payment-*` headers, in a fixed order.
    pub fn to_pairs(&self) -> [(&'static str, String); 8] {
        [
            (X_PAYMENT_REQUIRED, "true".to_string()),
            (X_PAYMENT_INVOICE, self.invoice_id.clone()),
            (X_PAYMENT_AMOUNT, self.amount.to_string()),
            (X_PAYMENT_CURRENCY, self.currency.clone()),
            (X_PAYMENT_RECIPIENT, self.recipient.clone()),
            (X_PAYMENT_AGENT, self.agent_id.clone()),
            (X_PAYMENT_NETWORK, self.network.to_string()),
            (X_PAYMENT_EXPIRES, self.expires_at.to_string()),
        ]
    }
}

/// JSON body of a `402` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequiredBody {
    pub error: String,
    pub message: String,
}

impl PaymentRequiredBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: "Payment Required".to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_headers() {
        let headers = PaymentRequiredHeaders {
            invoice_id: "pay_1_abc".into(),
            amount: 50_000,
            currency: DEFAULT_CURRENCY.into(),
            recipient: "Recv".into(),
            agent_id: "pdf-summarizer-v1".into(),
            network: Network::Devnet,
            expires_at: UnixTimestamp::from_secs(1_700_000_300),
        };
        let pairs = headers.to_pairs();
        assert_eq!(pairs[0], ("x-payment-required", "true".to_string()));
        assert_eq!(pairs[2], ("x-payment-amount", "50000".to_string()));
        assert_eq!(pairs[6], ("x-payment-network", "devnet".to_string()));
        assert_eq!(pairs[7], ("x-payment-expires", "1700000300".to_string()));
    }
}
