//! Transport encoding for payment payloads.
//!
//! A payload travels as base64 of its compact JSON form. Decoding never panics
//! on attacker-controlled input; every failure is a [`PaymentError::Decode`],
//! which callers treat as "payment required".

use serde_json::{Map, Value};

use crate::proto::{
    Features, Network, PAYMENT_TYPE_SOLANA, PROTOCOL_VERSION, PaymentError, PaymentIntent,
    PaymentPayload,
};
use crate::timestamp::UnixTimestamp;
use crate::util::Base64Bytes;

/// Default lifetime of a freshly created payload, in seconds.
pub const DEFAULT_EXPIRY_SECONDS: u64 = 300;

/// Inputs for [`PaymentPayload::create`].
#[derive(Debug, Clone)]
pub struct CreatePaymentParams {
    pub payment_id: String,
    pub payer: String,
    pub recipient: String,
    pub amount: String,
    pub token_mint: String,
    pub agent_id: String,
    pub network: Network,
    pub task_metadata: Option<Map<String, Value>>,
    pub expiry_seconds: Option<u64>,
}

impl PaymentPayload {
    /// Builds an unsigned payload: `nonce = now`, `expiresAt = now + expiry` (300s by default).
    pub fn create(params: CreatePaymentParams) -> Self {
        Self::create_at(params, UnixTimestamp::now())
    }

    /// [`PaymentPayload::create`] against an explicit clock.
    pub fn create_at(params: CreatePaymentParams, now: UnixTimestamp) -> Self {
        let expiry = params.expiry_seconds.unwrap_or(DEFAULT_EXPIRY_SECONDS);
        PaymentPayload {
            version: PROTOCOL_VERSION.to_string(),
            payment_type: PAYMENT_TYPE_SOLANA.to_string(),
            network: params.network,
            payload: PaymentIntent {
                payment_id: params.payment_id,
                payer: params.payer,
                recipient: params.recipient,
                amount: params.amount,
                token_mint: params.token_mint,
                agent_id: params.agent_id,
                task_metadata: params.task_metadata,
                expires_at: now + expiry,
                nonce: now.as_secs(),
                payment_intent_signature: None,
            },
            features: Features::Standard,
        }
    }

    /// Encodes the payload for the `X-PAYMENT` header.
    pub fn encode(&self) -> String {
        // Plain data with string keys always serializes.
        let json = serde_json::to_vec(self).unwrap_or_default();
        Base64Bytes::encode(json).to_string()
    }

    /// Decodes an `X-PAYMENT` header value.
    pub fn decode(encoded: &str) -> Result<Self, PaymentError> {
        let bytes = Base64Bytes::from(encoded.trim())
            .decode()
            .map_err(|e| PaymentError::Decode(format!("not valid base64: {e}")))?;
        serde_json::from_slice(&bytes).map_err(|e| {
            tracing::debug!(error = %e, "payment header is not a payload");
            PaymentError::Decode(e.to_string())
        })
    }
}
