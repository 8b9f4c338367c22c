//! Structural, temporal and business checks for decoded payloads.
//!
//! Validation never stops at the first problem: every broken rule is collected so
//! the client sees a complete diagnosis in one round trip. Signature checks are not
//! part of this pass; the settlement engine applies them according to its policy.

use crate::proto::{PAYMENT_TYPE_SOLANA, PROTOCOL_VERSION, PaymentError, PaymentPayload, try_parse_amount};
use crate::timestamp::UnixTimestamp;

/// Outcome of [`PayloadValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn into_result(self) -> Result<(), PaymentError> {
        if self.valid {
            Ok(())
        } else {
            Err(PaymentError::Validation(self.errors))
        }
    }
}

#[derive(Debug, Clone)]
pub struct PayloadValidator {
    payment_type: String,
}

impl Default for PayloadValidator {
    fn default() -> Self {
        Self::new(PAYMENT_TYPE_SOLANA)
    }
}

impl PayloadValidator {
    /// A validator accepting payloads for the given rail identifier.
    pub fn new(payment_type: impl Into<String>) -> Self {
        Self {
            payment_type: payment_type.into(),
        }
    }

    pub fn validate(&self, payload: &PaymentPayload) -> ValidationReport {
        self.validate_at(payload, UnixTimestamp::now())
    }

    pub fn validate_at(&self, payload: &PaymentPayload, now: UnixTimestamp) -> ValidationReport {
        let mut errors = self.envelope_errors(payload);
        let intent = &payload.payload;
        if Self::is_expired_at(payload, now) {
            errors.push("Payment payload has expired".to_string());
        }
        if intent.payment_id.is_empty() {
            errors.push("Missing paymentId".to_string());
        }
        if intent.payer.is_empty() {
            errors.push("Missing payer".to_string());
        }
        if intent.recipient.is_empty() {
            errors.push("Missing recipient".to_string());
        }
        if let Err(e) = try_parse_amount(&intent.amount) {
            errors.push(e.to_string());
        }
        ValidationReport::from_errors(errors)
    }

    /// Version and rail checks only, the first thing a caller needs to know.
    pub fn envelope_errors(&self, payload: &PaymentPayload) -> Vec<String> {
        let mut errors = Vec::new();
        if payload.version != PROTOCOL_VERSION {
            errors.push(format!(
                "Invalid version: expected {PROTOCOL_VERSION}, got {}",
                payload.version
            ));
        }
        if payload.payment_type != self.payment_type {
            errors.push(format!(
                "Invalid payment type: expected {}, got {}",
                self.payment_type, payload.payment_type
            ));
        }
        errors
    }

    /// `expiresAt < now`, at seconds granularity.
    pub fn is_expired_at(payload: &PaymentPayload, now: UnixTimestamp) -> bool {
        payload.payload.expires_at.is_before(now)
    }
}
