//! Threshold approval for payments that need several signers.
//!
//! A [`MultiSigConfig`] accumulates signatures from its authorized signers.
//! A payment is approved when enough *distinct* authorized signers have signed
//! and the deadline has not passed. The deadline is a hard cutoff: an approval
//! reached earlier no longer counts once it is exceeded.

use std::collections::HashSet;

use ed25519_dalek::SigningKey;

use crate::proto::{MultiSigConfig, MultiSigSignature, PaymentError, PaymentIntent, PaymentPayload};
use crate::signing;
use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultiSigError {
    #[error("Signer {0} is not authorized for this payment")]
    UnauthorizedSigner(String),
    #[error("Payment does not require multiple signatures")]
    NotMultiSig,
}

impl MultiSigConfig {
    /// Configuration problems, all of them.
    pub fn validate_at(&self, now: UnixTimestamp) -> Vec<String> {
        let mut errors = Vec::new();
        if self.threshold == 0 {
            errors.push("Valid signature threshold is required".to_string());
        }
        if self.signers.is_empty() {
            errors.push("At least one authorized signer is required".to_string());
        }
        if self.threshold as usize > self.signers.len() {
            errors.push("Threshold cannot exceed number of signers".to_string());
        }
        if self.deadline.is_before(now) {
            errors.push("Multi-signature deadline has passed".to_string());
        }
        errors
    }

    pub fn is_authorized(&self, signer: &str) -> bool {
        self.signers.iter().any(|s| s == signer)
    }

    /// Records a signature from an authorized signer.
    ///
    /// Returns `Ok(false)` when the signer already signed; the duplicate is not stored.
    pub fn add_signature(&mut self, signature: MultiSigSignature) -> Result<bool, MultiSigError> {
        if !self.is_authorized(&signature.signer) {
            return Err(MultiSigError::UnauthorizedSigner(signature.signer));
        }
        if self.signatures.iter().any(|s| s.signer == signature.signer) {
            return Ok(false);
        }
        self.signatures.push(signature);
        Ok(true)
    }

    /// Number of distinct authorized signers present, without checking signatures.
    pub fn approvals(&self) -> usize {
        self.signatures
            .iter()
            .filter(|s| self.is_authorized(&s.signer))
            .map(|s| s.signer.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Distinct authorized signers whose signature verifies over the intent.
    pub fn verified_approvals(&self, intent: &PaymentIntent) -> usize {
        let message = signing::build_message(intent);
        self.signatures
            .iter()
            .filter(|s| self.is_authorized(&s.signer))
            .filter(|s| signing::verify_message(&message, &s.signature, &s.signer))
            .map(|s| s.signer.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn is_approved(&self, now: UnixTimestamp) -> bool {
        !self.deadline.is_before(now) && self.approvals() >= self.threshold as usize
    }

    /// Full settlement gate: valid configuration, cryptographically valid signatures
    /// from at least `threshold` distinct signers, deadline not passed.
    pub fn require_approval(
        &self,
        intent: &PaymentIntent,
        now: UnixTimestamp,
    ) -> Result<(), PaymentError> {
        let errors = self.validate_at(now);
        if !errors.is_empty() {
            return Err(PaymentError::Validation(errors));
        }
        let approvals = self.verified_approvals(intent);
        if approvals < self.threshold as usize {
            return Err(PaymentError::MultiSigThreshold {
                approvals,
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

impl PaymentPayload {
    /// Adds the holder of `key` as a co-signer of a multi-signature payload.
    pub fn co_sign(&mut self, key: &SigningKey, now: UnixTimestamp) -> Result<bool, MultiSigError> {
        let signature = signing::sign_intent(&self.payload, key);
        let entry = MultiSigSignature {
            signer: signing::public_key_base58(key),
            signature: signature.signature,
            timestamp: now,
            nonce: signature.nonce,
        };
        self.features
            .multi_sig_mut()
            .ok_or(MultiSigError::NotMultiSig)?
            .add_signature(entry)
    }
}
