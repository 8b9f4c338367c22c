//! Canonical signing message and Ed25519 verification for payment intents.
//!
//! The message is UTF-8, newline-joined, and has a fixed line order:
//!
//! ```text
//! SynapsePay Payment Intent
//! PaymentID: <paymentId>
//! Payer: <payer>
//! Recipient: <recipient>
//! Amount: <amount>
//! Token: <tokenMint>
//! Agent: <agentId>
//! Expires: <expiresAt>
//! Nonce: <nonce>
//! ```
//!
//! Every line is always present. An empty field renders as an empty value after
//! the label, so two implementations agree byte-for-byte on the message.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::proto::{PaymentIntent, PaymentIntentSignature, PaymentPayload, SignatureError};
use crate::util::Base64Bytes;

/// First line of every signing message.
pub const SIGNING_BANNER: &str = "SynapsePay Payment Intent";

/// Builds the canonical message a payer signs.
pub fn build_message(intent: &PaymentIntent) -> Vec<u8> {
    let lines = [
        SIGNING_BANNER.to_string(),
        format!("PaymentID: {}", intent.payment_id),
        format!("Payer: {}", intent.payer),
        format!("Recipient: {}", intent.recipient),
        format!("Amount: {}", intent.amount),
        format!("Token: {}", intent.token_mint),
        format!("Agent: {}", intent.agent_id),
        format!("Expires: {}", intent.expires_at),
        format!("Nonce: {}", intent.nonce),
    ];
    lines.join("\n").into_bytes()
}

/// Verifies a detached Ed25519 signature over the intent's canonical message.
///
/// `signature` is base64 of 64 raw bytes, `public_key` is a base58 32-byte key.
/// Any malformed input yields `false`.
pub fn verify(intent: &PaymentIntent, signature: &str, public_key: &str) -> bool {
    verify_message(&build_message(intent), signature, public_key)
}

/// Verifies a base64 Ed25519 signature over arbitrary bytes with a base58 public key.
pub fn verify_message(message: &[u8], signature: &str, public_key: &str) -> bool {
    let Some(signature) = Base64Bytes::from(signature).decode_array::<64>() else {
        return false;
    };
    let Some(public_key) = decode_public_key(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public_key) else {
        return false;
    };
    let signature = Signature::from_bytes(&signature);
    verifying_key.verify(message, &signature).is_ok()
}

fn decode_public_key(public_key: &str) -> Option<[u8; 32]> {
    let bytes = bs58::decode(public_key).into_vec().ok()?;
    bytes.try_into().ok()
}

/// Checks the intent's own signature against its payer.
pub fn verify_intent_signature(intent: &PaymentIntent) -> Result<(), SignatureError> {
    let signature = intent
        .payment_intent_signature
        .as_ref()
        .ok_or(SignatureError::Missing)?;
    if verify(intent, &signature.signature, &intent.payer) {
        Ok(())
    } else {
        Err(SignatureError::Invalid)
    }
}

/// Signs the intent's canonical message with the payer's key.
pub fn sign_intent(intent: &PaymentIntent, key: &SigningKey) -> PaymentIntentSignature {
    let signature = key.sign(&build_message(intent));
    PaymentIntentSignature {
        signature: Base64Bytes::encode(signature.to_bytes()).to_string(),
        nonce: intent.nonce,
    }
}

/// Base58 form of a signing key's public half, the way payer addresses are written.
pub fn public_key_base58(key: &SigningKey) -> String {
    bs58::encode(key.verifying_key().as_bytes()).into_string()
}

impl PaymentPayload {
    /// Attaches the payer's signature to the intent.
    pub fn signed(mut self, key: &SigningKey) -> Self {
        let signature = sign_intent(&self.payload, key);
        self.payload.payment_intent_signature = Some(signature);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::UnixTimestamp;

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[11u8; 32])
    }

    fn intent(payer: String) -> PaymentIntent {
        PaymentIntent {
            payment_id: "pay_1".into(),
            payer,
            recipient: "Recv".into(),
            amount: "50000".into(),
            token_mint: "Mint".into(),
            agent_id: "pdf-summarizer-v1".into(),
            task_metadata: None,
            expires_at: UnixTimestamp::from_secs(1_700_000_300),
            nonce: 1_700_000_000,
            payment_intent_signature: None,
        }
    }

    #[test]
    fn message_has_fixed_layout() {
        let message = String::from_utf8(build_message(&intent("Payer".into()))).unwrap();
        assert_eq!(
            message,
            "SynapsePay Payment Intent\nPaymentID: pay_1\nPayer: Payer\nRecipient: Recv\n\
             Amount: 50000\nToken: Mint\nAgent: pdf-summarizer-v1\nExpires: 1700000300\n\
             Nonce: 1700000000"
        );
    }

    #[test]
    fn empty_fields_keep_their_line() {
        let mut intent = intent(String::new());
        intent.agent_id.clear();
        let message = String::from_utf8(build_message(&intent)).unwrap();
        assert_eq!(message.lines().count(), 9);
        assert!(message.contains("\nPayer: \n"));
        assert!(message.contains("\nAgent: \n"));
    }

    #[test]
    fn signed_intent_verifies() {
        let key = key();
        let mut intent = intent(public_key_base58(&key));
        let signature = sign_intent(&intent, &key);
        assert!(verify(&intent, &signature.signature, &intent.payer));
        intent.payment_intent_signature = Some(signature);
        assert_eq!(verify_intent_signature(&intent), Ok(()));
    }

    #[test]
    fn tampering_any_byte_fails() {
        let key = key();
        let intent = intent(public_key_base58(&key));
        let signature = key.sign(&build_message(&intent));
        let encoded = Base64Bytes::encode(signature.to_bytes()).to_string();
        let payer = intent.payer.clone();

        let message = build_message(&intent);
        assert!(verify_message(&message, &encoded, &payer));
        for index in 0..message.len() {
            let mut tampered = message.clone();
            tampered[index] ^= 0x01;
            assert!(!verify_message(&tampered, &encoded, &payer), "byte {index}");
        }
    }

    #[test]
    fn malformed_inputs_are_false() {
        let key = key();
        let intent = intent(public_key_base58(&key));
        let good = sign_intent(&intent, &key).signature;
        assert!(!verify(&intent, "not base64", &intent.payer));
        assert!(!verify(&intent, &Base64Bytes::encode([0u8; 63]).to_string(), &intent.payer));
        assert!(!verify(&intent, &good, "0OIl"));
        assert!(!verify(&intent, &good, &bs58::encode([1u8; 31]).into_string()));
        let other = public_key_base58(&SigningKey::from_bytes(&[12u8; 32]));
        assert!(!verify(&intent, &good, &other));
    }

    #[test]
    fn missing_signature_is_reported() {
        let intent = intent("Payer".into());
        assert_eq!(verify_intent_signature(&intent), Err(SignatureError::Missing));
    }
}
