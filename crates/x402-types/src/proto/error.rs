//! The error taxonomy shared by verification and settlement.
//!
//! Business failures are values: every verify or settle step returns
//! `Result<_, PaymentError>`, and the HTTP layer renders the error with its
//! [`PaymentError::kind`] code.

/// Why a payer signature was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Invalid payment intent signature")]
    Invalid,
    #[error("Payment intent signature is required")]
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PaymentError {
    /// The `X-PAYMENT` value is not base64 or does not hold a payload.
    #[error("Invalid payment header: {0}")]
    Decode(String),
    /// Every structural or business rule the payload broke.
    #[error("Invalid payment payload: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("Payment payload has expired")]
    Expired,
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("Facilitator balance {balance} lamports is below the required reserve of {required}")]
    InsufficientSponsorBalance { balance: u64, required: u64 },
    #[error("Sponsorship limit exceeded: {0}")]
    SponsorshipLimitExceeded(String),
    /// Rail or network failure after retries were exhausted.
    #[error("Settlement failed: {0}")]
    Settlement(String),
    #[error("Multi-signature approval incomplete: {approvals} of {threshold} required signatures")]
    MultiSigThreshold { approvals: usize, threshold: u32 },
    #[error("Payment {0} was already submitted for settlement")]
    DuplicateSettlement(String),
}

impl PaymentError {
    /// Machine-readable code for the error.
    pub fn kind(&self) -> &'static str {
        match self {
            PaymentError::Decode(_) => "decode_error",
            PaymentError::Validation(_) => "validation_error",
            PaymentError::Expired => "expired",
            PaymentError::Signature(SignatureError::Invalid) => "invalid_signature",
            PaymentError::Signature(SignatureError::Missing) => "missing_signature",
            PaymentError::InsufficientSponsorBalance { .. } => "insufficient_sponsor_balance",
            PaymentError::SponsorshipLimitExceeded(_) => "sponsorship_limit_exceeded",
            PaymentError::Settlement(_) => "settlement_error",
            PaymentError::MultiSigThreshold { .. } => "multisig_threshold",
            PaymentError::DuplicateSettlement(_) => "duplicate_settlement",
        }
    }

    /// Whether the payment was refused before anything was signed or sent.
    ///
    /// Rails report every failure that may have reached the cluster as
    /// [`PaymentError::Settlement`].
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            PaymentError::Settlement(_) | PaymentError::DuplicateSettlement(_)
        )
    }

    /// The individual validation messages, empty for other kinds.
    pub fn details(&self) -> Vec<String> {
        match self {
            PaymentError::Validation(errors) => errors.clone(),
            _ => Vec::new(),
        }
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}
