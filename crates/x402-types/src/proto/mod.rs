//! Wire format types for x402 payment payloads.
//!
//! A client answers a `402 Payment Required` by sending a [`PaymentPayload`],
//! base64-encoded, in the `X-PAYMENT` request header. The payload is a
//! versioned envelope around a [`PaymentIntent`]: the self-contained description
//! of a single payment that the payer signs.
//!
//! Extensions (gasless sponsorship, multi-signature approval) live behind the
//! envelope's `features` object, modelled here as the [`Features`] sum type with a
//! single `kind` discriminant.

mod error;
mod headers;

pub use error::*;
pub use headers::*;

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::timestamp::UnixTimestamp;

/// The only supported protocol version.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Rail identifier for Solana payments.
pub const PAYMENT_TYPE_SOLANA: &str = "solana";

/// Deployment networks a payload may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "mainnet-beta")]
    MainnetBeta,
    #[serde(rename = "devnet")]
    Devnet,
    #[serde(rename = "localnet")]
    Localnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::MainnetBeta => "mainnet-beta",
            Network::Devnet => "devnet",
            Network::Localnet => "localnet",
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown network: {0}")]
pub struct UnknownNetwork(String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet-beta" | "mainnet" => Ok(Network::MainnetBeta),
            "devnet" => Ok(Network::Devnet),
            "localnet" | "localhost" => Ok(Network::Localnet),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

/// The payer's Ed25519 authorization over the canonical signing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentSignature {
    /// Base64 of the 64 raw signature bytes.
    pub signature: String,
    pub nonce: u64,
}

/// A single payment, as authorized by the payer.
///
/// Identity fields default to empty strings when absent so that the validator,
/// not the decoder, reports them: a client gets every problem in one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    #[serde(default)]
    pub payment_id: String,
    #[serde(default)]
    pub payer: String,
    #[serde(default)]
    pub recipient: String,
    /// Base units of the token, as a decimal string.
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub token_mint: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub expires_at: UnixTimestamp,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent_signature: Option<PaymentIntentSignature>,
}

impl PaymentIntent {
    /// Parses `amount` as a strictly positive integer.
    ///
    /// Only plain ASCII digits are accepted; signs, decimals and exponents are rejected.
    pub fn amount_value(&self) -> Option<u64> {
        parse_amount(&self.amount)
    }

    /// Reads a string entry of `taskMetadata`.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.task_metadata.as_ref()?.get(key)?.as_str()
    }
}

/// Parses a token amount: non-empty, digits only, fits `u64`, greater than zero.
pub fn parse_amount(s: &str) -> Option<u64> {
    try_parse_amount(s).ok()
}

/// Why an amount string was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Invalid amount")]
    Invalid,
    /// SPL token amounts are `u64` base units.
    #[error("Amount exceeds the largest token amount of {}", u64::MAX)]
    TooLarge,
}

/// [`parse_amount`] that tells a malformed amount from one above `u64::MAX`.
pub fn try_parse_amount(s: &str) -> Result<u64, AmountError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::Invalid);
    }
    let wide = match s.parse::<u128>() {
        Ok(wide) => wide,
        Err(_) => return Err(AmountError::TooLarge),
    };
    match u64::try_from(wide) {
        Ok(0) => Err(AmountError::Invalid),
        Ok(amount) => Ok(amount),
        Err(_) => Err(AmountError::TooLarge),
    }
}

/// The versioned envelope carried in the `X-PAYMENT` header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    /// Protocol version. Kept as free text so a mismatch is reported, not a decode failure.
    pub version: String,
    pub payment_type: String,
    pub network: Network,
    pub payload: PaymentIntent,
    #[serde(default, skip_serializing_if = "Features::is_standard")]
    pub features: Features,
}

impl PaymentPayload {
    pub fn intent(&self) -> &PaymentIntent {
        &self.payload
    }
}

/// A multi-signature approval entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigSignature {
    pub signer: String,
    /// Base64 Ed25519 signature over the intent's canonical message.
    pub signature: String,
    pub timestamp: UnixTimestamp,
    pub nonce: u64,
}

/// Threshold approval requirements attached to a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSigConfig {
    pub threshold: u32,
    pub signers: Vec<String>,
    #[serde(default)]
    pub signatures: Vec<MultiSigSignature>,
    pub deadline: UnixTimestamp,
}

/// Payment extensions.
///
/// Exactly one variant is active, selected by the `kind` discriminant on the wire.
/// A payload whose populated extension fields disagree with its `kind` is rejected.
/// Unrelated fields inside `features` are ignored.
///
/// ```json
/// { "kind": "gasless", "gasless": true, "facilitator": "Fac1..." }
/// { "kind": "multiSig", "multiSig": { "threshold": 2, "signers": [..], "signatures": [], "deadline": 1700000000 } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "FeaturesWire", into = "FeaturesWire")]
pub enum Features {
    #[default]
    Standard,
    Gasless { facilitator: String },
    MultiSig(MultiSigConfig),
}

impl Features {
    pub fn is_standard(&self) -> bool {
        matches!(self, Features::Standard)
    }

    pub fn kind(&self) -> FeatureKind {
        match self {
            Features::Standard => FeatureKind::Standard,
            Features::Gasless { .. } => FeatureKind::Gasless,
            Features::MultiSig(_) => FeatureKind::MultiSig,
        }
    }

    pub fn multi_sig(&self) -> Option<&MultiSigConfig> {
        match self {
            Features::MultiSig(config) => Some(config),
            _ => None,
        }
    }

    pub fn multi_sig_mut(&mut self) -> Option<&mut MultiSigConfig> {
        match self {
            Features::MultiSig(config) => Some(config),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeatureKind {
    Standard,
    Gasless,
    MultiSig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeaturesWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<FeatureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gasless: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    facilitator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    multi_sig: Option<MultiSigConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum FeaturesError {
    #[error("features.kind is required when extension fields are present")]
    MissingKind,
    #[error("features.kind is {kind:?} but {field} is populated")]
    Mismatch { kind: FeatureKind, field: &'static str },
    #[error("features.kind is {kind:?} but {field} is missing")]
    MissingField { kind: FeatureKind, field: &'static str },
    #[error("gasless payments must set features.gasless to true")]
    GaslessFlagFalse,
}

impl TryFrom<FeaturesWire> for Features {
    type Error = FeaturesError;

    fn try_from(wire: FeaturesWire) -> Result<Self, Self::Error> {
        let has_gasless = wire.gasless.is_some() || wire.facilitator.is_some();
        let has_multi_sig = wire.multi_sig.is_some();
        let Some(kind) = wire.kind else {
            return if has_gasless || has_multi_sig {
                Err(FeaturesError::MissingKind)
            } else {
                Ok(Features::Standard)
            };
        };
        let mismatch = |field| FeaturesError::Mismatch { kind, field };
        match kind {
            FeatureKind::Standard => {
                if has_gasless {
                    return Err(mismatch("gasless"));
                }
                if has_multi_sig {
                    return Err(mismatch("multiSig"));
                }
                Ok(Features::Standard)
            }
            FeatureKind::Gasless => {
                if has_multi_sig {
                    return Err(mismatch("multiSig"));
                }
                if wire.gasless == Some(false) {
                    return Err(FeaturesError::GaslessFlagFalse);
                }
                let facilitator = wire.facilitator.ok_or(FeaturesError::MissingField {
                    kind,
                    field: "facilitator",
                })?;
                Ok(Features::Gasless { facilitator })
            }
            FeatureKind::MultiSig => {
                if has_gasless {
                    return Err(mismatch("gasless"));
                }
                let config = wire.multi_sig.ok_or(FeaturesError::MissingField {
                    kind,
                    field: "multiSig",
                })?;
                Ok(Features::MultiSig(config))
            }
        }
    }
}

impl From<Features> for FeaturesWire {
    fn from(features: Features) -> Self {
        match features {
            Features::Standard => FeaturesWire {
                kind: Some(FeatureKind::Standard),
                ..Default::default()
            },
            Features::Gasless { facilitator } => FeaturesWire {
                kind: Some(FeatureKind::Gasless),
                gasless: Some(true),
                facilitator: Some(facilitator),
                multi_sig: None,
            },
            Features::MultiSig(config) => FeaturesWire {
                kind: Some(FeatureKind::MultiSig),
                multi_sig: Some(config),
                ..Default::default()
            },
        }
    }
}

/// Platform fee rate in basis points, `0..=10000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct PlatformFeeBps(u16);

impl PlatformFeeBps {
    pub const MAX: u16 = 10_000;

    pub fn new(bps: u16) -> Option<Self> {
        (bps <= Self::MAX).then_some(Self(bps))
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

impl Default for PlatformFeeBps {
    fn default() -> Self {
        Self(500)
    }
}

impl TryFrom<u16> for PlatformFeeBps {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("platform fee must be at most 10000 bps, got {value}"))
    }
}

impl From<PlatformFeeBps> for u16 {
    fn from(value: PlatformFeeBps) -> Self {
        value.0
    }
}

/// Division of a payment between the platform and the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub amount: u64,
    pub fee_amount: u64,
    pub recipient_amount: u64,
}

impl FeeSplit {
    /// `fee = floor(amount * bps / 10000)`, the recipient receives the rest.
    ///
    /// ```
    /// use x402_types::proto::{FeeSplit, PlatformFeeBps};
    ///
    /// let split = FeeSplit::compute(1_000_000, PlatformFeeBps::default());
    /// assert_eq!(split.fee_amount, 50_000);
    /// assert_eq!(split.recipient_amount, 950_000);
    /// ```
    pub fn compute(amount: u64, bps: PlatformFeeBps) -> Self {
        // bps <= 10000 keeps the quotient <= amount, so it fits back into u64.
        let fee_amount = (amount as u128 * bps.0 as u128 / PlatformFeeBps::MAX as u128) as u64;
        Self {
            amount,
            fee_amount,
            recipient_amount: amount - fee_amount,
        }
    }
}

/// Result of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedPayment {
    pub payment_id: String,
    pub payer: String,
    pub recipient: String,
    pub amount: String,
    pub agent_id: String,
}

impl VerifiedPayment {
    pub fn from_intent(intent: &PaymentIntent) -> Self {
        Self {
            payment_id: intent.payment_id.clone(),
            payer: intent.payer.clone(),
            recipient: intent.recipient.clone(),
            amount: intent.amount.clone(),
            agent_id: intent.agent_id.clone(),
        }
    }
}

/// How a payment was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementMode {
    /// Synthetic settlement, no funds moved.
    Demo,
    Real,
}

impl Display for SettlementMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SettlementMode::Demo => f.write_str("demo"),
            SettlementMode::Real => f.write_str("real"),
        }
    }
}

/// Proof of settlement returned to the resource server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleReceipt {
    pub payment_id: String,
    pub mode: SettlementMode,
    pub tx_signature: String,
    pub slot: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_amount: Option<String>,
    pub settled_at: chrono::DateTime<chrono::Utc>,
}

/// Body of a verification response: `{valid: true, ...payment}` or `{valid: false, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(flatten)]
    pub payment: Option<VerifiedPayment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl From<Result<VerifiedPayment, PaymentError>> for VerifyResponse {
    fn from(result: Result<VerifiedPayment, PaymentError>) -> Self {
        match result {
            Ok(payment) => VerifyResponse {
                valid: true,
                payment: Some(payment),
                error: None,
                error_kind: None,
                details: Vec::new(),
            },
            Err(error) => VerifyResponse {
                valid: false,
                payment: None,
                error: Some(error.to_string()),
                error_kind: Some(error.kind().to_string()),
                details: error.details(),
            },
        }
    }
}

/// Body of a settlement response: `{success: true, ...receipt}` or `{success: false, error}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(flatten)]
    pub receipt: Option<SettleReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl From<Result<SettleReceipt, PaymentError>> for SettleResponse {
    fn from(result: Result<SettleReceipt, PaymentError>) -> Self {
        match result {
            Ok(receipt) => SettleResponse {
                success: true,
                receipt: Some(receipt),
                error: None,
                error_kind: None,
                details: Vec::new(),
            },
            Err(error) => SettleResponse {
                success: false,
                receipt: None,
                error: Some(error.to_string()),
                error_kind: Some(error.kind().to_string()),
                details: error.details(),
            },
        }
    }
}

/// Request body accepted by `/verify` and `/settle`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    /// The base64 `X-PAYMENT` value.
    pub payment: String,
}
