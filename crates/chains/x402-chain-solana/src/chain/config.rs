use serde::{Deserialize, Serialize};
use solana_commitment_config::CommitmentConfig;
use solana_keypair::Keypair;
use std::str::FromStr;
use std::time::Duration;
use url::Url;
use x402_types::config::LiteralOrEnv;
use x402_types::proto::Network;

use crate::chain::Address;
use crate::networks::KnownNetworkSolana;

/// Solana settings for the facilitator.
///
/// Every field falls back to an environment variable, then to a hardcoded default,
/// so an empty `"solana": {}` block is a working devnet configuration in demo mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolanaChainConfig {
    /// `SOLANA_NETWORK`, `devnet` by default.
    #[serde(default = "solana_chain_config::default_network")]
    pub network: Network,
    /// `SOLANA_RPC_URL`, the network's public endpoint when unset.
    #[serde(default = "solana_chain_config::default_rpc")]
    pub rpc: Option<Url>,
    /// Facilitator key (base58, 64 bytes). Falls back to `FACILITATOR_PRIVATE_KEY`.
    /// Without one the facilitator settles in demo mode.
    #[serde(default = "solana_chain_config::default_signer")]
    pub signer: Option<SolanaSignerConfig>,
    /// `USDC_MINT_ADDRESS`, the network's USDC mint by default.
    #[serde(default = "solana_chain_config::default_usdc_mint")]
    pub usdc_mint: Option<Address>,
    /// Bound on every RPC read and on confirmation polling.
    #[serde(default = "solana_chain_config::default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default)]
    pub commitment: Commitment,
}

impl Default for SolanaChainConfig {
    fn default() -> Self {
        Self {
            network: solana_chain_config::default_network(),
            rpc: solana_chain_config::default_rpc(),
            signer: solana_chain_config::default_signer(),
            usdc_mint: solana_chain_config::default_usdc_mint(),
            rpc_timeout_secs: solana_chain_config::default_rpc_timeout_secs(),
            commitment: Commitment::default(),
        }
    }
}

impl SolanaChainConfig {
    /// The configured mint, or the network's USDC mint.
    pub fn mint(&self) -> Address {
        self.usdc_mint
            .unwrap_or_else(|| Address::new(self.network.usdc_mint()))
    }

    pub fn rpc_url(&self) -> String {
        match &self.rpc {
            Some(url) => url.to_string(),
            None => self.network.default_rpc_url().to_string(),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn signer(&self) -> Option<&SolanaPrivateKey> {
        self.signer.as_ref().map(|s| s.0.inner())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    #[default]
    Confirmed,
    Finalized,
}

impl From<Commitment> for CommitmentConfig {
    fn from(value: Commitment) -> Self {
        match value {
            Commitment::Processed => CommitmentConfig::processed(),
            Commitment::Confirmed => CommitmentConfig::confirmed(),
            Commitment::Finalized => CommitmentConfig::finalized(),
        }
    }
}

mod solana_chain_config {
    use super::*;

    pub fn default_network() -> Network {
        std::env::var("SOLANA_NETWORK")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Network::Devnet)
    }

    pub fn default_rpc() -> Option<Url> {
        let raw = std::env::var("SOLANA_RPC_URL").ok()?;
        Url::parse(&raw)
            .inspect_err(|e| tracing::warn!(error = %e, "SOLANA_RPC_URL is not a valid URL, ignoring it"))
            .ok()
    }

    pub fn default_signer() -> Option<SolanaSignerConfig> {
        let raw = std::env::var("FACILITATOR_PRIVATE_KEY").ok()?;
        if raw.trim().is_empty() {
            return None;
        }
        match SolanaPrivateKey::from_str(raw.trim()) {
            Ok(key) => Some(SolanaSignerConfig(LiteralOrEnv::from_literal(key))),
            Err(e) => {
                tracing::error!(error = %e, "FACILITATOR_PRIVATE_KEY is not a valid keypair, ignoring it");
                None
            }
        }
    }

    pub fn default_usdc_mint() -> Option<Address> {
        std::env::var("USDC_MINT_ADDRESS")
            .ok()
            .and_then(|s| Address::from_str(&s).ok())
    }

    pub fn default_rpc_timeout_secs() -> u64 {
        10
    }
}

// ============================================================================
// Solana Private Key
// ============================================================================

/// A validated Solana keypair in its 64-byte form: 32 secret bytes then 32 public bytes.
///
/// Parsed from base58 (the Solana CLI/wallet export format) or from the JSON byte
/// array written by `solana-keygen`.
#[derive(Clone, PartialEq, Eq)]
pub struct SolanaPrivateKey([u8; 64]);

impl std::fmt::Debug for SolanaPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SolanaPrivateKey(..)")
    }
}

impl SolanaPrivateKey {
    pub fn from_base58(s: &str) -> Result<Self, String> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| format!("Invalid base58: {}", e))?;
        Self::from_slice(&bytes)
    }

    pub fn from_json_bytes(s: &str) -> Result<Self, String> {
        let bytes: Vec<u8> =
            serde_json::from_str(s).map_err(|e| format!("Invalid key byte array: {e}"))?;
        Self::from_slice(&bytes)
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, String> {
        let arr: [u8; 64] = bytes.try_into().map_err(|_| {
            format!(
                "Private key must be 64 bytes (standard Solana format), got {} bytes",
                bytes.len()
            )
        })?;
        Keypair::try_from(&arr[..]).map_err(|e| format!("Invalid keypair: {e}"))?;
        Ok(Self(arr))
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn keypair(&self) -> Result<Keypair, String> {
        Keypair::try_from(&self.0[..]).map_err(|e| format!("Invalid keypair: {e}"))
    }
}

impl Serialize for SolanaPrivateKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base58())
    }
}

impl FromStr for SolanaPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim_start().starts_with('[') {
            Self::from_json_bytes(s)
        } else {
            Self::from_base58(s)
        }
    }
}

/// The facilitator's signing key, literal or `$ENV` reference.
///
/// ```json
/// { "signer": "$FACILITATOR_PRIVATE_KEY" }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolanaSignerConfig(LiteralOrEnv<SolanaPrivateKey>);

impl SolanaSignerConfig {
    pub fn new(key: SolanaPrivateKey) -> Self {
        Self(LiteralOrEnv::from_literal(key))
    }
}
