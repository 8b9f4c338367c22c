//! Solana chain plumbing for x402 settlement.
//!
//! - [`Address`] - A Solana public key (base58-encoded)
//! - [`SolanaChainConfig`] - RPC endpoint, network, facilitator key, mint
//! - [`SolanaChainProvider`] - RPC-backed cluster access with the facilitator keypair
//! - [`RetryPolicy`] - Bounded backoff for transaction submission

pub mod config;
pub mod provider;
pub mod retry;
pub mod types;

pub use config::*;
pub use provider::*;
pub use retry::*;
pub use types::*;
