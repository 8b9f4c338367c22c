#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Solana rail for the x402 payment protocol.
//!
//! Payments settle as SPL token `TransferChecked` instructions between associated
//! token accounts. The facilitator signs as fee payer and, for intent-only
//! payments, as the SPL delegate the payer approved for its token account.
//!
//! # Modules
//!
//! - [`chain`] - Provider trait, RPC-backed provider, configuration and retry policy
//! - [`networks`] - Per-network USDC mints and RPC endpoints
//! - [`transfer`] - Token account resolution, transfer building and inspection
//! - [`rail`] - Fee-split settlement of a verified payment
//! - [`gasless`] - Facilitator-sponsored and pre-signed transaction flows

pub mod chain;
pub mod gasless;
pub mod networks;
pub mod rail;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use networks::KnownNetworkSolana;
