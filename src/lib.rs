#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! x402 pay-per-use payments on Solana.
//!
//! A resource server answers `402 Payment Required`; the client signs a payment
//! intent and sends it base64-encoded in `X-PAYMENT`; a facilitator verifies the
//! payload and settles it, splitting the amount between the recipient and the
//! platform fee, at most once per `paymentId`.
//!
//! This crate re-exports the workspace members:
//!
//! - [`types`] - Wire format, codec, signing, validation and multi-signature approval
//! - [`solana`] - The Solana rail and gasless sponsorship
//! - [`facilitator`] - The local facilitator, its stores, security guard and HTTP handlers
//! - [`axum`] - Middleware for resource servers and the remote facilitator client

pub use x402_axum as axum;
pub use x402_chain_solana as solana;
pub use x402_facilitator_local as facilitator;
pub use x402_types as types;
