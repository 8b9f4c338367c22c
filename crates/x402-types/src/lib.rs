#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Core types for the x402 payment protocol on Solana.
//!
//! A resource server answers `402 Payment Required`; the client attaches a signed,
//! self-describing [`proto::PaymentPayload`] in the `X-PAYMENT` header; a facilitator
//! verifies and settles it. This crate holds everything both sides must agree on,
//! independent of how settlement is carried out.
//!
//! # Modules
//!
//! - [`codec`] - Creating payloads and their base64 transport encoding
//! - [`config`] - Environment variable resolution for configuration values
//! - [`facilitator`] - Core trait for payment verification and settlement
//! - [`ledger`] - The invoice/escrow collaborator consulted by the facilitator
//! - [`multisig`] - Threshold approval for multi-signature payments
//! - [`proto`] - Wire format types, error taxonomy and header contract
//! - [`signing`] - Canonical signing message and Ed25519 verification
//! - [`timestamp`] - Unix timestamp utilities for expiry windows
//! - [`util`] - Base64 helpers
//! - [`validator`] - Structural, temporal and business checks

pub mod codec;
pub mod config;
pub mod facilitator;
pub mod ledger;
pub mod multisig;
pub mod proto;
pub mod signing;
pub mod timestamp;
pub mod util;
pub mod validator;
