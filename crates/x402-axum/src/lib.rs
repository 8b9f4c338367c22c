//! Axum middleware for x402 payments on Solana.
//!
//! Protect a route with [`X402Middleware`]: callers without a settled `X-PAYMENT`
//! get `402 Payment Required` and the terms to pay. Settlement goes through any
//! [`x402_types::facilitator::Facilitator`], typically the remote
//! [`facilitator_client::FacilitatorClient`].

pub mod facilitator_client;
pub mod layer;
pub mod paygate;

pub use layer::X402Middleware;
pub use paygate::PaymentTerms;
