//! x402 Facilitator Server
//!
//! An HTTP server that verifies and settles x402 payments on Solana, issues invoices
//! for priced agents, sponsors network fees for gasless payments and tracks escrowed
//! payments through task completion.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Configuration types and loading |
//! | [`run`] | Server initialization and runtime |
//!
//! # Running the Server
//!
//! ```bash
//! # Demo mode: no facilitator key, synthetic settlements
//! cargo run --package x402-facilitator
//!
//! # Real settlement on devnet
//! FACILITATOR_PRIVATE_KEY=<base58 keypair> cargo run --package x402-facilitator
//!
//! # Run with custom config
//! cargo run --package x402-facilitator -- --config /path/to/config.json
//! ```

pub mod config;
pub mod run;

pub use run::run;
