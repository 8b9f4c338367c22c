#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Local facilitator for x402 payments on Solana.
//!
//! [`FacilitatorLocal`] implements [`Facilitator`](x402_types::facilitator::Facilitator):
//! it verifies encoded payment payloads and settles them at most once per `paymentId`,
//! either on the Solana rail or, when no facilitator key is configured, in demo mode.
//!
//! # Modules
//!
//! - [`facilitator_local`] - Verification and idempotent settlement
//! - [`store`] - Settlement stores (in-memory, SQLite) keyed by `paymentId`
//! - [`guard`] - Rate limiting, emergency pause and payer access control
//! - [`invoice`] - Agent price book and invoice issuance
//! - [`ledger`] - In-memory escrow ledger
//! - [`handlers`] - HTTP endpoints
//! - [`util`] - Graceful shutdown and telemetry
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use x402_facilitator_local::{AppState, FacilitatorLocal, handlers};
//!
//! let facilitator = FacilitatorLocal::new(rail, config.settlement.store.open()?, &config.settlement)
//!     .with_ledger(ledger.clone());
//! let state = AppState { facilitator: Arc::new(facilitator), gasless, guard, invoices, ledger };
//! let app = axum::Router::new().merge(handlers::routes().with_state(state));
//! ```

pub mod facilitator_local;
pub mod guard;
pub mod handlers;
pub mod invoice;
pub mod ledger;
pub mod store;
pub mod util;

pub use facilitator_local::*;
pub use handlers::{AppState, routes};
