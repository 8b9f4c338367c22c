//! Process plumbing for the facilitator.
//!
//! | Module | Description | Feature |
//! |--------|-------------|---------|
//! | [`sig_down`] | Graceful shutdown on SIGTERM/SIGINT | - |
//! | [`telemetry`] | `tracing` subscriber, OpenTelemetry export, HTTP spans | `telemetry` |

pub mod sig_down;
#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use sig_down::*;
#[cfg(feature = "telemetry")]
pub use telemetry::*;
