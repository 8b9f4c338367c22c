//! x402 Facilitator HTTP entrypoint.
//!
//! Endpoints:
//! - `GET /health` – Mode, network and feature flags
//! - `GET|POST /verify` – Verify an `X-PAYMENT` value
//! - `GET|POST /settle` – Settle a verified payment, at most once per `paymentId`
//! - `GET /settle/{paymentId}` – Settlement status
//! - `POST /invoice`, `GET /invoice/{invoiceId}` – Invoice issuance and lookup
//! - `/gasless/*` – Sponsored and pre-signed transaction flows
//! - `/admin/*` – Emergency pause and security status, behind `Authorization: Bearer $ADMIN_TOKEN`
//! - `/tasks/{invoiceId}/complete`, `/payments/{invoiceId}/claim` – Escrow lifecycle
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `FACILITATOR_PRIVATE_KEY` enables real settlement; without it the server runs in demo mode
//! - `ADMIN_TOKEN` unlocks the admin routes
//! - `OTEL_*` variables enable OpenTelemetry export

use std::process;

#[tokio::main]
async fn main() {
    let result = x402_facilitator::run().await;
    if let Err(e) = result {
        eprintln!("{e}");
        process::exit(1)
    }
}
