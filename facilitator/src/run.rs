//! Server wiring.
//!
//! Without a valid facilitator key the server still starts: settlement runs in demo
//! mode and the gasless endpoints answer `503`.

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors;
use x402_chain_solana::chain::SolanaChainProvider;
use x402_chain_solana::gasless::GaslessSponsorshipEngine;
use x402_chain_solana::rail::SolanaRail;
use x402_facilitator_local::guard::SecurityGuard;
use x402_facilitator_local::invoice::InvoiceDesk;
use x402_facilitator_local::ledger::InMemoryLedger;
use x402_facilitator_local::util::{SigDown, Telemetry};
use x402_facilitator_local::{AppState, FacilitatorLocal, handlers};
use x402_types::ledger::Ledger;

use crate::config::Config;

/// Initializes the x402 facilitator server.
///
/// - Loads `.env` variables.
/// - Initializes tracing and, when configured, OpenTelemetry export.
/// - Connects to the Solana RPC when a facilitator key is present.
/// - Starts an Axum HTTP server with the facilitator handlers.
///
/// Shuts down gracefully on SIGTERM or SIGINT.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // A provider may already be installed by a dependency; either way one is in place.
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load()?;
    let solana = config.solana();
    let mint = solana.mint();

    let provider = match SolanaChainProvider::from_config(solana) {
        Ok(provider) => provider.map(Arc::new),
        Err(e) => {
            tracing::error!(error = %e, "Facilitator key is unusable, falling back to demo mode");
            None
        }
    };
    let rail = provider.clone().map(|p| SolanaRail::new(p, mint));
    let gasless = provider
        .map(|p| Arc::new(GaslessSponsorshipEngine::new(p, mint, config.gasless().clone())));

    let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
    let store = config.settlement().store.open()?;
    let facilitator =
        FacilitatorLocal::new(rail, store, config.settlement()).with_ledger(ledger.clone());
    let invoices = InvoiceDesk::new(
        config.invoice().clone(),
        ledger.clone(),
        solana.network,
        mint.to_string(),
    );
    let guard = Arc::new(SecurityGuard::new(config.security()));

    tracing::info!(
        network = %solana.network,
        mode = %facilitator.mode(),
        mint = %mint,
        fee_bps = facilitator.fee_bps().get(),
        "Facilitator ready"
    );

    let sig_down = SigDown::try_new()?;
    let maintenance = {
        let guard = guard.clone();
        let cancel = sig_down.cancellation_token();
        tokio::spawn(async move { guard.run_maintenance(cancel).await })
    };

    let state = AppState {
        facilitator: Arc::new(facilitator),
        gasless,
        guard,
        invoices: Arc::new(invoices),
        ledger,
    };

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(state))
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host(), config.port());
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!("Failed to bind to {}: {}", addr, e))?;

    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(sig_down.graceful())
        .await?;

    if let Err(e) = maintenance.await {
        tracing::warn!(error = %e, "Security maintenance task ended abnormally");
    }
    tracing::info!("Server stopped");

    Ok(())
}
