//! Axum middleware for enforcing x402 payments on protected routes.
//!
//! Requests without a valid `X-PAYMENT` header get `402 Payment Required` with the
//! route's terms in the `X-Payment-*` headers. Valid payments are settled through the
//! configured facilitator **before** the handler runs, so a handler only ever executes
//! for money that has moved.
//!
//! ## Example Usage
//!
//! ```rust
//! use axum::{Extension, Router, routing::get};
//! use x402_axum::{PaymentTerms, X402Middleware};
//! use x402_types::proto::{Network, SettleReceipt};
//!
//! let x402 = X402Middleware::try_from("http://localhost:8403").unwrap();
//!
//! let app: Router = Router::new().route(
//!     "/summarize",
//!     get(summarize).layer(x402.with_terms(PaymentTerms::new(
//!         50_000,
//!         "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH",
//!         "pdf-summarizer-v1",
//!         Network::Devnet,
//!     ))),
//! );
//!
//! async fn summarize(Extension(receipt): Extension<SettleReceipt>) -> String {
//!     format!("paid with {}", receipt.tx_signature)
//! }
//! ```
//!
//! Any [`Facilitator`] works, including an in-process one: see
//! [`X402Middleware::from_facilitator`].

use axum_core::extract::Request;
use axum_core::response::Response;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};
use url::Url;
use x402_types::facilitator::Facilitator;

use crate::facilitator_client::{FacilitatorClient, FacilitatorClientError};
use crate::paygate::{Paygate, PaymentTerms};

/// The main X402 middleware instance.
///
/// Create a single instance per application and use it to build payment layers
/// for protected routes.
#[derive(Clone, Debug)]
pub struct X402Middleware<F> {
    facilitator: F,
}

impl<F> X402Middleware<F> {
    /// Uses `facilitator` for settlement, local or remote.
    pub fn from_facilitator(facilitator: F) -> Self {
        Self { facilitator }
    }

    pub fn facilitator(&self) -> &F {
        &self.facilitator
    }
}

impl X402Middleware<Arc<FacilitatorClient>> {
    /// Creates a middleware instance backed by a remote facilitator at `url`.
    pub fn try_new(url: &str) -> Result<Self, FacilitatorClientError> {
        let facilitator = FacilitatorClient::try_from(url)?;
        Ok(Self {
            facilitator: Arc::new(facilitator),
        })
    }

    pub fn facilitator_url(&self) -> &Url {
        self.facilitator.base_url()
    }
}

impl TryFrom<&str> for X402Middleware<Arc<FacilitatorClient>> {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl TryFrom<String> for X402Middleware<Arc<FacilitatorClient>> {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(&value)
    }
}

impl<F> X402Middleware<F>
where
    F: Clone,
{
    /// Builds the layer that charges `terms` on a route.
    pub fn with_terms(&self, terms: PaymentTerms) -> X402Layer<F> {
        X402Layer {
            facilitator: self.facilitator.clone(),
            terms: Arc::new(terms),
        }
    }
}

#[derive(Clone, Debug)]
pub struct X402Layer<F> {
    facilitator: F,
    terms: Arc<PaymentTerms>,
}

impl<F> X402Layer<F> {
    pub fn terms(&self) -> &PaymentTerms {
        &self.terms
    }
}

impl<S, F> Layer<S> for X402Layer<F>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    F: Facilitator + Clone,
{
    type Service = X402MiddlewareService<F>;

    fn layer(&self, inner: S) -> Self::Service {
        X402MiddlewareService {
            facilitator: self.facilitator.clone(),
            terms: self.terms.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Axum service that enforces x402 payments on incoming requests.
#[derive(Clone, Debug)]
pub struct X402MiddlewareService<F> {
    /// Payment facilitator (local or remote)
    facilitator: F,
    terms: Arc<PaymentTerms>,
    /// The inner Axum service being wrapped
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl<F> Service<Request> for X402MiddlewareService<F>
where
    F: Facilitator + Clone + Send + Sync + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let gate = Paygate {
            facilitator: self.facilitator.clone(),
            terms: self.terms.clone(),
        };
        Box::pin(gate.handle_request(self.inner.clone(), req))
    }
}
