//! HTTP endpoints implemented by the facilitator.
//!
//! Protocol endpoints (`/verify`, `/settle`) take `{"payment": "<X-PAYMENT value>"}`
//! and answer with [`VerifyResponse`] / [`SettleResponse`]. Around them sit invoice
//! issuance, the gasless flows, settlement lookup, the security admin surface and
//! the escrow lifecycle routes.
//!
//! Status codes: invalid or failed `400`, duplicate `409`, paused `503`,
//! rate-limited `429`, forbidden payer `403`, unknown id `404`, internal `500`.
//! The `/admin` routes answer `401` unless called with the configured admin token.

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::instrument;
use x402_chain_solana::chain::SolanaChainProviderLike;
use x402_chain_solana::gasless::{GaslessReceipt, GaslessSponsorshipEngine};
use x402_chain_solana::rail::SolanaRail;
use x402_types::ledger::{Ledger, LedgerError};
use x402_types::proto::{
    PaymentError, PaymentPayload, PaymentRequest, SettleReceipt, SettleResponse, SettlementMode,
    VerifyResponse,
};

use crate::facilitator_local::FacilitatorLocal;
use crate::guard::{GuardError, SecurityGuard};
use crate::invoice::{InvoiceDesk, InvoiceError, InvoiceRequest};

/// Shared state of the facilitator router.
pub struct AppState<P> {
    pub facilitator: Arc<FacilitatorLocal<SolanaRail<P>>>,
    /// Present only when a facilitator key is configured.
    pub gasless: Option<Arc<GaslessSponsorshipEngine<P>>>,
    pub guard: Arc<SecurityGuard>,
    pub invoices: Arc<InvoiceDesk>,
    pub ledger: Arc<dyn Ledger>,
}

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            facilitator: self.facilitator.clone(),
            gasless: self.gasless.clone(),
            guard: self.guard.clone(),
            invoices: self.invoices.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

pub fn routes<P>() -> Router<AppState<P>>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(get_health::<P>))
        .route("/verify", get(get_verify_info).post(post_verify::<P>))
        .route("/settle", get(get_settle_info).post(post_settle::<P>))
        .route("/settle/{payment_id}", get(get_settlement::<P>))
        .route("/invoice", post(post_invoice::<P>))
        .route("/invoice/{invoice_id}", get(get_invoice::<P>))
        .route("/gasless/estimate", post(post_gasless_estimate::<P>))
        .route("/gasless/execute", post(post_gasless_execute::<P>))
        .route("/gasless/execute-presigned", post(post_gasless_execute_presigned::<P>))
        .route("/gasless/stats", get(get_gasless_stats::<P>))
        .route("/gasless/tx/{signature}", get(get_gasless_tx::<P>))
        .route("/admin/pause", post(post_pause::<P>).delete(delete_pause::<P>))
        .route("/admin/security", get(get_security::<P>))
        .route("/tasks/{invoice_id}/complete", post(post_complete_task::<P>))
        .route("/payments/{invoice_id}/claim", post(post_claim_payment::<P>))
}

/// A failure rendered as `{error, errorKind}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn gasless_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "gasless_unavailable",
            "Gasless sponsorship requires a configured facilitator key",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message, "errorKind": self.kind }));
        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<GuardError> for ApiError {
    fn from(error: GuardError) -> Self {
        let message = error.to_string();
        match error {
            GuardError::Paused(_) => ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "paused", message),
            GuardError::RateLimited { retry_after_secs } => ApiError {
                retry_after: Some(retry_after_secs),
                ..ApiError::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
            },
            GuardError::Forbidden(_) => ApiError::new(StatusCode::FORBIDDEN, "forbidden", message),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        let message = error.to_string();
        match error {
            LedgerError::UnknownInvoice(_) => ApiError::not_found(message),
            LedgerError::InvoiceExpired(_) => ApiError::new(StatusCode::BAD_REQUEST, "invoice_expired", message),
            LedgerError::AlreadyPaid(_) => ApiError::new(StatusCode::CONFLICT, "already_paid", message),
            LedgerError::InvalidState { .. } => ApiError::new(StatusCode::CONFLICT, "invalid_state", message),
            LedgerError::Remote(_) => {
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "ledger_unavailable", message)
            }
        }
    }
}

impl From<InvoiceError> for ApiError {
    fn from(error: InvoiceError) -> Self {
        let message = error.to_string();
        match error {
            InvoiceError::UnknownAgent(_) => ApiError::not_found(message),
            InvoiceError::MissingField(_) | InvoiceError::InvalidAmount => {
                ApiError::new(StatusCode::BAD_REQUEST, "validation_error", message)
            }
            InvoiceError::Ledger(e) => e.into(),
        }
    }
}

impl From<PaymentError> for ApiError {
    fn from(error: PaymentError) -> Self {
        ApiError::new(payment_status(&error), error.kind(), error.to_string())
    }
}

fn payment_status(error: &PaymentError) -> StatusCode {
    match error {
        PaymentError::DuplicateSettlement(_) => StatusCode::CONFLICT,
        PaymentError::InsufficientSponsorBalance { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Proof that the request carried `Authorization: Bearer <admin token>`.
pub struct AdminAuth;

impl<P> FromRequestParts<AppState<P>> for AdminAuth
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState<P>) -> Result<Self, Self::Rejection> {
        let bearer = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if state.guard.admin_authorized(bearer) {
            return Ok(AdminAuth);
        }
        tracing::warn!(path = %parts.uri.path(), "Unauthorized admin request");
        Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Valid admin bearer token required",
        ))
    }
}

/// Rate-limit key: the payer when known, else the first forwarded client address.
fn rate_key(headers: &HeaderMap, payer: Option<&str>) -> String {
    if let Some(payer) = payer.filter(|p| !p.is_empty()) {
        return payer.to_string();
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// Screens a request carrying `payment`. The payer is read without verification,
/// only to pick the rate-limit key and apply access control.
fn screen(guard: &SecurityGuard, headers: &HeaderMap, payment: &str) -> Result<(), ApiError> {
    let payer = PaymentPayload::decode(payment).ok().map(|p| p.payload.payer);
    let key = rate_key(headers, payer.as_deref());
    guard.check(&key, payer.as_deref()).map_err(|e| {
        tracing::warn!(key = %key, error = %e, "Request screened out");
        ApiError::from(e)
    })
}

#[instrument(skip_all)]
pub async fn get_health<P>(State(state): State<AppState<P>>) -> impl IntoResponse
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let facilitator = &state.facilitator;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": facilitator.mode(),
        "demoMode": facilitator.is_demo(),
        "platformFeeBps": facilitator.fee_bps(),
        "gasless": state.gasless.as_ref().is_some_and(|g| g.config().enabled),
        "paused": state.guard.pause.status().active,
    }))
}

/// `GET /verify`: describes the `/verify` request body.
#[instrument(skip_all)]
pub async fn get_verify_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/verify",
        "description": "POST to verify an x402 payment",
        "body": { "payment": "base64 X-PAYMENT value" },
    }))
}

/// `GET /settle`: describes the `/settle` request body.
#[instrument(skip_all)]
pub async fn get_settle_info() -> impl IntoResponse {
    Json(json!({
        "endpoint": "/settle",
        "description": "POST to settle an x402 payment, at most once per paymentId",
        "body": { "payment": "base64 X-PAYMENT value" },
    }))
}

/// `POST /verify`: decodes, validates and authenticates a payment without settling it.
#[instrument(skip_all)]
pub async fn post_verify<P>(
    State(state): State<AppState<P>>,
    headers: HeaderMap,
    Json(body): Json<PaymentRequest>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    screen(&state.guard, &headers, &body.payment)?;
    let result = state.facilitator.verify_payment(&body.payment);
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(error) => payment_status(error),
    };
    Ok((status, Json(VerifyResponse::from(result))).into_response())
}

/// `POST /settle`: verifies the payment again and moves the funds.
#[instrument(skip_all)]
pub async fn post_settle<P>(
    State(state): State<AppState<P>>,
    headers: HeaderMap,
    Json(body): Json<PaymentRequest>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    screen(&state.guard, &headers, &body.payment)?;
    let result = state.facilitator.settle_payment(&body.payment).await;
    Ok(settle_response(result))
}

fn settle_response(result: Result<SettleReceipt, PaymentError>) -> Response {
    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err(error) => payment_status(error),
    };
    (status, Json(SettleResponse::from(result))).into_response()
}

#[instrument(skip_all, fields(payment_id = %payment_id))]
pub async fn get_settlement<P>(
    State(state): State<AppState<P>>,
    Path(payment_id): Path<String>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let report = state.facilitator.settlement_status(&payment_id).await.map_err(|e| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
    })?;
    Ok(Json(report).into_response())
}

#[instrument(skip_all)]
pub async fn post_invoice<P>(
    State(state): State<AppState<P>>,
    Json(body): Json<InvoiceRequest>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let invoice = state.invoices.create(body).await?;
    Ok((StatusCode::CREATED, Json(invoice)).into_response())
}

#[instrument(skip_all, fields(invoice_id = %invoice_id))]
pub async fn get_invoice<P>(
    State(state): State<AppState<P>>,
    Path(invoice_id): Path<String>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let invoice = state
        .ledger
        .get_invoice(&invoice_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Unknown invoice {invoice_id}")))?;
    Ok(Json(invoice).into_response())
}

/// Settle response of the gasless routes, with the sponsorship details.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GaslessSettleResponse {
    #[serde(flatten)]
    pub settlement: SettleResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_paid_by_facilitator: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_gas_cost: Option<u64>,
}

fn gasless_receipt(payload: &PaymentPayload, gas: &GaslessReceipt) -> SettleReceipt {
    SettleReceipt {
        payment_id: payload.payload.payment_id.clone(),
        mode: SettlementMode::Real,
        tx_signature: gas.signature.clone(),
        slot: gas.slot,
        fee_amount: None,
        recipient_amount: Some(payload.payload.amount.clone()),
        settled_at: chrono::Utc::now(),
    }
}

fn gasless_response(result: Result<(SettleReceipt, GaslessReceipt), PaymentError>) -> Response {
    let (status, gas, result) = match result {
        Ok((receipt, gas)) => (StatusCode::OK, Some(gas), Ok(receipt)),
        Err(error) => (payment_status(&error), None, Err(error)),
    };
    let body = GaslessSettleResponse {
        settlement: SettleResponse::from(result),
        gas_paid_by_facilitator: gas.as_ref().map(|g| g.gas_paid_by_facilitator),
        user_gas_cost: gas.as_ref().map(|g| g.user_gas_cost),
    };
    (status, Json(body)).into_response()
}

#[instrument(skip_all)]
pub async fn post_gasless_estimate<P>(
    State(state): State<AppState<P>>,
    Json(body): Json<PaymentRequest>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let engine = state.gasless.as_ref().ok_or_else(ApiError::gasless_unavailable)?;
    let payload = PaymentPayload::decode(&body.payment)?;
    Ok(Json(engine.estimate_gas_cost(&payload).await).into_response())
}

/// `POST /gasless/execute`: verifies the payment and submits it with the facilitator paying the fee.
#[instrument(skip_all)]
pub async fn post_gasless_execute<P>(
    State(state): State<AppState<P>>,
    headers: HeaderMap,
    Json(body): Json<PaymentRequest>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let engine = state.gasless.as_ref().ok_or_else(ApiError::gasless_unavailable)?;
    screen(&state.guard, &headers, &body.payment)?;
    let result = state
        .facilitator
        .settle_via(&body.payment, |payload| async move {
            let gas = engine.build_and_submit(&payload).await?;
            Ok((gasless_receipt(&payload, &gas), gas))
        })
        .await;
    Ok(gasless_response(result))
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreSignedRequest {
    /// Base64 transaction signed by the payer.
    pub transaction: String,
    pub payment: String,
}

/// `POST /gasless/execute-presigned`: co-signs a payer-signed transfer as fee payer and submits it.
#[instrument(skip_all)]
pub async fn post_gasless_execute_presigned<P>(
    State(state): State<AppState<P>>,
    headers: HeaderMap,
    Json(body): Json<PreSignedRequest>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let engine = state.gasless.as_ref().ok_or_else(ApiError::gasless_unavailable)?;
    screen(&state.guard, &headers, &body.payment)?;
    let transaction = body.transaction.as_str();
    let result = state
        .facilitator
        .settle_via(&body.payment, |payload| async move {
            let gas = engine.execute_pre_signed(transaction, &payload).await?;
            Ok((gasless_receipt(&payload, &gas), gas))
        })
        .await;
    Ok(gasless_response(result))
}

#[instrument(skip_all)]
pub async fn get_gasless_stats<P>(State(state): State<AppState<P>>) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let engine = state.gasless.as_ref().ok_or_else(ApiError::gasless_unavailable)?;
    let stats = engine.get_facilitator_stats().await.map_err(|e| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.kind(), e.to_string())
    })?;
    Ok(Json(stats).into_response())
}

#[instrument(skip_all, fields(signature = %signature))]
pub async fn get_gasless_tx<P>(
    State(state): State<AppState<P>>,
    Path(signature): Path<String>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let engine = state.gasless.as_ref().ok_or_else(ApiError::gasless_unavailable)?;
    Ok(Json(engine.get_transaction_status(&signature).await).into_response())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PauseRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[instrument(skip_all)]
pub async fn post_pause<P>(
    _admin: AdminAuth,
    State(state): State<AppState<P>>,
    body: Option<Json<PauseRequest>>,
) -> impl IntoResponse
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "Emergency pause".to_string());
    Json(state.guard.pause.activate(reason))
}

#[instrument(skip_all)]
pub async fn delete_pause<P>(_admin: AdminAuth, State(state): State<AppState<P>>) -> impl IntoResponse
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    Json(state.guard.pause.deactivate())
}

#[instrument(skip_all)]
pub async fn get_security<P>(_admin: AdminAuth, State(state): State<AppState<P>>) -> impl IntoResponse
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    Json(state.guard.status())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteTaskRequest {
    pub result_reference: String,
}

/// `POST /tasks/{invoiceId}/complete`: the paid task produced its result.
#[instrument(skip_all, fields(invoice_id = %invoice_id))]
pub async fn post_complete_task<P>(
    State(state): State<AppState<P>>,
    Path(invoice_id): Path<String>,
    Json(body): Json<CompleteTaskRequest>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let record = state
        .ledger
        .get_payment(&invoice_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No payment for invoice {invoice_id}")))?;
    let record = state.ledger.complete_task(&record, &body.result_reference).await?;
    tracing::info!(invoice_id = %invoice_id, "Task completed");
    Ok(Json(record).into_response())
}

/// `POST /payments/{invoiceId}/claim`: releases escrowed funds to the agent.
#[instrument(skip_all, fields(invoice_id = %invoice_id))]
pub async fn post_claim_payment<P>(
    State(state): State<AppState<P>>,
    Path(invoice_id): Path<String>,
) -> Result<Response, ApiError>
where
    P: SolanaChainProviderLike + Send + Sync + 'static,
{
    let record = state
        .ledger
        .get_payment(&invoice_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No payment for invoice {invoice_id}")))?;
    let transferred = state.ledger.claim_payment(&record).await?;
    let payment = state.ledger.get_payment(&invoice_id).await?;
    Ok(Json(json!({
        "invoiceId": invoice_id,
        "transferred": transferred,
        "payment": payment,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facilitator_local::SettlementConfig;
    use crate::guard::{AdminToken, RateLimitConfig, SecurityConfig};
    use crate::invoice::{DEFAULT_RECIPIENT, InvoiceConfig};
    use crate::ledger::InMemoryLedger;
    use crate::store::InMemorySettlementStore;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use ed25519_dalek::SigningKey;
    use serde_json::Value;
    use solana_commitment_config::CommitmentConfig;
    use solana_keypair::Keypair;
    use std::time::Duration;
    use tower::ServiceExt;
    use x402_chain_solana::chain::{Address, SolanaChainProvider};
    use x402_chain_solana::gasless::GaslessConfig;
    use x402_types::codec::CreatePaymentParams;
    use x402_types::proto::{Features, Network, PlatformFeeBps};
    use x402_types::signing::public_key_base58;

    const MINT: &str = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZJDncDU";
    const ADMIN_TOKEN: &str = "admin-s3cret";

    fn admin_security() -> SecurityConfig {
        SecurityConfig {
            admin_token: Some(AdminToken::new(ADMIN_TOKEN)),
            ..SecurityConfig::default()
        }
    }

    /// A facilitator key on an unreachable cluster: enough for checks that run
    /// before any RPC call.
    fn offline_engine(config: GaslessConfig) -> (GaslessSponsorshipEngine<SolanaChainProvider>, String) {
        let provider = SolanaChainProvider::new(
            Keypair::new(),
            "http://127.0.0.1:1".to_string(),
            CommitmentConfig::confirmed(),
            Duration::from_secs(1),
        );
        let facilitator = provider.pubkey().to_string();
        let mint: Address = MINT.parse().unwrap();
        (GaslessSponsorshipEngine::new(provider, mint, config), facilitator)
    }

    fn app_with(security: SecurityConfig) -> Router {
        build_app(security, None)
    }

    fn build_app(
        security: SecurityConfig,
        gasless: Option<GaslessSponsorshipEngine<SolanaChainProvider>>,
    ) -> Router {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let facilitator = FacilitatorLocal::new(
            None,
            Box::new(InMemorySettlementStore::new()),
            &SettlementConfig {
                platform_fee_bps: PlatformFeeBps::default(),
                ..SettlementConfig::default()
            },
        )
        .with_ledger(ledger.clone());
        let invoices = InvoiceDesk::new(
            InvoiceConfig {
                default_recipient: DEFAULT_RECIPIENT.to_string(),
                ..InvoiceConfig::default()
            },
            ledger.clone(),
            Network::Devnet,
            MINT.to_string(),
        );
        let state: AppState<SolanaChainProvider> = AppState {
            facilitator: Arc::new(facilitator),
            gasless: gasless.map(Arc::new),
            guard: Arc::new(SecurityGuard::new(&security)),
            invoices: Arc::new(invoices),
            ledger,
        };
        routes().with_state(state)
    }

    fn app() -> Router {
        app_with(admin_security())
    }

    fn signed_payment(payment_id: &str) -> String {
        signed_with(payment_id, Features::Standard)
    }

    fn signed_with(payment_id: &str, features: Features) -> String {
        let payer = SigningKey::from_bytes(&[7; 32]);
        let mut payload = PaymentPayload::create(CreatePaymentParams {
            payment_id: payment_id.into(),
            payer: public_key_base58(&payer),
            recipient: DEFAULT_RECIPIENT.into(),
            amount: "1000000".into(),
            token_mint: MINT.into(),
            agent_id: "pdf-summarizer-v1".into(),
            network: Network::Devnet,
            task_metadata: None,
            expiry_seconds: None,
        });
        payload.features = features;
        payload.signed(&payer).encode()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn as_admin(mut request: Request<Body>, token: &str) -> Request<Body> {
        let value = HeaderValue::from_str(&format!("Bearer {token}")).unwrap();
        request.headers_mut().insert(header::AUTHORIZATION, value);
        request
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn health_reports_demo_mode() {
        let app = app();
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "demo");
        assert_eq!(body["demoMode"], true);
        assert_eq!(body["platformFeeBps"], 500);
    }

    #[tokio::test]
    async fn verify_then_settle_then_duplicate() {
        let app = app();
        let payment = signed_payment("pay_http");

        let (status, body) = send(&app, post_json("/verify", json!({ "payment": payment }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], true);
        assert_eq!(body["paymentId"], "pay_http");

        let (status, body) = send(&app, post_json("/settle", json!({ "payment": payment }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["mode"], "demo");

        let (status, body) = send(&app, post_json("/settle", json!({ "payment": payment }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errorKind"], "duplicate_settlement");

        let (status, body) = send(&app, Request::get("/settle/pay_http").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "settled");
        assert_eq!(body["demoMode"], true);
    }

    #[tokio::test]
    async fn garbage_payment_is_bad_request() {
        let app = app();
        let (status, body) = send(&app, post_json("/verify", json!({ "payment": "not-a-payload" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["valid"], false);
        assert_eq!(body["errorKind"], "decode_error");

        let (_, body) = send(&app, Request::get("/settle/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(body["status"], "unknown");
    }

    #[tokio::test]
    async fn pause_blocks_settlement() {
        let app = app();
        let pause = as_admin(post_json("/admin/pause", json!({ "reason": "incident" })), ADMIN_TOKEN);
        let (status, body) = send(&app, pause).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], true);

        let payment = signed_payment("pay_paused");
        let (status, body) = send(&app, post_json("/settle", json!({ "payment": payment }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["errorKind"], "paused");

        let request = as_admin(Request::delete("/admin/pause").body(Body::empty()).unwrap(), ADMIN_TOKEN);
        let (_, body) = send(&app, request).await;
        assert_eq!(body["active"], false);
        let (status, _) = send(&app, post_json("/settle", json!({ "payment": payment }))).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn rate_limit_answers_429() {
        let app = app_with(SecurityConfig {
            rate_limit: RateLimitConfig {
                enabled: true,
                requests_per_minute: 1,
            },
            ..SecurityConfig::default()
        });
        let payment = signed_payment("pay_limited");
        let (status, _) = send(&app, post_json("/verify", json!({ "payment": payment }))).await;
        assert_eq!(status, StatusCode::OK);
        let response = app
            .clone()
            .oneshot(post_json("/verify", json!({ "payment": payment })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn blacklisted_payer_is_forbidden() {
        let payer = public_key_base58(&SigningKey::from_bytes(&[7; 32]));
        let mut security = SecurityConfig::default();
        security.access_control.blacklist = vec![payer];
        let app = app_with(security);
        let (status, body) = send(&app, post_json("/settle", json!({ "payment": signed_payment("pay_x") }))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["errorKind"], "forbidden");
    }

    #[tokio::test]
    async fn invoice_lifecycle_over_http() {
        let app = app();
        let (status, invoice) = send(
            &app,
            post_json("/invoice", json!({ "agentId": "image-editor-v1", "payer": "payer" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(invoice["amount"], 100_000);
        assert_eq!(invoice["amountDisplay"], "0.1 USDC");
        let invoice_id = invoice["invoiceId"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app,
            Request::get(format!("/invoice/{invoice_id}")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "open");

        let (status, _) = send(
            &app,
            post_json("/invoice", json!({ "agentId": "unknown-agent", "payer": "payer" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            post_json(&format!("/tasks/{invoice_id}/complete"), json!({ "resultReference": "ipfs://x" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn gasless_needs_a_facilitator_key() {
        let app = app();
        let (status, body) = send(&app, Request::get("/gasless/stats").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["errorKind"], "gasless_unavailable");
    }

    #[tokio::test]
    async fn admin_routes_refuse_callers_without_the_token() {
        let app = app();
        let (status, body) = send(&app, post_json("/admin/pause", json!({ "reason": "x" }))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["errorKind"], "unauthorized");

        let wrong = as_admin(post_json("/admin/pause", json!({ "reason": "x" })), "guess");
        let (status, _) = send(&app, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(&app, Request::delete("/admin/pause").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, Request::get("/admin/security").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, health) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(health["paused"], false);

        let request = as_admin(Request::get("/admin/security").body(Body::empty()).unwrap(), ADMIN_TOKEN);
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pause"]["active"], false);
    }

    #[tokio::test]
    async fn admin_routes_stay_locked_without_a_configured_token() {
        let app = app_with(SecurityConfig {
            admin_token: None,
            ..SecurityConfig::default()
        });
        let request = as_admin(post_json("/admin/pause", json!({})), ADMIN_TOKEN);
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn gasless_rejection_does_not_consume_the_payment() {
        let (engine, facilitator) = offline_engine(GaslessConfig::default());
        let payment = signed_with("pay_gasless_off", Features::Gasless { facilitator });
        let app = build_app(admin_security(), Some(engine));

        for _ in 0..2 {
            let (status, body) =
                send(&app, post_json("/gasless/execute", json!({ "payment": payment }))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["errorKind"], "validation_error");
            assert!(body["error"].as_str().unwrap().contains("disabled"));
        }
        let (_, body) = send(&app, Request::get("/settle/pay_gasless_off").body(Body::empty()).unwrap()).await;
        assert_eq!(body["status"], "unknown");
    }

    #[tokio::test]
    async fn gasless_payment_is_not_fee_split_on_settle() {
        let payment = signed_with(
            "pay_gasless_settle",
            Features::Gasless {
                facilitator: "HN7cABqLq46Es1jh92dQQisAq662SmxELLLsHHe4YWrH".into(),
            },
        );
        let app = app();
        let (status, body) = send(&app, post_json("/settle", json!({ "payment": payment }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("/gasless/execute"));

        let (_, body) = send(&app, Request::get("/settle/pay_gasless_settle").body(Body::empty()).unwrap()).await;
        assert_eq!(body["status"], "unknown");
    }
}
