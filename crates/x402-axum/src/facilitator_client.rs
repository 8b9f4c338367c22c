//! A [`x402_types::facilitator::Facilitator`] implementation that talks to a _remote_ facilitator over HTTP.
//!
//! [`FacilitatorClient`] posts `{"payment": "<X-PAYMENT>"}` to the `/verify` and `/settle`
//! endpoints of a facilitator and maps the answers back onto [`VerifiedPayment`] and
//! [`SettleReceipt`], so the payment middleware works the same against a local or a
//! remote facilitator.
//!
//! ## Example
//!
//! ```rust
//! use x402_axum::facilitator_client::FacilitatorClient;
//!
//! let facilitator = FacilitatorClient::try_from("http://localhost:8403").unwrap();
//! assert_eq!(facilitator.settle_url().as_str(), "http://localhost:8403/settle");
//! ```
//!
//! ## Error Handling
//!
//! A facilitator that answers with a well-formed negative result (`valid: false` or
//! `success: false`) yields [`FacilitatorClientError::Rejected`] carrying its `errorKind`.
//! Transport failures, unexpected statuses and unreadable bodies have their own variants.

use http::{HeaderMap, StatusCode};
use reqwest::Client;
use std::fmt::Display;
use std::time::Duration;
use url::Url;
use x402_types::facilitator::Facilitator;
use x402_types::proto::{
    PaymentRequest, SettleReceipt, SettleResponse, VerifiedPayment, VerifyResponse,
};

#[cfg(feature = "telemetry")]
use tracing::{Instrument, Span};

/// A client for communicating with a remote x402 facilitator.
#[derive(Clone, Debug)]
pub struct FacilitatorClient {
    /// Base URL of the facilitator (e.g. `https://facilitator.example/`)
    base_url: Url,
    /// Full URL to `POST /verify` requests
    verify_url: Url,
    /// Full URL to `POST /settle` requests
    settle_url: Url,
    client: Client,
    /// Custom headers sent with each request
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl Facilitator for FacilitatorClient {
    type Error = FacilitatorClientError;

    #[cfg(feature = "telemetry")]
    async fn verify(&self, payment: &str) -> Result<VerifiedPayment, FacilitatorClientError> {
        with_span(
            FacilitatorClient::verify(self, payment),
            tracing::info_span!("x402.facilitator_client.verify", timeout = ?self.timeout),
        )
        .await
    }

    #[cfg(not(feature = "telemetry"))]
    async fn verify(&self, payment: &str) -> Result<VerifiedPayment, FacilitatorClientError> {
        FacilitatorClient::verify(self, payment).await
    }

    #[cfg(feature = "telemetry")]
    async fn settle(&self, payment: &str) -> Result<SettleReceipt, FacilitatorClientError> {
        with_span(
            FacilitatorClient::settle(self, payment),
            tracing::info_span!("x402.facilitator_client.settle", timeout = ?self.timeout),
        )
        .await
    }

    #[cfg(not(feature = "telemetry"))]
    async fn settle(&self, payment: &str) -> Result<SettleReceipt, FacilitatorClientError> {
        FacilitatorClient::settle(self, payment).await
    }
}

/// Errors that can occur while interacting with a remote facilitator.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("URL parse error: {context}: {source}")]
    UrlParse {
        context: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("HTTP error: {context}: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to deserialize JSON: {context}: {source}")]
    JsonDeserialization {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Unexpected HTTP status {status}: {context}: {body}")]
    HttpStatus {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("Failed to read response body as text: {context}: {source}")]
    ResponseBodyRead {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    /// The facilitator processed the payment and refused it.
    #[error("{context} rejected ({kind}): {message}")]
    Rejected {
        context: &'static str,
        kind: String,
        message: String,
    },
}

impl FacilitatorClientError {
    /// The facilitator's `errorKind`, when it refused the payment.
    pub fn rejection_kind(&self) -> Option<&str> {
        match self {
            FacilitatorClientError::Rejected { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

impl FacilitatorClient {
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Returns the computed `./verify` URL relative to [`FacilitatorClient::base_url`].
    pub fn verify_url(&self) -> &Url {
        &self.verify_url
    }

    /// Returns the computed `./settle` URL relative to [`FacilitatorClient::base_url`].
    pub fn settle_url(&self) -> &Url {
        &self.settle_url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn timeout(&self) -> &Option<Duration> {
        &self.timeout
    }

    /// Constructs a new [`FacilitatorClient`] from a base URL.
    ///
    /// `./verify` and `./settle` are resolved relative to the base.
    pub fn try_new(base_url: Url) -> Result<Self, FacilitatorClientError> {
        let verify_url =
            base_url
                .join("./verify")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./verify URL",
                    source: e,
                })?;
        let settle_url =
            base_url
                .join("./settle")
                .map_err(|e| FacilitatorClientError::UrlParse {
                    context: "Failed to construct ./settle URL",
                    source: e,
                })?;
        Ok(Self {
            client: Client::new(),
            base_url,
            verify_url,
            settle_url,
            headers: HeaderMap::new(),
            timeout: None,
        })
    }

    /// Attaches custom headers (an API key, say) to all future requests.
    pub fn with_headers(&self, headers: HeaderMap) -> Self {
        let mut this = self.clone();
        this.headers = headers;
        this
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut this = self.clone();
        this.timeout = Some(timeout);
        this
    }

    /// Sends a `POST /verify` request to the facilitator.
    pub async fn verify(&self, payment: &str) -> Result<VerifiedPayment, FacilitatorClientError> {
        const CONTEXT: &str = "POST /verify";
        let response: VerifyResponse = self
            .post_json(&self.verify_url, CONTEXT, &payment_request(payment))
            .await?;
        match response {
            VerifyResponse {
                valid: true,
                payment: Some(payment),
                ..
            } => Ok(payment),
            other => Err(rejected(CONTEXT, other.error_kind, other.error)),
        }
    }

    /// Sends a `POST /settle` request to the facilitator.
    pub async fn settle(&self, payment: &str) -> Result<SettleReceipt, FacilitatorClientError> {
        const CONTEXT: &str = "POST /settle";
        let response: SettleResponse = self
            .post_json(&self.settle_url, CONTEXT, &payment_request(payment))
            .await?;
        match response {
            SettleResponse {
                success: true,
                receipt: Some(receipt),
                ..
            } => Ok(receipt),
            other => Err(rejected(CONTEXT, other.error_kind, other.error)),
        }
    }

    /// POSTs `payload` as JSON and decodes the answer.
    ///
    /// The facilitator renders refusals with an error status and the same body shape
    /// as a success, so any body that decodes as `R` is returned whatever the status.
    async fn post_json<T, R>(
        &self,
        url: &Url,
        context: &'static str,
        payload: &T,
    ) -> Result<R, FacilitatorClientError>
    where
        T: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let mut req = self.client.post(url.clone()).json(payload);
        for (key, value) in self.headers.iter() {
            req = req.header(key, value);
        }
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }
        let http_response = req
            .send()
            .await
            .map_err(|e| FacilitatorClientError::Http { context, source: e })?;

        let status = http_response.status();
        let body = http_response
            .text()
            .await
            .map_err(|e| FacilitatorClientError::ResponseBodyRead { context, source: e })?;

        let result = match serde_json::from_str::<R>(&body) {
            Ok(decoded) => Ok(decoded),
            Err(e) if status == StatusCode::OK => {
                Err(FacilitatorClientError::JsonDeserialization { context, source: e })
            }
            _ => Err(FacilitatorClientError::HttpStatus {
                context,
                status,
                body,
            }),
        };

        record_result_on_span(&result);

        result
    }
}

fn payment_request(payment: &str) -> PaymentRequest {
    PaymentRequest {
        payment: payment.to_string(),
    }
}

fn rejected(
    context: &'static str,
    kind: Option<String>,
    message: Option<String>,
) -> FacilitatorClientError {
    FacilitatorClientError::Rejected {
        context,
        kind: kind.unwrap_or_else(|| "unknown".to_string()),
        message: message.unwrap_or_default(),
    }
}

/// Converts a string URL into a `FacilitatorClient`, parsing the URL and calling `try_new`.
impl TryFrom<&str> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // Normalize: strip trailing slashes and add a single trailing slash
        let mut normalized = value.trim_end_matches('/').to_string();
        normalized.push('/');
        let url = Url::parse(&normalized).map_err(|e| FacilitatorClientError::UrlParse {
            context: "Failed to parse base url",
            source: e,
        })?;
        FacilitatorClient::try_new(url)
    }
}

impl TryFrom<String> for FacilitatorClient {
    type Error = FacilitatorClientError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FacilitatorClient::try_from(value.as_str())
    }
}

/// Records the outcome of a request on a tracing span, including status and errors.
#[cfg(feature = "telemetry")]
fn record_result_on_span<R, E: Display>(result: &Result<R, E>) {
    let span = Span::current();
    match result {
        Ok(_) => {
            span.record("otel.status_code", "OK");
        }
        Err(err) => {
            span.record("otel.status_code", "ERROR");
            span.record("error.message", tracing::field::display(err));
            tracing::event!(tracing::Level::ERROR, error = %err, "Request to facilitator failed");
        }
    }
}

/// Noop if telemetry feature is off.
#[cfg(not(feature = "telemetry"))]
fn record_result_on_span<R, E: Display>(_result: &Result<R, E>) {}

#[cfg(feature = "telemetry")]
fn with_span<F: Future>(fut: F, span: Span) -> impl Future<Output = F::Output> {
    fut.instrument(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use x402_types::proto::{PaymentError, SettlementMode};

    fn verified() -> VerifiedPayment {
        VerifiedPayment {
            payment_id: "pay_1".to_string(),
            payer: "payer".to_string(),
            recipient: "recipient".to_string(),
            amount: "1000000".to_string(),
            agent_id: "pdf-summarizer-v1".to_string(),
        }
    }

    fn receipt() -> SettleReceipt {
        SettleReceipt {
            payment_id: "pay_1".to_string(),
            mode: SettlementMode::Real,
            tx_signature: "5sig".to_string(),
            slot: 42,
            fee_amount: Some("50000".to_string()),
            recipient_amount: Some("950000".to_string()),
            settled_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn endpoints_resolve_under_a_path_prefix() {
        let client = FacilitatorClient::try_from("http://localhost:8403/x402//").unwrap();
        assert_eq!(client.verify_url().as_str(), "http://localhost:8403/x402/verify");
        assert_eq!(client.settle_url().as_str(), "http://localhost:8403/x402/settle");
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let err = FacilitatorClient::try_from("not a url").unwrap_err();
        assert!(matches!(err, FacilitatorClientError::UrlParse { .. }));
    }

    #[tokio::test]
    async fn verify_posts_the_payment_and_returns_the_verified_intent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(body_json(serde_json::json!({ "payment": "encoded" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(VerifyResponse::from(Ok(verified()))),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_from(mock_server.uri()).unwrap();
        let payment = client.verify("encoded").await.unwrap();
        assert_eq!(payment, verified());
    }

    #[tokio::test]
    async fn settle_returns_the_receipt() {
        let mock_server = MockServer::start().await;
        let expected = receipt();
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(SettleResponse::from(Ok(expected.clone()))),
            )
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_from(mock_server.uri()).unwrap();
        let receipt = client.settle("encoded").await.unwrap();
        assert_eq!(receipt.tx_signature, expected.tx_signature);
        assert_eq!(receipt.fee_amount.as_deref(), Some("50000"));
    }

    #[tokio::test]
    async fn refusals_carry_the_error_kind() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/settle"))
            .respond_with(ResponseTemplate::new(409).set_body_json(SettleResponse::from(Err(
                PaymentError::DuplicateSettlement("pay_1".to_string()),
            ))))
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_from(mock_server.uri()).unwrap();
        let err = client.settle("encoded").await.unwrap_err();
        assert_eq!(err.rejection_kind(), Some("duplicate_settlement"));
    }

    #[tokio::test]
    async fn non_protocol_errors_surface_the_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_json(serde_json::json!({ "error": "Too many requests" })),
            )
            .mount(&mock_server)
            .await;

        let client = FacilitatorClient::try_from(mock_server.uri()).unwrap();
        match client.verify("encoded").await.unwrap_err() {
            FacilitatorClientError::HttpStatus { status, .. } => {
                assert_eq!(status, StatusCode::TOO_MANY_REQUESTS)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn custom_headers_are_forwarded() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/verify"))
            .and(header("x-api-key", "secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(VerifyResponse::from(Ok(verified()))),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "secret".parse().unwrap());
        let client = FacilitatorClient::try_from(mock_server.uri())
            .unwrap()
            .with_headers(headers)
            .with_timeout(Duration::from_secs(5));
        assert!(client.verify("encoded").await.is_ok());
    }
}
