//! The payment gate executed for every request to a protected route.
//!
//! The gate handles:
//! - Extracting the `X-PAYMENT` header
//! - Checking the payload against the route's [`PaymentTerms`]
//! - Settling the payment with the facilitator before the handler runs
//! - Returning `402 Payment Required` with the `X-Payment-*` headers otherwise
//!
//! On success the [`SettleReceipt`] is placed in the request extensions and the
//! response carries `X-Payment-Response`: base64 of the JSON [`SettleResponse`].

use axum_core::body::Body;
use axum_core::response::{IntoResponse, Response};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use rand::Rng;
use std::convert::Infallible;
use std::sync::Arc;
use tower::Service;
use x402_types::facilitator::Facilitator;
use x402_types::proto::{
    DEFAULT_CURRENCY, Network, PaymentError, PaymentPayload, PaymentRequiredBody,
    PaymentRequiredHeaders, SettleReceipt, SettleResponse, X_PAYMENT, X_PAYMENT_RESPONSE,
};
use x402_types::timestamp::UnixTimestamp;
use x402_types::util::Base64Bytes;

#[cfg(feature = "telemetry")]
use tracing::{Instrument, instrument};

/// What a protected route charges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTerms {
    /// Base units of the token.
    pub amount: u64,
    pub recipient: String,
    pub agent_id: String,
    pub network: Network,
    pub currency: String,
    /// Lifetime of the invoice announced in `X-Payment-Expires`.
    pub expiry_seconds: u64,
}

impl PaymentTerms {
    pub fn new(
        amount: u64,
        recipient: impl Into<String>,
        agent_id: impl Into<String>,
        network: Network,
    ) -> Self {
        Self {
            amount,
            recipient: recipient.into(),
            agent_id: agent_id.into(),
            network,
            currency: DEFAULT_CURRENCY.to_string(),
            expiry_seconds: 300,
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_expiry_seconds(mut self, expiry_seconds: u64) -> Self {
        self.expiry_seconds = expiry_seconds;
        self
    }

    /// The `402` terms for a fresh invoice issued at `now`.
    pub fn headers_at(&self, now: UnixTimestamp) -> PaymentRequiredHeaders {
        PaymentRequiredHeaders {
            invoice_id: invoice_id(now),
            amount: self.amount,
            currency: self.currency.clone(),
            recipient: self.recipient.clone(),
            agent_id: self.agent_id.clone(),
            network: self.network,
            expires_at: now + self.expiry_seconds,
        }
    }

    /// Whether `payload` pays at least what these terms ask, to the right party.
    ///
    /// Signature, expiry and structure are the facilitator's concern.
    pub fn admit(&self, payload: &PaymentPayload) -> Result<(), PaygateError> {
        let intent = payload.intent();
        let mut mismatches = Vec::new();
        if payload.network != self.network {
            mismatches.push(format!("network must be {}", self.network));
        }
        if intent.recipient != self.recipient {
            mismatches.push(format!("recipient must be {}", self.recipient));
        }
        if intent.agent_id != self.agent_id {
            mismatches.push(format!("agentId must be {}", self.agent_id));
        }
        match intent.amount_value() {
            Some(amount) if amount >= self.amount => {}
            _ => mismatches.push(format!("amount must be at least {}", self.amount)),
        }
        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(PaygateError::TermsMismatch(mismatches.join("; ")))
        }
    }
}

fn invoice_id(now: UnixTimestamp) -> String {
    let suffix: u32 = rand::rng().random();
    format!("inv_{}_{suffix:08x}", now.as_secs())
}

/// Why a request was not let through.
#[derive(Debug, thiserror::Error)]
pub enum PaygateError {
    #[error("X-PAYMENT header is required")]
    PaymentHeaderRequired,
    #[error(transparent)]
    InvalidPayment(#[from] PaymentError),
    #[error("Payment does not match the requested terms: {0}")]
    TermsMismatch(String),
    #[error("Settlement failed: {0}")]
    Settlement(String),
}

pub struct Paygate<TFacilitator> {
    pub facilitator: TFacilitator,
    pub terms: Arc<PaymentTerms>,
}

impl<TFacilitator> Paygate<TFacilitator>
where
    TFacilitator: Facilitator,
{
    /// Handles an incoming request, settling its payment first.
    ///
    /// Any failure becomes a `402` carrying the route's terms.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "x402.handle_request", skip_all)
    )]
    pub async fn handle_request<ReqBody, ResBody, S>(
        self,
        inner: S,
        req: http::Request<ReqBody>,
    ) -> Result<Response, Infallible>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
        S::Future: Send,
    {
        match self.handle_request_fallible(inner, req).await {
            Ok(response) => Ok(response),
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::info!(error = %err, "Payment required");
                Ok(payment_required(&self.terms, &err))
            }
        }
    }

    /// The fallible version of [`Paygate::handle_request`].
    pub async fn handle_request_fallible<ReqBody, ResBody, S>(
        &self,
        mut inner: S,
        mut req: http::Request<ReqBody>,
    ) -> Result<Response, PaygateError>
    where
        S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
        S::Response: IntoResponse,
        S::Error: IntoResponse,
        S::Future: Send,
    {
        let header = extract_payment_header(req.headers())?;
        let payload = PaymentPayload::decode(&header)?;
        self.terms.admit(&payload)?;

        let receipt = self
            .facilitator
            .settle(&header)
            .await
            .map_err(|e| PaygateError::Settlement(e.to_string()))?;
        let header_value = settlement_to_header(&receipt)?;

        #[cfg(feature = "telemetry")]
        tracing::info!(
            payment_id = %receipt.payment_id,
            tx = %receipt.tx_signature,
            mode = %receipt.mode,
            "Payment settled"
        );

        req.extensions_mut().insert(receipt);

        #[cfg(feature = "telemetry")]
        let response = inner
            .call(req)
            .instrument(tracing::info_span!("inner"))
            .await;
        #[cfg(not(feature = "telemetry"))]
        let response = inner.call(req).await;

        let mut response = match response {
            Ok(response) => response.into_response(),
            Err(err) => return Ok(err.into_response()),
        };
        response
            .headers_mut()
            .insert(HeaderName::from_static(X_PAYMENT_RESPONSE), header_value);
        Ok(response)
    }
}

fn extract_payment_header(headers: &HeaderMap) -> Result<String, PaygateError> {
    let value = headers
        .get(X_PAYMENT)
        .ok_or(PaygateError::PaymentHeaderRequired)?;
    let value = value
        .to_str()
        .map_err(|e| PaymentError::Decode(e.to_string()))?;
    Ok(value.trim().to_string())
}

fn settlement_to_header(receipt: &SettleReceipt) -> Result<HeaderValue, PaygateError> {
    let json = serde_json::to_vec(&SettleResponse::from(Ok(receipt.clone())))
        .map_err(|err| PaygateError::Settlement(err.to_string()))?;
    let encoded = Base64Bytes::encode(json);
    HeaderValue::from_bytes(encoded.as_ref()).map_err(|err| PaygateError::Settlement(err.to_string()))
}

/// `402` with the eight `X-Payment-*` headers and `{error, message}`.
pub fn payment_required(terms: &PaymentTerms, err: &PaygateError) -> Response {
    let headers = terms.headers_at(UnixTimestamp::now());
    let body = serde_json::to_vec(&PaymentRequiredBody::new(err.to_string())).unwrap_or_default();

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::PAYMENT_REQUIRED;
    let map = response.headers_mut();
    map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for (name, value) in headers.to_pairs() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            map.insert(HeaderName::from_static(name), value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use x402_types::codec::CreatePaymentParams;

    fn terms() -> PaymentTerms {
        PaymentTerms::new(50_000, "recipient", "pdf-summarizer-v1", Network::Devnet)
    }

    fn payload(amount: &str) -> PaymentPayload {
        PaymentPayload::create(CreatePaymentParams {
            payment_id: "pay_1".to_string(),
            payer: "payer".to_string(),
            recipient: "recipient".to_string(),
            amount: amount.to_string(),
            token_mint: "mint".to_string(),
            agent_id: "pdf-summarizer-v1".to_string(),
            network: Network::Devnet,
            task_metadata: None,
            expiry_seconds: None,
        })
    }

    #[test]
    fn admits_matching_and_overpaying_payloads() {
        assert!(terms().admit(&payload("50000")).is_ok());
        assert!(terms().admit(&payload("60000")).is_ok());
    }

    #[test]
    fn lists_every_mismatch() {
        let mut short = payload("49999");
        short.network = Network::MainnetBeta;
        let err = terms().admit(&short).unwrap_err().to_string();
        assert!(err.contains("network must be devnet"));
        assert!(err.contains("amount must be at least 50000"));
        assert!(!err.contains("recipient"));
    }

    #[test]
    fn headers_announce_a_fresh_invoice() {
        let now = UnixTimestamp::from_secs(1_700_000_000);
        let headers = terms().with_expiry_seconds(60).headers_at(now);
        assert!(headers.invoice_id.starts_with("inv_1700000000_"));
        assert_eq!(headers.expires_at, UnixTimestamp::from_secs(1_700_000_060));
        assert_eq!(headers.currency, "USDC");
    }
}
