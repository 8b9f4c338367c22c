//! Logging and OpenTelemetry export.
//!
//! Logs always go to stdout through `tracing-subscriber`, filtered by `RUST_LOG`
//! (default `info`). When any `OTEL_EXPORTER_OTLP_*` variable is set, spans and
//! metrics are also exported over OTLP, using `grpc` or `http/protobuf` per
//! `OTEL_EXPORTER_OTLP_PROTOCOL`.
//!
//! ```ignore
//! let telemetry = Telemetry::new()
//!     .with_name(env!("CARGO_PKG_NAME"))
//!     .with_version(env!("CARGO_PKG_VERSION"))
//!     .register();
//! let app = app.layer(telemetry.http_tracing());
//! ```

use axum::http::Request;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider, Temporality};
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, SdkTracerProvider};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use opentelemetry_semantic_conventions::attribute::{DEPLOYMENT_ENVIRONMENT_NAME, SERVICE_VERSION};
use std::env;
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OtlpProtocol {
    Http,
    Grpc,
}

impl OtlpProtocol {
    /// `None` unless OTLP export is configured.
    fn from_env() -> Option<Self> {
        let configured = ["OTEL_EXPORTER_OTLP_ENDPOINT", "OTEL_EXPORTER_OTLP_HEADERS", "OTEL_EXPORTER_OTLP_PROTOCOL"]
            .iter()
            .any(|var| env::var(var).is_ok());
        if !configured {
            return None;
        }
        match env::var("OTEL_EXPORTER_OTLP_PROTOCOL").as_deref() {
            Ok("grpc") => Some(OtlpProtocol::Grpc),
            _ => Some(OtlpProtocol::Http),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Telemetry {
    name: String,
    version: String,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    fn resource(&self) -> Resource {
        let deployment_env = env::var("DEPLOYMENT_ENV").unwrap_or_else(|_| "develop".to_string());
        Resource::builder()
            .with_service_name(self.name.clone())
            .with_schema_url(
                [
                    KeyValue::new(SERVICE_VERSION, self.version.clone()),
                    KeyValue::new(DEPLOYMENT_ENVIRONMENT_NAME, deployment_env),
                ],
                SCHEMA_URL,
            )
            .build()
    }

    fn tracer_provider(&self, protocol: OtlpProtocol) -> Option<SdkTracerProvider> {
        let builder = opentelemetry_otlp::SpanExporter::builder();
        let exporter = match protocol {
            OtlpProtocol::Http => builder.with_http().build(),
            OtlpProtocol::Grpc => builder.with_tonic().build(),
        };
        let exporter = exporter
            .inspect_err(|e| eprintln!("OTLP span exporter unavailable: {e}"))
            .ok()?;
        let provider = SdkTracerProvider::builder()
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(1.0))))
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(self.resource())
            .with_batch_exporter(exporter)
            .build();
        global::set_tracer_provider(provider.clone());
        Some(provider)
    }

    fn meter_provider(&self, protocol: OtlpProtocol) -> Option<SdkMeterProvider> {
        let builder = opentelemetry_otlp::MetricExporter::builder();
        let exporter = match protocol {
            OtlpProtocol::Http => builder.with_http().with_temporality(Temporality::default()).build(),
            OtlpProtocol::Grpc => builder.with_tonic().with_temporality(Temporality::default()).build(),
        };
        let exporter = exporter
            .inspect_err(|e| eprintln!("OTLP metric exporter unavailable: {e}"))
            .ok()?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(Duration::from_secs(30))
            .build();
        let stdout_reader = PeriodicReader::builder(opentelemetry_stdout::MetricExporter::default()).build();
        let provider = SdkMeterProvider::builder()
            .with_resource(self.resource())
            .with_reader(reader)
            .with_reader(stdout_reader)
            .build();
        global::set_meter_provider(provider.clone());
        Some(provider)
    }

    /// Installs the global subscriber. Call once, early in `main`.
    pub fn register(self) -> TelemetryProviders {
        let protocol = OtlpProtocol::from_env();
        let tracer_provider = protocol.and_then(|p| self.tracer_provider(p));
        let meter_provider = protocol.and_then(|p| self.meter_provider(p));

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let otel_layer = tracer_provider
            .as_ref()
            .map(|provider| OpenTelemetryLayer::new(provider.tracer(self.name.clone())));
        let metrics_layer = meter_provider.as_ref().map(|provider| MetricsLayer::new(provider.clone()));
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .with(metrics_layer)
            .with(otel_layer)
            .try_init();
        if let Err(e) = installed {
            eprintln!("Tracing subscriber already installed: {e}");
        }

        match protocol {
            Some(protocol) if tracer_provider.is_some() => {
                tracing::info!(?protocol, "OpenTelemetry export enabled")
            }
            Some(_) => tracing::warn!("OpenTelemetry configured but exporters failed to start"),
            None => tracing::info!("OpenTelemetry is not enabled"),
        }
        TelemetryProviders {
            tracer_provider,
            meter_provider,
        }
    }
}

/// Live exporters. Flushed and shut down on drop.
pub struct TelemetryProviders {
    tracer_provider: Option<SdkTracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryProviders {
    /// Request spans for the HTTP router, one per request, server errors marked failed.
    pub fn http_tracing(&self) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, HttpMakeSpan> {
        TraceLayer::new_for_http().make_span_with(HttpMakeSpan)
    }
}

impl Drop for TelemetryProviders {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.as_ref() {
            if let Err(err) = provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
        if let Some(provider) = self.meter_provider.as_ref() {
            if let Err(err) = provider.shutdown() {
                eprintln!("{err:?}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> tracing::Span {
        tracing::info_span!(
            "http_request",
            otel.kind = "server",
            otel.name = %format!("{} {}", request.method(), request.uri().path()),
            http.request.method = %request.method(),
            url.path = %request.uri().path(),
        )
    }
}
