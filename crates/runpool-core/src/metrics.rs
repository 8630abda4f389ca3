//! `OpenTelemetry` export of traces and pool metrics.
//!
//! This module is only compiled when the `metrics` Cargo feature is enabled.
//! Spans are bridged through `tracing-opentelemetry`; pool counters are
//! published by the caller as observable gauges on [`MetricsGuard::meter`].

use opentelemetry::global;
use opentelemetry::metrics::Meter;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Instrumentation scope name for everything runpool exports.
pub const SCOPE: &str = "runpool";

/// Errors that can occur during metrics / tracing pipeline initialisation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to build an OTLP exporter.
    #[error("failed to build OTLP exporter: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),

    /// Failed during `OTel` SDK shutdown or flush.
    #[error("OpenTelemetry SDK error: {0}")]
    Sdk(#[from] opentelemetry_sdk::error::OTelSdkError),
}

/// Keeps the `OpenTelemetry` providers alive for the process lifetime.
///
/// Dropping the guard does not flush; call [`MetricsGuard::shutdown`].
pub struct MetricsGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
}

impl MetricsGuard {
    /// Meter to register pool instruments on.
    pub fn meter(&self) -> Meter {
        global::meter(SCOPE)
    }

    /// Flush and shut down both providers.
    pub fn shutdown(self) -> Result<(), MetricsError> {
        self.tracer_provider.shutdown()?;
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Build the OTLP pipelines for traces and metrics and install them globally.
pub fn init_metrics(endpoint: &str) -> Result<MetricsGuard, MetricsError> {
    let resource = Resource::builder().with_service_name(SCOPE).build();

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let tracer_provider = SdkTracerProvider::builder()
        .with_resource(resource.clone())
        .with_batch_exporter(trace_exporter)
        .build();
    global::set_tracer_provider(tracer_provider.clone());

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let meter_provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_periodic_exporter(metric_exporter)
        .build();
    global::set_meter_provider(meter_provider.clone());

    Ok(MetricsGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Like [`crate::tracing_init::init_tracing`], but also exports spans over
/// OTLP when `endpoint` is set.
///
/// Falls back to plain logging (returning `None`) if the exporter cannot be
/// built.
pub fn init_tracing_with_metrics(
    default_filter: &str,
    log_json: bool,
    endpoint: Option<&str>,
) -> Option<MetricsGuard> {
    let Some(endpoint) = endpoint else {
        crate::tracing_init::init_tracing(default_filter, log_json);
        return None;
    };
    let guard = match init_metrics(endpoint) {
        Ok(guard) => guard,
        Err(e) => {
            crate::tracing_init::init_tracing(default_filter, log_json);
            tracing::warn!(error = %e, endpoint, "OTLP export disabled");
            return None;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(guard.tracer_provider.tracer(SCOPE));
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .with(otel_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(otel_layer)
            .init();
    }
    Some(guard)
}
