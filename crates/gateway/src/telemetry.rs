//! Log and trace subscriber setup

use nutrisage_common::config::ObservabilityConfig;
use opentelemetry::{trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace::TracerProvider, Resource};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// Install the global subscriber
///
/// RUST_LOG wins over the configured level. OTLP export is attached only
/// when an endpoint is configured; a failing exporter degrades to logs only.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer: BoxedLayer = if config.json_logging {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().pretty().with_target(true).boxed()
    };

    let mut otel_error = None;
    let telemetry_layer = match config.otel_endpoint.as_deref() {
        Some(endpoint) => match init_otel_tracing(endpoint, &config.service_name) {
            Ok(provider) => {
                let tracer = provider.tracer("nutrisage-gateway");
                opentelemetry::global::set_tracer_provider(provider);
                Some(tracing_opentelemetry::layer().with_tracer(tracer))
            }
            Err(e) => {
                otel_error = Some(e);
                None
            }
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(telemetry_layer)
        .with(filter)
        .init();

    match (&config.otel_endpoint, otel_error) {
        (_, Some(e)) => tracing::warn!(error = %e, "Failed to initialize OpenTelemetry, tracing disabled"),
        (Some(endpoint), None) => tracing::info!(endpoint = %endpoint, "OpenTelemetry export enabled"),
        (None, None) => tracing::debug!("OpenTelemetry disabled"),
    }
}

fn init_otel_tracing(
    endpoint: &str,
    service_name: &str,
) -> Result<TracerProvider, opentelemetry::trace::TraceError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    Ok(TracerProvider::builder()
        .with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]))
        .with_batch_exporter(exporter, runtime::Tokio)
        .build())
}

/// Flush pending spans
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}
