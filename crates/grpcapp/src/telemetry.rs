//! # Telemetry Features
//!
//! Optional OpenTelemetry export for the spans and call metrics produced by
//! the interceptor chain. Without any feature enabled every function here is
//! a no-op and only the JSON log output remains.
//!
//! ## Feature matrix
//!
//! - `traces`: export `tracing` spans (one `grpc` span per call).
//! - `metrics`: export per-call counters and a duration histogram.
//! - `otlp`: OTLP/gRPC exporter; endpoint and headers come from the standard
//!   `OTEL_EXPORTER_OTLP_*` environment variables.
//! - `stdout`: stdout exporter, handy for local debugging.
//!
//! ## Feature constraints
//!
//! - Exporters require at least one of `traces` or `metrics`.
//! - `otlp` and `stdout` can be enabled at the same time.
//!
//! ```bash
//! cargo run -p grpcapp-server --features traces,metrics,otlp
//! ```

// Disallow using `otlp` without `traces` or `metrics`
#[cfg(all(feature = "otlp", not(any(feature = "traces", feature = "metrics"))))]
compile_error!("The 'otlp' feature requires at least one of 'traces' or 'metrics' to be enabled.");

// Disallow using `stdout` without `traces` or `metrics`
#[cfg(all(feature = "stdout", not(any(feature = "traces", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'traces' or 'metrics' to be enabled."
);

use crate::{Config, Result};

// OTLP-specific imports
#[cfg(all(feature = "otlp", any(feature = "metrics", feature = "traces")))]
use opentelemetry_otlp::{Compression, Protocol, WithExportConfig, WithTonicConfig};

// Metrics-specific imports
#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

// Either
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_semantic_conventions as semvcns;

// Traces-specific imports
#[cfg(feature = "traces")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "traces")]
use opentelemetry_sdk::trace as sdktrace;

/// Providers built at logger initialization and flushed during shutdown.
#[derive(Default)]
pub struct TelemetryProviders {
    #[cfg(feature = "traces")]
    pub tracer_provider: Option<sdktrace::SdkTracerProvider>,
    #[cfg(feature = "metrics")]
    pub meter_provider: Option<sdkmetrics::SdkMeterProvider>,
}

impl TelemetryProviders {
    /// Builds the providers enabled at compile time and registers them
    /// globally.
    pub fn init(_config: &Config) -> Result<Self> {

        #[cfg(feature = "traces")]
        let tracer_provider = {
            opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
            let provider = init_tracer(&_config.service_name)?;
            opentelemetry::global::set_tracer_provider(provider.clone());
            Some(provider)
        };

        #[cfg(feature = "metrics")]
        let meter_provider = {
            let provider = init_metrics(&_config.service_name)?;
            opentelemetry::global::set_meter_provider(provider.clone());
            init_metric_handles(opentelemetry::global::meter_with_scope(scope()));
            Some(provider)
        };

        Ok(Self {
            #[cfg(feature = "traces")]
            tracer_provider,
            #[cfg(feature = "metrics")]
            meter_provider,
        })
    }

    /// Flushes and shuts down every provider. Failures are printed to stderr
    /// since the logger may already be gone.
    pub fn shutdown(&self) {
        #[cfg(feature = "traces")]
        if let Some(provider) = &self.tracer_provider {
            if let Err(err) = provider.force_flush() {
                eprintln!("Error flushing traces: {:#?}", err);
            }
            if let Err(err) = provider.shutdown() {
                eprintln!("Error shutting down tracer: {:#?}", err);
            }
        }

        #[cfg(feature = "metrics")]
        if let Some(provider) = &self.meter_provider {
            if let Err(err) = provider.force_flush() {
                eprintln!("Error flushing metrics: {:#?}", err);
            }
            if let Err(err) = provider.shutdown() {
                eprintln!("Error shutting down meter: {:#?}", err);
            }
        }
    }
}

#[cfg(any(feature = "metrics", feature = "traces"))]
pub(crate) fn scope() -> InstrumentationScope {
    InstrumentationScope::builder("grpcapp")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build()
}

#[cfg(any(feature = "metrics", feature = "traces"))]
fn resource(service_name: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name.to_owned())
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics(service_name: &str) -> Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    #[cfg(feature = "otlp")]
    let builder = {
        let exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(Compression::Gzip)
            .with_protocol(Protocol::Grpc)
            .build()
            .map_err(|err| crate::Error::Telemetry(format!("metrics exporter: {err}")))?;

        builder.with_periodic_exporter(exporter)
    };

    Ok(builder.build())
}

#[cfg(feature = "traces")]
fn init_tracer(service_name: &str) -> Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(service_name));

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        builder.with_span_processor(batch(SpanExporter::default()))
    };

    #[cfg(feature = "otlp")]
    let builder = {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_timeout(std::time::Duration::from_secs(10))
            .with_compression(Compression::Gzip)
            .with_protocol(Protocol::Grpc)
            .build()
            .map_err(|err| crate::Error::Telemetry(format!("span exporter: {err}")))?;

        builder.with_span_processor(batch(exporter))
    };

    Ok(builder.build())
}

#[cfg(all(feature = "traces", any(feature = "stdout", feature = "otlp")))]
fn batch<E>(exporter: E) -> sdktrace::BatchSpanProcessor
where
    E: opentelemetry_sdk::trace::SpanExporter + 'static,
{
    sdktrace::BatchSpanProcessor::builder(exporter)
        .with_batch_config(
            sdktrace::BatchConfigBuilder::default()
                .with_scheduled_delay(std::time::Duration::from_secs(5))
                .with_max_queue_size(2048)
                .build(),
        )
        .build()
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static RPC_REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RPC_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RPC_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static RPC_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = RPC_REQUESTS.set(
        meter
            .u64_counter("rpc_requests")
            .with_description("Total gRPC calls")
            .build(),
    );

    let _ = RPC_ERRORS.set(
        meter
            .u64_counter("rpc_errors")
            .with_description("gRPC calls that finished with a non-OK status")
            .build(),
    );

    let _ = RPC_INFLIGHT.set(
        meter
            .i64_up_down_counter("rpc_inflight")
            .with_description("Concurrent gRPC calls")
            .build(),
    );

    let _ = RPC_DURATION_MS.set(
        meter
            .f64_histogram("rpc_duration")
            .with_unit("ms")
            .with_description("Time until response headers are produced")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_requests(method: &str) {
    if let Some(counter) = RPC_REQUESTS.get() {
        counter.add(1, &[KeyValue::new("rpc.method", method.to_owned())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests(_method: &str) {}

#[cfg(feature = "metrics")]
pub fn increment_errors(method: &str, code: tonic::Code) {
    if let Some(counter) = RPC_ERRORS.get() {
        counter.add(
            1,
            &[
                KeyValue::new("rpc.method", method.to_owned()),
                KeyValue::new("rpc.grpc.status_code", code as i64),
            ],
        );
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_errors(_method: &str, _code: tonic::Code) {}

#[cfg(feature = "metrics")]
pub fn record_duration(method: &str, duration_ms: f64) {
    if let Some(histogram) = RPC_DURATION_MS.get() {
        histogram.record(duration_ms, &[KeyValue::new("rpc.method", method.to_owned())]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_duration(_method: &str, _duration_ms: f64) {}

#[cfg(feature = "metrics")]
fn add_inflight(delta: i64) {
    if let Some(counter) = RPC_INFLIGHT.get() {
        counter.add(delta, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
fn add_inflight(_delta: i64) {}

/// Counts one in-flight call for as long as it is alive.
#[derive(Debug)]
pub struct InflightGuard(());

impl InflightGuard {
    pub fn new() -> Self {
        add_inflight(1);
        Self(())
    }
}

impl Default for InflightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        add_inflight(-1);
    }
}
