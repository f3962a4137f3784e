//! JSON structured logging.
//!
//! The logger is a `tracing` [`Dispatch`] built from `Config::log_level`.
//! `RUST_LOG`, when set, takes precedence over the configured level. Source
//! file and line are only attached at `debug` or more verbose levels.

use crate::{Error, Result, telemetry::TelemetryProviders};
use tracing::Dispatch;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "traces")]
use opentelemetry::trace::TracerProvider;

/// Parses a level name into a filter.
///
/// Accepts the `tracing` names (case-insensitive) plus a few common aliases
/// (`warning`, `fatal`, `panic`) so existing deployment manifests keep
/// working.
pub fn parse_level(raw: &str) -> Result<LevelFilter> {
    let level = raw.trim().to_ascii_lowercase();
    match level.as_str() {
        "warning" => Ok(LevelFilter::WARN),
        "fatal" | "panic" | "dpanic" => Ok(LevelFilter::ERROR),
        other => other
            .parse::<LevelFilter>()
            .map_err(|_| Error::InvalidLogLevel(raw.to_owned())),
    }
}

/// Builds the JSON logger, wiring in the OpenTelemetry layers that were
/// compiled in.
pub fn build(level: LevelFilter, _providers: &TelemetryProviders) -> Dispatch {
    let verbose = level >= LevelFilter::DEBUG;

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| level.to_string().into()))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_thread_ids(true)
                .with_target(false)
                .with_file(verbose)
                .with_line_number(verbose)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        );

    #[cfg(feature = "traces")]
    let registry = registry.with(_providers.tracer_provider.as_ref().map(|provider| {
        tracing_opentelemetry::layer()
            .with_tracer(provider.tracer_with_scope(crate::telemetry::scope()))
            .with_error_records_to_exceptions(true)
    }));

    #[cfg(feature = "metrics")]
    let registry = registry.with(
        _providers
            .meter_provider
            .as_ref()
            .map(|provider| tracing_opentelemetry::MetricsLayer::new(provider.clone())),
    );

    Dispatch::new(registry)
}

/// Installs `dispatch` as the process-wide default.
///
/// Returns `false` when another default was already installed, in which case
/// the existing one is left in place.
pub fn install(dispatch: &Dispatch) -> bool {
    dispatch.clone().try_init().is_ok()
}
