//! Error types for the application lifecycle.
//!
//! Errors fall into two tiers. Failures that happen before a logger exists
//! (configuration, log level, telemetry exporters) can only be reported on
//! stderr. Everything after that is logged at error level by
//! [`App::start`](crate::App::start) before being returned.
//!
//! Authentication failures are never process errors; they surface as
//! [`tonic::Status`] on the offending call.

use std::{net::SocketAddr, path::PathBuf};

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Unified error type returned by [`App::start`](crate::App::start).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Environment variables could not be parsed into a [`Config`](crate::Config).
    #[error("failed to load config: {0}")]
    Config(#[from] clap::Error),

    /// `LOG_LEVEL` is not a recognized level.
    #[error("invalid log level: {0:?}")]
    InvalidLogLevel(String),

    /// An OpenTelemetry exporter could not be built.
    #[error("failed to initialize telemetry: {0}")]
    Telemetry(String),

    /// The database connection could not be established.
    #[error("failed to connect to database: {0}")]
    Database(#[from] sqlx::Error),

    /// A listener socket could not be bound.
    #[error("failed to listen {server} on {addr}: {source}")]
    Bind {
        server: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// HTTP serving was enabled without `TLS_CERTIFICATE`.
    #[error("cannot start http server without tls certificate")]
    MissingTlsCertificate,

    /// HTTP serving was enabled without `TLS_KEY`.
    #[error("cannot start http server without tls key")]
    MissingTlsKey,

    /// A TLS certificate or key file could not be read.
    #[error("failed to read tls material from {}: {source}", .path.display())]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transport rejected its configuration (e.g. bad TLS identity).
    #[error("invalid server configuration: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A listener stopped with an error before shutdown was requested.
    #[error("failed to serve {server}: {source}")]
    Serve {
        server: &'static str,
        #[source]
        source: tonic::transport::Error,
    },

    /// The reflection service rejected the encoded file descriptor set.
    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// A user start hook failed.
    #[error("start hook failed: {0:#}")]
    StartHook(anyhow::Error),

    /// A lifecycle stage ran before the stage it depends on.
    #[error("lifecycle out of order: {0}")]
    Lifecycle(&'static str),
}

impl Error {
    /// Returns `true` for failures that happen before a logger is installed.
    ///
    /// These can only be reported on stderr.
    pub fn is_pre_logger(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::InvalidLogLevel(_) | Error::Telemetry(_)
        )
    }
}
