use crate::Result;
use clap::Parser;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

/// Process configuration, read from environment variables.
///
/// Every field maps to one environment variable. `Config` is loaded once at
/// startup and shared read-only through [`Tools`](crate::Tools).
///
/// The same struct doubles as a set of `clap` arguments so binaries can
/// `#[command(flatten)]` it into their own CLI.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// PostgreSQL connection string. No connection is made when unset.
    #[arg(long, env = "DATABASE_DSN")]
    pub database_dsn: Option<String>,

    /// Minimum log level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` overrides this when set.
    #[arg(long, env = "LOG_LEVEL", default_value_t = String::from("info"))]
    pub log_level: String,

    /// Port the gRPC listener binds on all interfaces.
    #[arg(long, env = "GRPC_LISTEN_PORT", default_value_t = 9000)]
    pub grpc_listen_port: u16,

    /// Port the HTTPS (gRPC-Web) listener binds when HTTP serving is enabled.
    #[arg(long, env = "HTTP_LISTEN_PORT", default_value_t = 8080)]
    pub http_listen_port: u16,

    /// PEM certificate chain for the HTTP listener.
    #[arg(long, env = "TLS_CERTIFICATE")]
    pub tls_certificate: Option<PathBuf>,

    /// PEM private key for the HTTP listener.
    #[arg(long, env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Service name reported on telemetry resources.
    #[arg(long, env = "SERVICE_NAME", default_value_t = String::from("grpcapp"))]
    pub service_name: String,
}

impl Config {
    /// Reads the configuration from the process environment only.
    ///
    /// Command line arguments are ignored; unset variables fall back to
    /// their defaults.
    pub fn from_env() -> Result<Self> {
        Ok(Self::try_parse_from([env!("CARGO_PKG_NAME")])?)
    }

    /// The DSN, if one is set and non-empty.
    pub fn dsn(&self) -> Option<&str> {
        self.database_dsn.as_deref().filter(|dsn| !dsn.is_empty())
    }

    pub fn grpc_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.grpc_listen_port))
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.http_listen_port))
    }

    pub(crate) fn tls_certificate(&self) -> Option<&Path> {
        non_empty(self.tls_certificate.as_deref())
    }

    pub(crate) fn tls_key(&self) -> Option<&Path> {
        non_empty(self.tls_key.as_deref())
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_dsn: None,
            log_level: String::from("info"),
            grpc_listen_port: 9000,
            http_listen_port: 8080,
            tls_certificate: None,
            tls_key: None,
            service_name: String::from("grpcapp"),
        }
    }
}
