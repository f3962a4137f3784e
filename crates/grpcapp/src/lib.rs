#![doc = include_str!("../README.md")]

mod app;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod interceptor;
pub mod logger;
mod options;
pub mod server;
pub mod shutdown;
pub mod telemetry;
pub mod tools;

pub use app::{App, Stage};
pub use config::Config;
pub use error::{Error, Result};
pub use shutdown::{ShutdownHandle, Signal};
pub use tools::{Implementation, Tools};

// Re-exported so implementations can name the transport without a direct
// dependency.
pub use tonic;

/// Starts `app` and exits the process with status 1 if it fails.
///
/// Errors raised before the logger exists are printed to stderr; later ones
/// have already been logged by [`App::start`].
pub async fn run(app: App) {
    if let Err(err) = app.start().await {
        if err.is_pre_logger() {
            eprintln!("grpcapp: {err}");
        }
        std::process::exit(1);
    }
}
