#![doc = include_str!("../README.md")]

use clap::Parser;
use grpcapp::{App, Config, auth::hmac_secret};

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "grpcapp-server",
    version,
    about = "Reference gRPC server serving grpc.health.v1.Health"
)]
struct CliArgs {
    /// Also serve gRPC-Web over HTTPS on HTTP_LISTEN_PORT (requires
    /// TLS_CERTIFICATE and TLS_KEY)
    #[arg(long, env = "SERVE_HTTP")]
    http: bool,

    /// HMAC secret used to verify JWTs; authentication is off when unset
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Full method paths that require a token, comma separated; every method
    /// when empty
    #[arg(long, env = "JWT_METHODS", value_delimiter = ',')]
    jwt_methods: Vec<String>,

    #[command(flatten)]
    config: Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();

    let mut app = App::new().with_config(args.config).with_health_service();
    if args.http {
        app = app.with_http();
    }
    if let Some(secret) = args.jwt_secret.filter(|secret| !secret.is_empty()) {
        let methods = args
            .jwt_methods
            .into_iter()
            .map(|method| method.trim().to_owned())
            .filter(|method| !method.is_empty());
        app = app.with_jwt_authentication(hmac_secret(secret), methods);
    }

    grpcapp::run(app).await;
    tracing::info!("server shut down successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_flattened_config() {
        let args = CliArgs::try_parse_from([
            "grpcapp-server",
            "--http",
            "--jwt-secret",
            "s3cret",
            "--jwt-methods",
            "/a.A/One,/b.B/Two",
            "--grpc-listen-port",
            "50051",
        ])
        .unwrap();
        assert!(args.http);
        assert_eq!(args.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(args.jwt_methods, ["/a.A/One", "/b.B/Two"]);
        assert_eq!(args.config.grpc_listen_port, 50051);
    }
}
