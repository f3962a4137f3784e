#![allow(dead_code)]

use grpcapp::{App, Config, ShutdownHandle, Stage};
use std::{path::PathBuf, time::Duration};
use tokio::task::JoinHandle;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic_health::pb::{HealthCheckRequest, health_client::HealthClient};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn config(grpc_port: u16) -> Config {
    Config {
        grpc_listen_port: grpc_port,
        http_listen_port: free_port(),
        ..Config::default()
    }
}

/// Starts `app` in the background and waits until it is listening.
pub async fn spawn(app: App) -> (ShutdownHandle, JoinHandle<grpcapp::Result<()>>) {
    let handle = app.shutdown_handle();
    let mut stage = app.subscribe_stage();
    let task = tokio::spawn(app.start());
    tokio::time::timeout(TIMEOUT, stage.wait_for(|stage| *stage >= Stage::Listening))
        .await
        .expect("app did not start listening in time")
        .expect("app stopped before listening");
    (handle, task)
}

/// Triggers shutdown and waits for `start` to return.
pub async fn stop(
    handle: ShutdownHandle,
    task: JoinHandle<grpcapp::Result<()>>,
) -> grpcapp::Result<()> {
    assert!(handle.trigger(grpcapp::Signal::Interrupt));
    tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("start did not return after shutdown")
        .expect("start panicked")
}

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Config serving HTTPS with the test certificate, signed by
/// `fixtures/ca.pem` for `localhost` and `127.0.0.1`.
pub fn tls_config(grpc_port: u16) -> Config {
    Config {
        tls_certificate: Some(fixture("server.pem")),
        tls_key: Some(fixture("server.key")),
        ..config(grpc_port)
    }
}

pub async fn health_client(port: u16) -> HealthClient<Channel> {
    let channel = Channel::from_shared(format!("http://127.0.0.1:{port}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    HealthClient::new(channel)
}

pub async fn https_health_client(port: u16) -> HealthClient<Channel> {
    let ca = std::fs::read(fixture("ca.pem")).unwrap();
    let tls = ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca))
        .domain_name("localhost");
    let channel = Channel::from_shared(format!("https://127.0.0.1:{port}"))
        .unwrap()
        .tls_config(tls)
        .unwrap()
        .connect()
        .await
        .unwrap();
    HealthClient::new(channel)
}

pub async fn is_closed(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_err()
}

pub fn check(service: &str) -> tonic::Request<HealthCheckRequest> {
    tonic::Request::new(HealthCheckRequest {
        service: service.to_owned(),
    })
}
