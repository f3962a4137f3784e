mod common;

use common::{
    check, config, free_port, health_client, https_health_client, is_closed, spawn, stop,
    tls_config,
};
use grpcapp::{App, Error, Implementation, Stage, Tools};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tonic_health::pb::health_check_response::ServingStatus;
use tracing::Dispatch;

fn app(port: u16) -> App {
    App::new()
        .with_config(config(port))
        .with_logger(Dispatch::none())
        .with_health_service()
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_until_triggered_then_releases_the_port() {
    let port = free_port();
    let app = app(port);
    let stages = app.subscribe_stage();
    let (handle, task) = spawn(app).await;

    let mut client = health_client(port).await;
    let status = client.check(check("")).await.unwrap().into_inner().status;
    assert_eq!(status, ServingStatus::Serving as i32);
    drop(client);

    stop(handle, task).await.unwrap();
    assert_eq!(*stages.borrow(), Stage::Stopped);
    assert!(is_closed(port).await, "rpc listener must be closed after shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn https_listener_serves_the_same_routes_and_drains() {
    let port = free_port();
    let config = tls_config(port);
    let http_port = config.http_listen_port;
    let app = App::new()
        .with_config(config)
        .with_logger(Dispatch::none())
        .with_health_service()
        .with_http();
    let stages = app.subscribe_stage();
    let (handle, task) = spawn(app).await;

    let mut client = https_health_client(http_port).await;
    let status = client.check(check("")).await.unwrap().into_inner().status;
    assert_eq!(status, ServingStatus::Serving as i32);
    drop(client);

    let mut client = health_client(port).await;
    let status = client.check(check("")).await.unwrap().into_inner().status;
    assert_eq!(status, ServingStatus::Serving as i32);
    drop(client);

    stop(handle, task).await.unwrap();
    assert_eq!(*stages.borrow(), Stage::Stopped);
    assert!(is_closed(port).await, "rpc listener must be closed");
    assert!(is_closed(http_port).await, "https listener must be closed");
}

#[tokio::test(flavor = "multi_thread")]
async fn registered_services_report_serving() {
    #[derive(Default)]
    struct Reflection(Arc<AtomicBool>);

    impl Implementation for Reflection {
        fn use_tools(&mut self, tools: &Tools) {
            assert!(tools.db().is_none());
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let port = free_port();
    let used_tools = Arc::new(AtomicBool::new(false));
    let reflection = tonic_reflection::server::Builder::configure()
        .build_v1()
        .unwrap();
    let app = app(port).with_service_implementation(
        Reflection(Arc::clone(&used_tools)),
        move |_| reflection,
    );
    let (handle, task) = spawn(app).await;
    assert!(used_tools.load(Ordering::SeqCst));

    let mut client = health_client(port).await;
    let status = client
        .check(check("grpc.reflection.v1.ServerReflection"))
        .await
        .unwrap()
        .into_inner()
        .status;
    assert_eq!(status, ServingStatus::Serving as i32);

    let unknown = client.check(check("unknown.Service")).await.unwrap_err();
    assert_eq!(unknown.code(), tonic::Code::NotFound);
    drop(client);

    stop(handle, task).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_start_hook_aborts_before_listening() {
    let port = free_port();
    let app = app(port).with_start_hook(|_| anyhow::bail!("schema is out of date"));
    let stages = app.subscribe_stage();

    let err = app.start().await.unwrap_err();
    assert!(matches!(err, Error::StartHook(_)));
    assert!(*stages.borrow() < Stage::Listening);
    std::net::TcpListener::bind(("0.0.0.0", port)).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn second_trigger_is_ignored() {
    let port = free_port();
    let (handle, task) = spawn(app(port)).await;
    let extra = handle.clone();

    stop(handle, task).await.unwrap();
    assert!(!extra.trigger(grpcapp::Signal::Terminate));
}
