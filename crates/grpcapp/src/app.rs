use crate::{
    Config, Error, Result,
    auth::JwtAuth,
    database::{self, Database},
    interceptor::{CallLayer, Interceptor, InterceptorChain},
    logger,
    server::{self, GrpcServer, HttpServer, ServiceDescriptor},
    shutdown::{ShutdownHandle, Signal, Signals},
    telemetry::TelemetryProviders,
    tools::Tools,
};
use std::{future::Future, mem, net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic_health::{ServingStatus, server::HealthReporter};
use tracing::Dispatch;

pub(crate) type ServerOption = Box<dyn FnOnce(Server) -> Server + Send>;
pub(crate) type StartHook = Box<dyn FnOnce(&Tools) -> anyhow::Result<()> + Send>;

pub(crate) struct Registration {
    pub(crate) descriptor: ServiceDescriptor,
    pub(crate) register: Box<dyn FnOnce(&Tools, &mut GrpcServer) + Send>,
}

/// Lifecycle stages, in the order [`App::start`] walks through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Created,
    Configured,
    Logged,
    DatabaseAttached,
    ServersBuilt,
    ServicesRegistered,
    Listening,
    Draining,
    Stopped,
}

/// A gRPC application: configuration, logging, optional database, servers
/// and graceful shutdown, started by [`App::start`].
///
/// Anything supplied through a `with_*` option replaces the component the
/// corresponding stage would otherwise build.
pub struct App {
    pub(crate) config: Option<Arc<Config>>,
    pub(crate) logger: Option<Dispatch>,
    pub(crate) database: Option<Database>,
    pub(crate) jwt: Option<JwtAuth>,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) layers: Vec<CallLayer>,
    pub(crate) server_options: Vec<ServerOption>,
    pub(crate) registrations: Vec<Registration>,
    pub(crate) start_hooks: Vec<StartHook>,
    pub(crate) grpc_server: Option<GrpcServer>,
    pub(crate) http_server: Option<HttpServer>,
    pub(crate) serve_http: bool,
    pub(crate) health: bool,
    pub(crate) reflection: Option<&'static [u8]>,
    telemetry: Option<TelemetryProviders>,
    tools: Option<Tools>,
    registered: Vec<ServiceDescriptor>,
    health_reporter: Option<HealthReporter>,
    stage: Arc<watch::Sender<Stage>>,
    shutdown_tx: mpsc::Sender<Signal>,
    shutdown_rx: Option<mpsc::Receiver<Signal>>,
    done_tx: Option<oneshot::Sender<()>>,
    done_rx: Option<oneshot::Receiver<()>>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = oneshot::channel();
        let (stage, _) = watch::channel(Stage::Created);
        Self {
            config: None,
            logger: None,
            database: None,
            jwt: None,
            interceptors: Vec::new(),
            layers: Vec::new(),
            server_options: Vec::new(),
            registrations: Vec::new(),
            start_hooks: Vec::new(),
            grpc_server: None,
            http_server: None,
            serve_http: false,
            health: false,
            reflection: None,
            telemetry: None,
            tools: None,
            registered: Vec::new(),
            health_reporter: None,
            stage: Arc::new(stage),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
            done_tx: Some(done_tx),
            done_rx: Some(done_rx),
        }
    }

    /// Runs the application until a shutdown signal has been handled.
    ///
    /// Stages run in a fixed order: config, logger, database, servers,
    /// service registration, start hooks, listen, then wait for
    /// SIGINT/SIGTERM (or [`ShutdownHandle::trigger`]) and drain. The first
    /// failing stage ends the run; errors after the logger exists are logged
    /// before being returned.
    pub async fn start(mut self) -> Result<()> {
        self.init_config()?;
        self.init_logger()?;

        let result = self.serve().await;
        if let Err(err) = &result {
            tracing::error!(error = %err, "fatal error, stopping application");
        }
        result
    }

    async fn serve(&mut self) -> Result<()> {
        self.init_database().await?;
        self.init_servers()?;
        self.init_service_implementations().await?;
        self.run_start_hooks()?;

        let (listeners, mut fatal) = self.listen().await?;
        let abort = CancellationToken::new();
        let mut done = self.shutdown(listeners, abort.clone())?;

        tokio::select! {
            _ = &mut done => Ok(()),
            Some(err) = fatal.recv() => {
                abort.cancel();
                let _ = done.await;
                Err(err)
            }
        }
    }

    pub(crate) fn init_config(&mut self) -> Result<()> {
        if self.config.is_none() {
            self.config = Some(Arc::new(Config::from_env()?));
        }
        self.advance(Stage::Configured);
        Ok(())
    }

    pub(crate) fn init_logger(&mut self) -> Result<()> {
        if self.logger.is_none() {
            let config = self.loaded_config()?;
            let level = logger::parse_level(&config.log_level)?;
            let providers = TelemetryProviders::init(&config)?;
            self.logger = Some(logger::build(level, &providers));
            self.telemetry = Some(providers);
        }
        if let Some(dispatch) = &self.logger {
            logger::install(dispatch);
        }
        self.advance(Stage::Logged);
        Ok(())
    }

    pub(crate) async fn init_database(&mut self) -> Result<()> {
        if self.database.is_none() {
            let config = self.loaded_config()?;
            if let Some(dsn) = config.dsn() {
                self.database = Some(database::connect(dsn).await?);
                tracing::info!("connected to database");
            }
        }
        self.advance(Stage::DatabaseAttached);
        Ok(())
    }

    pub(crate) fn init_servers(&mut self) -> Result<()> {
        if self.grpc_server.is_none() {
            let mut interceptors: Vec<Arc<dyn Interceptor>> =
                Vec::with_capacity(self.interceptors.len() + 1);
            if let Some(jwt) = self.jwt.take() {
                interceptors.push(Arc::new(jwt));
            }
            interceptors.append(&mut self.interceptors);

            let transport = self
                .server_options
                .drain(..)
                .fold(GrpcServer::default_transport(), |server, option| {
                    option(server)
                });
            let chain = InterceptorChain::new(interceptors)
                .with_layers(mem::take(&mut self.layers));
            self.grpc_server = Some(GrpcServer::new(transport, Some(chain)));
        } else if self.jwt.is_some()
            || !self.interceptors.is_empty()
            || !self.layers.is_empty()
            || !self.server_options.is_empty()
        {
            tracing::warn!(
                "rpc server supplied, interceptors, layers and server options are not applied"
            );
        }

        if self.http_server.is_none() {
            self.http_server = Some(HttpServer::new(HttpServer::default_transport()));
        }
        self.advance(Stage::ServersBuilt);
        Ok(())
    }

    pub(crate) async fn init_service_implementations(&mut self) -> Result<()> {
        let tools = Tools::new(
            self.loaded_config()?,
            self.loaded_logger()?,
            self.database.clone(),
        );
        let server = self
            .grpc_server
            .as_mut()
            .ok_or(Error::Lifecycle("rpc server is not built"))?;

        for registration in mem::take(&mut self.registrations) {
            (registration.register)(&tools, server);
            tracing::info!(
                service.name = registration.descriptor.name(),
                "service registration"
            );
        }
        self.registered = server.services().to_vec();

        if self.health {
            let (reporter, service) = tonic_health::server::health_reporter();
            for descriptor in &self.registered {
                reporter
                    .set_service_status(descriptor.name(), ServingStatus::Serving)
                    .await;
            }
            server.add_service(service);
            self.health_reporter = Some(reporter);
        }

        if let Some(encoded) = self.reflection {
            let reflection = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(encoded)
                .build_v1()?;
            server.add_service(reflection);
        }

        self.tools = Some(tools);
        self.advance(Stage::ServicesRegistered);
        Ok(())
    }

    pub(crate) fn run_start_hooks(&mut self) -> Result<()> {
        let tools = self
            .tools
            .clone()
            .ok_or(Error::Lifecycle("services are not registered"))?;
        for hook in mem::take(&mut self.start_hooks) {
            hook(&tools).map_err(Error::StartHook)?;
        }
        Ok(())
    }

    /// Binds every listener, then spawns one serving task per listener.
    ///
    /// Nothing is spawned unless every listener could be prepared, so a
    /// failure here leaves no port bound.
    pub(crate) async fn listen(&mut self) -> Result<(Listeners, mpsc::Receiver<Error>)> {
        let config = self.loaded_config()?;
        let grpc = self
            .grpc_server
            .take()
            .ok_or(Error::Lifecycle("rpc server is not built"))?;
        let routes = grpc.routes();

        let grpc_addr = config.grpc_addr();
        tracing::info!(address = %grpc_addr, "starting grpc server");
        let grpc_listener = bind("grpc", grpc_addr).await?;

        let (fatal_tx, fatal_rx) = mpsc::channel(2);

        let http = if self.serve_http {
            let http = self
                .http_server
                .take()
                .ok_or(Error::Lifecycle("http server is not built"))?;
            let http_addr = config.http_addr();
            tracing::info!(
                address = %http_addr,
                tls.certificate = ?config.tls_certificate,
                tls.key = ?config.tls_key,
                "starting http server"
            );
            let identity = server::load_identity(&config).await?;
            let http_listener = bind("http", http_addr).await?;

            let stop = CancellationToken::new();
            let serve = http.serve(
                identity,
                routes.clone(),
                grpc.chain().cloned(),
                TcpListenerStream::new(http_listener),
                stop.clone().cancelled_owned(),
            )?;
            Some((serve, stop))
        } else {
            None
        };

        let stop = CancellationToken::new();
        let serve = grpc.serve(
            routes,
            TcpListenerStream::new(grpc_listener),
            stop.clone().cancelled_owned(),
        );
        let listeners = Listeners {
            grpc: Listener::spawn("grpc", serve, stop, fatal_tx.clone()),
            http: http.map(|(serve, stop)| Listener::spawn("http", serve, stop, fatal_tx)),
        };

        Ok((listeners, fatal_rx))
    }

    /// Spawns the routine that waits for a shutdown signal, or for `abort`,
    /// and drains the listeners. The returned receiver resolves once
    /// everything stopped.
    ///
    /// Signal handlers are registered before the stage moves to
    /// [`Stage::Listening`].
    pub(crate) fn shutdown(
        &mut self,
        listeners: Listeners,
        abort: CancellationToken,
    ) -> Result<oneshot::Receiver<()>> {
        let done_tx = self
            .done_tx
            .take()
            .ok_or(Error::Lifecycle("shutdown is already scheduled"))?;
        let done_rx = self
            .done_rx
            .take()
            .ok_or(Error::Lifecycle("shutdown is already scheduled"))?;
        let signals = Signals::install(self.shutdown_rx.take());
        let stage = Arc::clone(&self.stage);
        let telemetry = self.telemetry.take();
        let health = self
            .health_reporter
            .clone()
            .map(|reporter| (reporter, self.registered.clone()));

        self.advance(Stage::Listening);
        tokio::spawn(async move {
            tokio::select! {
                signal = signals.recv() => tracing::info!(signal = %signal, "graceful shutdown"),
                () = abort.cancelled() => tracing::warn!("a listener failed, draining the others"),
            }
            stage.send_replace(Stage::Draining);

            if let Some((reporter, services)) = health {
                for name in std::iter::once("").chain(services.iter().map(|s| s.name())) {
                    reporter
                        .set_service_status(name, ServingStatus::NotServing)
                        .await;
                }
            }

            listeners.stop().await;

            if let Some(telemetry) = telemetry {
                telemetry.shutdown();
            }
            stage.send_replace(Stage::Stopped);
            let _ = done_tx.send(());
        });

        Ok(done_rx)
    }

    fn advance(&self, stage: Stage) {
        let previous = self.stage.send_replace(stage);
        debug_assert!(previous <= stage, "stage went back from {previous:?} to {stage:?}");
        tracing::debug!(stage = ?stage, "lifecycle");
    }

    fn loaded_config(&self) -> Result<Arc<Config>> {
        self.config
            .clone()
            .ok_or(Error::Lifecycle("config is not loaded"))
    }

    fn loaded_logger(&self) -> Result<Dispatch> {
        self.logger
            .clone()
            .ok_or(Error::Lifecycle("logger is not initialized"))
    }

    /// The loaded (or supplied) configuration.
    pub fn config(&self) -> Option<&Config> {
        self.config.as_deref()
    }

    /// Tools handed to implementations; available once services are
    /// registered.
    pub fn tools(&self) -> Option<&Tools> {
        self.tools.as_ref()
    }

    /// The RPC server, between server construction and listen.
    pub fn grpc_server(&self) -> Option<&GrpcServer> {
        self.grpc_server.as_ref()
    }

    /// The HTTP server, between server construction and listen.
    pub fn http_server(&self) -> Option<&HttpServer> {
        self.http_server.as_ref()
    }

    pub fn stage(&self) -> Stage {
        *self.stage.borrow()
    }

    /// Watches stage transitions, e.g. to wait until the app is listening.
    pub fn subscribe_stage(&self) -> watch::Receiver<Stage> {
        self.stage.subscribe()
    }

    /// A handle that triggers graceful shutdown from code.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle::new(self.shutdown_tx.clone())
    }
}

async fn bind(server: &'static str, addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| Error::Bind {
            server,
            addr,
            source,
        })
}

/// A spawned serving task and the token that stops it.
pub(crate) struct Listener {
    stop: CancellationToken,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl Listener {
    fn spawn<F>(
        server: &'static str,
        serve: F,
        stop: CancellationToken,
        fatal: mpsc::Sender<Error>,
    ) -> Self
    where
        F: Future<Output = Result<(), tonic::transport::Error>> + Send + 'static,
    {
        let stopping = stop.clone();
        let task = tokio::spawn(async move {
            match serve.await {
                Err(source) if !stopping.is_cancelled() => {
                    let _ = fatal.send(Error::Serve { server, source }).await;
                    Ok(())
                }
                result => result,
            }
        });
        Self { stop, task }
    }

    /// Stops accepting and waits for in-flight calls to finish.
    async fn stop(self) -> Result<(), tower::BoxError> {
        self.stop.cancel();
        self.task.await??;
        Ok(())
    }
}

pub(crate) struct Listeners {
    grpc: Listener,
    http: Option<Listener>,
}

impl Listeners {
    async fn stop(self) {
        if let Err(err) = self.grpc.stop().await {
            tracing::error!(error = %err, "failed to stop grpc server gracefully");
        }
        tracing::info!("stopped grpc server");

        if let Some(http) = self.http {
            if let Err(err) = http.stop().await {
                tracing::error!(error = %err, "failed to shutdown http server gracefully");
            }
            tracing::info!("stopped http server");
        }
    }
}
