//! Chainable `with_*` options on [`App`].

use crate::{
    App, Config,
    app::Registration,
    auth::{JwtAuth, KeyResolver},
    database::Database,
    interceptor::{CallService, Interceptor},
    server::{GrpcServer, HttpServer, ServiceDescriptor},
    tools::{Implementation, Tools},
};
use std::{convert::Infallible, sync::Arc};
use tonic::{body::Body, server::NamedService, transport::Server};
use tower::{Layer, Service};
use tracing::Dispatch;

impl App {
    /// Uses `config` instead of reading the environment.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(Arc::new(config));
        self
    }

    /// Uses `logger` instead of building the JSON logger. It is still
    /// installed as the global default when none is set yet.
    pub fn with_logger(mut self, logger: impl Into<Dispatch>) -> Self {
        self.logger = Some(logger.into());
        self
    }

    /// Uses an existing database handle; `DATABASE_DSN` is then ignored.
    pub fn with_database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    /// Uses a pre-configured transport as the RPC server.
    ///
    /// The server is used as-is: interceptors, JWT authentication and
    /// [`with_server_options`](Self::with_server_options) are not applied
    /// to it. Services are still registered.
    pub fn with_grpc_server(mut self, server: Server) -> Self {
        self.grpc_server = Some(GrpcServer::new(server, None));
        self
    }

    /// Uses a pre-configured transport for the HTTP server. TLS, gRPC-Web
    /// and CORS are still layered on top.
    pub fn with_http_server(mut self, server: Server) -> Self {
        self.http_server = Some(HttpServer::new(server));
        self
    }

    /// Adjusts the default RPC transport, e.g. timeouts or message limits.
    /// Options apply in the order they are added.
    ///
    /// ```ignore
    /// App::new().with_server_options(|server| server.timeout(Duration::from_secs(30)))
    /// ```
    pub fn with_server_options<F>(mut self, option: F) -> Self
    where
        F: FnOnce(Server) -> Server + Send + 'static,
    {
        self.server_options.push(Box::new(option));
        self
    }

    /// Appends a user interceptor. It runs after authentication, for unary
    /// and streaming calls alike.
    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Appends a tower layer around the handler of every call.
    ///
    /// Layers run after authentication and the [`Interceptor`]s, so they
    /// only see calls that were let through, and they observe the
    /// handler's response. The first layer added is the outermost.
    ///
    /// ```ignore
    /// App::new().with_layer(tower::util::MapResponseLayer::new(|mut res: http::Response<_>| {
    ///     res.headers_mut().insert("x-served-by", HeaderValue::from_static("billing"));
    ///     res
    /// }))
    /// ```
    pub fn with_layer<L>(mut self, layer: L) -> Self
    where
        L: Layer<CallService> + Send + Sync + 'static,
        L::Service: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + Clone
            + Send
            + Sync
            + 'static,
        <L::Service as Service<http::Request<Body>>>::Future: Send + 'static,
    {
        self.layers.push(Arc::new(move |inner: CallService| {
            CallService::new(layer.layer(inner))
        }));
        self
    }

    /// Enables JWT authentication.
    ///
    /// `methods` lists the full method paths that require a token; an empty
    /// list protects every method.
    ///
    /// ```ignore
    /// App::new().with_jwt_authentication(
    ///     grpcapp::auth::hmac_secret(secret),
    ///     ["/billing.v1.Billing/Charge"],
    /// )
    /// ```
    pub fn with_jwt_authentication<I, M>(mut self, resolver: impl KeyResolver, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        self.jwt = Some(JwtAuth::new(resolver, methods));
        self
    }

    /// Also serves the RPC routes over HTTPS on `HTTP_LISTEN_PORT`.
    ///
    /// Requires `TLS_CERTIFICATE` and `TLS_KEY`; their absence fails
    /// [`App::start`] when listening.
    pub fn with_http(mut self) -> Self {
        self.serve_http = true;
        self
    }

    /// Registers a service implementation.
    ///
    /// `implementation` receives [`Tools`] once, then `into_service` turns it
    /// into the generated server type:
    ///
    /// ```ignore
    /// App::new().with_service_implementation(Greeter::default(), GreeterServer::new)
    /// ```
    pub fn with_service_implementation<I, S, F>(mut self, implementation: I, into_service: F) -> Self
    where
        I: Implementation,
        F: FnOnce(I) -> S + Send + 'static,
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let mut implementation = implementation;
        self.registrations.push(Registration {
            descriptor: ServiceDescriptor::of::<S>(),
            register: Box::new(move |tools: &Tools, server: &mut GrpcServer| {
                implementation.use_tools(tools);
                server.add_service(into_service(implementation));
            }),
        });
        self
    }

    /// Runs `hook` after services are registered and before listening.
    /// An error aborts the start.
    pub fn with_start_hook<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Tools) -> anyhow::Result<()> + Send + 'static,
    {
        self.start_hooks.push(Box::new(hook));
        self
    }

    /// Serves `grpc.health.v1.Health`, reporting every registered service as
    /// SERVING until shutdown begins.
    pub fn with_health_service(mut self) -> Self {
        self.health = true;
        self
    }

    /// Serves gRPC server reflection from an encoded file descriptor set.
    pub fn with_reflection(mut self, encoded_file_descriptor_set: &'static [u8]) -> Self {
        self.reflection = Some(encoded_file_descriptor_set);
        self
    }
}
