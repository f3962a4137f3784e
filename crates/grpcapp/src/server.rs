//! RPC and HTTP server assembly.
//!
//! [`GrpcServer`] owns the transport builder, the interceptor chain and the
//! routes of every registered service. [`HttpServer`] serves the very same
//! routes over TLS with HTTP/1.1, gRPC-Web and permissive CORS, so browser
//! clients reach the same handlers as native gRPC clients.

use crate::{Config, Error, Result, interceptor::InterceptorChain};
use std::{convert::Infallible, future::Future, path::Path};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{
    body::Body,
    server::NamedService,
    service::{Routes, RoutesBuilder},
    transport::{Identity, Server, ServerTlsConfig},
};
use tonic_web::GrpcWebLayer;
use tower::{Service, ServiceBuilder};
use tower_http::cors::{Any, CorsLayer};

/// Identity of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceDescriptor {
    name: &'static str,
}

impl ServiceDescriptor {
    pub fn of<S: NamedService>() -> Self {
        Self { name: S::NAME }
    }

    /// Fully qualified service name, e.g. `grpc.health.v1.Health`.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// The RPC server: transport settings, interceptor chain and routes.
pub struct GrpcServer {
    transport: Server,
    chain: Option<InterceptorChain>,
    routes: RoutesBuilder,
    services: Vec<ServiceDescriptor>,
}

impl GrpcServer {
    pub(crate) fn new(transport: Server, chain: Option<InterceptorChain>) -> Self {
        Self {
            transport,
            chain,
            routes: RoutesBuilder::default(),
            services: Vec::new(),
        }
    }

    /// Default transport: HTTP/2 with adaptive flow-control windows.
    pub(crate) fn default_transport() -> Server {
        Server::builder().http2_adaptive_window(Some(true))
    }

    /// Services registered so far, in registration order.
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Whether calls go through the library's interceptor chain. A server
    /// supplied with [`App::with_grpc_server`](crate::App::with_grpc_server)
    /// is used as-is and is not intercepted.
    pub fn is_intercepted(&self) -> bool {
        self.chain.is_some()
    }

    pub(crate) fn chain(&self) -> Option<&InterceptorChain> {
        self.chain.as_ref()
    }

    pub(crate) fn add_service<S>(&mut self, service: S)
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        self.services.push(ServiceDescriptor::of::<S>());
        self.routes.add_service(service);
    }

    pub(crate) fn routes(&self) -> Routes {
        self.routes.clone().routes()
    }

    pub(crate) async fn serve<F>(
        self,
        routes: Routes,
        incoming: TcpListenerStream,
        signal: F,
    ) -> Result<(), tonic::transport::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut transport = self
            .transport
            .layer(ServiceBuilder::new().option_layer(self.chain));
        transport
            .add_routes(routes)
            .serve_with_incoming_shutdown(incoming, signal)
            .await
    }
}

/// The HTTPS server fronting the RPC routes for gRPC-Web clients.
pub struct HttpServer {
    transport: Server,
}

impl HttpServer {
    pub(crate) fn new(transport: Server) -> Self {
        Self { transport }
    }

    pub(crate) fn default_transport() -> Server {
        Server::builder().accept_http1(true)
    }

    pub(crate) fn serve<F>(
        self,
        identity: Identity,
        routes: Routes,
        chain: Option<InterceptorChain>,
        incoming: TcpListenerStream,
        signal: F,
    ) -> Result<impl Future<Output = Result<(), tonic::transport::Error>> + Send + 'static>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let transport = self
            .transport
            .tls_config(ServerTlsConfig::new().identity(identity))?;

        Ok(async move {
            let mut transport = transport.layer(
                ServiceBuilder::new()
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    )
                    .layer(GrpcWebLayer::new())
                    .option_layer(chain),
            );
            transport
                .add_routes(routes)
                .serve_with_incoming_shutdown(incoming, signal)
                .await
        })
    }
}

/// Loads the TLS identity of the HTTP listener.
///
/// Both paths must be configured; each missing one is its own error.
pub(crate) async fn load_identity(config: &Config) -> Result<Identity> {
    let certificate = config.tls_certificate().ok_or(Error::MissingTlsCertificate)?;
    let key = config.tls_key().ok_or(Error::MissingTlsKey)?;
    Ok(Identity::from_pem(read(certificate).await?, read(key).await?))
}

async fn read(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|source| Error::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })
}
