use std::{
    net::SocketAddr,
    task::{Context, Poll},
};
use tonic::transport::server::{TcpConnectInfo, TlsConnectInfo};
use tower::Service;
use tracing::{Instrument, field, instrument::Instrumented};

/// Call identity recorded in the request extensions of every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTags {
    service: String,
    method: String,
    full_method: String,
    peer: Option<SocketAddr>,
}

impl CallTags {
    /// Splits a gRPC path (`/package.Service/Method`) into its parts.
    pub fn from_path(path: &str, peer: Option<SocketAddr>) -> Self {
        let (service, method) = path
            .trim_start_matches('/')
            .split_once('/')
            .unwrap_or(("unknown", path));
        Self {
            service: service.to_owned(),
            method: method.to_owned(),
            full_method: path.to_owned(),
            peer,
        }
    }

    fn from_request<B>(req: &http::Request<B>) -> Self {
        let extensions = req.extensions();
        let peer = extensions
            .get::<TcpConnectInfo>()
            .and_then(TcpConnectInfo::remote_addr)
            .or_else(|| {
                extensions
                    .get::<TlsConnectInfo<TcpConnectInfo>>()
                    .and_then(|info| info.get_ref().remote_addr())
            });
        Self::from_path(req.uri().path(), peer)
    }

    /// Fully qualified service name, e.g. `grpc.health.v1.Health`.
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The full gRPC path, e.g. `/grpc.health.v1.Health/Check`.
    pub fn full_method(&self) -> &str {
        &self.full_method
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Tags each call with a [`CallTags`] extension and runs it inside a `grpc`
/// span carrying the same fields.
#[derive(Debug, Clone)]
pub struct ContextTags<S> {
    inner: S,
}

impl<S> ContextTags<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S, B> Service<http::Request<B>> for ContextTags<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Instrumented<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        let tags = CallTags::from_request(&req);
        let span = tracing::info_span!(
            "grpc",
            grpc.service = %tags.service,
            grpc.method = %tags.method,
            peer.address = field::Empty,
        );
        if let Some(peer) = tags.peer {
            span.record("peer.address", field::display(peer));
        }
        req.extensions_mut().insert(tags);

        let future = {
            let _enter = span.enter();
            self.inner.call(req)
        };
        future.instrument(span)
    }
}
