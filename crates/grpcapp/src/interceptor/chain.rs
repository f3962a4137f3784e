use super::{ContextTags, Interceptor, RequestLogging};
use futures::future::{self, Either, Ready};
use http::{HeaderValue, header::CONTENT_TYPE};
use std::{
    convert::Infallible,
    fmt, mem,
    sync::Arc,
    task::{Context, Poll},
};
use tonic::{Status, body::Body, metadata::MetadataMap};
use tower::{Layer, Service, util::BoxCloneSyncService};

type Interceptors = Arc<[Arc<dyn Interceptor>]>;

/// A type-erased call handler, as seen by layers added with
/// [`App::with_layer`](crate::App::with_layer).
pub type CallService = BoxCloneSyncService<http::Request<Body>, http::Response<Body>, Infallible>;

/// Wraps the handler of every call in one user layer.
pub(crate) type CallLayer = Arc<dyn Fn(CallService) -> CallService + Send + Sync>;

/// The complete, frozen interceptor chain as a single tower layer.
///
/// Wraps a service in [`ContextTags`] → [`RequestLogging`] →
/// [`Intercepted`] → user layers, in that order.
#[derive(Clone)]
pub struct InterceptorChain {
    interceptors: Interceptors,
    layers: Arc<[CallLayer]>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
            layers: Arc::new([]),
        }
    }

    /// Adds layers around the handler. The first layer is the outermost.
    pub(crate) fn with_layers(mut self, layers: Vec<CallLayer>) -> Self {
        self.layers = layers.into();
        self
    }

    /// Number of authentication and user interceptors in the chain.
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.interceptors.len())
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl<S> Layer<S> for InterceptorChain
where
    S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    type Service = ContextTags<RequestLogging<Intercepted<CallService>>>;

    fn layer(&self, inner: S) -> Self::Service {
        let handler = self
            .layers
            .iter()
            .rev()
            .fold(CallService::new(inner), |handler, layer| layer(handler));
        ContextTags::new(RequestLogging::new(Intercepted::new(
            handler,
            self.interceptors.clone(),
        )))
    }
}

/// Runs each [`Interceptor`] against the request head, then forwards the
/// rebuilt request to the inner service.
///
/// The body is never touched, so streaming calls keep their message stream
/// while handlers observe the augmented metadata and extensions.
#[derive(Clone)]
pub struct Intercepted<S> {
    inner: S,
    interceptors: Interceptors,
}

impl<S> Intercepted<S> {
    pub(crate) fn new(inner: S, interceptors: Interceptors) -> Self {
        Self {
            inner,
            interceptors,
        }
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for Intercepted<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    ResBody: Default,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Either<Ready<Result<S::Response, S::Error>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        if self.interceptors.is_empty() {
            return Either::Right(self.inner.call(req));
        }

        let (mut parts, body) = req.into_parts();
        let method = parts.uri.path().to_owned();
        let mut request = tonic::Request::from_parts(
            MetadataMap::from_headers(mem::take(&mut parts.headers)),
            mem::take(&mut parts.extensions),
            (),
        );

        for interceptor in self.interceptors.iter() {
            request = match interceptor.intercept(&method, request) {
                Ok(request) => request,
                Err(status) => return Either::Left(future::ready(Ok(reject(&status)))),
            };
        }

        let (metadata, extensions, ()) = request.into_parts();
        parts.headers = metadata.into_headers();
        parts.extensions = extensions;
        Either::Right(self.inner.call(http::Request::from_parts(parts, body)))
    }
}

/// A trailers-only gRPC response carrying `status`.
fn reject<B: Default>(status: &Status) -> http::Response<B> {
    let mut response = http::Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    // header encoding only fails on invalid details, fall back to code only
    if status.add_header(headers).is_err() {
        let _ = Status::new(status.code(), status.message()).add_header(headers);
    }
    response
}
