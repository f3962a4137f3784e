//! The per-call interceptor chain.
//!
//! Every call served by the library passes through, in order:
//!
//! 1. [`ContextTags`]: records service, method and peer in the request
//!    extensions and opens a `grpc` span.
//! 2. [`RequestLogging`]: logs the final status code (`Ok` at DEBUG,
//!    anything else at ERROR) and records call metrics.
//! 3. [`Intercepted`]: runs JWT authentication (when configured) followed by
//!    the user [`Interceptor`]s, in the order they were added.
//! 4. User layers added with [`App::with_layer`](crate::App::with_layer),
//!    wrapping the handler itself.
//!
//! Interceptors only see the request head. The body, and with it every
//! message of a streaming call, is forwarded untouched. Code that must run
//! around the handler (timing it, reading or rewriting its response) is a
//! layer over [`CallService`] instead.

mod chain;
mod logging;
mod tags;

pub(crate) use chain::CallLayer;
pub use chain::{CallService, Intercepted, InterceptorChain};
pub use logging::{LoggingBody, LoggingFuture, RequestLogging, code_to_level};
pub use tags::{CallTags, ContextTags};

use tonic::{Request, Status};

/// Inspects or augments the head of every call before it reaches the
/// handler.
///
/// `method` is the full gRPC path (`/package.Service/Method`). Returning an
/// error rejects the call with that status; the handler never runs.
///
/// Closures with a matching signature implement this trait:
///
/// ```ignore
/// app.with_interceptor(|method: &str, request: tonic::Request<()>| {
///     tracing::debug!(method, "incoming call");
///     Ok(request)
/// })
/// ```
pub trait Interceptor: Send + Sync + 'static {
    fn intercept(&self, method: &str, request: Request<()>) -> Result<Request<()>, Status>;
}

impl<F> Interceptor for F
where
    F: Fn(&str, Request<()>) -> Result<Request<()>, Status> + Send + Sync + 'static,
{
    fn intercept(&self, method: &str, request: Request<()>) -> Result<Request<()>, Status> {
        self(method, request)
    }
}
