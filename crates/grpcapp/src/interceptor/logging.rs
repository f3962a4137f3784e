use super::CallTags;
use crate::telemetry::{self, InflightGuard};
use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Instant,
};
use tonic::{Code, Status, body::Body};
use tower::{BoxError, Service};
use tracing::Level;

/// Severity a finished call is logged at.
///
/// `Ok` is DEBUG, every other code is ERROR.
pub fn code_to_level(code: Code) -> Level {
    match code {
        Code::Ok => Level::DEBUG,
        _ => Level::ERROR,
    }
}

/// Logs one line per call once its final status is known.
///
/// The status of a streaming call travels in the trailers, so the response
/// body is wrapped and the call is finished when the trailers (or the end of
/// a trailers-only response) go out. Duration covers the whole call.
#[derive(Debug, Clone)]
pub struct RequestLogging<S> {
    inner: S,
}

impl<S> RequestLogging<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RequestLogging<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Error: fmt::Display,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError> + fmt::Display,
{
    type Response = http::Response<Body>;
    type Error = S::Error;
    type Future = LoggingFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let method = req
            .extensions()
            .get::<CallTags>()
            .map(|tags| tags.full_method().to_owned())
            .unwrap_or_else(|| req.uri().path().to_owned());

        LoggingFuture {
            call: Some(CallRecord::new(method)),
            inner: self.inner.call(req),
        }
    }
}

/// One call, from the request until its final status.
struct CallRecord {
    method: String,
    start: Instant,
    _inflight: InflightGuard,
}

impl CallRecord {
    fn new(method: String) -> Self {
        telemetry::increment_requests(&method);
        Self {
            method,
            start: Instant::now(),
            _inflight: InflightGuard::new(),
        }
    }

    fn finish(self, code: Code) {
        let time_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let method = self.method.as_str();
        match code_to_level(code) {
            Level::ERROR => {
                tracing::error!(
                    grpc.method = method,
                    grpc.code = ?code,
                    grpc.time_ms = time_ms,
                    "finished call"
                )
            }
            _ => {
                tracing::debug!(
                    grpc.method = method,
                    grpc.code = ?code,
                    grpc.time_ms = time_ms,
                    "finished call"
                )
            }
        }
        if code != Code::Ok {
            telemetry::increment_errors(method, code);
        }
        telemetry::record_duration(method, time_ms);
    }
}

pin_project! {
    /// Response future of [`RequestLogging`].
    pub struct LoggingFuture<F> {
        #[pin]
        inner: F,
        call: Option<CallRecord>,
    }
}

impl<F, B, E> Future for LoggingFuture<F>
where
    F: Future<Output = Result<http::Response<B>, E>>,
    E: fmt::Display,
    B: HttpBody<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + fmt::Display,
{
    type Output = Result<http::Response<Body>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        let mut call = this.call.take();

        Poll::Ready(match result {
            Ok(response) => {
                // trailers-only responses carry the status in the head
                let head_code = Status::from_header_map(response.headers()).map(|s| s.code());
                if response.body().is_end_stream() {
                    if let Some(call) = call.take() {
                        call.finish(head_code.unwrap_or(Code::Ok));
                    }
                }
                Ok(response.map(|inner| {
                    Body::new(LoggingBody {
                        inner,
                        head_code,
                        call,
                    })
                }))
            }
            Err(err) => {
                if let Some(call) = call {
                    tracing::error!(
                        grpc.method = %call.method,
                        error = %err,
                        "failed to serve call"
                    );
                    call.finish(Code::Internal);
                }
                Err(err)
            }
        })
    }
}

pin_project! {
    /// Response body that finishes the call once its status is known.
    ///
    /// A body dropped before that point was abandoned by the client and is
    /// logged as `Cancelled`.
    pub struct LoggingBody<B> {
        #[pin]
        inner: B,
        head_code: Option<Code>,
        call: Option<CallRecord>,
    }

    impl<B> PinnedDrop for LoggingBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(call) = this.call.take() {
                call.finish(this.head_code.unwrap_or(Code::Cancelled));
            }
        }
    }
}

impl<B> HttpBody for LoggingBody<B>
where
    B: HttpBody<Data = Bytes>,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        let frame = ready!(this.inner.as_mut().poll_frame(cx));

        let code = match &frame {
            Some(Ok(frame)) => match frame.trailers_ref() {
                Some(trailers) => Some(
                    Status::from_header_map(trailers).map_or(Code::Ok, |status| status.code()),
                ),
                None if this.inner.is_end_stream() => Some(this.head_code.unwrap_or(Code::Ok)),
                None => None,
            },
            Some(Err(err)) => {
                tracing::error!(error = %err, "response body failed");
                Some(Code::Internal)
            }
            None => Some(this.head_code.unwrap_or(Code::Ok)),
        };
        if let Some(code) = code {
            if let Some(call) = this.call.take() {
                call.finish(code);
            }
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;
    use std::{
        convert::Infallible,
        pin::pin,
        sync::{Arc, Mutex},
    };
    use tower::{ServiceExt, service_fn};
    use tracing::{Subscriber, field::Visit};
    use tracing_subscriber::{Layer, layer::Context as LayerContext, prelude::*};

    #[test]
    fn ok_is_debug_everything_else_is_error() {
        assert_eq!(code_to_level(Code::Ok), Level::DEBUG);
        for code in [
            Code::Cancelled,
            Code::Unknown,
            Code::InvalidArgument,
            Code::DeadlineExceeded,
            Code::NotFound,
            Code::AlreadyExists,
            Code::PermissionDenied,
            Code::ResourceExhausted,
            Code::FailedPrecondition,
            Code::Aborted,
            Code::OutOfRange,
            Code::Unimplemented,
            Code::Internal,
            Code::Unavailable,
            Code::DataLoss,
            Code::Unauthenticated,
        ] {
            assert_eq!(code_to_level(code), Level::ERROR, "{code:?}");
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<(Level, String)>>>);

    impl Captured {
        fn events(&self) -> Vec<(Level, String)> {
            self.0.lock().unwrap().clone()
        }
    }

    struct CodeVisitor(String);

    impl Visit for CodeVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            if field.name() == "grpc.code" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: Subscriber> Layer<S> for Captured {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
            let mut visitor = CodeVisitor(String::new());
            event.record(&mut visitor);
            if !visitor.0.is_empty() {
                self.0
                    .lock()
                    .unwrap()
                    .push((*event.metadata().level(), visitor.0));
            }
        }
    }

    /// A streamed response: one message, then the given trailers.
    struct Streamed {
        message: Option<Bytes>,
        trailers: Option<HeaderMap>,
    }

    impl HttpBody for Streamed {
        type Data = Bytes;
        type Error = Status;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
            if let Some(message) = self.message.take() {
                return Poll::Ready(Some(Ok(Frame::data(message))));
            }
            Poll::Ready(self.trailers.take().map(|t| Ok(Frame::trailers(t))))
        }

        fn is_end_stream(&self) -> bool {
            self.message.is_none() && self.trailers.is_none()
        }
    }

    fn trailers(status: Status) -> HeaderMap {
        let mut trailers = HeaderMap::new();
        status.add_header(&mut trailers).unwrap();
        trailers
    }

    fn request() -> http::Request<()> {
        http::Request::builder()
            .uri("http://localhost/pkg.Svc/Call")
            .body(())
            .unwrap()
    }

    async fn drain(body: Body) {
        let mut body = pin!(body);
        while let Some(frame) = std::future::poll_fn(|cx| body.as_mut().poll_frame(cx)).await {
            frame.unwrap();
        }
    }

    async fn unary(status: Option<Status>) -> Vec<(Level, String)> {
        let captured = Captured::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(captured.clone()));

        let svc = RequestLogging::new(service_fn(move |_req: http::Request<()>| {
            let status = status.clone();
            async move {
                let mut response = http::Response::new(Body::empty());
                if let Some(status) = status {
                    status.add_header(response.headers_mut()).unwrap();
                }
                Ok::<_, Infallible>(response)
            }
        }));
        let response = svc.oneshot(request()).await.unwrap();
        drain(response.into_body()).await;

        captured.events()
    }

    async fn streamed(trailers: HeaderMap, consume: bool) -> Vec<(Level, String)> {
        let captured = Captured::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(captured.clone()));

        let svc = RequestLogging::new(service_fn(move |_req: http::Request<()>| {
            let body = Streamed {
                message: Some(Bytes::from_static(b"frame")),
                trailers: Some(trailers.clone()),
            };
            async move { Ok::<_, Infallible>(http::Response::new(body)) }
        }));
        let response = svc.oneshot(request()).await.unwrap();
        assert!(captured.events().is_empty(), "logged before the stream ended");

        if consume {
            drain(response.into_body()).await;
        } else {
            drop(response);
        }
        captured.events()
    }

    #[tokio::test]
    async fn success_is_logged_at_debug() {
        let events = unary(None).await;
        assert_eq!(events, vec![(Level::DEBUG, "Ok".to_owned())]);
    }

    #[tokio::test]
    async fn trailers_only_failure_is_logged_at_error() {
        let events = unary(Some(Status::not_found("missing"))).await;
        assert_eq!(events, vec![(Level::ERROR, "NotFound".to_owned())]);
    }

    #[tokio::test]
    async fn stream_failing_in_trailers_is_logged_at_error() {
        let events = streamed(trailers(Status::internal("stream broke")), true).await;
        assert_eq!(events, vec![(Level::ERROR, "Internal".to_owned())]);
    }

    #[tokio::test]
    async fn stream_ending_ok_is_logged_at_debug() {
        let events = streamed(trailers(Status::new(Code::Ok, "")), true).await;
        assert_eq!(events, vec![(Level::DEBUG, "Ok".to_owned())]);
    }

    #[tokio::test]
    async fn abandoned_stream_is_cancelled() {
        let events = streamed(trailers(Status::new(Code::Ok, "")), false).await;
        assert_eq!(events, vec![(Level::ERROR, "Cancelled".to_owned())]);
    }
}
