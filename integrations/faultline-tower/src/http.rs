use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use faultline::{Abort, Reporter};
use http::{Request, Response, StatusCode};
use pin_project::pin_project;
use sentry_core::{protocol, Hub, SentryFutureExt};
use tower_layer::Layer;
use tower_service::Service;

use crate::{CaptureFuture, ReportFuture};

/// Response header carrying the remote event identifier of the abort a
/// recovered response stands in for.
pub const EVENT_ID_HEADER: &str = "x-crash-report-id";

/// HTTP-aware variant of [`crate::ReportLayer`].
///
/// In addition to the hub-per-request and abort-recording contract, the
/// created service attaches the request's method, URL and headers to every
/// event captured while it is handled.  With the `axum-matched-path`
/// feature enabled, events are also tagged with the route template the
/// router matched.
#[derive(Clone)]
pub struct ReportHttpLayer {
    reporter: Reporter,
}

impl ReportHttpLayer {
    /// Builds a layer reporting through the given reporter.
    pub fn new(reporter: &Reporter) -> ReportHttpLayer {
        ReportHttpLayer {
            reporter: reporter.clone(),
        }
    }
}

impl<S> Layer<S> for ReportHttpLayer {
    type Service = ReportHttpService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ReportHttpService {
            service,
            reporter: self.reporter.clone(),
        }
    }
}

/// Tower service created by [`ReportHttpLayer`].
#[derive(Clone)]
pub struct ReportHttpService<S> {
    service: S,
    reporter: Reporter,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ReportHttpService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>, Error = Abort>,
{
    type Response = S::Response;
    type Error = Abort;
    type Future = ReportFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        if !self.reporter.is_enabled() {
            return ReportFuture::Direct(self.service.call(request));
        }

        #[allow(clippy::redundant_closure)]
        let hub = Arc::new(Hub::with(|hub| Hub::new_from_top(hub)));

        let sentry_request = protocol::Request {
            method: Some(request.method().to_string()),
            url: request.uri().to_string().parse().ok(),
            headers: request
                .headers()
                .iter()
                .map(|(header, value)| {
                    (
                        header.to_string(),
                        value.to_str().unwrap_or_default().into(),
                    )
                })
                .collect(),
            ..Default::default()
        };
        #[cfg(feature = "axum-matched-path")]
        let route = request
            .extensions()
            .get::<axum::extract::MatchedPath>()
            .map(|path| path.as_str().to_owned());

        hub.configure_scope(|scope| {
            scope.add_event_processor(move |mut event| {
                if event.request.is_none() {
                    event.request = Some(sentry_request.clone());
                }
                Some(event)
            });
            #[cfg(feature = "axum-matched-path")]
            if let Some(route) = route {
                scope.set_tag("route", route);
            }
        });

        let future = Hub::run(hub.clone(), || self.service.call(request));
        ReportFuture::Instrumented(CaptureFuture::new(self.reporter.clone(), future).bind_hub(hub))
    }
}

/// Tower layer that answers aborts with an error response.
///
/// This is the recovery boundary of the middleware chain: it sits outside
/// the reporting layers and turns a propagated [`Abort`] into a
/// `500 Internal Server Error`, so a failed request never takes down its
/// connection or any other request being served.  The remote event
/// identifier, when one was assigned, is exposed in the
/// [`EVENT_ID_HEADER`] response header.
#[derive(Clone, Copy, Debug, Default)]
pub struct RecoveryLayer;

impl RecoveryLayer {
    /// Builds the recovery layer.
    pub fn new() -> RecoveryLayer {
        RecoveryLayer
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = RecoveryService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RecoveryService {
            service,
            poll_failure: None,
        }
    }
}

/// Tower service created by [`RecoveryLayer`].
pub struct RecoveryService<S> {
    service: S,
    poll_failure: Option<Abort>,
}

impl<S: Clone> Clone for RecoveryService<S> {
    fn clone(&self) -> RecoveryService<S> {
        // A pending readiness failure belongs to the original instance.
        RecoveryService {
            service: self.service.clone(),
            poll_failure: None,
        }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RecoveryService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>, Error = Abort>,
    ResBody: Default,
{
    type Response = Response<ResBody>;
    type Error = Infallible;
    type Future = RecoveryFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.poll_failure.is_some() {
            return Poll::Ready(Ok(()));
        }
        match self.service.poll_ready(cx) {
            Poll::Ready(Err(abort)) => {
                self.poll_failure = Some(abort);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        if let Some(abort) = self.poll_failure.take() {
            return RecoveryFuture::Failed(Some(abort));
        }
        RecoveryFuture::Inner(self.service.call(request))
    }
}

/// The future returned by [`RecoveryService`].
#[pin_project(project = RecoveryFutureProj)]
pub enum RecoveryFuture<F> {
    /// Waiting on the inner service.
    Inner(#[pin] F),
    /// The inner service failed its readiness check.
    Failed(Option<Abort>),
}

impl<F, ResBody> Future for RecoveryFuture<F>
where
    F: Future<Output = Result<Response<ResBody>, Abort>>,
    ResBody: Default,
{
    type Output = Result<Response<ResBody>, Infallible>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            RecoveryFutureProj::Inner(future) => match future.poll(cx) {
                Poll::Ready(Ok(response)) => Poll::Ready(Ok(response)),
                Poll::Ready(Err(abort)) => Poll::Ready(Ok(abort_response(&abort))),
                Poll::Pending => Poll::Pending,
            },
            RecoveryFutureProj::Failed(abort) => {
                let abort = abort
                    .take()
                    .expect("recovery future polled after completion");
                Poll::Ready(Ok(abort_response(&abort)))
            }
        }
    }
}

fn abort_response<ResBody: Default>(abort: &Abort) -> Response<ResBody> {
    if !abort.is_recorded() {
        // The abort never went through a reporter; at least leave a local
        // trace before answering the client.
        log::error!("{abort}");
    }
    let mut response = Response::new(ResBody::default());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    if let Some(event_id) = abort.event_id() {
        if let Ok(value) = event_id.to_string().parse() {
            response.headers_mut().insert(EVENT_ID_HEADER, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    use faultline::Report;

    #[test]
    fn test_abort_response_without_event_id_has_no_header() {
        let reporter = Reporter::disabled();
        let abort = reporter
            .capture(Some(Report::new("boom")), faultline::Disposition::Abort)
            .unwrap_err();

        let response: Response<()> = abort_response(&abort);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // A disabled reporter assigns no event identifier.
        assert!(response.headers().get(EVENT_ID_HEADER).is_none());
    }
}
