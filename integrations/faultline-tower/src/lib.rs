//! Tower middleware that wires request handling into a `faultline`
//! [`Reporter`].
//!
//! [`ReportLayer`] gives every request its own isolated hub and records any
//! [`Abort`] flowing out of the wrapped service, so context attached while
//! handling one request never bleeds into a concurrent one.  When the
//! reporter is disabled the wrapped service runs untouched.
//!
//! # Examples
//!
//! Wrapping a service directly:
//!
//! ```rust
//! use faultline::{Abort, Reporter};
//! use faultline_tower::ReportService;
//!
//! let reporter = Reporter::from_env();
//! let service = ReportService::new(
//!     &reporter,
//!     tower::service_fn(|name: String| async move { Ok::<_, Abort>(format!("hello {name}")) }),
//! );
//! # let _ = service;
//! ```
//!
//! Composing a middleware chain for an HTTP server, with the recovery
//! boundary outermost so an aborted request is answered with an error
//! response instead of tearing anything else down:
//!
//! ```rust
//! # #[cfg(feature = "http")] {
//! use tower::ServiceBuilder;
//! use faultline::{Abort, Reporter};
//! use faultline_tower::{RecoveryLayer, ReportHttpLayer};
//!
//! let reporter = Reporter::from_env();
//! let service = ServiceBuilder::new()
//!     .layer(RecoveryLayer::new())
//!     .layer(ReportHttpLayer::new(&reporter))
//!     .service(tower::service_fn(|request: http::Request<String>| async move {
//!         let _ = request;
//!         Ok::<_, Abort>(http::Response::new(String::new()))
//!     }));
//! # let _ = service;
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use faultline::{Abort, Reporter};
use pin_project::pin_project;
use sentry_core::{Hub, SentryFuture, SentryFutureExt};
use tower_layer::Layer;
use tower_service::Service;

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "http")]
pub use crate::http::*;

/// Tower layer that binds an isolated hub to each request and records
/// aborts leaving the wrapped service.
#[derive(Clone)]
pub struct ReportLayer {
    reporter: Reporter,
}

impl ReportLayer {
    /// Builds a layer reporting through the given reporter.
    pub fn new(reporter: &Reporter) -> ReportLayer {
        ReportLayer {
            reporter: reporter.clone(),
        }
    }
}

impl<S> Layer<S> for ReportLayer {
    type Service = ReportService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ReportService {
            service,
            reporter: self.reporter.clone(),
        }
    }
}

/// Tower service created by [`ReportLayer`].
///
/// With an enabled reporter every call runs under a hub derived from the
/// current one, and an `Err` result is recorded (at most once) before being
/// forwarded.  With a disabled reporter the inner service is called
/// directly, without any instrumentation.
#[derive(Clone)]
pub struct ReportService<S> {
    service: S,
    reporter: Reporter,
}

impl<S> ReportService<S> {
    /// Wraps a service so that aborts leaving it are reported.
    pub fn new(reporter: &Reporter, service: S) -> ReportService<S> {
        ReportLayer::new(reporter).layer(service)
    }
}

impl<S, Request> Service<Request> for ReportService<S>
where
    S: Service<Request, Error = Abort>,
{
    type Response = S::Response;
    type Error = Abort;
    type Future = ReportFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        if !self.reporter.is_enabled() {
            return ReportFuture::Direct(self.service.call(request));
        }

        #[allow(clippy::redundant_closure)]
        let hub = Arc::new(Hub::with(|hub| Hub::new_from_top(hub)));
        let future = Hub::run(hub.clone(), || self.service.call(request));
        ReportFuture::Instrumented(CaptureFuture::new(self.reporter.clone(), future).bind_hub(hub))
    }
}

/// The future returned by [`ReportService`].
#[pin_project(project = ReportFutureProj)]
pub enum ReportFuture<F> {
    /// The request runs under its own hub with abort capture.
    Instrumented(#[pin] SentryFuture<CaptureFuture<F>>),
    /// The request passes through untouched.
    Direct(#[pin] F),
}

impl<F, T> Future for ReportFuture<F>
where
    F: Future<Output = Result<T, Abort>>,
{
    type Output = Result<T, Abort>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            ReportFutureProj::Instrumented(future) => future.poll(cx),
            ReportFutureProj::Direct(future) => future.poll(cx),
        }
    }
}

/// Future adapter that records aborts resolved by the wrapped future.
#[pin_project]
pub struct CaptureFuture<F> {
    reporter: Reporter,
    #[pin]
    future: F,
}

impl<F> CaptureFuture<F> {
    pub(crate) fn new(reporter: Reporter, future: F) -> CaptureFuture<F> {
        CaptureFuture { reporter, future }
    }
}

impl<F, T> Future for CaptureFuture<F>
where
    F: Future<Output = Result<T, Abort>>,
{
    type Output = Result<T, Abort>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.future.poll(cx) {
            Poll::Ready(Err(mut abort)) => {
                // The hub bound around this poll is the request's own, so
                // the submission cannot leak context across requests.
                this.reporter.record_abort(&mut abort);
                Poll::Ready(Err(abort))
            }
            poll => poll,
        }
    }
}
