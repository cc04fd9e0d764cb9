use std::borrow::Cow;
use std::env;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use sentry::types::Uuid;
use sentry::{Client, ClientOptions, Hub, IntoDsn};

use crate::report::Report;

/// What happens to the current control flow after a report was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handle the report, then carry on.
    Continue,
    /// Handle the report, then hand it back as an [`Abort`] for the caller
    /// to propagate.
    Abort,
}

/// A handled error propagating up a single request's call stack.
///
/// `Abort` is returned from [`Reporter::capture`] when the caller asked for
/// [`Disposition::Abort`].  It travels through `Result` like any other
/// error; an outer boundary such as `faultline-tower`'s `RecoveryLayer`
/// turns it into an error response so that unrelated requests keep being
/// served.
#[derive(Debug)]
pub struct Abort {
    report: Report,
    event_id: Option<Uuid>,
    recorded: bool,
}

impl Abort {
    /// Wraps a report that has not been handed to a [`Reporter`] yet.
    pub fn new(report: Report) -> Abort {
        Abort {
            report,
            event_id: None,
            recorded: false,
        }
    }

    fn recorded(report: Report, event_id: Option<Uuid>) -> Abort {
        Abort {
            report,
            event_id,
            recorded: true,
        }
    }

    /// The report this abort carries.
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// The remote event identifier, if the report was submitted.
    pub fn event_id(&self) -> Option<Uuid> {
        self.event_id
    }

    /// Whether the report has already been logged and (when applicable)
    /// submitted.
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    /// Unwraps the abort back into its report.
    pub fn into_report(self) -> Report {
        self.report
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.report, f)
    }
}

impl Error for Abort {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.report)
    }
}

impl From<Report> for Abort {
    fn from(report: Report) -> Abort {
        Abort::new(report)
    }
}

/// Handle to the crash-reporting pipeline.
///
/// A reporter is constructed once at startup and passed to whichever
/// components need it.  Cloning is cheap; all clones share the same
/// underlying client.  The operating mode is fixed at construction: either
/// a remote client is attached, or the reporter is disabled and every
/// capture degrades to local logging.
///
/// # Examples
///
/// ```
/// use faultline::{Disposition, Report, Reporter};
///
/// fn run(reporter: &Reporter) -> Result<(), faultline::Abort> {
///     let report = Report::new("ledger out of sync").with_tag("subsystem", "billing");
///     // Report the error, then unwind this request only.
///     reporter.capture(Some(report), Disposition::Abort)?;
///     unreachable!("an abort disposition always propagates");
/// }
///
/// let reporter = Reporter::disabled();
/// assert!(run(&reporter).is_err());
/// ```
#[derive(Clone)]
pub struct Reporter {
    mode: Mode,
}

#[derive(Clone)]
enum Mode {
    Enabled(Arc<Client>),
    Disabled,
}

impl Reporter {
    /// Builds a reporter from the process environment.
    ///
    /// `SENTRY_DSN` selects the remote endpoint; `ENVIRONMENT` and
    /// `SENTRY_RELEASE` are attached to every submitted event.  A missing,
    /// empty or malformed DSN logs a warning and yields a disabled
    /// reporter; it is never a fatal error.
    pub fn from_env() -> Reporter {
        let raw = env::var("SENTRY_DSN").unwrap_or_default();
        let dsn = match raw.as_str().into_dsn() {
            Ok(Some(dsn)) => dsn,
            Ok(None) => {
                log::warn!("crash reporting disabled: SENTRY_DSN is not set");
                return Reporter::disabled();
            }
            Err(err) => {
                log::warn!("crash reporting disabled: invalid SENTRY_DSN `{raw}`: {err}");
                return Reporter::disabled();
            }
        };
        Reporter::new(ClientOptions {
            dsn: Some(dsn),
            environment: env::var("ENVIRONMENT").ok().map(Cow::from),
            release: env::var("SENTRY_RELEASE").ok().map(Cow::from),
            ..Default::default()
        })
    }

    /// Builds a reporter from explicit client options and binds the client
    /// to the current hub.
    ///
    /// This is the seam for dependency injection and for tests, which pass
    /// options carrying a test transport.  Options not set explicitly are
    /// filled in by [`sentry::apply_defaults`], which installs the default
    /// transport and integrations.
    pub fn new(options: ClientOptions) -> Reporter {
        let client = Arc::new(Client::from(sentry::apply_defaults(options)));
        if client.is_enabled() {
            Hub::with(|hub| hub.bind_client(Some(client.clone())));
            Reporter {
                mode: Mode::Enabled(client),
            }
        } else {
            log::warn!("crash reporting disabled: client could not be enabled");
            Reporter::disabled()
        }
    }

    /// A reporter that never talks to the remote service.
    pub fn disabled() -> Reporter {
        Reporter {
            mode: Mode::Disabled,
        }
    }

    /// Whether a remote client is attached.
    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, Mode::Enabled(_))
    }

    /// Handles an error by logging it locally and, when enabled, capturing
    /// it on the remote service inside an isolated scope.
    ///
    /// `None` is a no-op.  With [`Disposition::Abort`] the report is handed
    /// back wrapped in an [`Abort`] for the caller to propagate with `?`;
    /// with [`Disposition::Continue`] the call always returns `Ok`.
    ///
    /// Submission is fire-and-forget: the call returns once the scope is
    /// configured and the event is queued on the SDK transport.
    pub fn capture(&self, report: Option<Report>, disposition: Disposition) -> Result<(), Abort> {
        let Some(report) = report else {
            return Ok(());
        };
        let event_id = self.record(&report);
        match disposition {
            Disposition::Continue => Ok(()),
            Disposition::Abort => Err(Abort::recorded(report, event_id)),
        }
    }

    /// Records an abort that surfaced without passing through
    /// [`capture`](Reporter::capture), e.g. one bubbling out of a request
    /// handler.  Recording happens at most once per abort.
    pub fn record_abort(&self, abort: &mut Abort) {
        if !abort.recorded {
            abort.event_id = self.record(&abort.report);
            abort.recorded = true;
        }
    }

    fn record(&self, report: &Report) -> Option<Uuid> {
        match &self.mode {
            Mode::Disabled => {
                // No remote identifier to correlate with; log as-is.
                log::error!("{report}");
                None
            }
            Mode::Enabled(_) => {
                if report.suppresses_remote_capture() {
                    return None;
                }
                let event_id = sentry::with_scope(
                    |scope| {
                        for (key, value) in report.extras() {
                            scope.set_extra(key, value.clone());
                        }
                        scope.set_extra("stacktrace", format!("{:?}", report.backtrace()).into());
                        for (key, value) in report.tags() {
                            scope.set_tag(key, value);
                        }
                    },
                    || sentry::capture_error(report),
                );
                // The SDK reports a nil UUID when no client was reachable
                // on the current hub.
                if event_id == Uuid::nil() {
                    log::error!("{report}");
                    None
                } else {
                    log::error!("{report} (captured with event ID {event_id})");
                    Some(event_id)
                }
            }
        }
    }
}
