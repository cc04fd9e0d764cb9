//! Error reporting for services that ship their failures to
//! [Sentry](https://sentry.io/) while staying fully functional without it.
//!
//! The entry point is the [`Reporter`]: a handle constructed once at
//! process startup and passed to every component that needs it.  When a DSN
//! is configured it wraps a Sentry client; when it is not, or when the DSN
//! cannot be parsed, the reporter degrades to plain local logging instead
//! of failing.  The operating mode is fixed at construction time.
//!
//! Errors are handed over as [`Report`] values, which carry structured
//! extras, tags and a backtrace recorded at the point of construction.
//! Each capture runs in its own isolated scope, so context attached for one
//! error never leaks into another concurrent submission.
//!
//! # Quickstart
//!
//! ```
//! use faultline::{Disposition, Report, Reporter};
//!
//! fn sync_ledger(reporter: &Reporter) -> Result<(), faultline::Abort> {
//!     if let Err(err) = std::fs::read_to_string("ledger.json") {
//!         // Log and report, then abort this unit of work only.
//!         reporter.capture(Some(Report::from_error(err)), Disposition::Abort)?;
//!     }
//!     Ok(())
//! }
//!
//! // Reads SENTRY_DSN, ENVIRONMENT and SENTRY_RELEASE; a missing DSN
//! // yields a disabled reporter rather than an error.
//! let reporter = Reporter::from_env();
//! let _ = sync_ledger(&reporter);
//! ```
//!
//! # HTTP services
//!
//! The `faultline-tower` crate wraps request handlers so that aborts
//! propagating out of a handler are captured per request and converted into
//! error responses at the serving boundary.
//!
//! # Suppressed reports
//!
//! A report whose extras carry [`SUPPRESS_CAPTURE_EXTRA`] with the value
//! `true` is intentionally kept away from the remote service; see the
//! constant's documentation.

#![warn(missing_docs)]
#![deny(unsafe_code)]

mod report;
mod reporter;

pub use crate::report::{Report, SUPPRESS_CAPTURE_EXTRA};
pub use crate::reporter::{Abort, Disposition, Reporter};

// Re-exported so callers can build client options and extra values without
// naming the SDK themselves.
pub use sentry::protocol;
pub use sentry::{ClientOptions, IntoDsn};
