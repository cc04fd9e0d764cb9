use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use backtrace::Backtrace;
use sentry::protocol::{Map, Value};

/// Reserved extra key that marks a report as an internally generated
/// condition which must not be forwarded to the remote service.
///
/// A report whose extras contain this key with the boolean value `true` is
/// skipped by the remote capture path entirely.
pub const SUPPRESS_CAPTURE_EXTRA: &str = "custom_service";

/// An error value enriched with structured context for crash reporting.
///
/// A `Report` carries a message, an optional source error, arbitrary
/// structured extras, string tags and a backtrace recorded at the point of
/// construction.  It implements [`std::error::Error`], so the source chain
/// is rendered as a chain of exceptions on the remote service.
///
/// # Examples
///
/// ```
/// use faultline::Report;
///
/// let report = Report::new("payment provider unreachable")
///     .with_tag("subsystem", "billing")
///     .with_extra("attempt", 3);
/// assert_eq!(report.to_string(), "payment provider unreachable");
/// ```
#[derive(Debug)]
pub struct Report {
    message: String,
    source: Option<Box<dyn Error + Send + Sync>>,
    extras: Map<String, Value>,
    tags: BTreeMap<String, String>,
    backtrace: Backtrace,
}

impl Report {
    /// Creates a report from a message, recording the current backtrace.
    pub fn new<M: Into<String>>(message: M) -> Report {
        Report {
            message: message.into(),
            source: None,
            extras: Map::new(),
            tags: BTreeMap::new(),
            backtrace: Backtrace::new(),
        }
    }

    /// Creates a report wrapping an arbitrary error as its source.
    ///
    /// The report's message is the error's `Display` rendition; the error
    /// itself stays reachable through [`std::error::Error::source`].
    pub fn from_error<E>(error: E) -> Report
    where
        E: Error + Send + Sync + 'static,
    {
        let mut report = Report::new(error.to_string());
        report.source = Some(Box::new(error));
        report
    }

    /// Attaches a structured extra under the given key.
    pub fn with_extra<K, V>(mut self, key: K, value: V) -> Report
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Attaches a string tag under the given key.
    pub fn with_tag<K, V>(mut self, key: K, value: V) -> Report
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// The structured extras attached to this report.
    pub fn extras(&self) -> &Map<String, Value> {
        &self.extras
    }

    /// The tags attached to this report.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// The backtrace recorded when the report was created.
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Whether the [`SUPPRESS_CAPTURE_EXTRA`] extra flags this report as
    /// suppressed from remote capture.
    pub fn suppresses_remote_capture(&self) -> bool {
        matches!(
            self.extras.get(SUPPRESS_CAPTURE_EXTRA),
            Some(Value::Bool(true))
        )
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for Report {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_deref()
            .map(|source| source as &(dyn Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let report = Report::from_error(io);
        assert_eq!(report.to_string(), "disk on fire");
        assert_eq!(report.source().unwrap().to_string(), "disk on fire");
    }

    #[test]
    fn test_suppression_flag() {
        let plain = Report::new("plain");
        assert!(!plain.suppresses_remote_capture());

        let marked = Report::new("marked").with_extra(SUPPRESS_CAPTURE_EXTRA, true);
        assert!(marked.suppresses_remote_capture());

        // Anything but boolean `true` leaves the report reportable.
        let off = Report::new("off").with_extra(SUPPRESS_CAPTURE_EXTRA, false);
        assert!(!off.suppresses_remote_capture());
        let stringly = Report::new("stringly").with_extra(SUPPRESS_CAPTURE_EXTRA, "true");
        assert!(!stringly.suppresses_remote_capture());
    }
}
