use std::sync::{Arc, Mutex};
use std::thread;

use faultline::{Abort, Disposition, Report, Reporter, SUPPRESS_CAPTURE_EXTRA};
use sentry::protocol::Value;
use sentry::test::{with_captured_events, TestTransport};
use sentry::types::Uuid;
use sentry::{ClientOptions, Hub};

struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl log::Log for MemoryLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        self.lines.lock().unwrap().push(record.args().to_string());
    }

    fn flush(&self) {}
}

static LOGGER: MemoryLogger = MemoryLogger {
    lines: Mutex::new(Vec::new()),
};

// The process-wide logger is shared by every test in this binary, so each
// test greps for its own unique marker instead of asserting on the full log.
fn init_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}

fn logged_lines() -> Vec<String> {
    LOGGER.lines.lock().unwrap().clone()
}

fn enabled_reporter() -> (Reporter, Arc<TestTransport>) {
    let transport = TestTransport::new();
    let reporter = Reporter::new(ClientOptions {
        dsn: Some("https://public@sentry.invalid/1".parse().unwrap()),
        transport: Some(Arc::new(transport.clone())),
        ..Default::default()
    });
    assert!(reporter.is_enabled());
    (reporter, transport)
}

#[test]
fn test_nil_report_is_a_noop() {
    init_logger();
    let (reporter, transport) = enabled_reporter();

    assert!(reporter.capture(None, Disposition::Continue).is_ok());
    assert!(reporter.capture(None, Disposition::Abort).is_ok());

    assert!(transport.fetch_and_clear_events().is_empty());
}

#[test]
fn test_suppressed_report_skips_remote_capture() {
    init_logger();
    let (reporter, transport) = enabled_reporter();

    let report = Report::new("suppressed-probe-7c1").with_extra(SUPPRESS_CAPTURE_EXTRA, true);
    reporter
        .capture(Some(report), Disposition::Continue)
        .unwrap();

    assert!(transport.fetch_and_clear_events().is_empty());
    // The suppression branch does not even log locally.
    assert!(logged_lines()
        .iter()
        .all(|line| !line.contains("suppressed-probe-7c1")));
}

#[test]
fn test_capture_submits_extras_stacktrace_and_tags() {
    init_logger();
    let (reporter, transport) = enabled_reporter();

    let report = Report::new("db-down-probe-91f")
        .with_tag("subsystem", "db")
        .with_extra("attempt", 3);
    reporter
        .capture(Some(report), Disposition::Continue)
        .unwrap();

    let events = transport.fetch_and_clear_events();
    assert_eq!(events.len(), 1);
    let event = &events[0];

    assert_eq!(event.tags.get("subsystem").map(String::as_str), Some("db"));
    assert_eq!(event.extra.get("attempt"), Some(&Value::from(3)));
    assert!(matches!(
        event.extra.get("stacktrace"),
        Some(Value::String(trace)) if !trace.is_empty()
    ));
    assert_eq!(
        event.exception.iter().last().unwrap().value.as_deref(),
        Some("db-down-probe-91f")
    );

    // The local log line correlates with the remote event.
    assert!(logged_lines().iter().any(|line| {
        line.contains("db-down-probe-91f") && line.contains("captured with event ID")
    }));
}

#[test]
fn test_abort_disposition_propagates_to_the_call_site() {
    init_logger();
    let (reporter, transport) = enabled_reporter();

    fn failing(reporter: &Reporter) -> Result<(), Abort> {
        let report = Report::new("abort-probe-5dd").with_tag("subsystem", "billing");
        reporter.capture(Some(report), Disposition::Abort)?;
        unreachable!("an abort disposition always propagates");
    }

    let abort = match failing(&reporter) {
        Err(abort) => abort,
        Ok(()) => panic!("abort did not propagate"),
    };

    assert!(abort.is_recorded());
    assert_ne!(abort.event_id().unwrap(), Uuid::nil());
    assert_eq!(abort.report().to_string(), "abort-probe-5dd");
    // Reporting happened exactly once, before the abort was handed back.
    assert_eq!(transport.fetch_and_clear_events().len(), 1);
}

#[test]
fn test_missing_dsn_degrades_to_local_logging() {
    init_logger();
    std::env::remove_var("SENTRY_DSN");
    let reporter = Reporter::from_env();
    assert!(!reporter.is_enabled());

    let events = with_captured_events(|| {
        let report = Report::new("disabled-probe-3aa");
        reporter
            .capture(Some(report), Disposition::Continue)
            .unwrap();
    });

    // Nothing went remote, the error only hit the local log without an
    // event identifier.
    assert!(events.is_empty());
    let lines = logged_lines();
    assert!(lines.iter().any(|line| line == "disabled-probe-3aa"));
    assert!(lines
        .iter()
        .all(|line| !(line.contains("disabled-probe-3aa") && line.contains("event ID"))));
}

#[test]
fn test_invalid_dsn_degrades_to_disabled() {
    init_logger();
    std::env::set_var("SENTRY_DSN", "not-a-dsn");
    let reporter = Reporter::from_env();
    std::env::remove_var("SENTRY_DSN");
    assert!(!reporter.is_enabled());
}

#[test]
fn test_concurrent_captures_do_not_cross_contaminate() {
    init_logger();
    let (reporter, transport) = enabled_reporter();
    let base = Hub::current();

    let handles: Vec<_> = (0..8)
        .map(|index| {
            let reporter = reporter.clone();
            let hub = Arc::new(Hub::new_from_top(base.clone()));
            thread::spawn(move || {
                Hub::run(hub, || {
                    let report = Report::new(format!("worker {index}"))
                        .with_tag("worker", format!("w{index}"))
                        .with_extra(format!("slot-{index}"), index as i64);
                    reporter
                        .capture(Some(report), Disposition::Continue)
                        .unwrap();
                });
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let events = transport.fetch_and_clear_events();
    assert_eq!(events.len(), 8);
    for event in events {
        let message = event
            .exception
            .iter()
            .last()
            .unwrap()
            .value
            .clone()
            .unwrap();
        let index = message.rsplit(' ').next().unwrap().to_owned();

        // Exactly this call's tag, and exactly this call's extras.
        assert_eq!(event.tags.len(), 1);
        assert_eq!(
            event.tags.get("worker").map(String::as_str),
            Some(format!("w{index}").as_str())
        );
        assert_eq!(event.extra.len(), 2);
        assert_eq!(
            event.extra.get(&format!("slot-{index}")),
            Some(&Value::from(index.parse::<i64>().unwrap()))
        );
        assert!(event.extra.contains_key("stacktrace"));
    }
}
