//! Integration tests for logging system

use async_trait::async_trait;
use bridge_traits::error::Result as SinkResult;
use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
use core_runtime::logging::{
    init_logging, redact_bearer, redact_if_sensitive, LogFormat, LoggingConfig,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct CapturingSink {
    entries: Mutex<Vec<LogEntry>>,
}

#[async_trait]
impl LoggerSink for CapturingSink {
    async fn log(&self, entry: LogEntry) -> SinkResult<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    fn min_level(&self) -> LogLevel {
        LogLevel::Debug
    }
}

// The global subscriber can only be installed once per process, so every
// assertion on the installed pipeline lives in this one test.
#[test]
fn test_global_logging_mirrors_redacted_events_to_sink() {
    let sink = Arc::new(CapturingSink::default());
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug)
        .with_logger_sink(sink.clone());

    init_logging(config).unwrap();

    tracing::debug!(target: "core_auth::token_store", refresh_token = "eyJ.r.s", "persisted tokens");
    tracing::trace!(target: "core_auth::token_store", "below sink level");
    tracing::info!(target: "hyper::client", "filtered dependency noise");

    let entries = sink.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "persisted tokens");
    assert_eq!(
        entries[0].fields.get("refresh_token"),
        Some(&"[REDACTED]".to_string())
    );
    drop(entries);

    let second = init_logging(LoggingConfig::default());
    assert!(second.is_err());
}

#[test]
fn test_redaction_of_credentials() {
    assert_eq!(redact_if_sensitive("access_token", "eyJ.a.b"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("Authorization", "Bearer x"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("password", "my_password"), "[REDACTED]");
    assert_eq!(redact_bearer("Bearer eyJ.a.b"), "Bearer [REDACTED]");
}

#[test]
fn test_redaction_of_emails() {
    let redacted = redact_if_sensitive("email", "student@uni.example.edu");

    assert!(redacted.starts_with('s'));
    assert!(redacted.contains("[REDACTED]"));
    assert!(!redacted.contains("example.edu"));
}

#[test]
fn test_normal_values_pass_through() {
    assert_eq!(redact_if_sensitive("report_id", "12345"), "12345");
    assert_eq!(redact_if_sensitive("phase", "Authenticated"), "Authenticated");
    assert_eq!(redact_if_sensitive("user_id", "user_123"), "user_123");
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_secret_redaction(false)
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.level, LogLevel::Warn);
    assert!(!config.redact_secrets);
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
}
