//! Tests for `src/logging.rs`.

use trustgate::logging::{LoggingGuard, LOG_FILE_PREFIX};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    // Only one global subscriber per process; the directory is created first
    // either way.
    let _result = trustgate::logging::init_production(&logs_dir);
    assert!(logs_dir.exists(), "logs directory should be created");
    assert!(LOG_FILE_PREFIX.starts_with("trustgate"));
}

#[test]
fn init_cli_is_idempotent() {
    trustgate::logging::init_cli();
    trustgate::logging::init_cli();
}
