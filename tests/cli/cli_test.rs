//! CLI contract tests against a throwaway database.

use assert_cmd::Command;
use tempfile::TempDir;

const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

fn trustgate(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("trustgate").expect("binary should build");
    cmd.current_dir(dir.path())
        .env_clear()
        .env("TRUSTGATE_CONFIG_PATH", dir.path().join("absent.toml"))
        .env("TRUSTGATE_DB_PATH", dir.path().join("trustgate.db"))
        .env("TRUSTGATE_LOGS_DIR", dir.path().join("logs"))
        .env("TRUSTGATE_SIGNING_KEY", KEY_HEX);
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("stdout should be utf-8")
}

#[test]
fn verify_chain_on_empty_database_is_valid() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let out = stdout_of(trustgate(&dir).arg("verify-chain"));
    let report: serde_json::Value = serde_json::from_str(&out).expect("json output");
    assert_eq!(report["valid"], true);
    assert_eq!(report["receipts_checked"], 0);
    assert!(dir.path().join("trustgate.db").exists());
}

#[test]
fn empty_hitl_queue_lists_nothing() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let out = stdout_of(trustgate(&dir).args(["hitl", "list"]));
    let pending: serde_json::Value = serde_json::from_str(&out).expect("json output");
    assert_eq!(pending, serde_json::json!([]));

    let out = stdout_of(trustgate(&dir).args(["hitl", "expire"]));
    let expired: serde_json::Value = serde_json::from_str(&out).expect("json output");
    assert_eq!(expired["expired"], 0);
}

#[test]
fn unknown_agent_reports_default_trust() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let out = stdout_of(trustgate(&dir).args(["trust", "newcomer"]));
    let view: serde_json::Value = serde_json::from_str(&out).expect("json output");
    assert_eq!(view["current"]["escalation_level"], "normal");
    assert_eq!(view["history"], serde_json::json!([]));
}

#[test]
fn missing_signing_key_is_fatal() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    trustgate(&dir)
        .env_remove("TRUSTGATE_SIGNING_KEY")
        .arg("verify-chain")
        .assert()
        .failure();
}

#[test]
fn resolving_an_unknown_request_fails() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    trustgate(&dir)
        .args(["hitl", "resolve", "nope1234", "--approve", "--reviewer", "alice"])
        .assert()
        .failure();
}

#[test]
fn resolve_needs_a_verdict() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    trustgate(&dir)
        .args(["hitl", "resolve", "nope1234", "--reviewer", "alice"])
        .assert()
        .failure();
}
