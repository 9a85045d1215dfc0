use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use phonehome_client::Spool;
use phonehome_core::props::keys;
use phonehome_core::{MessageKind, PropertyStore};
use phonehome_transport::testing::registered_store;

fn phonehome_cmd(config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("phonehome"));
    cmd.arg("-c").arg(config).env_remove("RUST_LOG");
    cmd
}

/// Writes a property file under `dir`; registered stores carry test keys.
fn write_config(dir: &Path, registered: bool) -> PathBuf {
    let path = dir.join("phonehome.yaml");
    let mut store = PropertyStore::open_file(&path).expect("open config");
    if registered {
        for (name, value) in registered_store("https://transport.example").iter() {
            store.set(name, value);
        }
    } else {
        store.set(keys::SYSTEM_ID, "SN1");
        store.set(keys::ASSET_ID, "asset-1");
        store.set(keys::KEYLEN, "512");
    }
    store.set(keys::DATA_DIR, dir.join("data").to_string_lossy());
    store.save().expect("save config");
    path
}

fn write_event(dir: &Path, uuid: &str) -> PathBuf {
    let path = dir.join("event.json");
    let event = serde_json::json!({
        "uuid": uuid,
        "code": "SUN4V-8001-8H",
        "summary": "CPU strand faulted",
    });
    fs::write(&path, event.to_string()).expect("write event");
    path
}

#[test]
fn dry_run_prints_message_without_registration() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), false);

    phonehome_cmd(&config)
        .args(["send", "heartbeat", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("<heartbeat>").and(contains("SN1")));
}

#[test]
fn send_requires_registration() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), false);

    phonehome_cmd(&config)
        .args(["send", "heartbeat"])
        .assert()
        .code(2)
        .stderr(contains("phonehome: cannot send").and(contains("not registered")));
}

#[test]
fn fault_without_event_is_a_configuration_error() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), true);

    phonehome_cmd(&config)
        .args(["send", "fault", "--dry-run"])
        .assert()
        .code(2)
        .stderr(contains("requires an event"));
}

#[test]
fn unknown_kind_is_rejected_by_argument_parsing() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), false);

    phonehome_cmd(&config)
        .args(["send", "bogus"])
        .assert()
        .failure()
        .stderr(contains("unknown message kind"));
}

#[test]
fn malformed_property_file_exits_2() {
    let tmp = TempDir::new().expect("tmp");
    let config = tmp.path().join("phonehome.yaml");
    fs::write(&config, "- not\n- a mapping\n").expect("write config");

    phonehome_cmd(&config)
        .arg("status")
        .assert()
        .code(2)
        .stderr(contains("phonehome: failed to open"));
}

#[test]
fn unregister_without_registration_is_a_no_op() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), false);

    phonehome_cmd(&config)
        .arg("unregister")
        .assert()
        .success()
        .stdout(contains("not registered"));
}

#[test]
fn status_json_reports_registration() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), true);

    let output = phonehome_cmd(&config)
        .args(["status", "--json"])
        .output()
        .expect("run status");
    assert!(output.status.success());

    let status: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(status["registered"], serde_json::json!(true));
    assert_eq!(status["client_id"], serde_json::json!("client-1"));
    assert_eq!(status["transport"], serde_json::json!("dts"));
    assert_eq!(status["pending"], serde_json::json!(0));
    assert_eq!(
        status["key_fingerprint"].as_str().map(str::len),
        Some(64),
        "sha256 hex fingerprint"
    );
}

#[test]
fn list_shows_spooled_messages() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), true);
    let spool = Spool::new(tmp.path().join("data").join("messages"));
    let id = spool
        .persist(MessageKind::Fault, b"<fault/>")
        .expect("persist");

    phonehome_cmd(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(contains(id.as_str()).and(contains("awaiting redelivery")));

    let output = phonehome_cmd(&config)
        .args(["list", "--json"])
        .output()
        .expect("run list");
    let listing: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(listing["pending"][0]["id"], serde_json::json!(id));
    assert_eq!(listing["pending"][0]["kind"], serde_json::json!("fault"));
    assert_eq!(listing["pending"][0]["bytes"], serde_json::json!(8));
}

#[test]
fn queued_fault_lands_in_the_daemon_inbox() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), true);
    let event = write_event(tmp.path(), "0d9e6f1a-77aa-4c0e-9b0e-5d3c2a1b4f60");

    phonehome_cmd(&config)
        .args(["send", "fault", "--queue", "--event"])
        .arg(&event)
        .assert()
        .success()
        .stdout(contains("queued fault"));

    let queued = tmp
        .path()
        .join("data")
        .join("events")
        .join("0d9e6f1a-77aa-4c0e-9b0e-5d3c2a1b4f60.json");
    assert!(queued.is_file(), "missing {}", queued.display());
}

#[test]
fn register_against_unreachable_server_fails_with_diagnostic() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), false);

    phonehome_cmd(&config)
        .args(["register", "-u", "ops", "-p", "secret", "--url", "http://127.0.0.1:1"])
        .assert()
        .code(1)
        .stderr(contains("phonehome: registration failed").and(contains("secret").not()));

    let saved = PropertyStore::open_file(&config).expect("reopen");
    assert!(!saved.is_registered());
    assert_eq!(saved.get(keys::DEST_URL), Some("http://127.0.0.1:1"));
}

#[test]
fn single_daemon_cycle_reports_unregistered_host() {
    let tmp = TempDir::new().expect("tmp");
    let config = write_config(tmp.path(), false);

    let output = phonehome_cmd(&config)
        .args(["daemon", "--once", "--json"])
        .output()
        .expect("run daemon");
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["registered"], serde_json::json!(false));
    assert_eq!(report["reloaded"], serde_json::json!(true));
}
