//! End-to-end delivery policy: the queue-service protocol over a scripted
//! engine and a real spool directory.

use std::sync::Arc;
use std::time::SystemTime;

use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

use phonehome_client::{deliver, BuildOptions, Delivery, ResendOutcome, Session, Spool};
use phonehome_core::props::keys;
use phonehome_core::{FaultEvent, MessageKind, PhoneHomeError};
use phonehome_transport::testing::{registered_store, ScriptedEngine};
use phonehome_transport::{DtsProtocol, TransportClient};

const EVENT_UUID: &str = "5c6b2a3e-0d6f-4c8e-9a39-3f1d6a7c2b10";

fn fault_options() -> BuildOptions {
    BuildOptions {
        event: Some(FaultEvent {
            uuid: EVENT_UUID.into(),
            code: "SUN4V-8001-8H".into(),
            severity: "Major".into(),
            summary: "CPU fault".into(),
            description: "A CPU strand was faulted".into(),
            required_action: None,
            component: None,
            payload: None,
            update: false,
        }),
        ..BuildOptions::default()
    }
}

fn dts_session(extra: &[(&str, &str)]) -> (Arc<ScriptedEngine>, Session) {
    let engine = Arc::new(ScriptedEngine::new());
    let mut props = registered_store("https://transport.example");
    for (name, value) in extra {
        props.set(*name, *value);
    }
    let protocol = DtsProtocol::new(TransportClient::new(engine.clone()));
    (engine, Session::with_protocol(props, Box::new(protocol)))
}

#[test]
fn conflict_drops_fault_without_spooling() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.child("messages").path());
    let (engine, mut session) = dts_session(&[]);
    engine.push_status(409);

    let message = session
        .build_message(MessageKind::Fault, &fault_options())
        .unwrap();
    let delivery = deliver(&session, &spool, &message, SystemTime::now()).unwrap();

    match delivery {
        Delivery::Dropped { status, .. } => assert_eq!(status, Some(409)),
        other => panic!("expected drop, got {other:?}"),
    }
    assert!(spool.list_pending().unwrap().is_empty());
    tmp.child("messages")
        .assert(predicate::path::missing().or(predicate::path::is_dir()));
}

#[test]
fn refused_connection_spools_fault_for_resend() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.child("messages").path());
    let (engine, mut session) = dts_session(&[]);
    engine.push_refused();

    let message = session
        .build_message(MessageKind::Fault, &fault_options())
        .unwrap();
    let Delivery::Spooled(id) = deliver(&session, &spool, &message, SystemTime::now()).unwrap()
    else {
        panic!("fault should have been spooled");
    };

    assert!(id.starts_with("fault-"));
    let file = tmp.child("messages").child(format!("{id}.xml"));
    file.assert(predicate::path::is_file());
    file.assert(predicate::str::contains(EVENT_UUID));

    let pending = spool.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, MessageKind::Fault);

    engine.push_status(201);
    assert_eq!(spool.resend(&id, &session).unwrap(), ResendOutcome::Delivered);
    file.assert(predicate::path::missing());
    let requests = engine.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].body, requests[1].body);
}

#[test]
fn refused_resend_keeps_file_byte_for_byte() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.child("messages").path());
    let (engine, session) = dts_session(&[]);

    let id = spool.persist(MessageKind::Fault, b"<fault/>").unwrap();
    engine.push_status(503);
    assert_eq!(spool.resend(&id, &session).unwrap(), ResendOutcome::Kept);
    tmp.child("messages")
        .child(format!("{id}.xml"))
        .assert("<fault/>");
}

#[test]
fn unusable_signing_setup_keeps_spooled_fault() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.child("messages").path());
    let (engine, session) = dts_session(&[(keys::SIGNATURE_DIGEST, "md5")]);

    let id = spool.persist(MessageKind::Fault, b"<fault/>").unwrap();
    let err = spool.resend(&id, &session).unwrap_err();

    assert!(matches!(err, PhoneHomeError::Configuration(_)), "{err}");
    assert!(engine.requests().is_empty());
    tmp.child("messages")
        .child(format!("{id}.xml"))
        .assert("<fault/>");
}

#[test]
fn unusable_signing_setup_does_not_drop_new_fault() {
    let tmp = TempDir::new().unwrap();
    let spool = Spool::new(tmp.child("messages").path());
    let (engine, mut session) = dts_session(&[(keys::REG_MSG_KEY, "not a pem key")]);

    let message = session
        .build_message(MessageKind::Fault, &fault_options())
        .unwrap();
    let err = deliver(&session, &spool, &message, SystemTime::now()).unwrap_err();

    assert!(!err.is_fatal());
    assert!(!err.is_rejection());
    assert!(engine.requests().is_empty());
}
