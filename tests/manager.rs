//! End-to-end scenarios driven through the spawned manager handle.

use std::thread::sleep;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use status_relay::manager::ManagerError;
use status_relay::test_harness::{ForwardProbe, TestFrameworkId, TestUpdate, path_in};
use status_relay::{HandleError, ManagerConfig, ManagerHandle};

fn spawn(temp: &TempDir, config: ManagerConfig) -> (ManagerHandle<String, TestUpdate>, ForwardProbe) {
    status_relay::telemetry::init();
    let probe = ForwardProbe::new();
    let handle = ManagerHandle::spawn(config, probe.sink(), path_in(temp.path()));
    (handle, probe)
}

fn fast_retry() -> ManagerConfig {
    ManagerConfig {
        retry_interval_min_ms: 50,
        retry_interval_max_ms: 200,
    }
}

#[test]
fn happy_path_checkpointed() {
    let temp = TempDir::new().unwrap();
    let (handle, probe) = spawn(&temp, ManagerConfig::default());
    let update = TestUpdate::new(1);

    handle.update(update.clone(), "s1".to_string(), true).unwrap();

    let path = temp.path().join("s1.updates");
    assert!(path.exists());
    let after_update = std::fs::metadata(&path).unwrap().len();
    assert!(after_update > 0);
    assert_eq!(probe.forwarded(), vec![update.clone()]);

    assert!(handle.acknowledgement("s1".to_string(), update.uuid()).unwrap());
    let after_ack = std::fs::metadata(&path).unwrap().len();
    assert!(after_ack > after_update);

    // Stream alive with an empty queue: a further ack is unexpected.
    let err = handle
        .acknowledgement("s1".to_string(), update.uuid())
        .unwrap_err();
    assert!(matches!(err, HandleError::Manager(ManagerError::Stream(_))));
}

#[test]
fn unacknowledged_update_is_retried_until_acked() {
    let temp = TempDir::new().unwrap();
    let (handle, probe) = spawn(&temp, fast_retry());
    let update = TestUpdate::new(2);

    handle.update(update.clone(), "s1".to_string(), false).unwrap();
    assert_eq!(probe.count(), 1);

    // First retry fires at ~50ms.
    sleep(Duration::from_millis(130));
    assert!(probe.count() >= 2, "expected a retry, got {}", probe.count());

    assert!(handle.acknowledgement("s1".to_string(), update.uuid()).unwrap());
    let after_ack = probe.count();

    sleep(Duration::from_millis(150));
    assert_eq!(probe.count(), after_ack, "retries must stop after the ack");

    for forwarded in probe.forwarded() {
        assert_eq!(forwarded, update);
    }
}

#[test]
fn duplicate_update_is_suppressed() {
    let temp = TempDir::new().unwrap();
    let (handle, probe) = spawn(&temp, ManagerConfig::default());
    let update = TestUpdate::new(3);

    handle.update(update.clone(), "s1".to_string(), false).unwrap();
    handle.update(update, "s1".to_string(), false).unwrap();

    assert_eq!(probe.count(), 1);
}

#[test]
fn second_ack_is_reported_as_duplicate() {
    let temp = TempDir::new().unwrap();
    let (handle, probe) = spawn(&temp, ManagerConfig::default());
    let first = TestUpdate::new(1);
    let second = TestUpdate::new(2);

    handle.update(first.clone(), "s1".to_string(), false).unwrap();
    handle.update(second.clone(), "s1".to_string(), false).unwrap();

    assert!(handle.acknowledgement("s1".to_string(), first.uuid()).unwrap());
    let err = handle
        .acknowledgement("s1".to_string(), first.uuid())
        .unwrap_err();
    assert!(matches!(
        err,
        HandleError::Manager(ManagerError::DuplicateAck { .. })
    ));

    assert_eq!(probe.forwarded(), vec![first, second]);
}

#[test]
fn terminal_ack_closes_the_stream_but_keeps_the_file() {
    let temp = TempDir::new().unwrap();
    let (handle, _probe) = spawn(&temp, ManagerConfig::default());
    let update = TestUpdate::terminal(4);

    handle.update(update.clone(), "s1".to_string(), true).unwrap();
    assert!(!handle.acknowledgement("s1".to_string(), update.uuid()).unwrap());

    let err = handle
        .acknowledgement("s1".to_string(), update.uuid())
        .unwrap_err();
    assert!(matches!(
        err,
        HandleError::Manager(ManagerError::UnknownStream { .. })
    ));

    assert!(temp.path().join("s1.updates").exists());
}

#[test]
fn framework_cleanup_closes_all_its_streams() {
    let temp = TempDir::new().unwrap();
    let (handle, _probe) = spawn(&temp, ManagerConfig::default());
    let first = TestUpdate::new(1).with_framework("fw");
    let second = TestUpdate::new(2).with_framework("fw");

    handle.update(first.clone(), "s1".to_string(), true).unwrap();
    handle.update(second, "s2".to_string(), true).unwrap();

    handle.cleanup(TestFrameworkId("fw".to_string()));

    // Commands run in order: once the next ack is processed, the cleanup
    // must have happened.
    let err = handle
        .acknowledgement("s1".to_string(), first.uuid())
        .unwrap_err();
    assert!(matches!(
        err,
        HandleError::Manager(ManagerError::UnknownStream { .. })
    ));
    let err = handle
        .acknowledgement("s2".to_string(), Uuid::from_bytes([2u8; 16]))
        .unwrap_err();
    assert!(matches!(
        err,
        HandleError::Manager(ManagerError::UnknownStream { .. })
    ));

    assert!(temp.path().join("s1.updates").exists());
    assert!(temp.path().join("s2.updates").exists());
}

#[test]
fn pause_holds_forwards_until_resume() {
    let temp = TempDir::new().unwrap();
    let (handle, probe) = spawn(&temp, ManagerConfig::default());
    let update = TestUpdate::new(5);

    handle.pause();
    handle.update(update.clone(), "s1".to_string(), false).unwrap();
    assert_eq!(probe.count(), 0);

    handle.resume();
    // Sync on the mailbox: the duplicate is processed after the resume.
    handle.update(update, "s1".to_string(), false).unwrap();
    assert_eq!(probe.count(), 1);
}

#[test]
fn checkpoint_mode_must_match_the_stream() {
    let temp = TempDir::new().unwrap();
    let (handle, _probe) = spawn(&temp, ManagerConfig::default());

    handle.update(TestUpdate::new(1), "s1".to_string(), true).unwrap();
    let err = handle
        .update(TestUpdate::new(2), "s1".to_string(), false)
        .unwrap_err();
    assert!(matches!(
        err,
        HandleError::Manager(ManagerError::CheckpointMismatch { .. })
    ));
}

#[test]
fn update_without_uuid_is_rejected() {
    let temp = TempDir::new().unwrap();
    let (handle, probe) = spawn(&temp, ManagerConfig::default());

    let err = handle
        .update(TestUpdate::new(1).without_uuid(), "s1".to_string(), false)
        .unwrap_err();
    assert!(matches!(err, HandleError::Manager(ManagerError::Stream(_))));
    assert_eq!(probe.count(), 0);
}
