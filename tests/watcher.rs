//! End-to-end tests driving the public API through the platform's real default
//! backend. Scenarios that depend on a non-default consolidation policy (sibling
//! consolidation, ancestor reuse, cousin consolidation under a cap) are exercised
//! directly against `RegistryConfig` in `src/registry.rs`'s own unit tests instead;
//! the ones here hold regardless of consolidation policy.
//!
//! `pathwatch`'s registry and native-watcher index are process-global by design, so
//! every test here serializes on [`guard`] to avoid cross-test interference within
//! this binary.

use std::fs;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use pathwatch::EventKind;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn recv(rx: &mpsc::Receiver<pathwatch::PublicEvent>) -> pathwatch::PublicEvent {
    rx.recv_timeout(Duration::from_secs(5)).expect("timed out waiting for event")
}

#[test]
fn directly_deleted_watched_directory_is_silent() {
    let _g = guard();
    let parent = tempdir().unwrap();
    let sub = parent.path().join("sub");
    fs::create_dir(&sub).unwrap();

    let (tx, rx) = mpsc::channel();
    let subscription = pathwatch::watch(&sub, move |ev| {
        let _ = tx.send(ev);
    })
    .unwrap();

    fs::remove_dir(&sub).unwrap();

    // A watched directory's own deletion is never reported (directory watches have
    // no parent-relative name to translate it against).
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

    subscription.close();
}

#[test]
fn deleted_subdirectory_observed_via_parent_not_child() {
    let _g = guard();
    let parent = tempdir().unwrap();
    let sub = parent.path().join("sub");
    fs::create_dir(&sub).unwrap();

    let (tx_parent, rx_parent) = mpsc::channel();
    let sub_parent = pathwatch::watch(parent.path(), move |ev| {
        let _ = tx_parent.send(ev);
    })
    .unwrap();

    let (tx_child, rx_child) = mpsc::channel();
    let sub_child = pathwatch::watch(&sub, move |ev| {
        let _ = tx_child.send(ev);
    })
    .unwrap();

    fs::remove_dir(&sub).unwrap();

    let parent_event = recv(&rx_parent);
    assert_eq!(parent_event.kind, EventKind::Change);
    assert_eq!(parent_event.path, Some(std::path::PathBuf::new()));

    assert!(rx_child.recv_timeout(Duration::from_millis(500)).is_err());

    sub_parent.close();
    sub_child.close();
}

#[test]
fn renamed_watched_file_is_followed() {
    let _g = guard();
    let dir = tempdir().unwrap();
    let original = dir.path().join("f.txt");
    fs::write(&original, b"hello").unwrap();
    let renamed = dir.path().join("g.txt");

    let (tx, rx) = mpsc::channel();
    let subscription = pathwatch::watch(&original, move |ev| {
        let _ = tx.send(ev);
    })
    .unwrap();

    fs::rename(&original, &renamed).unwrap();

    let ev = recv(&rx);
    assert_eq!(ev.kind, EventKind::Rename);
    assert_eq!(ev.path, Some(renamed.clone()));

    // The subscription follows the rename: further changes to the new path still
    // reach the same callback.
    fs::write(&renamed, b"world again").unwrap();
    let ev = recv(&rx);
    assert_eq!(ev.kind, EventKind::Change);

    subscription.close();
}

#[test]
fn directory_create_is_observed_as_change() {
    let _g = guard();
    let dir = tempdir().unwrap();

    let (tx, rx) = mpsc::channel();
    let subscription = pathwatch::watch(dir.path(), move |ev| {
        let _ = tx.send(ev);
    })
    .unwrap();

    // A new entry inside a watched directory is not a hit on the directory itself:
    // `create`/`delete`/`rename` are reserved for the exact watched target.
    fs::write(dir.path().join("new.txt"), b"hi").unwrap();
    let ev = recv(&rx);
    assert_eq!(ev.kind, EventKind::Change);
    assert_eq!(ev.path, Some(std::path::PathBuf::new()));

    subscription.close();
}

#[test]
fn close_is_idempotent_and_stops_delivery() {
    let _g = guard();
    let dir = tempdir().unwrap();

    let (tx, rx) = mpsc::channel();
    let subscription = pathwatch::watch(dir.path(), move |ev| {
        let _ = tx.send(ev);
    })
    .unwrap();

    subscription.close();
    subscription.close();

    fs::write(dir.path().join("after-close.txt"), b"hi").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
}

#[test]
fn close_all_watchers_empties_global_state() {
    let _g = guard();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let _sub_a = pathwatch::watch(dir_a.path(), |_| {}).unwrap();
    let _sub_b = pathwatch::watch(dir_b.path(), |_| {}).unwrap();

    assert!(pathwatch::get_native_watcher_count() > 0);

    pathwatch::close_all_watchers();

    assert_eq!(pathwatch::get_native_watcher_count(), 0);
    assert!(pathwatch::get_watched_paths().is_empty());
}
