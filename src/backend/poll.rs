//! A polling backend: periodically re-scans each watched directory and diffs
//! `(len, modified)` metadata snapshots to synthesize raw events.
//!
//! Grounded in the teacher's `PollWatcher` (referenced throughout `notify`'s `lib.rs`
//! as the cross-platform fallback `Watcher` and used in its own test harness): a
//! `walkdir`-based scan compared against the previous scan's snapshot. This is the
//! crate's own backend for `#[cfg(test)]` exercising of the registry and translator,
//! and the documented fallback when no native backend is compiled in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use walkdir::WalkDir;

use super::{Backend, Listener, RawAction, RawEvent};
use crate::error::Result;

#[derive(Clone, PartialEq, Eq, Debug)]
struct Snapshot {
    len: u64,
    modified: Option<SystemTime>,
    is_dir: bool,
}

struct Watch {
    path: PathBuf,
    listener: Box<dyn Listener>,
    entries: HashMap<PathBuf, Snapshot>,
}

struct Shared {
    watches: Mutex<HashMap<i32, Watch>>,
}

/// A [`Backend`] implemented by periodically re-scanning watched directories.
pub struct PollBackend {
    shared: Arc<Shared>,
    next_handle: AtomicI32,
    _scanner: thread::JoinHandle<()>,
}

impl PollBackend {
    /// Start a poll backend that re-scans every watched directory every `interval`.
    pub fn new(interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            watches: Mutex::new(HashMap::new()),
        });
        let scanner_shared = Arc::clone(&shared);
        let scanner = thread::Builder::new()
            .name("pathwatch-poll".into())
            .spawn(move || scan_loop(scanner_shared, interval))
            .expect("failed to spawn poll backend thread");
        Self {
            shared,
            next_handle: AtomicI32::new(0),
            _scanner: scanner,
        }
    }
}

impl Default for PollBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl Backend for PollBackend {
    fn add_watch(&self, directory: &Path, listener: Box<dyn Listener>) -> Result<i32> {
        let entries = scan(directory);
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut watches = self.shared.watches.lock().unwrap();
        watches.insert(
            handle,
            Watch {
                path: directory.to_path_buf(),
                listener,
                entries,
            },
        );
        Ok(handle)
    }

    fn remove_watch(&self, handle: i32) -> Result<()> {
        self.shared.watches.lock().unwrap().remove(&handle);
        Ok(())
    }
}

fn scan(directory: &Path) -> HashMap<PathBuf, Snapshot> {
    let mut entries = HashMap::new();
    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if let Ok(meta) = entry.metadata() {
            entries.insert(
                entry.path().to_path_buf(),
                Snapshot {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                    is_dir: meta.is_dir(),
                },
            );
        }
    }
    entries
}

fn scan_loop(shared: Arc<Shared>, interval: Duration) {
    loop {
        thread::sleep(interval);
        let mut watches = shared.watches.lock().unwrap();
        if watches.is_empty() {
            continue;
        }
        for (&handle, watch) in watches.iter_mut() {
            let fresh = scan(&watch.path);

            for (path, snapshot) in &fresh {
                match watch.entries.get(path) {
                    None => emit(
                        handle,
                        &watch.path,
                        path,
                        RawAction::Add,
                        None,
                        watch.listener.as_ref(),
                    ),
                    Some(old) if old != snapshot => emit(
                        handle,
                        &watch.path,
                        path,
                        RawAction::Modified,
                        None,
                        watch.listener.as_ref(),
                    ),
                    _ => {}
                }
            }

            for path in watch.entries.keys() {
                if !fresh.contains_key(path) {
                    emit(
                        handle,
                        &watch.path,
                        path,
                        RawAction::Delete,
                        None,
                        watch.listener.as_ref(),
                    );
                }
            }

            watch.entries = fresh;
        }
    }
}

fn emit(
    handle: i32,
    dir: &Path,
    path: &Path,
    action: RawAction,
    old_filename: Option<PathBuf>,
    listener: &dyn Listener,
) {
    let filename = match path.strip_prefix(dir) {
        Ok(rel) => rel.to_path_buf(),
        Err(_) => path.to_path_buf(),
    };
    listener.on_event(RawEvent {
        handle,
        action,
        dir: dir.to_path_buf(),
        filename,
        old_filename,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn detects_create_and_delete() {
        let dir = tempdir().unwrap();
        let backend = PollBackend::new(Duration::from_millis(10));
        let (tx, rx) = mpsc::channel();
        let handle = backend
            .add_watch(dir.path(), Box::new(move |ev: RawEvent| tx.send(ev).unwrap()))
            .unwrap();
        assert!(handle >= 0);

        let file = dir.path().join("f.txt");
        fs::write(&file, b"hi").unwrap();
        let ev = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ev.action, RawAction::Add);
        assert_eq!(ev.filename, Path::new("f.txt"));

        fs::remove_file(&file).unwrap();
        let ev = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ev.action, RawAction::Delete);
    }
}
