//! Cross-platform filesystem watcher core.
//!
//! `pathwatch` consolidates many user subscriptions onto as few OS-level watch
//! resources as possible, then demultiplexes and translates the raw events each
//! resource delivers back into a small, cross-platform-consistent set of
//! notifications: `create`, `change`, `delete` and `rename`.
//!
//! ```no_run
//! let subscription = pathwatch::watch("/tmp/some/dir", |event| {
//!     println!("{:?}", event);
//! })?;
//! // ... later
//! subscription.close();
//! # Ok::<(), pathwatch::Error>(())
//! ```
//!
//! # Architecture
//!
//! Five layers, leaves first: a [`backend::Backend`] per platform delivers raw
//! events to a [`native::NativeWatcher`], which fans them out to every
//! [`Subscription`] bound to it. The [`registry`] module decides which directory
//! each subscription's native watcher actually watches — reusing, consolidating or
//! splitting as subscriptions come and go — and [`translate`] turns each raw event
//! into the public [`PublicEvent`] (or nothing) a given subscription should see.
//!
//! # Features
//!
//! - `macos_fsevent`, enabled by default: FSEvents backend on macOS.
//! - `serde`: `Serialize`/`Deserialize` on [`PublicEvent`] and [`EventKind`].

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
mod native;
mod registry;
mod subscription;
mod translate;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

pub use config::RegistryConfig;
pub use error::{Error, ErrorKind, Result};
pub use event::{EventKind, PublicEvent};
pub use subscription::Subscription;

use backend::Backend;
use registry::RegistryTree;

struct Manager {
    registry: Mutex<RegistryTree>,
    next_id: AtomicU64,
    closing_all: Arc<AtomicBool>,
}

impl Manager {
    fn new() -> Self {
        let dispatch = native::spawn_dispatch_thread();
        let backend = default_backend();
        let config = RegistryConfig::default();
        Self {
            registry: Mutex::new(RegistryTree::new(config, backend, dispatch)),
            next_id: AtomicU64::new(1),
            closing_all: Arc::new(AtomicBool::new(false)),
        }
    }
}

static MANAGER: OnceLock<Manager> = OnceLock::new();

fn manager() -> &'static Manager {
    MANAGER.get_or_init(Manager::new)
}

#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
fn default_backend() -> Arc<dyn Backend> {
    Arc::new(backend::fsevent::FsEventBackend::new())
}

#[cfg(target_os = "linux")]
fn default_backend() -> Arc<dyn Backend> {
    match backend::inotify::InotifyBackend::new() {
        Ok(b) => Arc::new(b),
        Err(err) => {
            log::warn!(target: "pathwatch", "inotify backend unavailable ({err}), falling back to polling");
            Arc::new(backend::poll::PollBackend::default())
        }
    }
}

#[cfg(windows)]
fn default_backend() -> Arc<dyn Backend> {
    Arc::new(backend::windows::WindowsBackend::new())
}

#[cfg(not(any(
    all(target_os = "macos", feature = "macos_fsevent"),
    target_os = "linux",
    windows
)))]
fn default_backend() -> Arc<dyn Backend> {
    Arc::new(backend::poll::PollBackend::default())
}

fn detach_fn() -> subscription::DetachFn {
    Arc::new(|path: &Path, id: u64| {
        manager().registry.lock().unwrap().detach(path, id);
    })
}

/// Watch `path` (a file or a directory), invoking `callback` for every subsequent
/// change (§6).
///
/// `path` is canonicalized before use; the call fails with
/// [`ErrorKind::PathNotFound`] if it does not resolve to anything on disk (watching
/// paths that do not yet exist is out of scope — see the crate's design notes).
pub fn watch<F>(path: impl AsRef<Path>, callback: F) -> Result<Subscription>
where
    F: FnMut(PublicEvent) + Send + 'static,
{
    let watched_path = path.as_ref().to_path_buf();
    let canonical = watched_path
        .canonicalize()
        .map_err(|err| Error::from(err).add_path(watched_path.clone()))?;

    let is_watching_parent = canonical.is_file();
    let (normalized_path, target_path) = if is_watching_parent {
        let parent = canonical
            .parent()
            .ok_or_else(|| Error::path_not_found().add_path(canonical.clone()))?
            .to_path_buf();
        (parent, canonical.clone())
    } else {
        (canonical.clone(), canonical.clone())
    };

    let m = manager();
    let id = m.next_id.fetch_add(1, Ordering::Relaxed);

    let subscription = Subscription::new(
        id,
        watched_path,
        normalized_path.clone(),
        target_path,
        normalized_path.clone(),
        is_watching_parent,
        true,
        Box::new(callback),
        detach_fn(),
        Arc::clone(&m.closing_all),
    );

    let observer = subscription.observer();
    let native = m.registry.lock().unwrap().attach(&normalized_path, id, observer)?;
    subscription.bind(native);

    Ok(subscription)
}

/// Stop every live subscription and native watcher, resetting the registry to empty
/// (§6). Safe to call with no watchers active.
pub fn close_all_watchers() {
    let m = manager();
    m.closing_all.store(true, Ordering::SeqCst);
    m.registry.lock().unwrap().reset();
    m.closing_all.store(false, Ordering::SeqCst);
}

/// The set of directories currently watched at the OS level, one per native
/// watcher, deduplicated (§6).
pub fn get_watched_paths() -> Vec<PathBuf> {
    manager().registry.lock().unwrap().watched_paths()
}

/// The number of distinct native watchers currently alive (§6).
pub fn get_native_watcher_count() -> usize {
    manager().registry.lock().unwrap().native_watcher_count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_nonexistent_path_is_rejected() {
        let err = watch("/this/path/does/not/exist/i/hope", |_| {}).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::PathNotFound));
    }
}
