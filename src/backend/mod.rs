//! The native backend interface (§6 of the design).
//!
//! Everything above this module — the registry, the native watcher wrapper, the
//! subscription and the translator — depends only on [`Backend`], [`RawEvent`] and
//! [`Listener`]. No backend-specific type crosses this boundary, so swapping FSEvents
//! for inotify or the change journal is invisible to the rest of the crate.

use std::path::{Path, PathBuf};

use crate::error::Result;

#[cfg(all(target_os = "macos", feature = "macos_fsevent"))]
pub mod fsevent;
#[cfg(target_os = "linux")]
pub mod inotify;
#[cfg(windows)]
pub mod windows;

pub mod null;
pub mod poll;

/// The action carried by a [`RawEvent`].
///
/// A closed sum over exactly the four actions a backend can report, per the "Dynamic
/// event object" design note: modeled as a fixed-field tagged variant, not an open bag
/// of flags.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RawAction {
    /// A new file or directory appeared.
    Add,
    /// An existing file or directory's contents or metadata changed.
    Modified,
    /// A file or directory was removed.
    Delete,
    /// A file or directory was renamed or moved.
    Moved,
}

/// A single raw notification as delivered by a [`Backend`] to a [`Listener`].
///
/// `dir` is always the directory the event concerns (the parent of `filename`).
/// `old_filename` is present only for [`RawAction::Moved`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RawEvent {
    /// The handle of the native watch this event was attributed to.
    pub handle: i32,
    /// What happened.
    pub action: RawAction,
    /// The directory the changed entry lives in.
    pub dir: PathBuf,
    /// The name of the changed entry, relative to `dir`.
    pub filename: PathBuf,
    /// For [`RawAction::Moved`], the entry's previous name, relative to `dir`.
    pub old_filename: Option<PathBuf>,
}

impl RawEvent {
    /// The full previous path, if this is a rename.
    pub fn old_path(&self) -> Option<PathBuf> {
        self.old_filename.as_ref().map(|name| self.dir.join(name))
    }

    /// The full new (or only, for non-renames) path.
    pub fn new_path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

/// The per-watch callback a [`Backend`] delivers [`RawEvent`]s to.
///
/// Implementations must not block for long inside `on_event` — backends call it from
/// their own OS thread(s), and a slow listener stalls event delivery for every watch
/// multiplexed onto that thread.
pub trait Listener: Send + 'static {
    /// Called once per raw event attributed to this listener's handle.
    fn on_event(&self, event: RawEvent);

    /// Called when the backend cannot deliver further events for this handle because
    /// of an error (not because the watch was removed). The native watcher wrapper
    /// surfaces this on the per-subscription error channel; see §7.
    fn on_error(&self, error: crate::error::Error) {
        let _ = error;
    }
}

impl<F> Listener for F
where
    F: Fn(RawEvent) + Send + 'static,
{
    fn on_event(&self, event: RawEvent) {
        (self)(event)
    }
}

/// The native backend interface (§6).
///
/// A `Backend` owns whatever OS-level watch resources it needs and hands out
/// process-wide-unique, non-negative handles. Everything above this trait is written
/// against it, never against a concrete backend type.
pub trait Backend: Send + Sync + 'static {
    /// Start watching `directory`, delivering every subsequent raw event for it (and,
    /// if the backend is inherently recursive, its descendants) to `listener`.
    ///
    /// Returns a non-negative handle on success. `directory` is assumed already
    /// canonicalized and already verified to exist by the caller (the registry), per
    /// spec.md's "watching paths that do not yet exist" non-goal.
    fn add_watch(&self, directory: &Path, listener: Box<dyn Listener>) -> Result<i32>;

    /// Stop watching the directory associated with `handle`.
    ///
    /// A handle that is no longer live is not an error (§7: "a native watcher already
    /// stopped when asked to stop is not an error").
    fn remove_watch(&self, handle: i32) -> Result<()>;

    /// Whether native watches from this backend are inherently recursive (cover
    /// descendants without a separate watch per directory). Determines the
    /// `recursive` field of [`crate::native::NativeWatcher`] and therefore which
    /// watches can share a `(path, recursive)` slot.
    fn is_recursive(&self) -> bool {
        false
    }
}
