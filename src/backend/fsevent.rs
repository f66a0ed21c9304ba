//! FSEvents-based backend for macOS (§4.4 of the design).
//!
//! Where the teacher's own `FsEventWatcher` rebuilds a single stream on every
//! watch/unwatch for a single listener, this backend multiplexes many independent
//! listeners onto that same single stream: `add_watch`/`remove_watch` grow or shrink a
//! shared path list and rebuild the stream, exactly like the teacher's
//! `append_path`/`remove_path`/`run`/`stop` quartet, but event delivery is routed
//! per-handle by a `path -> handle` lookup rather than handed to one fixed listener.

#![allow(non_upper_case_globals)]

use std::collections::HashMap;
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use objc2_core_foundation as cf;
use objc2_core_services as fs;

use super::{Backend, Listener, RawAction, RawEvent};
use crate::error::{Error, Result};

bitflags::bitflags! {
    #[repr(C)]
    struct StreamFlags: u32 {
        const NONE = fs::kFSEventStreamEventFlagNone;
        const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
        const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
        const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
        const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
        const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
        const ITEM_INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
        const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
        const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
    }
}

/// A raw FSEvents callback, resolved to the inode and existence it had at the moment
/// the callback ran — both needed for rename reconstruction and create/delete
/// disambiguation (§4.4).
struct RawCallbackEvent {
    path: PathBuf,
    flags: StreamFlags,
    inode: Option<u64>,
    exists: bool,
}

fn stat_inode(path: &Path) -> (Option<u64>, bool) {
    use std::os::unix::fs::MetadataExt;
    match std::fs::symlink_metadata(path) {
        Ok(meta) => (Some(meta.ino()), true),
        Err(_) => (None, false),
    }
}

struct Maps {
    handle_to_path: HashMap<i32, PathBuf>,
    path_to_handle: HashMap<PathBuf, i32>,
    handle_to_listener: HashMap<i32, Arc<dyn Listener>>,
    next_handle: i32,
}

impl Maps {
    fn new() -> Self {
        Self {
            handle_to_path: HashMap::new(),
            path_to_handle: HashMap::new(),
            handle_to_listener: HashMap::new(),
            next_handle: 0,
        }
    }

    fn paths(&self) -> Vec<PathBuf> {
        self.handle_to_path.values().cloned().collect()
    }
}

struct Stream {
    stream: fs::FSEventStreamRef,
    runloop: cf::CFRetained<cf::CFRunLoop>,
    thread: thread::JoinHandle<()>,
}

// The stream and runloop references are only ever touched from the thread that
// created them (the FSEvents dispatch thread) or during teardown after that thread has
// stopped; the context pointer handed to the C callback owns its own Arc clone.
unsafe impl Send for Stream {}

struct Teardown {
    destroying: Mutex<bool>,
    processing: Mutex<u32>,
    idle: Condvar,
}

impl Teardown {
    fn new() -> Self {
        Self {
            destroying: Mutex::new(false),
            processing: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Enter a processing scope. Returns `None` if the backend is being torn down.
    fn enter(&self) -> Option<ProcessingGuard<'_>> {
        if *self.destroying.lock().unwrap() {
            return None;
        }
        *self.processing.lock().unwrap() += 1;
        Some(ProcessingGuard { teardown: self })
    }

    /// Block until no callback is in flight, then mark the backend as destroying so no
    /// new processing scope can start.
    fn wait_idle_and_destroy(&self) {
        *self.destroying.lock().unwrap() = true;
        let mut processing = self.processing.lock().unwrap();
        while *processing > 0 {
            processing = self.idle.wait(processing).unwrap();
        }
    }
}

struct ProcessingGuard<'a> {
    teardown: &'a Teardown,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        let mut processing = self.teardown.processing.lock().unwrap();
        *processing -= 1;
        if *processing == 0 {
            self.teardown.idle.notify_all();
        }
    }
}

struct CallbackContext {
    maps: Arc<Mutex<Maps>>,
    teardown: Arc<Teardown>,
}

struct Inner {
    maps: Arc<Mutex<Maps>>,
    teardown: Arc<Teardown>,
    stream: Option<Stream>,
}

/// FSEvents-backed [`Backend`] sharing a single stream across all its watches.
pub struct FsEventBackend {
    inner: Mutex<Inner>,
}

impl FsEventBackend {
    /// Create a backend with no watches and no running stream.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                maps: Arc::new(Mutex::new(Maps::new())),
                teardown: Arc::new(Teardown::new()),
                stream: None,
            }),
        }
    }

    fn rebuild_stream(inner: &mut Inner) -> Result<()> {
        let paths = inner.maps.lock().unwrap().paths();
        let previous = inner.stream.take();

        if paths.is_empty() {
            if let Some(stream) = previous {
                stop_stream(stream, &inner.teardown);
            }
            return Ok(());
        }

        let new_stream = start_stream(&paths, Arc::clone(&inner.maps), Arc::clone(&inner.teardown))?;
        inner.stream = Some(new_stream);

        if let Some(stream) = previous {
            stop_stream(stream, &inner.teardown);
        }

        Ok(())
    }
}

impl Default for FsEventBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for FsEventBackend {
    fn add_watch(&self, directory: &Path, listener: Box<dyn Listener>) -> Result<i32> {
        if !directory.exists() {
            return Err(Error::path_not_found().add_path(directory.into()));
        }
        let canonical = directory.canonicalize()?;

        let mut inner = self.inner.lock().unwrap();
        let handle = {
            let mut maps = inner.maps.lock().unwrap();
            let handle = maps.next_handle;
            maps.next_handle += 1;
            maps.handle_to_path.insert(handle, canonical.clone());
            maps.path_to_handle.insert(canonical.clone(), handle);
            maps.handle_to_listener.insert(handle, Arc::from(listener));
            handle
        };

        if let Err(err) = Self::rebuild_stream(&mut inner) {
            let mut maps = inner.maps.lock().unwrap();
            maps.handle_to_path.remove(&handle);
            maps.path_to_handle.remove(&canonical);
            maps.handle_to_listener.remove(&handle);
            return Err(err);
        }

        Ok(handle)
    }

    fn remove_watch(&self, handle: i32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let removed_path = {
            let mut maps = inner.maps.lock().unwrap();
            match maps.handle_to_path.remove(&handle) {
                Some(path) => {
                    maps.path_to_handle.remove(&path);
                    maps.handle_to_listener.remove(&handle);
                    Some(path)
                }
                None => None,
            }
        };

        if removed_path.is_none() {
            // Already gone; not an error (§7).
            return Ok(());
        }

        // Failure here leaves the old stream running, silently dropping events for
        // the removed handle since it's no longer in the maps (§4.4).
        Self::rebuild_stream(&mut inner)
    }

    fn is_recursive(&self) -> bool {
        // FSEvents is inherently recursive: a stream over a directory also reports
        // changes in its descendants.
        true
    }
}

impl Drop for FsEventBackend {
    fn drop(&mut self) {
        if let Some(stream) = self.inner.lock().unwrap().stream.take() {
            stop_stream(stream, &self.inner.lock().unwrap().teardown);
        }
    }
}

fn start_stream(paths: &[PathBuf], maps: Arc<Mutex<Maps>>, teardown: Arc<Teardown>) -> Result<Stream> {
    let cf_paths = cf::CFMutableArray::empty();
    for path in paths {
        let s = path.to_str().ok_or_else(|| Error::generic("non-utf8 path"))?;
        cf_paths.append(&cf::CFString::from_str(s));
    }

    let context = Box::into_raw(Box::new(CallbackContext { maps, teardown: Arc::clone(&teardown) }));

    let stream_context = fs::FSEventStreamContext {
        version: 0,
        info: context as *mut libc::c_void,
        retain: None,
        release: Some(release_context),
        copyDescription: None,
    };

    let flags = fs::kFSEventStreamCreateFlagFileEvents | fs::kFSEventStreamCreateFlagNoDefer;

    let stream = unsafe {
        fs::FSEventStreamCreate(
            cf::kCFAllocatorDefault,
            Some(callback),
            &stream_context as *const _ as *mut _,
            cf_paths.as_opaque(),
            fs::kFSEventStreamEventIdSinceNow,
            0.0,
            flags,
        )
    };

    let (tx, rx) = std::sync::mpsc::channel();
    let thread_stream = RawStream(stream);
    let thread = thread::Builder::new()
        .name("pathwatch-fsevents".into())
        .spawn(move || {
            let stream = thread_stream.0;
            unsafe {
                let runloop = cf::CFRunLoop::current().expect("current runloop");
                #[allow(deprecated)]
                fs::FSEventStreamScheduleWithRunLoop(
                    stream,
                    &runloop,
                    cf::kCFRunLoopDefaultMode.expect("default runloop mode"),
                );
                if !fs::FSEventStreamStart(stream) {
                    fs::FSEventStreamInvalidate(stream);
                    fs::FSEventStreamRelease(stream);
                    let _ = tx.send(Err(Error::generic("unable to start FSEvents stream")));
                    return;
                }
                let _ = tx.send(Ok(runloop.clone()));
                cf::CFRunLoop::run();
                fs::FSEventStreamStop(stream);
                fs::FSEventStreamInvalidate(stream);
                fs::FSEventStreamRelease(stream);
            }
        })
        .map_err(|_| Error::generic("failed to spawn FSEvents thread"))?;

    let runloop = rx
        .recv()
        .map_err(|_| Error::generic("FSEvents thread exited before starting"))??;

    Ok(Stream { stream, runloop, thread })
}

fn stop_stream(stream: Stream, teardown: &Teardown) {
    teardown.wait_idle_and_destroy();
    while !stream.runloop.is_waiting() {
        thread::yield_now();
    }
    stream.runloop.stop();
    let _ = stream.thread.join();
}

struct RawStream(fs::FSEventStreamRef);
unsafe impl Send for RawStream {}

unsafe extern "C-unwind" fn release_context(info: *const libc::c_void) {
    unsafe {
        drop(Box::from_raw(info as *const CallbackContext as *mut CallbackContext));
    }
}

/// Step 1 of event correlation (§4.4): which handle owns a raw path.
fn owning_handle(maps: &Maps, path: &Path) -> Option<i32> {
    if let Some(parent) = path.parent() {
        if let Some(&handle) = maps.path_to_handle.get(parent) {
            return Some(handle);
        }
    }
    // Uncommon case: the path itself is a directly-watched directory. We deliberately
    // do not emit its own deletion (mirrors the Linux/Windows libraries), but we still
    // need to find the owner so directory-rollup events referencing it can be routed.
    maps.path_to_handle.get(path).copied()
}

unsafe extern "C-unwind" fn callback(
    _stream_ref: fs::ConstFSEventStreamRef,
    info: *mut libc::c_void,
    num_events: libc::size_t,
    event_paths: NonNull<libc::c_void>,
    event_flags: NonNull<fs::FSEventStreamEventFlags>,
    _event_ids: NonNull<fs::FSEventStreamEventId>,
) {
    let context = unsafe { &*(info as *const CallbackContext) };
    let Some(_guard) = context.teardown.enter() else {
        return;
    };

    let event_paths = event_paths.as_ptr() as *const *const libc::c_char;
    let mut raw = Vec::with_capacity(num_events);
    for i in 0..num_events {
        let c_path = unsafe { CStr::from_ptr(*event_paths.add(i)) };
        let Ok(path_str) = c_path.to_str() else { continue };
        let path = PathBuf::from(path_str);

        let bits = unsafe { *event_flags.as_ptr().add(i) };
        let Some(flags) = StreamFlags::from_bits(bits) else { continue };
        if flags.contains(StreamFlags::HISTORY_DONE) {
            continue;
        }

        let (inode, exists) = stat_inode(&path);
        raw.push(RawCallbackEvent { path, flags, inode, exists });
    }

    dispatch_batch(raw, &context.maps);
}

/// Steps 2-4 of §4.4: rename reconstruction, create/modify/delete disambiguation,
/// directory-change rollup, and routing to the owning handle.
fn dispatch_batch(mut raw: Vec<RawCallbackEvent>, maps: &Mutex<Maps>) {
    let maps = maps.lock().unwrap();
    let mut dirs_changed: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
    let mut i = 0;

    while i < raw.len() {
        let ev = &raw[i];
        let is_rename = ev.flags.contains(StreamFlags::ITEM_RENAMED);

        // Try to pair this rename with the next event sharing an inode.
        if is_rename {
            if let Some(pair_idx) = find_rename_pair(&raw, i) {
                let (older_idx, newer_idx) = (i, pair_idx);
                emit_rename_pair(&raw, older_idx, newer_idx, &maps, &mut dirs_changed);
                raw_mark_consumed(&mut raw, &[older_idx, newer_idx]);
                i += 1;
                continue;
            }

            // A lone rename: Add if it still exists, Delete otherwise.
            let action = if ev.exists { RawAction::Add } else { RawAction::Delete };
            emit_single(&ev.path, action, &maps, &mut dirs_changed);
            i += 1;
            continue;
        }

        if ev.flags.contains(StreamFlags::ITEM_CREATED) && ev.exists {
            emit_single(&ev.path, RawAction::Add, &maps, &mut dirs_changed);
        }
        if ev.flags.contains(StreamFlags::ITEM_REMOVED) && !ev.exists {
            emit_single(&ev.path, RawAction::Delete, &maps, &mut dirs_changed);
        }
        if ev.flags.contains(StreamFlags::ITEM_MODIFIED)
            || ev.flags.contains(StreamFlags::ITEM_INODE_META_MOD)
        {
            emit_single(&ev.path, RawAction::Modified, &maps, &mut dirs_changed);
        }

        i += 1;
    }

    for dir in dirs_changed {
        let Some(parent) = dir.parent() else { continue };
        if let Some(&handle) = maps.path_to_handle.get(parent) {
            route(&maps, handle, &dir, RawAction::Modified, None);
        }
    }
}

fn raw_mark_consumed(raw: &mut [RawCallbackEvent], indices: &[usize]) {
    // Clear the rename flag on consumed entries so the outer loop's `is_rename` check
    // does not reprocess the second half of an already-paired rename.
    for &idx in indices {
        raw[idx].flags.remove(StreamFlags::ITEM_RENAMED);
    }
}

fn find_rename_pair(raw: &[RawCallbackEvent], start: usize) -> Option<usize> {
    let anchor = &raw[start];
    let anchor_inode = anchor.inode?;
    raw.iter().enumerate().skip(start + 1).find_map(|(idx, ev)| {
        if ev.flags.contains(StreamFlags::ITEM_RENAMED) && ev.inode == Some(anchor_inode) {
            Some(idx)
        } else {
            None
        }
    })
}

fn emit_rename_pair(
    raw: &[RawCallbackEvent],
    a: usize,
    b: usize,
    maps: &Maps,
    dirs_changed: &mut std::collections::HashSet<PathBuf>,
) {
    let (old, new) = if raw[a].exists { (&raw[b], &raw[a]) } else { (&raw[a], &raw[b]) };

    if old.path.parent() == new.path.parent() {
        let Some(dir) = old.path.parent() else { return };
        let Some(old_name) = old.path.file_name() else { return };
        let Some(new_name) = new.path.file_name() else { return };
        match owning_handle(maps, &old.path) {
            Some(handle) => {
                if let Some(listener) = maps.handle_to_listener.get(&handle) {
                    listener.on_event(RawEvent {
                        handle,
                        action: RawAction::Moved,
                        dir: dir.to_path_buf(),
                        filename: PathBuf::from(new_name),
                        old_filename: Some(PathBuf::from(old_name)),
                    });
                }
            }
            None => note_rollup(dir, dirs_changed),
        }
        return;
    }

    emit_single(&old.path, RawAction::Delete, maps, dirs_changed);
    emit_single(&new.path, RawAction::Add, maps, dirs_changed);
    if new.flags.contains(StreamFlags::ITEM_MODIFIED) {
        emit_single(&new.path, RawAction::Modified, maps, dirs_changed);
    }
}

fn emit_single(
    path: &Path,
    action: RawAction,
    maps: &Maps,
    dirs_changed: &mut std::collections::HashSet<PathBuf>,
) {
    match owning_handle(maps, path) {
        Some(handle) => route(maps, handle, path, action, None),
        None => {
            if let Some(dir) = path.parent() {
                note_rollup(dir, dirs_changed);
            }
        }
    }
}

fn note_rollup(dir: &Path, dirs_changed: &mut std::collections::HashSet<PathBuf>) {
    dirs_changed.insert(dir.to_path_buf());
}

fn route(maps: &Maps, handle: i32, path: &Path, action: RawAction, old_filename: Option<PathBuf>) {
    let Some(watched) = maps.handle_to_path.get(&handle) else { return };
    let Some(listener) = maps.handle_to_listener.get(&handle) else { return };
    let filename = path.strip_prefix(watched).unwrap_or(path).to_path_buf();
    listener.on_event(RawEvent {
        handle,
        action,
        dir: watched.clone(),
        filename,
        old_filename,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owning_handle_prefers_parent_over_self() {
        let mut maps = Maps::new();
        maps.path_to_handle.insert(PathBuf::from("/a"), 1);
        let handle = owning_handle(&maps, Path::new("/a/b"));
        assert_eq!(handle, Some(1));
    }

    #[test]
    fn owning_handle_falls_back_to_exact_match() {
        let mut maps = Maps::new();
        maps.path_to_handle.insert(PathBuf::from("/a"), 1);
        let handle = owning_handle(&maps, Path::new("/a"));
        assert_eq!(handle, Some(1));
    }

    #[test]
    fn owning_handle_drops_unmatched() {
        let maps = Maps::new();
        assert_eq!(owning_handle(&maps, Path::new("/nowhere")), None);
    }
}
