//! Native watcher wrapper (§4.3): a reference-counted handle on top of a backend
//! handle, one instance per distinct watched directory.
//!
//! Subscribers register an [`Observer`] bundle of callbacks rather than a trait
//! object, the way the teacher's `FsEventWatcher`/`INotifyWatcher` hand a single
//! `EventHandler` to the backend — here there can be many, so each gets its own
//! bundle, keyed by an id assigned by the registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::backend::{Backend, Listener, RawEvent};
use crate::error::{Error, Result};

/// A process-unique id for a [`NativeWatcher`], handed out on creation.
pub type WatcherId = u64;

fn next_watcher_id() -> WatcherId {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Running,
}

/// The callback bundle a subscriber registers on a [`NativeWatcher`].
///
/// Held behind `Arc` (not `Box`) so the watcher can hand out clones while briefly
/// locked and invoke them after releasing the lock, avoiding a deadlock when a
/// callback calls back into this same watcher (as `on_should_detach` handlers do,
/// via the replacement watcher's `subscribe` and this watcher's own `unsubscribe`).
#[derive(Clone)]
pub struct Observer {
    pub on_change: Arc<dyn Fn(RawEvent) + Send + Sync>,
    pub on_error: Arc<dyn Fn(Arc<Error>) + Send + Sync>,
    pub on_should_detach: Arc<dyn Fn(Arc<NativeWatcher>, PathBuf) + Send + Sync>,
    pub on_will_stop: Arc<dyn Fn() + Send + Sync>,
}

/// One OS-level watch resource, shared by every subscription currently bound to it.
pub struct NativeWatcher {
    pub id: WatcherId,
    pub path: PathBuf,
    pub recursive: bool,
    backend: Arc<dyn Backend>,
    dispatch: crossbeam_channel::Sender<DispatchMsg>,
    state: Mutex<State>,
    handle: Mutex<Option<i32>>,
    observers: Mutex<HashMap<u64, Observer>>,
}

impl NativeWatcher {
    pub(crate) fn new(
        path: PathBuf,
        recursive: bool,
        backend: Arc<dyn Backend>,
        dispatch: crossbeam_channel::Sender<DispatchMsg>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_watcher_id(),
            path,
            recursive,
            backend,
            dispatch,
            state: Mutex::new(State::Stopped),
            handle: Mutex::new(None),
            observers: Mutex::new(HashMap::new()),
        })
    }

    /// True while the backend watch is active (has at least one subscriber).
    pub fn is_running(&self) -> bool {
        *self.state.lock().unwrap() == State::Running
    }

    /// Register a subscriber. Starts the backend watch if this is the first one.
    pub fn subscribe(self: &Arc<Self>, id: u64, observer: Observer) -> Result<()> {
        let was_empty = {
            let mut observers = self.observers.lock().unwrap();
            let was_empty = observers.is_empty();
            observers.insert(id, observer);
            was_empty
        };
        if was_empty {
            if let Err(err) = self.start() {
                self.observers.lock().unwrap().remove(&id);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unregister a subscriber. Stops the backend watch once none remain.
    pub fn unsubscribe(&self, id: u64) {
        let now_empty = {
            let mut observers = self.observers.lock().unwrap();
            observers.remove(&id);
            observers.is_empty()
        };
        if now_empty {
            self.force_stop();
        }
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state == State::Running {
            return Ok(());
        }
        let listener = NativeListener { watcher: Arc::downgrade(self), tx: self.dispatch.clone() };
        let handle = self.backend.add_watch(&self.path, Box::new(listener))?;
        *self.handle.lock().unwrap() = Some(handle);
        *state = State::Running;
        log::debug!(target: "pathwatch::native", "started path={:?} handle={handle}", self.path);
        Ok(())
    }

    /// Stop the backend watch unconditionally, notifying any observers still
    /// registered (normally none, unless called while subscribers are mid-migration).
    pub fn force_stop(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == State::Stopped {
            return;
        }
        let will_stop: Vec<_> = {
            let observers = self.observers.lock().unwrap();
            observers.values().map(|o| Arc::clone(&o.on_will_stop)).collect()
        };
        for f in will_stop {
            f();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if let Err(err) = self.backend.remove_watch(handle) {
                log::warn!(target: "pathwatch::native", "remove_watch failed path={:?}: {err}", self.path);
            }
        }
        *state = State::Stopped;
        log::trace!(target: "pathwatch::native", "stopped path={:?}", self.path);
    }

    /// Broadcast `should-detach(replacement, self.path)` to every current observer.
    /// Each subscriber decides for itself whether to migrate (§4.2).
    pub fn should_detach(self: &Arc<Self>, replacement: Arc<NativeWatcher>) {
        let handlers: Vec<_> = {
            let observers = self.observers.lock().unwrap();
            observers.values().map(|o| Arc::clone(&o.on_should_detach)).collect()
        };
        for handler in handlers {
            handler(Arc::clone(&replacement), self.path.clone());
        }
    }

    fn dispatch_event(&self, event: RawEvent) {
        let handlers: Vec<_> = {
            let observers = self.observers.lock().unwrap();
            observers.values().map(|o| Arc::clone(&o.on_change)).collect()
        };
        for handler in handlers {
            handler(event.clone());
        }
    }

    fn dispatch_error(&self, error: Arc<Error>) {
        let handlers: Vec<_> = {
            let observers = self.observers.lock().unwrap();
            observers.values().map(|o| Arc::clone(&o.on_error)).collect()
        };
        for handler in handlers {
            handler(Arc::clone(&error));
        }
    }
}

impl std::fmt::Debug for NativeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeWatcher")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("recursive", &self.recursive)
            .field("running", &self.is_running())
            .finish()
    }
}

struct NativeListener {
    watcher: Weak<NativeWatcher>,
    tx: crossbeam_channel::Sender<DispatchMsg>,
}

impl Listener for NativeListener {
    fn on_event(&self, event: RawEvent) {
        let _ = self.tx.send(DispatchMsg { watcher: self.watcher.clone(), payload: Payload::Event(event) });
    }

    fn on_error(&self, error: Error) {
        let _ = self.tx.send(DispatchMsg {
            watcher: self.watcher.clone(),
            payload: Payload::Error(Arc::new(error)),
        });
    }
}

enum Payload {
    Event(RawEvent),
    Error(Arc<Error>),
}

/// A message handed from a backend thread to the cooperative dispatch thread (§5).
pub struct DispatchMsg {
    watcher: Weak<NativeWatcher>,
    payload: Payload,
}

/// Spawn the single cooperative dispatch thread that serializes delivery of raw
/// backend events to [`NativeWatcher`]s (and from there to subscriptions).
pub fn spawn_dispatch_thread() -> crossbeam_channel::Sender<DispatchMsg> {
    let (tx, rx) = crossbeam_channel::unbounded::<DispatchMsg>();
    thread_spawn(rx);
    tx
}

fn thread_spawn(rx: crossbeam_channel::Receiver<DispatchMsg>) {
    std::thread::Builder::new()
        .name("pathwatch-dispatch".into())
        .spawn(move || {
            for msg in rx {
                if let Some(watcher) = msg.watcher.upgrade() {
                    match msg.payload {
                        Payload::Event(event) => watcher.dispatch_event(event),
                        Payload::Error(error) => watcher.dispatch_error(error),
                    }
                }
            }
        })
        .expect("failed to spawn pathwatch dispatch thread");
}
