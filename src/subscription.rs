//! Path watcher / subscription (§4.2): presents a stable per-subscription view of
//! change events regardless of which native watcher currently backs it, migrating
//! atomically between native watchers when the registry consolidates or splits.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Invoked by [`Subscription::close`] to tell the registry a subscriber is gone.
/// Kept as an injected closure (rather than a direct call into a global) so this
/// module stays testable without standing up the crate-level singleton.
pub(crate) type DetachFn = Arc<dyn Fn(&Path, u64) + Send + Sync>;

use crate::backend::RawEvent;
use crate::error::Error;
use crate::event::PublicEvent;
use crate::native::{NativeWatcher, Observer};
use crate::translate::{self, TranslateContext};

/// The user-facing callback signature (§6): invoked once per delivered event.
pub type Callback = Box<dyn FnMut(PublicEvent) + Send + 'static>;

struct Translating {
    target_path: PathBuf,
    normalized_path: PathBuf,
}

struct Inner {
    /// The path originally passed to [`crate::watch`], before canonicalization.
    #[allow(dead_code)]
    watched_path: PathBuf,
    /// The canonical directory this subscription is keyed under in the registry tree.
    /// Unlike `translating.normalized_path`, this never changes across a rename — it
    /// is the `P` the registry's `attach`/`detach` were called with (§4.1).
    registry_path: PathBuf,
    is_watching_parent: bool,
    /// Whether `target_path` already existed when this subscription was created, used
    /// by the `Add` suppression rule (§4.2).
    existed_at_subscribe: bool,
    translating: Mutex<Translating>,
    native: Mutex<Option<Arc<NativeWatcher>>>,
    callback: Mutex<Callback>,
    error_tx: crossbeam_channel::Sender<Arc<Error>>,
    error_rx: crossbeam_channel::Receiver<Arc<Error>>,
    active: AtomicBool,
    id: u64,
    detach: DetachFn,
    closing_all: Arc<AtomicBool>,
}

/// A live, user-facing subscription on one path (§3, §4.2).
///
/// Dropping the last clone of a subscription closes it, the same way the teacher's
/// `Watcher` implementations stop their thread on `Drop`.
pub struct Subscription {
    inner: Arc<Inner>,
}

impl Subscription {
    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn registry_path(&self) -> &Path {
        &self.inner.registry_path
    }

    pub(crate) fn new(
        id: u64,
        watched_path: PathBuf,
        registry_path: PathBuf,
        target_path: PathBuf,
        normalized_path: PathBuf,
        is_watching_parent: bool,
        existed_at_subscribe: bool,
        callback: Callback,
        detach: DetachFn,
        closing_all: Arc<AtomicBool>,
    ) -> Self {
        let (error_tx, error_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            watched_path,
            registry_path,
            is_watching_parent,
            existed_at_subscribe,
            translating: Mutex::new(Translating { target_path, normalized_path }),
            native: Mutex::new(None),
            callback: Mutex::new(callback),
            error_tx,
            error_rx,
            active: AtomicBool::new(true),
            id,
            detach,
            closing_all,
        });
        Self { inner }
    }

    /// Receiver for backend delivery errors that do not tear down the subscription
    /// (§7: "backend delivery error on a live subscription").
    pub fn errors(&self) -> crossbeam_channel::Receiver<Arc<Error>> {
        self.inner.error_rx.clone()
    }

    /// Build the [`Observer`] bundle the registry hands to whichever native watcher
    /// this subscription ends up bound to.
    pub(crate) fn observer(&self) -> Observer {
        Inner::make_observer(&self.inner)
    }

    pub(crate) fn bind(&self, native: Arc<NativeWatcher>) {
        *self.inner.native.lock().unwrap() = Some(native);
    }

    /// Idempotent (§5 "Cancellation"): marks the subscription inactive, detaches it
    /// from whichever native watcher currently backs it, and guarantees no further
    /// callbacks.
    pub fn close(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            (self.inner.detach)(&self.inner.registry_path, self.inner.id);
            *self.inner.native.lock().unwrap() = None;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn handle_raw_event(self: &Arc<Self>, event: RawEvent) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let (ctx_target, ctx_normalized) = {
            let t = self.translating.lock().unwrap();
            (t.target_path.clone(), t.normalized_path.clone())
        };

        // Suppression rule (§4.2): an `Add` for the exact target this subscription was
        // created on is spurious if the target already existed at subscribe time.
        if self.existed_at_subscribe
            && matches!(event.action, crate::backend::RawAction::Add)
            && event.new_path() == ctx_target
        {
            return;
        }

        let ctx = TranslateContext {
            target_path: &ctx_target,
            normalized_path: &ctx_normalized,
            is_watching_parent: self.is_watching_parent,
        };
        let out = translate::translate(&event, &ctx);

        if out.new_target_path.is_some() || out.new_normalized_path.is_some() {
            let mut t = self.translating.lock().unwrap();
            if let Some(new_target) = out.new_target_path {
                t.target_path = new_target;
            }
            if let Some(new_normalized) = out.new_normalized_path {
                t.normalized_path = new_normalized;
            }
        }

        if let Some(public_event) = out.event {
            self.deliver(public_event);
        }
    }

    fn deliver(self: &Arc<Self>, event: PublicEvent) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        // Errors from user callbacks must never propagate into the dispatch loop
        // (§7): `catch_unwind` wraps the single invocation point.
        let mut callback = self.callback.lock().unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            (*callback)(event);
        }));
        if let Err(_panic) = result {
            log::error!(target: "pathwatch::subscription", "subscription callback panicked");
        }
    }

    fn handle_error(self: &Arc<Self>, error: Arc<Error>) {
        let _ = self.error_tx.send(error);
    }

    /// Re-attach protocol step 2 (§4.2): migrate to `replacement` if it still covers
    /// this subscription, else ignore.
    fn handle_should_detach(self: &Arc<Self>, replacement: Arc<NativeWatcher>, stopped_path: PathBuf) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if self.closing_all.load(Ordering::SeqCst) {
            return;
        }

        let normalized_path = self.translating.lock().unwrap().normalized_path.clone();
        let mut current = self.native.lock().unwrap();

        let current_is_replacement = current.as_ref().is_some_and(|n| Arc::ptr_eq(n, &replacement));
        if current_is_replacement {
            return;
        }
        // Only react if the watcher that's leaving is actually the one we're on, or
        // if the replacement still covers us (defends against a stale broadcast from
        // a watcher we already migrated away from).
        let our_native_is_stopping = current.as_ref().is_some_and(|n| n.path == stopped_path);
        if !our_native_is_stopping {
            return;
        }
        if !normalized_path.starts_with(&replacement.path) && normalized_path != replacement.path {
            return;
        }

        if replacement.subscribe(self.id, Inner::make_observer(self)).is_ok() {
            *current = Some(replacement);
        }
    }

    /// Re-attach protocol step 3 (§4.2): clear our native reference only if the
    /// stopping native is ours (it may not be, if we already migrated away from it).
    fn handle_will_stop(self: &Arc<Self>) {
        // Nothing to do here directly: `handle_should_detach` already updates
        // `native` before the old watcher's `force_stop` emits `will-stop`, and
        // `close()` clears `native` itself. This hook exists so a future native
        // watcher implementation that emits `will-stop` without a prior
        // `should-detach` (e.g. an unexpected backend failure) still has a defined,
        // inert landing spot instead of a missing callback.
    }

    fn make_observer(self: &Arc<Self>) -> Observer {
        let on_change = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);
        let on_should_detach = Arc::downgrade(self);
        let on_will_stop = Arc::downgrade(self);
        Observer {
            on_change: Arc::new(move |event: RawEvent| {
                if let Some(inner) = on_change.upgrade() {
                    Inner::handle_raw_event(&inner, event);
                }
            }),
            on_error: Arc::new(move |error: Arc<Error>| {
                if let Some(inner) = on_error.upgrade() {
                    Inner::handle_error(&inner, error);
                }
            }),
            on_should_detach: Arc::new(move |replacement: Arc<NativeWatcher>, stopped_path: PathBuf| {
                if let Some(inner) = on_should_detach.upgrade() {
                    Inner::handle_should_detach(&inner, replacement, stopped_path);
                }
            }),
            on_will_stop: Arc::new(move || {
                if let Some(inner) = on_will_stop.upgrade() {
                    Inner::handle_will_stop(&inner);
                }
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn sub(is_watching_parent: bool, target: &str, normalized: &str, existed: bool) -> Subscription {
        let (tx, _rx) = mpsc::channel::<PublicEvent>();
        Subscription::new(
            1,
            PathBuf::from(normalized),
            PathBuf::from(normalized),
            PathBuf::from(target),
            PathBuf::from(normalized),
            is_watching_parent,
            existed,
            Box::new(move |ev| {
                let _ = tx.send(ev);
            }),
            Arc::new(|_: &Path, _: u64| {}),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn new_subscription_starts_active_with_no_native() {
        let s = sub(false, "/a", "/a", false);
        assert!(s.inner.active.load(Ordering::SeqCst));
        assert!(s.inner.native.lock().unwrap().is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let s = sub(false, "/a", "/a", false);
        s.close();
        s.close();
        assert!(!s.inner.active.load(Ordering::SeqCst));
    }
}
