//! A backend that accepts watches and delivers nothing.
//!
//! Used as a trait-object sanity check and as a default when no platform backend is
//! compiled in.

use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use super::{Backend, Listener};
use crate::error::Result;

/// A [`Backend`] that never reports any events.
#[derive(Debug, Default)]
pub struct NullBackend {
    next_handle: AtomicI32,
}

impl NullBackend {
    /// Create a new, empty null backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for NullBackend {
    fn add_watch(&self, _directory: &Path, _listener: Box<dyn Listener>) -> Result<i32> {
        Ok(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn remove_watch(&self, _handle: i32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_safe_and_silent() {
        let backend: &dyn Backend = &NullBackend::new();
        let handle = backend.add_watch(Path::new("/"), Box::new(|_| {})).unwrap();
        assert!(handle >= 0);
        backend.remove_watch(handle).unwrap();
    }
}
