//! The public event type delivered to subscription callbacks.

use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The kind of a [`PublicEvent`].
///
/// This is deliberately a small, closed set — the translator (see
/// [`crate::translate`]) collapses the much larger space of raw backend actions into
/// these four, so that callbacks behave the same on every platform.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[non_exhaustive]
pub enum EventKind {
    /// The subscription's target was created. Carries no path.
    Create,
    /// Something changed inside the watched directory, or the watched file's contents
    /// changed. Carries no path.
    Change,
    /// The subscription's exact target was deleted.
    Delete,
    /// The subscription's target was renamed. Carries the new path.
    Rename,
}

impl EventKind {
    /// The string form used at the public callback boundary (§6 of the design).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Change => "change",
            EventKind::Delete => "delete",
            EventKind::Rename => "rename",
        }
    }
}

/// A single public notification delivered to a subscription's callback.
///
/// `path` follows the convention from the design: `None` for a delete of the exact
/// target, `Some(empty)` for a directory-contents change, and `Some(new_path)` for a
/// rename.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PublicEvent {
    /// What happened.
    pub kind: EventKind,
    /// See the type-level doc for the `None`/empty/full-path convention.
    pub path: Option<PathBuf>,
}

impl PublicEvent {
    /// A `create` event for the subscription's own target.
    pub fn create() -> Self {
        Self {
            kind: EventKind::Create,
            path: Some(PathBuf::new()),
        }
    }

    /// A `change` event with an empty path (directory-contents change, or a watched
    /// file's own content changing).
    pub fn change() -> Self {
        Self {
            kind: EventKind::Change,
            path: Some(PathBuf::new()),
        }
    }

    /// A `delete` of the subscription's exact target. Carries no path.
    pub fn delete() -> Self {
        Self {
            kind: EventKind::Delete,
            path: None,
        }
    }

    /// A `rename` of the subscription's target to `new_path`.
    pub fn rename(new_path: PathBuf) -> Self {
        Self {
            kind: EventKind::Rename,
            path: Some(new_path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_callback_contract() {
        assert_eq!(EventKind::Create.as_str(), "create");
        assert_eq!(EventKind::Change.as_str(), "change");
        assert_eq!(EventKind::Delete.as_str(), "delete");
        assert_eq!(EventKind::Rename.as_str(), "rename");
    }

    #[test]
    fn delete_carries_no_path() {
        assert_eq!(PublicEvent::delete().path, None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn rename_event_round_trips_through_json() {
        let event = PublicEvent::rename(PathBuf::from("/watched/new.txt"));
        let json = serde_json::to_string(&event).unwrap();
        let back: PublicEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(json.contains("\"kind\":\"rename\""));
    }
}
