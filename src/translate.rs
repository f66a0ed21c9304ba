//! The event translator (§4.2 core logic): a pure function turning one raw backend
//! event into zero or one public event, given the subscribing path watcher's current
//! view of the world.
//!
//! Kept free of any I/O or locking so every branch of the mapping table can be
//! exercised directly in `#[test]`, the way the teacher tests `translate_flags` in
//! `fsevent.rs` against raw flag combinations rather than a live stream.

use std::path::{Path, PathBuf};

use crate::backend::{RawAction, RawEvent};
use crate::event::{EventKind, PublicEvent};

/// The parts of a subscription's state the translator needs to read.
pub struct TranslateContext<'a> {
    pub target_path: &'a Path,
    pub normalized_path: &'a Path,
    pub is_watching_parent: bool,
}

/// What the translator decided, including any change to the subscription's own
/// bookkeeping that the caller must apply (renames can move the watched target).
#[derive(Default)]
pub struct TranslateOutput {
    pub event: Option<PublicEvent>,
    pub new_target_path: Option<PathBuf>,
    pub new_normalized_path: Option<PathBuf>,
}

fn eq_target(p: &Path, target: &Path) -> bool {
    p == target
}

/// Strictly inside: `p` is a descendant of `normalized`, never `normalized` itself.
fn inside(p: &Path, normalized: &Path) -> bool {
    p != normalized && p.starts_with(normalized)
}

/// Translate one raw event. `ctx` reflects the subscription's state *before* this
/// event; if the result carries `new_target_path`/`new_normalized_path`, the caller
/// must commit them before the next call.
pub fn translate(event: &RawEvent, ctx: &TranslateContext<'_>) -> TranslateOutput {
    let new_path = event.dir.join(&event.filename);
    let old_path = event.old_filename.as_ref().map(|name| event.dir.join(name));

    match event.action {
        RawAction::Moved => translate_moved(&new_path, old_path.as_deref(), ctx),
        _ => translate_simple(event.action, &new_path, ctx),
    }
}

fn translate_simple(action: RawAction, new_path: &Path, ctx: &TranslateContext<'_>) -> TranslateOutput {
    if !inside(new_path, ctx.normalized_path) {
        return TranslateOutput::default();
    }

    let hit = eq_target(new_path, ctx.target_path);
    let kind = match (action, ctx.is_watching_parent, hit) {
        (RawAction::Add, true, true) => Some(EventKind::Create),
        (RawAction::Add, true, false) => None,
        (RawAction::Add, false, true) => Some(EventKind::Create),
        (RawAction::Add, false, false) => Some(EventKind::Change),

        (RawAction::Delete, true, true) => Some(EventKind::Delete),
        (RawAction::Delete, true, false) => None,
        (RawAction::Delete, false, true) => None,
        (RawAction::Delete, false, false) => Some(EventKind::Change),

        (RawAction::Modified, true, true) => Some(EventKind::Change),
        (RawAction::Modified, true, false) => None,
        (RawAction::Modified, false, true) => None,
        (RawAction::Modified, false, false) => Some(EventKind::Change),

        (RawAction::Moved, ..) => unreachable!("Moved is handled by translate_moved"),
    };

    let Some(kind) = kind else { return TranslateOutput::default() };

    // `Delete` is only ever produced for the exact target (see the match table
    // above), so it is the only kind that carries no path.
    let path = if kind == EventKind::Delete { None } else { Some(PathBuf::new()) };

    TranslateOutput { event: Some(PublicEvent { kind, path }), ..Default::default() }
}

fn translate_moved(new_path: &Path, old_path: Option<&Path>, ctx: &TranslateContext<'_>) -> TranslateOutput {
    let new_inside = inside(new_path, ctx.normalized_path);
    let old_inside = old_path.is_some_and(|p| inside(p, ctx.normalized_path));
    if !new_inside && !old_inside {
        return TranslateOutput::default();
    }

    let new_hit = eq_target(new_path, ctx.target_path);
    let old_hit = old_path.is_some_and(|p| eq_target(p, ctx.target_path));
    let path_involved = new_hit || old_hit;

    if ctx.is_watching_parent && !path_involved {
        return TranslateOutput::default();
    }

    if !ctx.is_watching_parent && !path_involved {
        let new_parent_matches = new_path.parent() == Some(ctx.normalized_path);
        let old_parent_matches = old_path.and_then(Path::parent) == Some(ctx.normalized_path);
        return if new_parent_matches || old_parent_matches {
            TranslateOutput {
                event: Some(PublicEvent { kind: EventKind::Change, path: Some(PathBuf::new()) }),
                ..Default::default()
            }
        } else {
            TranslateOutput::default()
        };
    }

    let mut out = TranslateOutput::default();
    if new_inside && new_path != ctx.target_path {
        out.new_target_path = Some(new_path.to_path_buf());
        if ctx.is_watching_parent {
            out.new_normalized_path = new_path.parent().map(Path::to_path_buf);
        }
    }

    out.event = Some(match (old_inside, new_inside) {
        (true, true) => PublicEvent { kind: EventKind::Rename, path: Some(new_path.to_path_buf()) },
        (true, false) => PublicEvent { kind: EventKind::Delete, path: None },
        (false, true) => PublicEvent { kind: EventKind::Create, path: Some(new_path.to_path_buf()) },
        (false, false) => return out,
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RawAction;

    fn event(action: RawAction, dir: &str, filename: &str, old_filename: Option<&str>) -> RawEvent {
        RawEvent {
            handle: 0,
            action,
            dir: PathBuf::from(dir),
            filename: PathBuf::from(filename),
            old_filename: old_filename.map(PathBuf::from),
        }
    }

    fn ctx<'a>(target: &'a Path, normalized: &'a Path, parent: bool) -> TranslateContext<'a> {
        TranslateContext { target_path: target, normalized_path: normalized, is_watching_parent: parent }
    }

    #[test]
    fn create_of_child_in_directory_watch_reports_plain_change() {
        // A new entry appearing inside a watched directory is not a hit on the
        // directory itself, so it surfaces as `change`, not `create`.
        let target = PathBuf::from("/watched");
        let ev = event(RawAction::Add, "/watched", "new.txt", None);
        let out = translate(&ev, &ctx(&target, &target, false));
        assert_eq!(out.event.unwrap().kind, EventKind::Change);
    }

    #[test]
    fn recreation_of_the_watched_directory_itself_is_reported_as_create() {
        // The directory was removed and a new one appeared at the exact same path:
        // an exact hit on the target, not a suppressed self-recreation at subscribe
        // time (that suppression only ever applies to the very first `Add`).
        let target = PathBuf::from("/watched");
        let ev = event(RawAction::Add, "/", "watched", None);
        let out = translate(&ev, &ctx(&target, &target, false));
        assert_eq!(out.event.unwrap().kind, EventKind::Create);
    }

    #[test]
    fn create_of_watched_file_is_reported() {
        let target = PathBuf::from("/watched/file.txt");
        let normalized = PathBuf::from("/watched");
        let ev = event(RawAction::Add, "/watched", "file.txt", None);
        let out = translate(&ev, &ctx(&target, &normalized, true));
        assert_eq!(out.event.unwrap().kind, EventKind::Create);
    }

    #[test]
    fn add_of_unrelated_file_while_watching_a_file_is_dropped() {
        let target = PathBuf::from("/watched/file.txt");
        let normalized = PathBuf::from("/watched");
        let ev = event(RawAction::Add, "/watched", "other.txt", None);
        let out = translate(&ev, &ctx(&target, &normalized, true));
        assert!(out.event.is_none());
    }

    #[test]
    fn delete_of_exact_target_file_reports_null_path() {
        let target = PathBuf::from("/watched/file.txt");
        let normalized = PathBuf::from("/watched");
        let ev = event(RawAction::Delete, "/watched", "file.txt", None);
        let out = translate(&ev, &ctx(&target, &normalized, true));
        let public = out.event.unwrap();
        assert_eq!(public.kind, EventKind::Delete);
        assert_eq!(public.path, None);
    }

    #[test]
    fn delete_outside_directory_is_dropped() {
        let target = PathBuf::from("/watched");
        let ev = event(RawAction::Delete, "/elsewhere", "gone.txt", None);
        let out = translate(&ev, &ctx(&target, &target, false));
        assert!(out.event.is_none());
    }

    #[test]
    fn modify_of_directory_itself_is_dropped() {
        let target = PathBuf::from("/watched");
        // `dir` == parent of the directory, `filename` == the directory's own name.
        let ev = event(RawAction::Modified, "/", "watched", None);
        let out = translate(&ev, &ctx(&target, &target, false));
        assert!(out.event.is_none());
    }

    #[test]
    fn rename_of_sibling_in_watched_directory_reports_plain_change() {
        // Neither endpoint is the watched directory itself, so this is reported the
        // same as any other directory-contents change, not a `rename`.
        let target = PathBuf::from("/watched");
        let ev = event(RawAction::Moved, "/watched", "after.txt", Some("before.txt"));
        let out = translate(&ev, &ctx(&target, &target, false));
        let public = out.event.unwrap();
        assert_eq!(public.kind, EventKind::Change);
        assert_eq!(public.path, Some(PathBuf::new()));
    }

    #[test]
    fn rename_of_the_watched_directory_itself_is_undetectable() {
        // The directory's own rename moves it to a sibling path, which never satisfies
        // `inside` of itself — consistent across all three backends (see §4.4).
        let target = PathBuf::from("/watched");
        let ev = event(RawAction::Moved, "/", "renamed", Some("watched"));
        let out = translate(&ev, &ctx(&target, &target, false));
        assert!(out.event.is_none());
    }

    #[test]
    fn rename_of_watched_file_updates_target_and_normalized_path() {
        let target = PathBuf::from("/watched/old.txt");
        let normalized = PathBuf::from("/watched");
        let ev = event(RawAction::Moved, "/watched", "new.txt", Some("old.txt"));
        let out = translate(&ev, &ctx(&target, &normalized, true));
        assert_eq!(out.new_target_path, Some(PathBuf::from("/watched/new.txt")));
        assert_eq!(out.new_normalized_path, Some(PathBuf::from("/watched")));
        assert_eq!(out.event.unwrap().kind, EventKind::Rename);
    }

    #[test]
    fn rename_of_unrelated_sibling_is_dropped() {
        let target = PathBuf::from("/watched/file.txt");
        let normalized = PathBuf::from("/watched");
        let ev = event(RawAction::Moved, "/watched", "b.txt", Some("a.txt"));
        let out = translate(&ev, &ctx(&target, &normalized, true));
        assert!(out.event.is_none());
    }
}
