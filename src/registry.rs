//! The registry tree (§4.1): a path-trie deciding, for every subscription attach or
//! detach, whether to create a native watcher, reuse an ancestor's, relocate
//! descendants under a new common-ancestor watcher, or split a watcher whose primary
//! subscriber just left.
//!
//! Nodes live in a flat arena addressed by [`NodeId`], the way the teacher's
//! consolidation tree in `backend-poll-tree` avoids building `Rc<RefCell<_>>` parent
//! links for a structure that is mutated from a single thread anyway. A node no
//! longer reachable from the root after a consolidation or split is simply left
//! behind in the arena (a tombstone) rather than deallocated.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::Backend;
use crate::config::RegistryConfig;
use crate::error::Result;
use crate::native::{NativeWatcher, Observer};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct NodeId(usize);

struct LeafData {
    native: Arc<NativeWatcher>,
    /// Full canonical paths of subscriptions this leaf serves on behalf of a
    /// descendant directory (never includes the leaf's own path).
    child_paths: HashSet<PathBuf>,
    /// Ids of subscriptions watching this leaf's own path directly (as opposed to
    /// being reused/consolidated onto it via `child_paths`). Narrowing a leaf down
    /// to a single remaining child path is only safe while this is empty — otherwise
    /// the leaf's own subscriber would be left with no native watcher covering it.
    own_ids: HashSet<u64>,
}

struct Node {
    path: PathBuf,
    /// The key this node is registered under in its parent's `children` map; unused
    /// on the root.
    segment: OsString,
    parent: Option<NodeId>,
    children: HashMap<OsString, NodeId>,
    leaf: Option<LeafData>,
}

fn segments(path: &Path) -> Vec<OsString> {
    path.components().map(|c| c.as_os_str().to_os_string()).collect()
}

fn join(segments: &[OsString]) -> PathBuf {
    let mut path = PathBuf::new();
    for segment in segments {
        path.push(segment);
    }
    path
}

struct WalkResult {
    end_node: NodeId,
    end_matched: usize,
    /// The deepest leaf encountered walking from the root toward the target, if any.
    deepest_leaf: Option<(NodeId, usize)>,
}

/// The tree of native watchers backing every active subscription.
pub struct RegistryTree {
    arena: Vec<Node>,
    root: NodeId,
    config: RegistryConfig,
    backend: Arc<dyn Backend>,
    dispatch: crossbeam_channel::Sender<crate::native::DispatchMsg>,
}

impl RegistryTree {
    pub fn new(
        config: RegistryConfig,
        backend: Arc<dyn Backend>,
        dispatch: crossbeam_channel::Sender<crate::native::DispatchMsg>,
    ) -> Self {
        let root = Node {
            path: PathBuf::new(),
            segment: OsString::new(),
            parent: None,
            children: HashMap::new(),
            leaf: None,
        };
        Self { arena: vec![root], root: NodeId(0), config, backend, dispatch }
    }

    /// All directories currently backed by a distinct native watcher.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.arena.iter().filter_map(|n| n.leaf.as_ref().map(|_| n.path.clone())).collect()
    }

    /// The number of distinct native watchers currently alive.
    pub fn native_watcher_count(&self) -> usize {
        self.arena.iter().filter(|n| n.leaf.is_some()).count()
    }

    /// Stop every native watcher and reset the tree to empty.
    pub fn reset(&mut self) {
        for node in &mut self.arena {
            if let Some(leaf) = node.leaf.take() {
                leaf.native.force_stop();
            }
            node.children.clear();
        }
        self.arena.truncate(1);
    }

    fn walk(&self, segs: &[OsString]) -> WalkResult {
        let mut cur = self.root;
        let mut matched = 0;
        let mut deepest_leaf = None;
        loop {
            if self.arena[cur.0].leaf.is_some() {
                deepest_leaf = Some((cur, matched));
            }
            if matched == segs.len() {
                break;
            }
            match self.arena[cur.0].children.get(&segs[matched]) {
                Some(&child) => {
                    cur = child;
                    matched += 1;
                }
                None => break,
            }
        }
        WalkResult { end_node: cur, end_matched: matched, deepest_leaf }
    }

    /// Create any interior nodes missing along `segs` and return the node at the
    /// full path, whatever it currently holds (interior or, if already present,
    /// a pre-existing leaf).
    fn ensure_path(&mut self, segs: &[OsString]) -> NodeId {
        let mut cur = self.root;
        let mut matched = 0;
        while matched < segs.len() {
            let segment = segs[matched].clone();
            let next = self.arena[cur.0].children.get(&segment).copied();
            cur = match next {
                Some(child) => child,
                None => {
                    let id = NodeId(self.arena.len());
                    self.arena.push(Node {
                        path: join(&segs[..=matched]),
                        segment: segment.clone(),
                        parent: Some(cur),
                        children: HashMap::new(),
                        leaf: None,
                    });
                    self.arena[cur.0].children.insert(segment, id);
                    id
                }
            };
            matched += 1;
        }
        cur
    }

    fn collect_leaves(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_leaves_into(node, &mut out);
        out
    }

    fn collect_leaves_into(&self, node: NodeId, out: &mut Vec<NodeId>) {
        if self.arena[node.0].leaf.is_some() {
            out.push(node);
        }
        let children: Vec<NodeId> = self.arena[node.0].children.values().copied().collect();
        for child in children {
            self.collect_leaves_into(child, out);
        }
    }

    fn collapse_upward(&mut self, mut node: NodeId) {
        loop {
            let (parent, childless, has_leaf) = {
                let n = &self.arena[node.0];
                (n.parent, n.children.is_empty(), n.leaf.is_some())
            };
            if has_leaf || !childless {
                break;
            }
            let Some(parent_id) = parent else { break };
            let segment = self.arena[node.0].segment.clone();
            self.arena[parent_id.0].children.remove(&segment);
            node = parent_id;
        }
    }

    fn new_native(&self, path: PathBuf) -> Arc<NativeWatcher> {
        NativeWatcher::new(path, self.backend.is_recursive(), Arc::clone(&self.backend), self.dispatch.clone())
    }

    /// Attach a new subscription at canonical directory `target`, registering
    /// `observer` under subscriber id `id`. Returns the native watcher the
    /// subscription ends up bound to.
    pub fn attach(&mut self, target: &Path, id: u64, observer: Observer) -> Result<Arc<NativeWatcher>> {
        let segs = segments(target);
        let walk = self.walk(&segs);

        if let Some((leaf_node, leaf_matched)) = walk.deepest_leaf {
            if leaf_matched == segs.len() {
                // `target` is already, exactly, the directory backing this leaf: the
                // same (path, recursive) pair can only ever have one native watcher.
                let native = self.arena[leaf_node.0].leaf.as_ref().unwrap().native.clone();
                native.subscribe(id, observer)?;
                self.arena[leaf_node.0].leaf.as_mut().unwrap().own_ids.insert(id);
                return Ok(native);
            }
            if self.config.reuse_ancestor_watchers() {
                self.arena[leaf_node.0].leaf.as_mut().unwrap().child_paths.insert(target.to_path_buf());
                let native = self.arena[leaf_node.0].leaf.as_ref().unwrap().native.clone();
                if let Err(err) = native.subscribe(id, observer) {
                    self.arena[leaf_node.0].leaf.as_mut().unwrap().child_paths.remove(target);
                    return Err(err);
                }
                return Ok(native);
            }
            return self.create_standalone_leaf(&segs, target, id, observer);
        }

        if walk.end_matched == segs.len() {
            let leaves = self.collect_leaves(walk.end_node);
            if !leaves.is_empty() && self.config.relocate_descendant_watchers() {
                return self.consolidate_children(walk.end_node, target, leaves, id, observer);
            }
            return self.create_standalone_leaf(&segs, target, id, observer);
        }

        let leaves = self.collect_leaves(walk.end_node);
        if leaves.is_empty() || walk.end_node == self.root {
            return self.create_standalone_leaf(&segs, target, id, observer);
        }
        let distance = segs.len() - walk.end_matched;
        if self.config.merge_watchers_with_common_ancestors() && self.config.within_cap(distance) {
            return self.consolidate_common_ancestor(walk.end_node, target, leaves, id, observer);
        }
        self.create_standalone_leaf(&segs, target, id, observer)
    }

    fn create_standalone_leaf(
        &mut self,
        segs: &[OsString],
        target: &Path,
        id: u64,
        observer: Observer,
    ) -> Result<Arc<NativeWatcher>> {
        let node = self.ensure_path(segs);
        let native = self.new_native(target.to_path_buf());
        if let Err(err) = native.subscribe(id, observer) {
            self.collapse_upward(node);
            return Err(err);
        }
        self.arena[node.0].leaf =
            Some(LeafData { native: native.clone(), child_paths: HashSet::new(), own_ids: HashSet::from([id]) });
        Ok(native)
    }

    fn consolidate_children(
        &mut self,
        node: NodeId,
        target: &Path,
        leaves: Vec<NodeId>,
        id: u64,
        observer: Observer,
    ) -> Result<Arc<NativeWatcher>> {
        let new_native = self.new_native(target.to_path_buf());
        new_native.subscribe(id, observer)?;

        let mut child_paths = HashSet::new();
        for leaf in &leaves {
            let old_native = self.arena[leaf.0].leaf.take().unwrap().native;
            old_native.should_detach(Arc::clone(&new_native));
            old_native.force_stop();
            child_paths.insert(self.arena[leaf.0].path.clone());
        }
        self.arena[node.0].children.clear();
        self.arena[node.0].leaf =
            Some(LeafData { native: new_native.clone(), child_paths, own_ids: HashSet::from([id]) });
        Ok(new_native)
    }

    fn consolidate_common_ancestor(
        &mut self,
        ancestor: NodeId,
        target: &Path,
        leaves: Vec<NodeId>,
        id: u64,
        observer: Observer,
    ) -> Result<Arc<NativeWatcher>> {
        let ancestor_path = self.arena[ancestor.0].path.clone();
        let new_native = self.new_native(ancestor_path);
        new_native.subscribe(id, observer)?;

        let mut child_paths = HashSet::new();
        child_paths.insert(target.to_path_buf());
        for leaf in &leaves {
            let old_native = self.arena[leaf.0].leaf.take().unwrap().native;
            old_native.should_detach(Arc::clone(&new_native));
            old_native.force_stop();
            child_paths.insert(self.arena[leaf.0].path.clone());
        }
        self.arena[ancestor.0].children.clear();
        self.arena[ancestor.0].leaf =
            Some(LeafData { native: new_native.clone(), child_paths, own_ids: HashSet::new() });
        Ok(new_native)
    }

    /// Detach subscriber `id` previously attached at `target`.
    pub fn detach(&mut self, target: &Path, id: u64) {
        let segs = segments(target);
        let walk = self.walk(&segs);
        let Some((leaf_node, matched)) = walk.deepest_leaf else { return };

        let native = self.arena[leaf_node.0].leaf.as_ref().unwrap().native.clone();
        native.unsubscribe(id);

        if matched == segs.len() {
            let leaf = self.arena[leaf_node.0].leaf.as_mut().unwrap();
            leaf.own_ids.remove(&id);
            let child_paths = leaf.child_paths.clone();
            if !child_paths.is_empty() {
                self.split_leaf(leaf_node, child_paths);
            } else {
                self.arena[leaf_node.0].leaf = None;
                self.collapse_upward(leaf_node);
            }
        } else {
            let leaf = self.arena[leaf_node.0].leaf.as_mut().unwrap();
            leaf.child_paths.remove(target);
            let remaining = leaf.child_paths.len();
            // Narrowing tears down the leaf's native watcher and broadcasts
            // should-detach to every subscriber on it. That's only safe when nothing
            // still depends on this leaf's own path — otherwise its direct subscriber
            // (e.g. the ancestor `watch()` this leaf's children were reused from) would
            // be left with no native watcher covering it at all.
            if remaining == 1 && self.config.relocate_ancestor_watchers() && leaf.own_ids.is_empty() {
                let only = leaf.child_paths.iter().next().cloned().unwrap();
                self.narrow_leaf(leaf_node, only);
            } else if remaining == 0 && !native.is_running() {
                self.arena[leaf_node.0].leaf = None;
                self.collapse_upward(leaf_node);
            }
        }
    }

    fn split_leaf(&mut self, leaf_node: NodeId, child_paths: HashSet<PathBuf>) {
        let old_native = self.arena[leaf_node.0].leaf.take().unwrap().native;
        for child_path in child_paths {
            let segs = segments(&child_path);
            let node = self.ensure_path(&segs);
            let new_native = self.new_native(child_path);
            old_native.should_detach(Arc::clone(&new_native));
            self.arena[node.0].leaf =
                Some(LeafData { native: new_native, child_paths: HashSet::new(), own_ids: HashSet::new() });
        }
        old_native.force_stop();
        self.collapse_upward(leaf_node);
    }

    fn narrow_leaf(&mut self, leaf_node: NodeId, remaining: PathBuf) {
        let old_native = self.arena[leaf_node.0].leaf.take().unwrap().native;
        let segs = segments(&remaining);
        let node = self.ensure_path(&segs);
        let new_native = self.new_native(remaining);
        old_native.should_detach(Arc::clone(&new_native));
        self.arena[node.0].leaf =
            Some(LeafData { native: new_native, child_paths: HashSet::new(), own_ids: HashSet::new() });
        old_native.force_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Listener, RawEvent};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    /// A backend that never fails and hands out sequential handles, so tests can
    /// exercise registry structure without touching the filesystem.
    struct CountingBackend {
        next: AtomicI32,
        live: Mutex<HashSet<i32>>,
    }

    impl CountingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self { next: AtomicI32::new(0), live: Mutex::new(HashSet::new()) })
        }

        fn live_count(&self) -> usize {
            self.live.lock().unwrap().len()
        }
    }

    impl Backend for CountingBackend {
        fn add_watch(&self, _directory: &Path, _listener: Box<dyn Listener>) -> Result<i32> {
            let handle = self.next.fetch_add(1, Ordering::SeqCst);
            self.live.lock().unwrap().insert(handle);
            Ok(handle)
        }

        fn remove_watch(&self, handle: i32) -> Result<()> {
            self.live.lock().unwrap().remove(&handle);
            Ok(())
        }
    }

    fn observer() -> Observer {
        Observer {
            on_change: Arc::new(|_: RawEvent| {}),
            on_error: Arc::new(|_| {}),
            on_should_detach: Arc::new(|_, _| {}),
            on_will_stop: Arc::new(|| {}),
        }
    }

    fn tree(config: RegistryConfig, backend: Arc<dyn Backend>) -> RegistryTree {
        let (tx, _rx) = crossbeam_channel::unbounded();
        RegistryTree::new(config, backend, tx)
    }

    #[test]
    fn standalone_watches_get_independent_leaves() {
        let backend = CountingBackend::new();
        let mut t = tree(RegistryConfig::flat_default(), backend);
        t.attach(Path::new("/a/b"), 1, observer()).unwrap();
        t.attach(Path::new("/c/d"), 2, observer()).unwrap();
        assert_eq!(t.native_watcher_count(), 2);
    }

    #[test]
    fn sibling_consolidation_under_common_ancestor() {
        let backend = CountingBackend::new();
        let config = RegistryConfig::flat_default().with_merge_watchers_with_common_ancestors(true).with_max_common_ancestor_level(2);
        let mut t = tree(config, Arc::clone(&backend) as Arc<dyn Backend>);
        t.attach(Path::new("/root/a"), 1, observer()).unwrap();
        t.attach(Path::new("/root/b"), 2, observer()).unwrap();
        assert_eq!(t.native_watcher_count(), 1);
        assert_eq!(t.watched_paths(), vec![PathBuf::from("/root")]);
        assert_eq!(backend.live_count(), 1);
    }

    #[test]
    fn cousin_consolidation_respects_cap() {
        let backend = CountingBackend::new();
        let config = RegistryConfig::flat_default().with_merge_watchers_with_common_ancestors(true).with_max_common_ancestor_level(2);
        let mut t = tree(config, Arc::clone(&backend) as Arc<dyn Backend>);
        t.attach(Path::new("/root/x/a"), 1, observer()).unwrap();
        // distance from /root to /root/y/b is 2, within cap.
        t.attach(Path::new("/root/y/b"), 2, observer()).unwrap();
        assert_eq!(t.native_watcher_count(), 1);

        let backend2 = CountingBackend::new();
        let config2 = config.with_max_common_ancestor_level(1);
        let mut t2 = tree(config2, Arc::clone(&backend2) as Arc<dyn Backend>);
        t2.attach(Path::new("/root/x/a"), 1, observer()).unwrap();
        t2.attach(Path::new("/root/y/b"), 2, observer()).unwrap();
        // distance 2 exceeds cap 1: both stay standalone.
        assert_eq!(t2.native_watcher_count(), 2);
    }

    #[test]
    fn ancestor_reuse_then_split_on_close() {
        let backend = CountingBackend::new();
        let config = RegistryConfig::flat_default().with_reuse_ancestor_watchers(true);
        let mut t = tree(config, Arc::clone(&backend) as Arc<dyn Backend>);
        t.attach(Path::new("/root"), 1, observer()).unwrap();
        t.attach(Path::new("/root/child"), 2, observer()).unwrap();
        assert_eq!(t.native_watcher_count(), 1);

        t.detach(Path::new("/root"), 1);
        // the ancestor's primary subscriber left but a child_path remains: split.
        assert_eq!(t.native_watcher_count(), 1);
        assert_eq!(t.watched_paths(), vec![PathBuf::from("/root/child")]);
    }

    #[test]
    fn detach_collapses_empty_leaf() {
        let backend = CountingBackend::new();
        let mut t = tree(RegistryConfig::flat_default(), Arc::clone(&backend) as Arc<dyn Backend>);
        t.attach(Path::new("/a/b/c"), 1, observer()).unwrap();
        t.detach(Path::new("/a/b/c"), 1);
        assert_eq!(t.native_watcher_count(), 0);
        assert_eq!(backend.live_count(), 0);
    }

    #[test]
    fn narrowing_ancestor_leaf_after_detach() {
        let backend = CountingBackend::new();
        let config = RegistryConfig::flat_default()
            .with_merge_watchers_with_common_ancestors(true)
            .with_max_common_ancestor_level(2)
            .with_relocate_ancestor_watchers(true);
        let mut t = tree(config, Arc::clone(&backend) as Arc<dyn Backend>);
        t.attach(Path::new("/root/a"), 1, observer()).unwrap();
        t.attach(Path::new("/root/b"), 2, observer()).unwrap();
        assert_eq!(t.native_watcher_count(), 1);

        t.detach(Path::new("/root/a"), 1);
        assert_eq!(t.native_watcher_count(), 1);
        assert_eq!(t.watched_paths(), vec![PathBuf::from("/root/b")]);
    }

    #[test]
    fn narrow_leaf_does_not_orphan_ancestors_own_subscriber() {
        let backend = CountingBackend::new();
        let config = RegistryConfig::flat_default()
            .with_reuse_ancestor_watchers(true)
            .with_relocate_ancestor_watchers(true);
        let mut t = tree(config, Arc::clone(&backend) as Arc<dyn Backend>);
        t.attach(Path::new("/root"), 1, observer()).unwrap();
        t.attach(Path::new("/root/a"), 2, observer()).unwrap();
        t.attach(Path::new("/root/b"), 3, observer()).unwrap();
        assert_eq!(t.native_watcher_count(), 1);

        // Closing the sibling child_path must not narrow the leaf down to /root/b:
        // /root's own direct subscriber (id 1) would be left uncovered.
        t.detach(Path::new("/root/a"), 2);
        assert_eq!(t.native_watcher_count(), 1);
        assert_eq!(t.watched_paths(), vec![PathBuf::from("/root")]);

        // Once the ancestor's own subscriber actually leaves, the remaining child_path
        // is free to split out on its own.
        t.detach(Path::new("/root"), 1);
        assert_eq!(t.native_watcher_count(), 1);
        assert_eq!(t.watched_paths(), vec![PathBuf::from("/root/b")]);
    }

    #[test]
    fn reset_stops_everything() {
        let backend = CountingBackend::new();
        let mut t = tree(RegistryConfig::flat_default(), Arc::clone(&backend) as Arc<dyn Backend>);
        t.attach(Path::new("/a"), 1, observer()).unwrap();
        t.attach(Path::new("/b"), 2, observer()).unwrap();
        t.reset();
        assert_eq!(t.native_watcher_count(), 0);
        assert_eq!(backend.live_count(), 0);
    }
}
