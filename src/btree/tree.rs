//! # Tree Engine
//!
//! The B+Tree operations: search, insert with split, delete with
//! rebalancing, ordered iteration, length, and the structural audit.
//!
//! ## Handle Model
//!
//! [`Tree`] is a handle around `Arc<Mutex<TreeCore>>`. The indirection is
//! not for thread safety (the tree is single-writer; callers serialize).
//! It exists so snapshot branches can hold weak references to their source
//! and so promoting a clone can swap state into a tree its owner holds
//! elsewhere.
//!
//! ## Mutation Shape
//!
//! Every mutating operation runs in two phases:
//!
//! ```text
//! 1. Read-only descent. Loads whatever the operation will touch
//!    (the root-to-leaf path; for deletes, also the adjacent siblings
//!    at every level). Host errors abort here, before anything moved.
//! 2. Copy-on-write descent along the recorded child indexes, then an
//!    ascent that refreshes separator keys and applies splits or
//!    borrow/merge rebalancing bottom-up. No host access in this phase.
//! ```
//!
//! The split of work is what gives puts and deletes their all-or-nothing
//! error behavior: a failed host read leaves the tree exactly as it was.
//!
//! ## Separator Algebra
//!
//! Interior entries are `(min key of subtree, child)`. Descent picks the
//! rightmost child whose key is ≤ the target. On the way back up each
//! parent re-stamps its entry with the child's current minimum, which is
//! how a new global minimum or a deleted leaf head propagates. Splits cut
//! at `⌈n/2⌉`; an overfull root splits into a new root one level deeper;
//! an interior root left with a single child collapses away.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use eyre::{ensure, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::btree::codec;
use crate::btree::node::{
    ensure_resident, make_writable, new_shared, Locator, Node, NodeContent, SharedNode,
};
use crate::error::TreeError;
use crate::host::{Host, KeyCompare};

/// Persistent, ordered key→value map: a copy-on-write B+Tree whose nodes
/// live in a host-managed append-only log.
///
/// Not thread-safe. All operations take `&self`; the handle provides
/// interior mutability so clones and their sources can observe each other,
/// but callers are expected to serialize access.
pub struct Tree<K, V, H> {
    pub(crate) core: Arc<Mutex<TreeCore<K, V, H>>>,
}

impl<K, V, H> std::fmt::Debug for Tree<K, V, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree").finish_non_exhaustive()
    }
}

pub(crate) struct TreeCore<K, V, H> {
    pub(crate) k_max: usize,
    pub(crate) compare: KeyCompare<K>,
    pub(crate) host: Arc<H>,
    pub(crate) root: SharedNode<K, V>,
    /// Entry count, maintained incrementally. `None` after `load` until
    /// the first count walk.
    pub(crate) len: Option<usize>,
    pub(crate) source: Option<Weak<Mutex<TreeCore<K, V, H>>>>,
    pub(crate) clones: Vec<Weak<Mutex<TreeCore<K, V, H>>>>,
}

struct SubtreeSummary<K> {
    depth: usize,
    entry_total: usize,
    min_key: Option<K>,
    max_key: Option<K>,
}

fn invariant(reason: String) -> eyre::Report {
    TreeError::InvariantViolation { reason }.into()
}

impl<K: Clone, V: Clone, H: Host<K, V>> Tree<K, V, H> {
    /// Creates an empty tree that splits nodes past `k_max` entries.
    pub fn new(k_max: usize, compare: KeyCompare<K>, host: Arc<H>) -> Result<Self> {
        ensure!(k_max >= 2, "fanout must be at least 2, got {}", k_max);
        Ok(Self::from_core(TreeCore {
            k_max,
            compare,
            host,
            root: new_shared(Node::Dirty {
                content: NodeContent::Leaf(Vec::new()),
            }),
            len: Some(0),
            source: None,
            clones: Vec::new(),
        }))
    }

    /// Reopens a tree from the root locator a previous [`flush`] returned.
    /// Fetches the root eagerly: the node header carries the fanout, and a
    /// bad locator should fail here rather than on first use.
    ///
    /// [`flush`]: Tree::flush
    pub fn load(loc: Locator, compare: KeyCompare<K>, host: Arc<H>) -> Result<Self> {
        let bytes = host.get_node(loc.segment, loc.offset, loc.length)?;
        let (fanout, content) = codec::decode_node(&bytes, host.as_ref())?;
        if fanout < 2 {
            return Err(TreeError::Corrupt {
                reason: format!("root header carries impossible fanout {fanout}"),
            }
            .into());
        }
        Ok(Self::from_core(TreeCore {
            k_max: fanout as usize,
            compare,
            host,
            root: new_shared(Node::Clean { loc, content }),
            len: None,
            source: None,
            clones: Vec::new(),
        }))
    }

    pub(crate) fn from_core(core: TreeCore<K, V, H>) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
        }
    }

    /// Inserts or overwrites. Returns `true` whenever the tree holds the
    /// pair afterwards, inserts and updates alike; `false` is reserved.
    pub fn put(&self, key: K, value: V) -> Result<bool> {
        self.core.lock().put(key, value)
    }

    pub fn get_by_key(&self, key: &K) -> Result<Option<V>> {
        self.core.lock().get(key)
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete_by_key(&self, key: &K) -> Result<bool> {
        self.core.lock().delete(key)
    }

    /// Total number of entries. O(1) once known; a tree fresh from
    /// [`load`](Tree::load) counts its leaves on the first call and caches
    /// the result.
    pub fn len(&self) -> Result<usize> {
        self.core.lock().len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// In-order iteration. The visitor runs with internal locks held and
    /// must not call back into this tree or its clones.
    pub fn for_each(&self, mut visit: impl FnMut(&K, &V)) -> Result<()> {
        let core = self.core.lock();
        let root = core.root.clone();
        core.walk_in_order(&root, &mut visit)
    }

    /// Full structural audit: uniform leaf depth, occupancy bounds,
    /// separator/minimum agreement, strict key ordering, clean/dirty
    /// adjacency, and the cached length. Reports which invariant broke;
    /// never repairs anything.
    pub fn validate(&self) -> Result<()> {
        self.core.lock().validate()
    }

    /// Renders the tree through the host's diagnostic dump functions.
    pub fn dump(&self) -> Result<String> {
        self.core.lock().dump()
    }
}

impl<K: Clone, V: Clone, H: Host<K, V>> TreeCore<K, V, H> {
    pub(crate) fn min_entries(&self) -> usize {
        (self.k_max + 1) / 2
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        let mut node = self.root.clone();
        loop {
            ensure_resident(&node, self.host.as_ref())?;
            let next = {
                let guard = node.read();
                let content = guard.content()?;
                match content {
                    NodeContent::Leaf(_) => {
                        return Ok(match content.search_leaf(key, self.compare)? {
                            Ok(idx) => Some(content.leaf_entries()?[idx].1.clone()),
                            Err(_) => None,
                        });
                    }
                    NodeContent::Interior(_) => {
                        let idx = content.child_index(key, self.compare)?;
                        content.interior_entries()?[idx].1.clone()
                    }
                }
            };
            node = next;
        }
    }

    fn put(&mut self, key: K, value: V) -> Result<bool> {
        // Phase one: read-only descent; host failures leave the tree untouched.
        let mut idxs: SmallVec<[usize; 8]> = SmallVec::new();
        {
            let mut node = self.root.clone();
            loop {
                ensure_resident(&node, self.host.as_ref())?;
                let next = {
                    let guard = node.read();
                    let content = guard.content()?;
                    match content {
                        NodeContent::Leaf(_) => None,
                        NodeContent::Interior(_) => {
                            let idx = content.child_index(&key, self.compare)?;
                            idxs.push(idx);
                            Some(content.interior_entries()?[idx].1.clone())
                        }
                    }
                };
                match next {
                    Some(child) => node = child,
                    None => break,
                }
            }
        }

        // Phase two: copy-on-write path, no host access from here on.
        make_writable(&mut self.root)?;
        let mut path: SmallVec<[(SharedNode<K, V>, usize); 8]> = SmallVec::new();
        let mut cur = self.root.clone();
        for &idx in &idxs {
            let child = {
                let mut guard = cur.write();
                let entries = guard.content_mut()?.interior_entries_mut()?;
                make_writable(&mut entries[idx].1)?;
                entries[idx].1.clone()
            };
            path.push((cur, idx));
            cur = child;
        }

        let inserted = {
            let mut guard = cur.write();
            let content = guard.content_mut()?;
            match content.search_leaf(&key, self.compare)? {
                Ok(idx) => {
                    content.leaf_entries_mut()?[idx].1 = value;
                    false
                }
                Err(slot) => {
                    content.leaf_entries_mut()?.insert(slot, (key, value));
                    true
                }
            }
        };

        // Ascend: re-stamp separators, split overfull children.
        let mut child = cur;
        for (parent, idx) in path.into_iter().rev() {
            {
                let mut guard = parent.write();
                let min = child.read().content()?.min_key()?;
                let overfull = child.read().content()?.entry_count() > self.k_max;
                let entries = guard.content_mut()?.interior_entries_mut()?;
                entries[idx].0 = min;
                if overfull {
                    let right = split_node(&child)?;
                    let right_key = right.read().content()?.min_key()?;
                    entries.insert(idx + 1, (right_key, right));
                }
            }
            child = parent;
        }

        if self.root.read().content()?.entry_count() > self.k_max {
            let left = self.root.clone();
            let right = split_node(&left)?;
            let left_key = left.read().content()?.min_key()?;
            let right_key = right.read().content()?.min_key()?;
            self.root = new_shared(Node::Dirty {
                content: NodeContent::Interior(vec![(left_key, left), (right_key, right)]),
            });
        }

        if inserted {
            if let Some(len) = self.len.as_mut() {
                *len += 1;
            }
        }
        Ok(true)
    }

    fn delete(&mut self, key: &K) -> Result<bool> {
        // Phase one: read-only descent. Besides the path, rebalancing may
        // touch the adjacent siblings at every level; load them up front so
        // phase two cannot fail on I/O.
        let mut idxs: SmallVec<[usize; 8]> = SmallVec::new();
        {
            let mut node = self.root.clone();
            loop {
                ensure_resident(&node, self.host.as_ref())?;
                let next = {
                    let guard = node.read();
                    let content = guard.content()?;
                    match content {
                        NodeContent::Leaf(_) => {
                            if content.search_leaf(key, self.compare)?.is_err() {
                                return Ok(false);
                            }
                            None
                        }
                        NodeContent::Interior(_) => {
                            let idx = content.child_index(key, self.compare)?;
                            let entries = content.interior_entries()?;
                            let mut siblings: SmallVec<[SharedNode<K, V>; 2]> = SmallVec::new();
                            if idx > 0 {
                                siblings.push(entries[idx - 1].1.clone());
                            }
                            if idx + 1 < entries.len() {
                                siblings.push(entries[idx + 1].1.clone());
                            }
                            idxs.push(idx);
                            Some((entries[idx].1.clone(), siblings))
                        }
                    }
                };
                match next {
                    Some((child, siblings)) => {
                        for sibling in &siblings {
                            ensure_resident(sibling, self.host.as_ref())?;
                        }
                        node = child;
                    }
                    None => break,
                }
            }
        }

        // Phase two: copy-on-write path, then rebalance on the way back up.
        make_writable(&mut self.root)?;
        let mut path: SmallVec<[(SharedNode<K, V>, usize); 8]> = SmallVec::new();
        let mut cur = self.root.clone();
        for &idx in &idxs {
            let child = {
                let mut guard = cur.write();
                let entries = guard.content_mut()?.interior_entries_mut()?;
                make_writable(&mut entries[idx].1)?;
                entries[idx].1.clone()
            };
            path.push((cur, idx));
            cur = child;
        }

        {
            let mut guard = cur.write();
            let content = guard.content_mut()?;
            match content.search_leaf(key, self.compare)? {
                Ok(idx) => {
                    content.leaf_entries_mut()?.remove(idx);
                }
                Err(_) => return Ok(false),
            }
        }

        let min_entries = self.min_entries();
        let mut child = cur;
        for (parent, idx) in path.into_iter().rev() {
            {
                let mut guard = parent.write();
                let underflow = child.read().content()?.entry_count() < min_entries;
                let entries = guard.content_mut()?.interior_entries_mut()?;
                if underflow {
                    rebalance_child(entries, idx, min_entries)?;
                } else {
                    entries[idx].0 = child.read().content()?.min_key()?;
                }
            }
            child = parent;
        }

        // An interior root with a single child loses a level.
        loop {
            let only = {
                let guard = self.root.read();
                match guard.content()? {
                    NodeContent::Interior(entries) if entries.len() == 1 => {
                        Some(entries[0].1.clone())
                    }
                    _ => None,
                }
            };
            match only {
                Some(new_root) => self.root = new_root,
                None => break,
            }
        }

        if let Some(len) = self.len.as_mut() {
            *len -= 1;
        }
        Ok(true)
    }

    pub(crate) fn len(&mut self) -> Result<usize> {
        if let Some(len) = self.len {
            return Ok(len);
        }
        let root = self.root.clone();
        let counted = self.count_entries(&root)?;
        self.len = Some(counted);
        Ok(counted)
    }

    fn count_entries(&self, node: &SharedNode<K, V>) -> Result<usize> {
        ensure_resident(node, self.host.as_ref())?;
        let kids: SmallVec<[SharedNode<K, V>; 8]> = {
            let guard = node.read();
            match guard.content()? {
                NodeContent::Leaf(entries) => return Ok(entries.len()),
                NodeContent::Interior(entries) => {
                    entries.iter().map(|(_, child)| child.clone()).collect()
                }
            }
        };
        let mut total = 0;
        for kid in &kids {
            total += self.count_entries(kid)?;
        }
        Ok(total)
    }

    fn walk_in_order(
        &self,
        node: &SharedNode<K, V>,
        visit: &mut impl FnMut(&K, &V),
    ) -> Result<()> {
        ensure_resident(node, self.host.as_ref())?;
        let kids: SmallVec<[SharedNode<K, V>; 8]> = {
            let guard = node.read();
            match guard.content()? {
                NodeContent::Leaf(entries) => {
                    for (key, value) in entries {
                        visit(key, value);
                    }
                    return Ok(());
                }
                NodeContent::Interior(entries) => {
                    entries.iter().map(|(_, child)| child.clone()).collect()
                }
            }
        };
        for kid in &kids {
            self.walk_in_order(kid, visit)?;
        }
        Ok(())
    }

    pub(crate) fn validate(&mut self) -> Result<()> {
        let root = self.root.clone();
        let summary = self.validate_node(&root, true)?;
        if let Some(len) = self.len {
            if len != summary.entry_total {
                return Err(invariant(format!(
                    "cached length {len} does not match {} leaf entries",
                    summary.entry_total
                )));
            }
        }
        Ok(())
    }

    fn validate_node(&self, node: &SharedNode<K, V>, is_root: bool) -> Result<SubtreeSummary<K>> {
        ensure_resident(node, self.host.as_ref())?;
        let guard = node.read();
        let node_clean = !guard.is_dirty();
        let content = guard.content()?;

        let count = content.entry_count();
        let (lo, hi) = match (is_root, content) {
            (true, NodeContent::Leaf(_)) => (0, self.k_max),
            (true, NodeContent::Interior(_)) => (2, self.k_max),
            (false, _) => (self.min_entries(), self.k_max),
        };
        if count < lo || count > hi {
            return Err(invariant(format!(
                "node holds {count} entries, outside {lo}..={hi}"
            )));
        }

        match content {
            NodeContent::Leaf(entries) => {
                for window in entries.windows(2) {
                    if (self.compare)(&window[0].0, &window[1].0) != Ordering::Less {
                        return Err(invariant("leaf keys are not strictly increasing".into()));
                    }
                }
                Ok(SubtreeSummary {
                    depth: 1,
                    entry_total: entries.len(),
                    min_key: entries.first().map(|(k, _)| k.clone()),
                    max_key: entries.last().map(|(k, _)| k.clone()),
                })
            }
            NodeContent::Interior(entries) => {
                let items: Vec<(K, SharedNode<K, V>, bool)> = entries
                    .iter()
                    .map(|(key, child)| (key.clone(), child.clone(), child.read().is_dirty()))
                    .collect();
                drop(guard);

                let mut depth = None;
                let mut entry_total = 0;
                let mut prev_key: Option<K> = None;
                let mut prev_max: Option<K> = None;
                for (key, child, child_dirty) in &items {
                    if node_clean && *child_dirty {
                        return Err(invariant(
                            "clean interior node references a dirty child".into(),
                        ));
                    }
                    if let Some(prev) = &prev_key {
                        if (self.compare)(prev, key) != Ordering::Less {
                            return Err(invariant(
                                "interior keys are not strictly increasing".into(),
                            ));
                        }
                    }

                    let child_summary = self.validate_node(child, false)?;
                    match &child_summary.min_key {
                        Some(min) if (self.compare)(key, min) == Ordering::Equal => {}
                        _ => {
                            return Err(invariant(
                                "separator key is not the minimum of its subtree".into(),
                            ))
                        }
                    }
                    if let (Some(max), Some(min)) = (&prev_max, &child_summary.min_key) {
                        if (self.compare)(max, min) != Ordering::Less {
                            return Err(invariant("subtrees overlap across a separator".into()));
                        }
                    }
                    match depth {
                        None => depth = Some(child_summary.depth),
                        Some(d) if d == child_summary.depth => {}
                        Some(d) => {
                            return Err(invariant(format!(
                                "leaf depth skew: {d} vs {}",
                                child_summary.depth
                            )))
                        }
                    }

                    entry_total += child_summary.entry_total;
                    prev_key = Some(key.clone());
                    prev_max = child_summary.max_key.clone();
                }

                Ok(SubtreeSummary {
                    depth: depth.unwrap_or(1) + 1,
                    entry_total,
                    min_key: items.first().map(|(key, ..)| key.clone()),
                    max_key: prev_max,
                })
            }
        }
    }

    fn dump(&self) -> Result<String> {
        let mut out = String::new();
        let root = self.root.clone();
        self.dump_node(&root, 0, &mut out)?;
        Ok(out)
    }

    fn dump_node(&self, node: &SharedNode<K, V>, depth: usize, out: &mut String) -> Result<()> {
        ensure_resident(node, self.host.as_ref())?;
        let indent = "  ".repeat(depth);
        let kids: SmallVec<[(String, SharedNode<K, V>); 8]> = {
            let guard = node.read();
            let state = match guard.loc() {
                Some(loc) => format!("@{}:{}+{}", loc.segment, loc.offset, loc.length),
                None => "dirty".to_string(),
            };
            let content = guard.content()?;
            match content {
                NodeContent::Leaf(entries) => {
                    writeln!(out, "{indent}leaf [{state}] {} entries", entries.len())?;
                    for (key, value) in entries {
                        writeln!(
                            out,
                            "{indent}  {} = {}",
                            self.host.dump_key(key)?,
                            self.host.dump_value(value)?
                        )?;
                    }
                    return Ok(());
                }
                NodeContent::Interior(entries) => {
                    writeln!(out, "{indent}interior [{state}] {} entries", entries.len())?;
                    let mut kids = SmallVec::new();
                    for (key, child) in entries {
                        kids.push((self.host.dump_key(key)?, child.clone()));
                    }
                    kids
                }
            }
        };
        for (key, child) in &kids {
            writeln!(out, "{indent}  >= {key}:")?;
            self.dump_node(child, depth + 1, out)?;
        }
        Ok(())
    }
}

fn split_node<K: Clone, V: Clone>(node: &SharedNode<K, V>) -> Result<SharedNode<K, V>> {
    let mut guard = node.write();
    let upper = guard.content_mut()?.split_upper_half();
    Ok(new_shared(Node::Dirty { content: upper }))
}

/// Rebalances the underfull child at `entries[idx]` against an adjacent
/// sibling: borrow one entry if the sibling can spare it, merge otherwise.
/// Both the child and the touched sibling are made writable first, so
/// nodes shared with clones are never mutated in place.
fn rebalance_child<K: Clone, V: Clone>(
    entries: &mut Vec<(K, SharedNode<K, V>)>,
    idx: usize,
    min_entries: usize,
) -> Result<()> {
    if idx > 0 {
        make_writable(&mut entries[idx - 1].1)?;
        let left = entries[idx - 1].1.clone();
        let child = entries[idx].1.clone();
        if left.read().content()?.entry_count() > min_entries {
            let moved = left.write().content_mut()?.pop_last()?;
            child.write().content_mut()?.push_front(moved)?;
            entries[idx].0 = child.read().content()?.min_key()?;
        } else {
            let mut left_guard = left.write();
            let mut child_guard = child.write();
            left_guard
                .content_mut()?
                .append_from(child_guard.content_mut()?)?;
            drop(child_guard);
            drop(left_guard);
            entries.remove(idx);
        }
    } else if idx + 1 < entries.len() {
        make_writable(&mut entries[idx + 1].1)?;
        let right = entries[idx + 1].1.clone();
        let child = entries[idx].1.clone();
        if right.read().content()?.entry_count() > min_entries {
            let moved = right.write().content_mut()?.pop_first()?;
            child.write().content_mut()?.push_back(moved)?;
            entries[idx + 1].0 = right.read().content()?.min_key()?;
            entries[idx].0 = child.read().content()?.min_key()?;
        } else {
            let mut child_guard = child.write();
            let mut right_guard = right.write();
            child_guard
                .content_mut()?
                .append_from(right_guard.content_mut()?)?;
            drop(right_guard);
            drop(child_guard);
            entries[idx].0 = child.read().content()?.min_key()?;
            entries.remove(idx + 1);
        }
    } else {
        // No adjacent sibling: only a single-entry parent gets here. An
        // empty child holds nothing, so its entry goes with it and the
        // parent's own underflow propagates up the ascent.
        let child = entries[idx].1.clone();
        if child.read().content()?.entry_count() == 0 {
            entries.remove(idx);
        } else {
            entries[idx].0 = child.read().content()?.min_key()?;
        }
    }
    Ok(())
}
