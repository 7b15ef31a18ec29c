//! # Node Lifecycle
//!
//! Every node in the tree is one of three states, and the state machine is
//! the type itself:
//!
//! ```text
//! Stub { loc }                 on the log only; fetch before use
//!   │  ensure_resident (get_node + decode)
//!   ▼
//! Clean { loc, content }       resident; bytes at loc match content
//!   │  make_writable (copy)            │  evict (drop content)
//!   ▼                                  ▼
//! Dirty { content }            resident; no on-log identity yet
//!   │  assign_locator (flush)
//!   └────────────────────────► Clean { loc, content }
//! ```
//!
//! A dirty node never has a locator and a node with a locator is never
//! dirty; encoding that as enum variants makes the exclusion impossible to
//! violate rather than merely audited.
//!
//! ## Sharing and Copy-on-Write
//!
//! Nodes are held as `Arc<RwLock<Node>>`. Clones of a tree share node
//! objects, so sharedness is simply the `Arc` strong count on the node's
//! identity. The write rule: a node may be mutated in place only when its
//! count is 1 and it is already dirty. Anything else gets a fresh `Dirty`
//! copy installed in the parent slot ([`make_writable`]), which clones the
//! child `Arc`s and thereby marks the whole subtree shared. Write paths
//! apply this top-down, so a dirty node's ancestors are always dirty and a
//! clean root means a fully clean tree.
//!
//! ## Content Layout
//!
//! Leaves hold `(key, value)` pairs; interior nodes hold `(key, child)`
//! pairs where the key is the minimum key of the child's subtree. The
//! min-key layout keeps the split/merge algebra uniform: splitting any
//! node is `split_off` at the midpoint, merging is concatenation, and the
//! parent entry for a node is always `(node.min_key(), node)`.

use std::cmp::Ordering;
use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result};
use parking_lot::RwLock;
use tracing::trace;

use crate::btree::codec;
use crate::host::{Host, KeyCompare};

/// Identity of a node image in the host log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    pub segment: u64,
    pub offset: u64,
    pub length: u64,
}

pub(crate) type SharedNode<K, V> = Arc<RwLock<Node<K, V>>>;

#[derive(Debug)]
pub(crate) enum Node<K, V> {
    Stub { loc: Locator },
    Clean { loc: Locator, content: NodeContent<K, V> },
    Dirty { content: NodeContent<K, V> },
}

#[derive(Debug)]
pub(crate) enum NodeContent<K, V> {
    Leaf(Vec<(K, V)>),
    Interior(Vec<(K, SharedNode<K, V>)>),
}

/// One entry moved between siblings during rebalancing.
pub(crate) enum OwnedEntry<K, V> {
    Leaf((K, V)),
    Interior((K, SharedNode<K, V>)),
}

impl<K, V> Node<K, V> {
    pub(crate) fn loc(&self) -> Option<Locator> {
        match self {
            Node::Stub { loc } | Node::Clean { loc, .. } => Some(*loc),
            Node::Dirty { .. } => None,
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        matches!(self, Node::Dirty { .. })
    }

    pub(crate) fn content(&self) -> Result<&NodeContent<K, V>> {
        match self {
            Node::Clean { content, .. } | Node::Dirty { content } => Ok(content),
            Node::Stub { loc } => bail!(
                "content of evicted node {}:{}+{} accessed without loading",
                loc.segment,
                loc.offset,
                loc.length
            ),
        }
    }

    /// Mutable content access, restricted to dirty nodes: a clean node's
    /// content must stay byte-identical to its on-log image.
    pub(crate) fn content_mut(&mut self) -> Result<&mut NodeContent<K, V>> {
        match self {
            Node::Dirty { content } => Ok(content),
            Node::Clean { .. } | Node::Stub { .. } => {
                bail!("mutable access to a node that is not dirty")
            }
        }
    }

    /// Dirty → Clean once the flush has written the node's image.
    pub(crate) fn assign_locator(&mut self, loc: Locator) -> Result<()> {
        match std::mem::replace(self, Node::Stub { loc }) {
            Node::Dirty { content } => {
                *self = Node::Clean { loc, content };
                Ok(())
            }
            other => {
                *self = other;
                bail!("locator assigned to a node that is not dirty")
            }
        }
    }

    /// Clean → Stub, dropping resident content. Refuses dirty nodes:
    /// their content is the only copy.
    pub(crate) fn evict(&mut self) -> Result<()> {
        match self {
            Node::Stub { .. } => Ok(()),
            Node::Dirty { .. } => bail!("dirty node cannot be evicted"),
            Node::Clean { loc, .. } => {
                let loc = *loc;
                *self = Node::Stub { loc };
                Ok(())
            }
        }
    }
}

impl<K, V> NodeContent<K, V> {
    pub(crate) fn entry_count(&self) -> usize {
        match self {
            NodeContent::Leaf(entries) => entries.len(),
            NodeContent::Interior(entries) => entries.len(),
        }
    }

    pub(crate) fn leaf_entries(&self) -> Result<&Vec<(K, V)>> {
        match self {
            NodeContent::Leaf(entries) => Ok(entries),
            NodeContent::Interior(_) => bail!("leaf access on an interior node"),
        }
    }

    pub(crate) fn leaf_entries_mut(&mut self) -> Result<&mut Vec<(K, V)>> {
        match self {
            NodeContent::Leaf(entries) => Ok(entries),
            NodeContent::Interior(_) => bail!("leaf access on an interior node"),
        }
    }

    pub(crate) fn interior_entries(&self) -> Result<&Vec<(K, SharedNode<K, V>)>> {
        match self {
            NodeContent::Interior(entries) => Ok(entries),
            NodeContent::Leaf(_) => bail!("interior access on a leaf node"),
        }
    }

    pub(crate) fn interior_entries_mut(&mut self) -> Result<&mut Vec<(K, SharedNode<K, V>)>> {
        match self {
            NodeContent::Interior(entries) => Ok(entries),
            NodeContent::Leaf(_) => bail!("interior access on a leaf node"),
        }
    }

    /// Index of the child owning `key`: the rightmost child whose
    /// separator is ≤ `key`. Keys below every separator go to child 0.
    pub(crate) fn child_index(&self, key: &K, compare: KeyCompare<K>) -> Result<usize> {
        let entries = self.interior_entries()?;
        ensure!(!entries.is_empty(), "descent through an empty interior node");
        let upper = entries.partition_point(|(k, _)| compare(k, key) != Ordering::Greater);
        Ok(upper.saturating_sub(1))
    }

    /// Binary search within a leaf: `Ok(index)` on a hit, `Err(slot)`
    /// with the insertion point on a miss.
    pub(crate) fn search_leaf(
        &self,
        key: &K,
        compare: KeyCompare<K>,
    ) -> Result<std::result::Result<usize, usize>> {
        let entries = self.leaf_entries()?;
        Ok(entries.binary_search_by(|(k, _)| compare(k, key)))
    }

    /// Splits off the upper half, leaving the first `⌈n/2⌉` entries in
    /// place. The returned half's first key is the separator the parent
    /// records for it.
    pub(crate) fn split_upper_half(&mut self) -> NodeContent<K, V> {
        match self {
            NodeContent::Leaf(entries) => {
                let mid = (entries.len() + 1) / 2;
                NodeContent::Leaf(entries.split_off(mid))
            }
            NodeContent::Interior(entries) => {
                let mid = (entries.len() + 1) / 2;
                NodeContent::Interior(entries.split_off(mid))
            }
        }
    }

    pub(crate) fn pop_first(&mut self) -> Result<OwnedEntry<K, V>> {
        ensure!(self.entry_count() > 0, "pop from an empty node");
        match self {
            NodeContent::Leaf(entries) => Ok(OwnedEntry::Leaf(entries.remove(0))),
            NodeContent::Interior(entries) => Ok(OwnedEntry::Interior(entries.remove(0))),
        }
    }

    pub(crate) fn pop_last(&mut self) -> Result<OwnedEntry<K, V>> {
        match self {
            NodeContent::Leaf(entries) => entries
                .pop()
                .map(OwnedEntry::Leaf)
                .ok_or_else(|| eyre!("pop from an empty node")),
            NodeContent::Interior(entries) => entries
                .pop()
                .map(OwnedEntry::Interior)
                .ok_or_else(|| eyre!("pop from an empty node")),
        }
    }

    pub(crate) fn push_front(&mut self, entry: OwnedEntry<K, V>) -> Result<()> {
        match (self, entry) {
            (NodeContent::Leaf(entries), OwnedEntry::Leaf(pair)) => {
                entries.insert(0, pair);
                Ok(())
            }
            (NodeContent::Interior(entries), OwnedEntry::Interior(pair)) => {
                entries.insert(0, pair);
                Ok(())
            }
            _ => bail!("entry kind does not match node kind"),
        }
    }

    pub(crate) fn push_back(&mut self, entry: OwnedEntry<K, V>) -> Result<()> {
        match (self, entry) {
            (NodeContent::Leaf(entries), OwnedEntry::Leaf(pair)) => {
                entries.push(pair);
                Ok(())
            }
            (NodeContent::Interior(entries), OwnedEntry::Interior(pair)) => {
                entries.push(pair);
                Ok(())
            }
            _ => bail!("entry kind does not match node kind"),
        }
    }

    /// Drains `other`'s entries onto this node's tail (sibling merge;
    /// `other` must be the right-hand sibling).
    pub(crate) fn append_from(&mut self, other: &mut NodeContent<K, V>) -> Result<()> {
        match (self, other) {
            (NodeContent::Leaf(left), NodeContent::Leaf(right)) => {
                left.append(right);
                Ok(())
            }
            (NodeContent::Interior(left), NodeContent::Interior(right)) => {
                left.append(right);
                Ok(())
            }
            _ => bail!("cannot merge nodes of different kinds"),
        }
    }
}

impl<K: Clone, V> NodeContent<K, V> {
    pub(crate) fn min_key(&self) -> Result<K> {
        let key = match self {
            NodeContent::Leaf(entries) => entries.first().map(|(k, _)| k),
            NodeContent::Interior(entries) => entries.first().map(|(k, _)| k),
        };
        key.cloned()
            .ok_or_else(|| eyre!("minimum key of an empty node"))
    }
}

impl<K: Clone, V: Clone> NodeContent<K, V> {
    /// Shallow copy: leaf data is cloned, interior children are shared by
    /// `Arc` (which is what flags them for copy-on-write later).
    pub(crate) fn clone_shallow(&self) -> NodeContent<K, V> {
        match self {
            NodeContent::Leaf(entries) => NodeContent::Leaf(entries.clone()),
            NodeContent::Interior(entries) => NodeContent::Interior(entries.clone()),
        }
    }
}

pub(crate) fn new_shared<K, V>(node: Node<K, V>) -> SharedNode<K, V> {
    Arc::new(RwLock::new(node))
}

/// Loads a stub from the host log. No-op for resident nodes.
pub(crate) fn ensure_resident<K, V, H: Host<K, V>>(
    node: &SharedNode<K, V>,
    host: &H,
) -> Result<()> {
    let loc = {
        let guard = node.read();
        match &*guard {
            Node::Stub { loc } => *loc,
            _ => return Ok(()),
        }
    };
    trace!(
        segment = loc.segment,
        offset = loc.offset,
        length = loc.length,
        "loading node from log"
    );
    let bytes = host.get_node(loc.segment, loc.offset, loc.length)?;
    let (_, content) = codec::decode_node(&bytes, host)?;
    let mut guard = node.write();
    if matches!(&*guard, Node::Stub { .. }) {
        *guard = Node::Clean { loc, content };
    }
    Ok(())
}

/// Makes the node in `slot` safe to mutate, installing a fresh dirty copy
/// unless the node is uniquely referenced and already dirty. The node must
/// be resident.
pub(crate) fn make_writable<K: Clone, V: Clone>(slot: &mut SharedNode<K, V>) -> Result<()> {
    if Arc::strong_count(slot) == 1 && slot.read().is_dirty() {
        return Ok(());
    }
    let copied = {
        let guard = slot.read();
        Node::Dirty {
            content: guard.content()?.clone_shallow(),
        }
    };
    *slot = new_shared(copied);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(pairs: &[(u32, u32)]) -> Node<u32, u32> {
        Node::Dirty {
            content: NodeContent::Leaf(pairs.to_vec()),
        }
    }

    #[test]
    fn writable_reuses_an_unshared_dirty_node() {
        let mut slot = new_shared(leaf(&[(1, 10)]));
        let before = Arc::as_ptr(&slot);
        make_writable(&mut slot).unwrap();
        assert_eq!(before, Arc::as_ptr(&slot));
    }

    #[test]
    fn writable_copies_a_shared_node() {
        let mut slot = new_shared(leaf(&[(1, 10)]));
        let alias = slot.clone();
        make_writable(&mut slot).unwrap();
        assert_ne!(Arc::as_ptr(&alias), Arc::as_ptr(&slot));
        // the alias keeps the original content
        assert_eq!(alias.read().content().unwrap().entry_count(), 1);
        assert_eq!(slot.read().content().unwrap().entry_count(), 1);
    }

    #[test]
    fn writable_copies_a_clean_node() {
        let loc = Locator {
            segment: 1,
            offset: 2,
            length: 3,
        };
        let mut slot = new_shared(Node::Clean {
            loc,
            content: NodeContent::Leaf(vec![(1u32, 10u32)]),
        });
        make_writable(&mut slot).unwrap();
        let guard = slot.read();
        assert!(guard.is_dirty());
        assert_eq!(guard.loc(), None);
    }

    #[test]
    fn locator_assignment_and_eviction_round_trip() {
        let loc = Locator {
            segment: 7,
            offset: 40,
            length: 9,
        };
        let mut node = leaf(&[(1, 10), (2, 20)]);
        node.assign_locator(loc).unwrap();
        assert_eq!(node.loc(), Some(loc));
        assert!(!node.is_dirty());
        node.evict().unwrap();
        assert!(node.content().is_err());
        assert_eq!(node.loc(), Some(loc));
    }

    #[test]
    fn dirty_nodes_refuse_eviction() {
        let mut node = leaf(&[(1, 10)]);
        assert!(node.evict().is_err());
    }

    #[test]
    fn split_leaves_the_larger_half_on_the_left() {
        let mut content = NodeContent::Leaf(vec![(1u32, 1u32), (2, 2), (3, 3)]);
        let right = content.split_upper_half();
        assert_eq!(content.entry_count(), 2);
        assert_eq!(right.entry_count(), 1);
        assert_eq!(right.min_key().unwrap(), 3);
    }

    #[test]
    fn child_index_picks_the_rightmost_covering_child() {
        let kids: Vec<(u32, SharedNode<u32, u32>)> = [10u32, 20, 30]
            .iter()
            .map(|&k| {
                (
                    k,
                    new_shared(Node::Dirty {
                        content: NodeContent::Leaf(Vec::new()),
                    }),
                )
            })
            .collect();
        let content = NodeContent::Interior(kids);
        let cmp = crate::host::compare_uint32;
        assert_eq!(content.child_index(&5, cmp).unwrap(), 0);
        assert_eq!(content.child_index(&10, cmp).unwrap(), 0);
        assert_eq!(content.child_index(&19, cmp).unwrap(), 0);
        assert_eq!(content.child_index(&20, cmp).unwrap(), 1);
        assert_eq!(content.child_index(&35, cmp).unwrap(), 2);
    }
}
