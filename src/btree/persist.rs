//! # Persistence Controller
//!
//! Turns the mutable in-memory overlay into a durable, locator-identified
//! on-log tree and back.
//!
//! ## Flush
//!
//! Dirty nodes are written post-order: children first, so that by the time
//! a parent is serialized every child slot carries a locator. Clean
//! subtrees are skipped wholesale: a dirty node's ancestors are always
//! dirty, so a node with a locator roots a fully persisted subtree. A tree
//! with a clean root flushes by returning the existing root locator,
//! without a single `put_node` call.
//!
//! ## Purge and Eviction
//!
//! Eviction drops a clean node's resident content, leaving the stub with
//! its locator; the content reloads on demand. Dirty nodes hold the only
//! copy of their data and refuse. `purge` additionally refuses while
//! clone linkage is live in either direction, where shared node objects would
//! be evicted out from under the other tree's feet mid-divergence.
//!
//! ## Layout Report
//!
//! Walks every node reachable from the root (loading stubs to find their
//! children) and sums image sizes per log segment. Dirty nodes occupy no
//! log space and contribute nothing.

use std::collections::HashMap;

use eyre::Result;
use smallvec::SmallVec;
use tracing::debug;

use crate::btree::codec;
use crate::btree::node::{ensure_resident, make_writable, Locator, Node, NodeContent, SharedNode};
use crate::btree::tree::{Tree, TreeCore};
use crate::error::TreeError;
use crate::host::Host;

/// Bytes of live node images per log segment.
pub type LayoutReport = HashMap<u64, u64>;

impl<K: Clone, V: Clone, H: Host<K, V>> Tree<K, V, H> {
    /// Writes every dirty node through the host and returns the root
    /// locator. Idempotent on a clean tree. With `and_purge`, clean
    /// resident content is evicted afterwards, leaving only locators.
    pub fn flush(&self, and_purge: bool) -> Result<Locator> {
        self.core.lock().flush(and_purge)
    }

    /// Drops all clean resident content. Refuses if any node is dirty or
    /// if clone linkage is live in either direction.
    pub fn purge(&self) -> Result<()> {
        self.core.lock().purge()
    }

    /// Forces the root resident and marks it dirty, so the next flush
    /// writes a fresh root image and returns a new locator.
    pub fn touch(&self) -> Result<()> {
        self.core.lock().touch()
    }

    /// Sums on-log node sizes per segment across the whole tree.
    pub fn layout_report(&self) -> Result<LayoutReport> {
        self.core.lock().layout_report()
    }
}

impl<K: Clone, V: Clone, H: Host<K, V>> TreeCore<K, V, H> {
    pub(crate) fn flush(&mut self, and_purge: bool) -> Result<Locator> {
        let root = self.root.clone();
        let loc = self.flush_node(&root)?;
        if and_purge {
            evict_clean(&root)?;
        }
        debug!(
            segment = loc.segment,
            offset = loc.offset,
            length = loc.length,
            and_purge,
            "flushed tree"
        );
        Ok(loc)
    }

    fn flush_node(&self, node: &SharedNode<K, V>) -> Result<Locator> {
        if let Some(loc) = node.read().loc() {
            return Ok(loc);
        }
        let kids: SmallVec<[SharedNode<K, V>; 8]> = {
            let guard = node.read();
            match guard.content()? {
                NodeContent::Leaf(_) => SmallVec::new(),
                NodeContent::Interior(entries) => {
                    entries.iter().map(|(_, child)| child.clone()).collect()
                }
            }
        };
        for kid in &kids {
            self.flush_node(kid)?;
        }

        let image = {
            let guard = node.read();
            codec::encode_node(guard.content()?, self.k_max as u32, self.host.as_ref())?
        };
        let (segment, offset) = self.host.put_node(&image)?;
        let loc = Locator {
            segment,
            offset,
            length: image.len() as u64,
        };
        node.write().assign_locator(loc)?;
        Ok(loc)
    }

    pub(crate) fn purge(&mut self) -> Result<()> {
        if self.live_clone_count() > 0 {
            return Err(TreeError::StateViolation {
                reason: "purge refused: tree has a live clone",
            }
            .into());
        }
        if let Some(source) = &self.source {
            if source.strong_count() > 0 {
                return Err(TreeError::StateViolation {
                    reason: "purge refused: tree is a clone whose source is live",
                }
                .into());
            }
        }
        // Mutation dirties the whole root-to-leaf path, so a clean root
        // means a fully clean tree.
        if self.root.read().is_dirty() {
            return Err(TreeError::StateViolation {
                reason: "purge refused: tree has dirty nodes",
            }
            .into());
        }
        evict_clean(&self.root)?;
        debug!("purged clean resident nodes");
        Ok(())
    }

    pub(crate) fn touch(&mut self) -> Result<()> {
        ensure_resident(&self.root, self.host.as_ref())?;
        make_writable(&mut self.root)
    }

    pub(crate) fn layout_report(&self) -> Result<LayoutReport> {
        let mut report = LayoutReport::new();
        let root = self.root.clone();
        self.layout_walk(&root, &mut report)?;
        Ok(report)
    }

    fn layout_walk(&self, node: &SharedNode<K, V>, report: &mut LayoutReport) -> Result<()> {
        if let Some(loc) = node.read().loc() {
            *report.entry(loc.segment).or_insert(0) += loc.length;
        }
        ensure_resident(node, self.host.as_ref())?;
        let kids: SmallVec<[SharedNode<K, V>; 8]> = {
            let guard = node.read();
            match guard.content()? {
                NodeContent::Leaf(_) => return Ok(()),
                NodeContent::Interior(entries) => {
                    entries.iter().map(|(_, child)| child.clone()).collect()
                }
            }
        };
        for kid in &kids {
            self.layout_walk(kid, report)?;
        }
        Ok(())
    }
}

/// Post-order eviction: children lose their content before the parent
/// drops the `Arc`s referencing them.
fn evict_clean<K, V>(node: &SharedNode<K, V>) -> Result<()> {
    let kids: SmallVec<[SharedNode<K, V>; 8]> = {
        let guard = node.read();
        match &*guard {
            Node::Clean {
                content: NodeContent::Interior(entries),
                ..
            } => entries.iter().map(|(_, child)| child.clone()).collect(),
            _ => SmallVec::new(),
        }
    };
    for kid in &kids {
        evict_clean(kid)?;
    }
    node.write().evict()
}
