//! # Snapshot Branches
//!
//! A snapshot is a copy-on-write fork: it costs one `Arc` clone of the
//! root, after which both trees treat every currently reachable node as
//! immutable. Mutating either side path-copies from the root down to the
//! touched leaf; untouched subtrees stay shared, by node object while
//! resident and by locator once flushed.
//!
//! Clone/source relations form a tree (a source may have many clones, a
//! clone has exactly one source) and are tracked with weak handles in
//! both directions, so dropping either side quietly dissolves the link.
//! The linkage gates `purge` (see the persistence controller) and feeds
//! [`update_clone_source`], the promotion protocol: the clone's state is
//! adopted by the source core and the clone stops depending on it. The
//! typical shape is checkpointing: branch the live tree, flush the
//! branch, promote it.
//!
//! [`update_clone_source`]: Tree::update_clone_source

use std::sync::Arc;

use eyre::Result;
use tracing::debug;

use crate::btree::tree::{Tree, TreeCore};
use crate::error::TreeError;
use crate::host::Host;

impl<K: Clone, V: Clone, H: Host<K, V>> Tree<K, V, H> {
    /// Forks a copy-on-write branch sharing this tree's current state.
    /// With `and_purge`, the source is flushed and evicted first, so the
    /// branch starts from locators alone. The branch may use a different
    /// host handle, but it must reach the same log.
    pub fn snapshot(&self, and_purge: bool, host: Arc<H>) -> Result<Tree<K, V, H>> {
        let mut core = self.core.lock();
        if and_purge {
            core.flush(true)?;
        }
        let branch = Tree::from_core(TreeCore {
            k_max: core.k_max,
            compare: core.compare,
            host,
            root: core.root.clone(),
            len: core.len,
            source: Some(Arc::downgrade(&self.core)),
            clones: Vec::new(),
        });
        core.clones.push(Arc::downgrade(&branch.core));
        debug!(live_clones = core.live_clone_count(), "forked snapshot");
        Ok(branch)
    }

    /// Promotes this clone to the canonical tree: the source adopts the
    /// clone's current root and length, and the clone stops being a clone.
    /// Fails with `StateViolation` on a tree that is not a clone; succeeds
    /// trivially if the source has already been dropped.
    pub fn update_clone_source(&self) -> Result<()> {
        let mut core = self.core.lock();
        let Some(source) = core.source.take() else {
            return Err(TreeError::StateViolation {
                reason: "update_clone_source on a tree that is not a clone",
            }
            .into());
        };
        if let Some(source_core) = source.upgrade() {
            let mut src = source_core.lock();
            src.root = core.root.clone();
            src.len = core.len;
            let own = Arc::downgrade(&self.core);
            src.clones.retain(|clone| !clone.ptr_eq(&own));
        }
        debug!("clone promoted over its source");
        Ok(())
    }
}

impl<K, V, H> TreeCore<K, V, H> {
    /// Prunes dead clone handles and counts the survivors.
    pub(crate) fn live_clone_count(&mut self) -> usize {
        self.clones.retain(|clone| clone.strong_count() > 0);
        self.clones.len()
    }
}
