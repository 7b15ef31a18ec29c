//! # Copy-on-Write B+Tree over an Append-Only Log
//!
//! This module implements the tree core: an ordered key→value map whose
//! nodes live in a host-managed append-only log and whose in-memory form
//! is a copy-on-write overlay on top of it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Tree (handle)                          │  put / get / delete / len
//! │   └── TreeCore                          │  validate / for_each / dump
//! ├─────────────────────────────────────────┤
//! │  Persistence controller                 │  flush / purge / touch
//! │                                         │  layout_report
//! ├─────────────────────────────────────────┤
//! │  Snapshot manager                       │  snapshot /
//! │                                         │  update_clone_source
//! ├─────────────────────────────────────────┤
//! │  Node lifecycle (Stub / Clean / Dirty)  │  residency, copy-on-write
//! ├─────────────────────────────────────────┤
//! │  Node codec                             │  header + entries + CRC
//! ├─────────────────────────────────────────┤
//! │  Host interface (injected)              │  get_node / put_node
//! │                                         │  pack / unpack / dump
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Structural Invariants
//!
//! - All leaves sit at the same depth.
//! - Every non-root node holds between `⌈K_max/2⌉` and `K_max` entries;
//!   the root leaf may hold fewer, and an interior root holds at least 2.
//! - Each interior entry's key equals the smallest key in its child's
//!   subtree; keys within a node strictly increase.
//! - A node with a locator is byte-identical to its on-log image; a dirty
//!   node has no locator. The two states are one enum.
//! - Nodes shared between a snapshot and its source are immutable through
//!   either view; writers path-copy.
//!
//! `Tree::validate` audits all of the above by full traversal.
//!
//! ## Thread Safety
//!
//! None. The locks inside exist for handle sharing between a tree and its
//! clones, not for concurrent mutation; callers serialize all access.

mod clone;
mod codec;
mod node;
mod persist;
mod tree;

#[cfg(test)]
pub(crate) mod testutil;

pub use node::Locator;
pub use persist::LayoutReport;
pub use tree::Tree;
