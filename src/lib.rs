//! # Bramble: Persistent Copy-on-Write B+Tree
//!
//! Bramble is an ordered key→value map whose nodes live in an externally
//! managed append-only log. The log, and the key/value byte codecs, are
//! injected through one host interface; the engine owns everything in
//! between: the split/merge algebra, the in-memory/on-log node
//! lifecycle, copy-on-write snapshot branches with shared subtrees, and
//! the flush machinery that turns a mutable overlay into a durable,
//! locator-identified tree.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bramble::{compare_uint32, Tree};
//!
//! let host = Arc::new(MyLog::open(...)?);
//! let tree = Tree::new(128, compare_uint32, host.clone())?;
//!
//! tree.put(42u32, record)?;
//! let root = tree.flush(true)?;           // durable; memory released
//!
//! // later, from nothing but the root locator:
//! let tree = Tree::load(root, compare_uint32, host)?;
//! assert!(tree.get_by_key(&42)?.is_some());
//! ```
//!
//! ## Node Lifecycle
//!
//! ```text
//!        put/delete            flush                 purge
//! (born) ───────────► Dirty ─────────► Clean ◄────────────► Stub
//!                       ▲    locator      │    content drop / reload
//!                       └─────────────────┘
//!                         copy-on-write
//! ```
//!
//! A dirty node exists only in memory; flushing writes dirty nodes
//! post-order and stamps each with the `(segment, offset, length)` locator
//! the host assigned. Purging drops clean content and keeps locators.
//! Snapshot branches (`Tree::snapshot`) share every reachable node and
//! diverge by path-copying, so a branch costs one refcount bump.
//!
//! ## What Bramble Is Not
//!
//! Not thread-safe (callers serialize), not a journal (durability is
//! whatever the host log provides), no range deletion, no secondary
//! indexes.
//!
//! ## Module Overview
//!
//! - [`btree`]: node lifecycle, codec, tree engine, persistence, snapshots
//! - [`host`]: the injected host interface and key comparators
//! - [`error`]: typed failure kinds carried inside `eyre::Report`

pub mod btree;
pub mod error;
pub mod host;

pub use btree::{LayoutReport, Locator, Tree};
pub use error::TreeError;
pub use host::{compare_uint32, Host, KeyCompare};
