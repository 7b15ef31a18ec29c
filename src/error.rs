//! # Error Kinds
//!
//! Bramble reports failures through `eyre::Result`, but the engine's own
//! failure modes are a typed enum so callers can tell them apart with
//! `Report::downcast_ref::<TreeError>()`:
//!
//! - `HostNotFound` / `HostMismatch`: the host log cannot produce the
//!   requested bytes. Host implementations are encouraged (not required)
//!   to use these variants; whatever they return is propagated unchanged.
//! - `Corrupt`: a fetched node image failed to parse. Indicates storage
//!   damage, never a caller mistake.
//! - `StateViolation`: the operation is not permitted in the tree's
//!   current state (purging with dirty nodes or live clone linkage,
//!   promoting a tree that is not a clone).
//! - `InvariantViolation`: `validate()` found a structural breach. Only
//!   `validate()` produces this; normal operations never do.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("log segment {segment} not found")]
    HostNotFound { segment: u64 },

    #[error("log chunk mismatch in segment {segment}: offset {offset} length {length}")]
    HostMismatch {
        segment: u64,
        offset: u64,
        length: u64,
    },

    #[error("node image corrupt: {reason}")]
    Corrupt { reason: String },

    #[error("{reason}")]
    StateViolation { reason: &'static str },

    #[error("invariant violated: {reason}")]
    InvariantViolation { reason: String },
}
