//! # Host Interface
//!
//! The tree never touches storage or key/value bytes directly. Everything
//! it needs from the outside world arrives through one injected capability
//! bundle, the [`Host`] trait:
//!
//! - `get_node` / `put_node`: the append-only log. Nodes are opaque byte
//!   chunks addressed by `(segment, offset, length)` triples; the host
//!   assigns segment and offset deterministically per write and must hand
//!   back exactly the bytes stored under the same triple.
//! - `pack_*` / `unpack_*`: bit-exact key and value codecs. The round-trip
//!   property `unpack(pack(x)) == (x, pack(x).len())` is load-bearing: the
//!   node codec advances through an entry stream using the `consumed`
//!   counts these return.
//! - `dump_*`: diagnostic rendering only, used by [`Tree::dump`]. Must not
//!   fail on well-formed input.
//!
//! Methods take `&self`; a host that needs mutable state (segment
//! counters, chunk maps) supplies its own interior mutability. One host
//! instance is typically shared by a tree and all of its clones.
//!
//! Key ordering is injected separately as a [`KeyCompare`] function so the
//! engine stays free of any assumption about the key type.
//!
//! [`Tree::dump`]: crate::Tree::dump

use std::cmp::Ordering;

use eyre::Result;

pub trait Host<K, V> {
    /// Returns the exact bytes previously written under the same triple.
    fn get_node(&self, segment: u64, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Appends opaque bytes, returning the assigned `(segment, offset)`.
    fn put_node(&self, bytes: &[u8]) -> Result<(u64, u64)>;

    fn pack_key(&self, key: &K) -> Result<Vec<u8>>;

    /// Decodes one key from the front of `bytes`, returning it together
    /// with the number of bytes consumed.
    fn unpack_key(&self, bytes: &[u8]) -> Result<(K, usize)>;

    fn pack_value(&self, value: &V) -> Result<Vec<u8>>;

    fn unpack_value(&self, bytes: &[u8]) -> Result<(V, usize)>;

    fn dump_key(&self, key: &K) -> Result<String>;

    fn dump_value(&self, value: &V) -> Result<String>;
}

/// Total order over keys. Supplied at tree construction and persisted
/// nowhere; loading a tree requires the same comparator it was built with.
pub type KeyCompare<K> = fn(&K, &K) -> Ordering;

/// Convenience comparator for `u32` keys. Not privileged in any way.
pub fn compare_uint32(a: &u32, b: &u32) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_uint32_is_a_total_order() {
        assert_eq!(compare_uint32(&1, &2), Ordering::Less);
        assert_eq!(compare_uint32(&2, &2), Ordering::Equal);
        assert_eq!(compare_uint32(&3, &2), Ordering::Greater);
    }
}
