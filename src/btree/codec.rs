//! # Node Codec
//!
//! Serializes a node to the byte image stored in the host log and parses
//! it back. The codec is pure: the same content always produces the same
//! bytes, which is what lets a clean node's locator stand in for its
//! content.
//!
//! ## Image Layout
//!
//! ```text
//! +--------------------+
//! | NodeHeader (17B)   |  kind (1B) | entry_count (4B LE)
//! |                    |  fanout (4B LE) | checksum (8B LE)
//! +--------------------+
//! | Entry 0            |  leaf:     pack(key) | pack(value)
//! | Entry 1            |  interior: pack(key) | segment (8B LE)
//! | ...                |            | offset (8B LE) | length (8B LE)
//! +--------------------+
//! ```
//!
//! Key and value bytes come from the host's pack functions and are not
//! framed: parsing advances by the `consumed` counts the unpack functions
//! report, so the host codecs must be exact. The fanout rides in every
//! header so that loading a tree from nothing but a root locator can
//! recover its split threshold.
//!
//! ## Corruption
//!
//! The checksum is CRC-64/ECMA-182 over the header fields and the entry
//! payload. A mismatch, a truncated buffer, an unknown kind tag, an entry
//! decoder that fails to advance, or trailing bytes after the last entry
//! all surface as [`TreeError::Corrupt`]; any of them means the bytes in
//! the log are not what the tree wrote.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{eyre, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::node::{new_shared, Locator, Node, NodeContent};
use crate::error::TreeError;
use crate::host::Host;

pub(crate) const NODE_HEADER_SIZE: usize = 17;
pub(crate) const CHILD_REF_SIZE: usize = 24;

const KIND_LEAF: u8 = 1;
const KIND_INTERIOR: u8 = 2;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    kind: u8,
    entry_count: U32,
    fanout: U32,
    checksum: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ChildRef {
    segment: U64,
    offset: U64,
    length: U64,
}

const _: () = assert!(std::mem::size_of::<ChildRef>() == CHILD_REF_SIZE);

fn compute_checksum(kind: u8, entry_count: u32, fanout: u32, payload: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&[kind]);
    digest.update(&entry_count.to_le_bytes());
    digest.update(&fanout.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

fn corrupt(reason: String) -> eyre::Report {
    TreeError::Corrupt { reason }.into()
}

/// Serializes a node. Interior children must already have locators;
/// flushing is post-order for exactly this reason.
pub(crate) fn encode_node<K, V, H: Host<K, V>>(
    content: &NodeContent<K, V>,
    fanout: u32,
    host: &H,
) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    let kind = match content {
        NodeContent::Leaf(entries) => {
            for (key, value) in entries {
                payload.extend_from_slice(&host.pack_key(key)?);
                payload.extend_from_slice(&host.pack_value(value)?);
            }
            KIND_LEAF
        }
        NodeContent::Interior(entries) => {
            for (key, child) in entries {
                payload.extend_from_slice(&host.pack_key(key)?);
                let loc = child
                    .read()
                    .loc()
                    .ok_or_else(|| eyre!("interior node serialized with an unflushed child"))?;
                let child_ref = ChildRef {
                    segment: U64::new(loc.segment),
                    offset: U64::new(loc.offset),
                    length: U64::new(loc.length),
                };
                payload.extend_from_slice(child_ref.as_bytes());
            }
            KIND_INTERIOR
        }
    };

    let entry_count = content.entry_count() as u32;
    let header = NodeHeader {
        kind,
        entry_count: U32::new(entry_count),
        fanout: U32::new(fanout),
        checksum: U64::new(compute_checksum(kind, entry_count, fanout, &payload)),
    };

    let mut image = Vec::with_capacity(NODE_HEADER_SIZE + payload.len());
    image.extend_from_slice(header.as_bytes());
    image.extend_from_slice(&payload);
    Ok(image)
}

/// Parses a node image, returning the recorded fanout and the content.
/// Interior children come back as stubs to be loaded on demand.
pub(crate) fn decode_node<K, V, H: Host<K, V>>(
    bytes: &[u8],
    host: &H,
) -> Result<(u32, NodeContent<K, V>)> {
    let (header, payload) = NodeHeader::ref_from_prefix(bytes)
        .map_err(|_| corrupt(format!("node image too short: {} bytes", bytes.len())))?;

    let entry_count = header.entry_count.get() as usize;
    let fanout = header.fanout.get();
    let stored = header.checksum.get();
    let computed = compute_checksum(header.kind, header.entry_count.get(), fanout, payload);
    if stored != computed {
        return Err(corrupt(format!(
            "checksum mismatch: stored {stored:#018x}, computed {computed:#018x}"
        )));
    }

    let mut rest = payload;
    let content = match header.kind {
        KIND_LEAF => {
            let mut entries = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                let (key, consumed) = unpack_step(rest, |b| host.unpack_key(b))?;
                rest = &rest[consumed..];
                let (value, consumed) = unpack_step(rest, |b| host.unpack_value(b))?;
                rest = &rest[consumed..];
                entries.push((key, value));
            }
            NodeContent::Leaf(entries)
        }
        KIND_INTERIOR => {
            let mut entries = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                let (key, consumed) = unpack_step(rest, |b| host.unpack_key(b))?;
                rest = &rest[consumed..];
                let (child_ref, tail) = ChildRef::ref_from_prefix(rest)
                    .map_err(|_| corrupt("truncated child reference".to_string()))?;
                let loc = Locator {
                    segment: child_ref.segment.get(),
                    offset: child_ref.offset.get(),
                    length: child_ref.length.get(),
                };
                rest = tail;
                entries.push((key, new_shared(Node::Stub { loc })));
            }
            NodeContent::Interior(entries)
        }
        other => return Err(corrupt(format!("unknown node kind {other}"))),
    };

    if !rest.is_empty() {
        return Err(corrupt(format!(
            "{} trailing bytes after {entry_count} entries",
            rest.len()
        )));
    }
    Ok((fanout, content))
}

fn unpack_step<T>(
    bytes: &[u8],
    unpack: impl FnOnce(&[u8]) -> Result<(T, usize)>,
) -> Result<(T, usize)> {
    let (item, consumed) = unpack(bytes)?;
    if consumed == 0 || consumed > bytes.len() {
        return Err(corrupt(format!(
            "entry decoder consumed {consumed} of {} available bytes",
            bytes.len()
        )));
    }
    Ok((item, consumed))
}
