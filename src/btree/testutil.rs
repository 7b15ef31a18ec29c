//! In-memory host log for unit tests: one chunk per segment, identity
//! checks on reads, and a `put_node` call counter for flush-idempotency
//! assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::error::TreeError;
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TestValue {
    pub num: u32,
    pub tag: [u8; 8],
}

impl TestValue {
    pub(crate) fn splat(n: u32) -> Self {
        Self {
            num: n,
            tag: [n as u8; 8],
        }
    }
}

#[derive(Default)]
struct LogState {
    last_segment: u64,
    last_offset: u64,
    chunks: HashMap<u64, (u64, Vec<u8>)>,
}

#[derive(Default)]
pub(crate) struct MemoryLog {
    state: Mutex<LogState>,
    puts: AtomicU64,
}

impl MemoryLog {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub(crate) fn chunk_sizes(&self) -> HashMap<u64, u64> {
        self.state
            .lock()
            .chunks
            .iter()
            .map(|(segment, (_, bytes))| (*segment, bytes.len() as u64))
            .collect()
    }
}

impl Host<u32, TestValue> for MemoryLog {
    fn get_node(&self, segment: u64, offset: u64, length: u64) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let (start, bytes) = state
            .chunks
            .get(&segment)
            .ok_or(TreeError::HostNotFound { segment })?;
        if *start != offset || bytes.len() as u64 != length {
            return Err(TreeError::HostMismatch {
                segment,
                offset,
                length,
            }
            .into());
        }
        Ok(bytes.clone())
    }

    fn put_node(&self, bytes: &[u8]) -> Result<(u64, u64)> {
        let mut state = self.state.lock();
        state.last_segment += 1;
        let segment = state.last_segment;
        state.last_offset += segment + bytes.len() as u64;
        let offset = state.last_offset;
        state.chunks.insert(segment, (offset, bytes.to_vec()));
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok((segment, offset))
    }

    fn pack_key(&self, key: &u32) -> Result<Vec<u8>> {
        Ok(key.to_le_bytes().to_vec())
    }

    fn unpack_key(&self, bytes: &[u8]) -> Result<(u32, usize)> {
        ensure!(bytes.len() >= 4, "packed key shorter than 4 bytes");
        Ok((u32::from_le_bytes(bytes[..4].try_into()?), 4))
    }

    fn pack_value(&self, value: &TestValue) -> Result<Vec<u8>> {
        let mut packed = Vec::with_capacity(12);
        packed.extend_from_slice(&value.num.to_le_bytes());
        packed.extend_from_slice(&value.tag);
        Ok(packed)
    }

    fn unpack_value(&self, bytes: &[u8]) -> Result<(TestValue, usize)> {
        ensure!(bytes.len() >= 12, "packed value shorter than 12 bytes");
        let num = u32::from_le_bytes(bytes[..4].try_into()?);
        let mut tag = [0u8; 8];
        tag.copy_from_slice(&bytes[4..12]);
        Ok((TestValue { num, tag }, 12))
    }

    fn dump_key(&self, key: &u32) -> Result<String> {
        Ok(format!("{key:#010x}"))
    }

    fn dump_value(&self, value: &TestValue) -> Result<String> {
        Ok(format!("{{num: {:#010x}, tag: {:02x?}}}", value.num, value.tag))
    }
}
