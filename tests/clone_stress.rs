//! # Clone Stress
//!
//! Grows a fanout-2 tree to 4096 entries and shrinks it back to empty,
//! forking a snapshot every 64 mutations and recording the entry count it
//! was taken at. Every recorded snapshot must keep reporting its length
//! and passing the structural audit no matter what happens to the live
//! tree afterwards.
//!
//! Phase one forks from the un-flushed live tree (all sharing is by
//! in-memory node object); phase two flushes-and-evicts before every fork
//! (all sharing is by locator). The two phases stress opposite halves of
//! the copy-on-write machinery.

mod common;

use std::collections::HashMap;

use bramble::{compare_uint32, Tree};
use common::{MemoryLog, TestValue};

const CLONE_INTERVAL: u32 = 0x0040;
const MAX_ELEMENTS: u32 = 0x1000;

type TestTree = Tree<u32, TestValue, MemoryLog>;

fn check_clones(clones: &HashMap<usize, TestTree>) {
    for (&recorded_len, clone) in clones {
        assert_eq!(
            clone.len().unwrap(),
            recorded_len,
            "clone recorded at {recorded_len} entries"
        );
        clone.validate().unwrap();
    }
}

#[test]
fn clones_survive_unflushed_and_flushed_churn() {
    let host = MemoryLog::new();
    let live: TestTree = Tree::new(2, compare_uint32, host.clone()).unwrap();
    let mut clones: HashMap<usize, TestTree> = HashMap::new();
    clones.insert(0, live.snapshot(false, host.clone()).unwrap());

    // phase one: fork the un-flushed live tree

    for key in 0..MAX_ELEMENTS {
        assert!(live.put(key, TestValue::splat(key)).unwrap(), "put {key}");
        if (key + 1) % CLONE_INTERVAL == 0 {
            clones.insert(
                (key + 1) as usize,
                live.snapshot(false, host.clone()).unwrap(),
            );
        }
    }
    check_clones(&clones);

    for key in 0..MAX_ELEMENTS {
        assert!(live.delete_by_key(&key).unwrap(), "delete {key}");
        if (key + 1) % CLONE_INTERVAL == 0 {
            clones.insert(
                (MAX_ELEMENTS - key - 1) as usize,
                live.snapshot(false, host.clone()).unwrap(),
            );
        }
    }
    check_clones(&clones);

    // phase two: flush and evict before every fork

    for key in 0..MAX_ELEMENTS {
        assert!(live.put(key, TestValue::splat(key)).unwrap(), "put {key}");
        if (key + 1) % CLONE_INTERVAL == 0 {
            live.flush(true).unwrap();
            clones.insert(
                (key + 1) as usize,
                live.snapshot(false, host.clone()).unwrap(),
            );
        }
    }
    check_clones(&clones);

    for key in 0..MAX_ELEMENTS {
        assert!(live.delete_by_key(&key).unwrap(), "delete {key}");
        if (key + 1) % CLONE_INTERVAL == 0 {
            live.flush(true).unwrap();
            clones.insert(
                (MAX_ELEMENTS - key - 1) as usize,
                live.snapshot(false, host.clone()).unwrap(),
            );
        }
    }
    check_clones(&clones);
}
