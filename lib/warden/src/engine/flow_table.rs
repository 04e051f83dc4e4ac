// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The keyed flow table.
//!
//! Maps a flow key to a stable index, which the owning worker uses as
//! the slot into its dense array of flow entries. The caller supplies
//! the hash, the same RSS hash the NIC steers with, so the worker
//! looking a flow up is always the worker that owns its slot.

use alloc::string::String;
use alloc::vec::Vec;
use warden_api::FlowKey;
use warden_api::WardenError;

/// Default number of slots in a worker's flow table.
pub const FLOW_TABLE_DEF_CAPACITY: usize = 4096;

/// How far an insert probes past its home slot before reporting the
/// table full. Keeps the worst-case lookup bounded; the caller treats
/// `full` as a droppable condition, not an error to fix.
const PROBE_LIMIT: usize = 8;

type Result<T> = core::result::Result<T, WardenError>;

/// An open-addressed, insert-only table of flow keys.
///
/// There is no per-entry removal: entries live until the table is torn
/// down with the worker (which also means an empty slot terminates a
/// probe sequence).
#[derive(Debug)]
pub struct FlowTable {
    name: String,
    slots: Vec<Option<FlowKey>>,
    mask: usize,
    num_flows: usize,
}

impl FlowTable {
    /// Create a table with `capacity` slots. `capacity` must be a
    /// power of two so the hash can be masked rather than divided.
    pub fn new(name: &str, capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "flow table capacity must be a power of two"
        );
        Self {
            name: String::from(name),
            slots: vec![None; capacity],
            mask: capacity - 1,
            num_flows: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_flows(&self) -> usize {
        self.num_flows
    }

    /// Find the slot of `key`, if present. Keys compare bitwise.
    pub fn lookup(&self, key: &FlowKey, hash: u32) -> Option<usize> {
        let home = hash as usize & self.mask;
        for i in 0..PROBE_LIMIT {
            let idx = (home + i) & self.mask;
            match &self.slots[idx] {
                Some(k) if k == key => return Some(idx),
                Some(_) => continue,
                None => return None,
            }
        }
        None
    }

    /// Insert `key`, returning its slot. Inserting a key already in
    /// the table returns the existing slot. When every slot within the
    /// probe window is taken the table reports itself full.
    pub fn insert(&mut self, key: FlowKey, hash: u32) -> Result<usize> {
        let home = hash as usize & self.mask;
        for i in 0..PROBE_LIMIT {
            let idx = (home + i) & self.mask;
            match &self.slots[idx] {
                Some(k) if *k == key => return Ok(idx),
                Some(_) => continue,
                None => {
                    self.slots[idx] = Some(key);
                    self.num_flows += 1;
                    return Ok(idx);
                }
            }
        }
        Err(WardenError::MaxCapacity(self.slots.len() as u64))
    }

    pub fn key_at(&self, idx: usize) -> Option<&FlowKey> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.num_flows = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use warden_api::AddrPair;
    use warden_api::Ipv4Addr;

    const CAP: usize = 16;

    fn key(last: u8) -> FlowKey {
        FlowKey {
            addrs: AddrPair::V4 {
                src: Ipv4Addr::from([192, 168, 2, last]),
                dst: Ipv4Addr::from([76, 76, 21, 21]),
            },
        }
    }

    #[test]
    fn insert_then_lookup() {
        let mut ft = FlowTable::new("flow-basic-test", CAP);
        assert_eq!(ft.num_flows(), 0);
        assert!(ft.lookup(&key(1), 0x1234).is_none());

        let idx = ft.insert(key(1), 0x1234).unwrap();
        assert_eq!(ft.lookup(&key(1), 0x1234), Some(idx));
        assert_eq!(ft.key_at(idx), Some(&key(1)));
        assert_eq!(ft.num_flows(), 1);

        // Reinserting is idempotent and returns the same slot.
        assert_eq!(ft.insert(key(1), 0x1234).unwrap(), idx);
        assert_eq!(ft.num_flows(), 1);
    }

    #[test]
    fn colliding_keys_probe() {
        let mut ft = FlowTable::new("flow-collision-test", CAP);
        // Same hash, different keys: each lands one slot further on.
        let a = ft.insert(key(1), 7).unwrap();
        let b = ft.insert(key(2), 7).unwrap();
        let c = ft.insert(key(3), 7).unwrap();
        assert_eq!((a, b, c), (7, 8, 9));
        assert_eq!(ft.lookup(&key(2), 7), Some(8));
        assert_eq!(ft.lookup(&key(3), 7), Some(9));
    }

    #[test]
    fn full_window_rejects() {
        let mut ft = FlowTable::new("flow-full-test", CAP);
        for i in 0..8 {
            ft.insert(key(i), 3).unwrap();
        }
        assert!(matches!(
            ft.insert(key(100), 3),
            Err(WardenError::MaxCapacity(16)),
        ));
        // A different home slot still works.
        assert!(ft.insert(key(100), 12).is_ok());
    }

    #[test]
    fn probe_wraps_around() {
        let mut ft = FlowTable::new("flow-wrap-test", CAP);
        let idx = ft.insert(key(1), 15).unwrap();
        assert_eq!(idx, 15);
        let idx = ft.insert(key(2), 15).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(ft.lookup(&key(2), 15), Some(0));
    }

    #[test]
    #[should_panic]
    fn capacity_must_be_power_of_two() {
        let _ = FlowTable::new("flow-bad-cap-test", 1000);
    }

    #[test]
    fn clear_empties() {
        let mut ft = FlowTable::new("flow-clear-test", CAP);
        ft.insert(key(1), 0).unwrap();
        assert_eq!(ft.num_flows(), 1);
        ft.clear();
        assert_eq!(ft.num_flows(), 0);
        assert!(ft.lookup(&key(1), 0).is_none());
    }
}
