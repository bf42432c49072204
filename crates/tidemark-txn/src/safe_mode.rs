//! Safe cleanout mode: the set of live TXN header addresses.
//!
//! With safe mode on, the resolver refuses to read an address that is not in
//! this set, so a freed page is reported as corrupted instead of being
//! misread.

use std::collections::HashSet;

use parking_lot::Mutex;
use tidemark_types::SlotAddr;
use xxhash_rust::xxh3::xxh3_64;

pub const LIVE_SET_PARTITIONS: usize = 64;

/// Partitioned set of live header addresses.
#[derive(Debug)]
pub struct LiveHeaderSet {
    parts: Vec<Mutex<HashSet<SlotAddr>>>,
}

impl Default for LiveHeaderSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveHeaderSet {
    pub fn new() -> Self {
        Self {
            parts: (0..LIVE_SET_PARTITIONS)
                .map(|_| Mutex::new(HashSet::new()))
                .collect(),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn part(&self, addr: SlotAddr) -> &Mutex<HashSet<SlotAddr>> {
        let h = xxh3_64(&addr.encode().raw().to_le_bytes());
        &self.parts[(h as usize) % LIVE_SET_PARTITIONS]
    }

    pub fn register(&self, addr: SlotAddr) {
        self.part(addr).lock().insert(addr);
    }

    pub fn deregister(&self, addr: SlotAddr) {
        self.part(addr).lock().remove(&addr);
    }

    pub fn contains(&self, addr: SlotAddr) -> bool {
        self.part(addr).lock().contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.parts.iter().map(|p| p.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deregister() {
        let set = LiveHeaderSet::new();
        assert!(set.is_empty());
        let addrs: Vec<_> = (1..=200_u32).map(|p| SlotAddr::new(1, p, 96)).collect();
        for a in &addrs {
            set.register(*a);
        }
        assert_eq!(set.len(), 200);
        assert!(addrs.iter().all(|a| set.contains(*a)));
        set.deregister(addrs[10]);
        assert!(!set.contains(addrs[10]));
        assert_eq!(set.len(), 199);
    }
}
