//! Commit cache: `trx_id -> commit image`.
//!
//! A committed transaction's image never changes and trx ids are never
//! reused, so entries need no invalidation. Inserts are best effort: a racing
//! insert may overwrite another, never corrupt it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tidemark_observability::TxnStats;
use tidemark_types::{CommitMark, Csr, Gcn, LookupStatus, Scn, TrxId, TxnLookupResult, TxnRecord, Utc};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{CacheLevel, CachePolicy, CommitCacheConfig};

/// One cached resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub trx_id: TrxId,
    pub scn: Scn,
    pub gcn: Gcn,
    pub utc: Utc,
    pub csr: Csr,
    pub is_slave: bool,
    pub status: LookupStatus,
}

impl CacheEntry {
    pub fn new(trx_id: TrxId, image: &CommitMark, is_slave: bool, status: LookupStatus) -> Self {
        Self {
            trx_id,
            scn: image.scn,
            gcn: image.gcn,
            utc: image.utc,
            csr: image.csr,
            is_slave,
            status,
        }
    }

    pub fn image(&self) -> CommitMark {
        CommitMark::new(self.scn, self.utc, self.gcn, self.csr)
    }

    /// Only final outcomes are cacheable.
    pub const fn is_cacheable(status: LookupStatus) -> bool {
        matches!(
            status,
            LookupStatus::Committed | LookupStatus::Purged | LookupStatus::Erased
        )
    }
}

/// Who is inserting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOrigin {
    /// A reader resolved the slot.
    Resolve,
    /// The transaction itself just committed.
    Commit,
}

// ---------------------------------------------------------------------------
// Shards
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LruShard {
    capacity: usize,
    map: HashMap<TrxId, (CacheEntry, u64)>,
    order: BTreeMap<u64, TrxId>,
    tick: u64,
}

impl LruShard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    fn touch(&mut self, trx_id: TrxId) -> Option<CacheEntry> {
        self.tick += 1;
        let tick = self.tick;
        let (entry, last) = self.map.get_mut(&trx_id)?;
        self.order.remove(last);
        *last = tick;
        self.order.insert(tick, trx_id);
        Some(*entry)
    }

    /// Returns whether an entry was evicted.
    fn insert(&mut self, entry: CacheEntry) -> bool {
        self.tick += 1;
        let tick = self.tick;
        if let Some((old, last)) = self.map.get_mut(&entry.trx_id) {
            *old = entry;
            self.order.remove(last);
            *last = tick;
            self.order.insert(tick, entry.trx_id);
            return false;
        }
        let mut evicted = false;
        if self.map.len() >= self.capacity {
            if let Some((_, victim)) = self.order.pop_first() {
                self.map.remove(&victim);
                evicted = true;
            }
        }
        self.map.insert(entry.trx_id, (entry, tick));
        self.order.insert(tick, entry.trx_id);
        evicted
    }
}

#[derive(Debug)]
enum Shard {
    /// Direct-mapped slots.
    Random(Vec<Option<CacheEntry>>),
    Lru(LruShard),
}

impl Shard {
    #[allow(clippy::cast_possible_truncation)]
    fn slot(slots: usize, hash: u64) -> usize {
        ((hash >> 32) as usize) % slots
    }

    fn get(&mut self, trx_id: TrxId, hash: u64) -> Option<CacheEntry> {
        match self {
            Self::Random(slots) => {
                let i = Self::slot(slots.len(), hash);
                slots[i].filter(|e| e.trx_id == trx_id)
            }
            Self::Lru(lru) => lru.touch(trx_id),
        }
    }

    fn put(&mut self, entry: CacheEntry, hash: u64) -> bool {
        match self {
            Self::Random(slots) => {
                let i = Self::slot(slots.len(), hash);
                let evicted = slots[i].is_some_and(|old| old.trx_id != entry.trx_id);
                slots[i] = Some(entry);
                evicted
            }
            Self::Lru(lru) => lru.insert(entry),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Random(slots) => slots.iter().flatten().count(),
            Self::Lru(lru) => lru.map.len(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Self::Random(slots) => slots.len(),
            Self::Lru(lru) => lru.capacity,
        }
    }
}

// ---------------------------------------------------------------------------
// CommitCache
// ---------------------------------------------------------------------------

/// Sharded commit cache.
#[derive(Debug)]
pub struct CommitCache {
    shards: Vec<Mutex<Shard>>,
    mask: u64,
    level: CacheLevel,
    replace_after_commit: bool,
    stats: Arc<TxnStats>,
}

impl CommitCache {
    pub fn new(config: &CommitCacheConfig, stats: Arc<TxnStats>) -> Self {
        let (shard_count, per_shard) = if config.level == CacheLevel::None {
            (1, 1)
        } else {
            let shards = config.shards.max(1);
            (shards, (config.capacity / shards).max(1))
        };
        let shards = (0..shard_count)
            .map(|_| {
                Mutex::new(match config.policy {
                    CachePolicy::Random => Shard::Random(vec![None; per_shard]),
                    CachePolicy::Lru => Shard::Lru(LruShard::new(per_shard)),
                })
            })
            .collect();
        Self {
            shards,
            mask: shard_count as u64 - 1,
            level: config.level,
            replace_after_commit: config.replace_after_commit,
            stats,
        }
    }

    pub fn level(&self) -> CacheLevel {
        self.level
    }

    pub fn is_enabled(&self) -> bool {
        self.level != CacheLevel::None
    }

    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, trx_id: TrxId) -> (&Mutex<Shard>, u64) {
        let hash = xxh3_64(&trx_id.get().to_le_bytes());
        (&self.shards[(hash & self.mask) as usize], hash)
    }

    pub fn lookup(&self, trx_id: TrxId) -> Option<CacheEntry> {
        if !self.is_enabled() {
            return None;
        }
        let (shard, hash) = self.shard(trx_id);
        let found = shard.lock().get(trx_id, hash);
        if found.is_some() {
            TxnStats::incr(&self.stats.cache_hit);
        } else {
            TxnStats::incr(&self.stats.cache_miss);
        }
        found
    }

    /// Look up the record's transaction and, on a hit, stamp the record.
    pub fn lookup_record(&self, rec: &mut TxnRecord) -> Option<TxnLookupResult> {
        let entry = self.lookup(rec.trx_id)?;
        let image = entry.image();
        rec.set_committed(&image, entry.is_slave);
        Some(TxnLookupResult::new(image, entry.status))
    }

    /// Returns whether the entry was stored.
    pub fn insert(&self, entry: CacheEntry, origin: InsertOrigin) -> bool {
        if !self.is_enabled() || !CacheEntry::is_cacheable(entry.status) {
            return false;
        }
        if origin == InsertOrigin::Commit && !self.replace_after_commit {
            return false;
        }
        let (shard, hash) = self.shard(entry.trx_id);
        if shard.lock().put(entry, hash) {
            TxnStats::incr(&self.stats.cache_evict);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entry slots across all shards.
    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.lock().capacity()).sum()
    }
}
