//! Transaction-system configuration.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Call [`TxnConfig::validate`] after building one by hand;
//! [`TxnConfig::from_json_str`] validates for you.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tidemark_error::{Result, TidemarkError};
use tidemark_types::RSEG_ID_MAX;

/// Hard upper bound for `cleanout.commit_max_rows`.
pub const COMMIT_CLEANOUT_MAX_ROWS_LIMIT: usize = 4096;

/// Transaction rollback segment ids are `1..=TXN_RSEGS_MAX`; the temporary
/// segments take the ids above them.
pub const TXN_RSEGS_MAX: u8 = RSEG_ID_MAX - 1;

// ---------------------------------------------------------------------------
// Commit cache
// ---------------------------------------------------------------------------

/// Where the commit cache is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    /// Never consulted.
    None,
    /// One table for the whole system.
    #[default]
    Global,
    /// Consulted per scanned block; shares the global table.
    Block,
}

/// Replacement policy inside a cache shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Direct-mapped array: a colliding insert overwrites.
    #[default]
    Random,
    /// Least recently used entry per shard is evicted.
    Lru,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitCacheConfig {
    pub level: CacheLevel,
    pub policy: CachePolicy,
    pub capacity: usize,
    pub shards: usize,
    pub replace_after_commit: bool,
}

impl Default for CommitCacheConfig {
    fn default() -> Self {
        Self {
            level: CacheLevel::Global,
            policy: CachePolicy::Random,
            capacity: 1 << 20,
            shards: 64,
            replace_after_commit: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Cleanout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanoutConfig {
    pub disabled: bool,
    pub page_hint_disabled: bool,
    pub commit_max_rows: usize,
    /// Track live undo header pages so a freed page is never misread.
    pub safe_mode: bool,
}

impl Default for CleanoutConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            page_hint_disabled: false,
            commit_max_rows: 3,
            safe_mode: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub freeze_enabled: bool,
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            freeze_enabled: false,
            timeout_secs: 10,
        }
    }
}

impl HeartbeatConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// GC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Undo logs purged per batch.
    pub purge_batch_logs: usize,
    /// Undo logs erased per batch.
    pub erase_batch_logs: usize,
    /// Purged logs moved to semi-purge per truncation.
    pub truncate_batch_logs: usize,
    pub cached_segments_max: usize,
    pub worker_interval_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            purge_batch_logs: 300,
            erase_batch_logs: 300,
            truncate_batch_logs: 128,
            cached_segments_max: 16,
            worker_interval_ms: 100,
        }
    }
}

impl GcConfig {
    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsegConfig {
    pub txn_rsegs: u8,
    pub temp_rsegs: u8,
}

impl Default for RsegConfig {
    fn default() -> Self {
        Self {
            txn_rsegs: 8,
            temp_rsegs: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// TxnConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    pub commit_cache: CommitCacheConfig,
    pub cleanout: CleanoutConfig,
    /// Flashback retention window.
    pub retention_secs: u64,
    pub heartbeat: HeartbeatConfig,
    pub gc: GcConfig,
    pub rollback_segments: RsegConfig,
}

impl TxnConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| TidemarkError::config(format!("parse error: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| TidemarkError::internal(format!("config serialization: {err}")))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn validate(&self) -> Result<()> {
        let cache = &self.commit_cache;
        if cache.level != CacheLevel::None {
            if cache.shards == 0 || !cache.shards.is_power_of_two() {
                return Err(TidemarkError::config(format!(
                    "commit_cache.shards must be a power of two, got {}",
                    cache.shards
                )));
            }
            if cache.capacity < cache.shards {
                return Err(TidemarkError::config(format!(
                    "commit_cache.capacity {} is smaller than shards {}",
                    cache.capacity, cache.shards
                )));
            }
        }
        if self.cleanout.commit_max_rows > COMMIT_CLEANOUT_MAX_ROWS_LIMIT {
            return Err(TidemarkError::config(format!(
                "cleanout.commit_max_rows {} exceeds {COMMIT_CLEANOUT_MAX_ROWS_LIMIT}",
                self.cleanout.commit_max_rows
            )));
        }
        if self.heartbeat.freeze_enabled && self.heartbeat.timeout_secs == 0 {
            return Err(TidemarkError::config(
                "heartbeat.timeout_secs must be positive when the freeze is enabled",
            ));
        }
        let gc = &self.gc;
        if gc.purge_batch_logs == 0 || gc.erase_batch_logs == 0 || gc.truncate_batch_logs == 0 {
            return Err(TidemarkError::config("gc batch sizes must be positive"));
        }
        let rsegs = &self.rollback_segments;
        if rsegs.txn_rsegs == 0 || rsegs.txn_rsegs > TXN_RSEGS_MAX {
            return Err(TidemarkError::config(format!(
                "rollback_segments.txn_rsegs must be in 1..={TXN_RSEGS_MAX}, got {}",
                rsegs.txn_rsegs
            )));
        }
        if u16::from(rsegs.txn_rsegs) + u16::from(rsegs.temp_rsegs) > u16::from(RSEG_ID_MAX) {
            return Err(TidemarkError::config(format!(
                "{} txn + {} temp rollback segments exceed {RSEG_ID_MAX} ids",
                rsegs.txn_rsegs, rsegs.temp_rsegs
            )));
        }
        Ok(())
    }
}
