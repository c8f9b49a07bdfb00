use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::model::VECTOR_DIM;

pub const SEGMENT_FILE: &str = "records.seg";

/// Everything `AgentVecDb::open` needs. Loaded from JSON; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// None keeps the store in memory.
    pub data_dir: Option<PathBuf>,
    /// Width of every stored vector. The encoders always emit `VECTOR_DIM`,
    /// so any other width limits the store to raw `insert`/`search`.
    pub dimensions: usize,
    /// true = fsync every append, false = OS buffer (faster)
    pub strict_durability: bool,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub bloom: BloomConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            dimensions: VECTOR_DIM,
            strict_durability: true,
            index: IndexConfig::default(),
            cache: CacheConfig::default(),
            bloom: BloomConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persistent(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: StoreConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(StoreError::Config("dimensions must be positive".into()));
        }
        if !(self.bloom.false_positive_rate > 0.0 && self.bloom.false_positive_rate < 1.0) {
            return Err(StoreError::Config(format!(
                "bloom.false_positive_rate must be in (0, 1), got {}",
                self.bloom.false_positive_rate
            )));
        }
        if let IndexConfig::Hnsw { m, .. } = self.index {
            if m < 2 {
                return Err(StoreError::Config("index.m must be at least 2".into()));
            }
        }
        if self.maintenance.interval_ms == 0 {
            return Err(StoreError::Config("maintenance.interval_ms must be positive".into()));
        }
        if self.maintenance.history_limit == 0 {
            return Err(StoreError::Config("maintenance.history_limit must be positive".into()));
        }
        Ok(())
    }

    pub fn segment_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(SEGMENT_FILE))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexConfig {
    Flat,
    Hnsw {
        m: usize,
        ef_construction: usize,
        ef_search: usize,
    },
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig::Flat
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            capacity: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BloomConfig {
    pub expected_items: usize,
    pub false_positive_rate: f64,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            expected_items: 1_000_000,
            false_positive_rate: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_ms: u64,
    /// Versions kept per record by compaction
    pub history_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 600_000,
            history_limit: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Exponential backoff for a failing maintenance pass.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): initial * 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}
