pub mod cache;
pub mod config;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod index;
pub mod manager;
pub mod model;
pub mod query;
pub mod storage;
pub mod vector;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{content_key, CacheStats, TtlCache};
use crate::config::{IndexConfig, StoreConfig};
use crate::encoder::FeatureEncoder;
use crate::filter::BloomFilter;
use crate::index::{FlatIndex, HnswIndex, NearestNeighborIndex};
use crate::storage::{MemoryLog, RecordLog, Segment};

pub use crate::error::{Result, StoreError};
pub use crate::model::{VectorMetadata, VectorRecord, VectorStatus, VectorType, VECTOR_DIM};
pub use crate::query::{SearchFilter, SearchHit, SearchQuery};

/// Latest known state of one vector id.
#[derive(Debug, Clone)]
struct CatalogEntry {
    /// Every stored version, oldest first
    offsets: Vec<u64>,
    metadata: VectorMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    pub live_records: usize,
    pub versions_kept: usize,
    pub versions_dropped: usize,
    pub deleted_purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub by_status: BTreeMap<VectorStatus, usize>,
    pub by_type: BTreeMap<VectorType, usize>,
    pub indexed: usize,
    pub index_kind: &'static str,
    pub log_bytes: u64,
    pub cache: CacheStats,
}

/// Vector store for encoded agent records.
///
/// Writes go to an append-only [`RecordLog`]; the catalog, bloom filter and
/// nearest-neighbor index are in-memory views rebuilt from the log on open.
/// Writers to the same id race: the last append wins.
pub struct AgentVecDb {
    config: StoreConfig,
    log: Mutex<Box<dyn RecordLog>>,
    catalog: RwLock<HashMap<String, CatalogEntry>>,
    index: RwLock<Box<dyn NearestNeighborIndex>>,
    bloom_filter: RwLock<BloomFilter>,
    search_cache: Mutex<TtlCache<Vec<SearchHit>>>,
    /// Bumped under the cache lock on every invalidation
    cache_generation: AtomicU64,
}

impl fmt::Debug for AgentVecDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentVecDb")
            .field("data_dir", &self.config.data_dir)
            .field("records", &self.catalog.read().map(|c| c.len()).unwrap_or_default())
            .finish()
    }
}

fn poisoned<T>(what: &'static str) -> impl FnOnce(T) -> StoreError {
    move |_| StoreError::LockPoisoned(what)
}

impl AgentVecDb {
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let log: Box<dyn RecordLog> = match config.segment_path() {
            Some(path) => {
                if let Some(dir) = path.parent() {
                    fs::create_dir_all(dir)?;
                }
                Box::new(Segment::open(&path, config.strict_durability)?)
            }
            None => Box::new(MemoryLog::new()),
        };

        let db = Self {
            index: RwLock::new(Self::build_index(&config)),
            bloom_filter: RwLock::new(BloomFilter::new(
                config.bloom.expected_items,
                config.bloom.false_positive_rate,
            )),
            search_cache: Mutex::new(TtlCache::new(config.cache.ttl(), config.cache.capacity)),
            cache_generation: AtomicU64::new(0),
            catalog: RwLock::new(HashMap::new()),
            log: Mutex::new(log),
            config,
        };

        db.replay()?;

        if db.config.dimensions != VECTOR_DIM {
            warn!(
                dimensions = db.config.dimensions,
                encoder_dimensions = VECTOR_DIM,
                "store width differs from the encoders; ingest and search_similar will be rejected"
            );
        }

        info!(
            data_dir = ?db.config.data_dir,
            records = db.len(),
            index = db.index_read()?.name(),
            "vector store opened"
        );
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn build_index(config: &StoreConfig) -> Box<dyn NearestNeighborIndex> {
        match config.index {
            IndexConfig::Flat => Box::new(FlatIndex::new()),
            IndexConfig::Hnsw { m, ef_construction, ef_search } => {
                Box::new(HnswIndex::new(m, ef_construction, ef_search))
            }
        }
    }

    // --- LOCK HELPERS ---

    fn log_lock(&self) -> Result<MutexGuard<'_, Box<dyn RecordLog>>> {
        self.log.lock().map_err(poisoned("record log"))
    }

    fn catalog_read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, CatalogEntry>>> {
        self.catalog.read().map_err(poisoned("catalog"))
    }

    fn catalog_write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, CatalogEntry>>> {
        self.catalog.write().map_err(poisoned("catalog"))
    }

    fn index_read(&self) -> Result<RwLockReadGuard<'_, Box<dyn NearestNeighborIndex>>> {
        self.index.read().map_err(poisoned("index"))
    }

    fn index_write(&self) -> Result<RwLockWriteGuard<'_, Box<dyn NearestNeighborIndex>>> {
        self.index.write().map_err(poisoned("index"))
    }

    fn cache_lock(&self) -> Result<MutexGuard<'_, TtlCache<Vec<SearchHit>>>> {
        self.search_cache.lock().map_err(poisoned("search cache"))
    }

    /// Rebuilds catalog, bloom filter and index from the log.
    fn replay(&self) -> Result<()> {
        let frames = self.log_lock()?.scan()?;
        let mut catalog = self.catalog_write()?;
        let mut index = self.index_write()?;
        let mut bloom = self.bloom_filter.write().map_err(poisoned("bloom filter"))?;

        catalog.clear();
        index.clear();
        bloom.clear();

        let mut order: Vec<String> = Vec::new();
        let mut vectors: HashMap<String, Vec<f32>> = HashMap::new();
        for (offset, record) in frames {
            let id = record.metadata.vector_id.clone();
            vectors.insert(id.clone(), record.vector_data);
            match catalog.get_mut(&id) {
                Some(entry) => {
                    entry.offsets.push(offset);
                    entry.metadata = record.metadata;
                }
                None => {
                    bloom.insert(id.as_bytes());
                    order.push(id.clone());
                    catalog.insert(id, CatalogEntry { offsets: vec![offset], metadata: record.metadata });
                }
            }
        }

        // Index the latest version of each id, in first-write order
        for id in order {
            let live = catalog.get(&id).is_some_and(|e| e.metadata.status != VectorStatus::Deleted);
            if let (true, Some(vector)) = (live, vectors.get(&id)) {
                index.insert(&id, vector);
            }
        }
        Ok(())
    }

    fn invalidate_cache(&self) -> Result<()> {
        let mut cache = self.cache_lock()?;
        self.cache_generation.fetch_add(1, Ordering::SeqCst);
        cache.clear();
        Ok(())
    }

    /// Caches `hits` unless a write invalidated the cache after `generation` was read.
    fn fill_cache(&self, key: u64, generation: u64, hits: &[SearchHit]) -> Result<bool> {
        let mut cache = self.cache_lock()?;
        if self.cache_generation.load(Ordering::SeqCst) != generation {
            return Ok(false);
        }
        cache.insert(key, hits.to_vec());
        Ok(true)
    }

    // --- WRITES ---

    /// Stores `record` under its id. An existing id is overwritten (last write wins).
    pub fn insert(&self, record: VectorRecord) -> Result<()> {
        self.store(record, true)
    }

    /// Appends `record`. With `reindex` false a live record keeps its current
    /// index entry; Deleted records always leave the index.
    fn store(&self, record: VectorRecord, reindex: bool) -> Result<()> {
        record.validate(self.config.dimensions)?;
        let id = record.metadata.vector_id.clone();

        let offset = self.log_lock()?.append(&record)?;

        self.bloom_filter
            .write()
            .map_err(poisoned("bloom filter"))?
            .insert(id.as_bytes());

        {
            let mut index = self.index_write()?;
            if record.metadata.status == VectorStatus::Deleted {
                index.remove(&id);
            } else if reindex {
                index.insert(&id, &record.vector_data);
            }
        }

        {
            let mut catalog = self.catalog_write()?;
            let entry = catalog.entry(id.clone()).or_insert_with(|| CatalogEntry {
                offsets: Vec::new(),
                metadata: record.metadata.clone(),
            });
            entry.offsets.push(offset);
            entry.metadata = record.metadata;
        }

        self.invalidate_cache()?;
        debug!(vector_id = %id, offset, "record stored");
        Ok(())
    }

    /// Encodes `fields` with the encoder for `vector_type` and stores the result.
    pub fn ingest(&self, vector_type: VectorType, agent_id: &str, fields: &Value, source: &str) -> Result<VectorRecord> {
        let record = FeatureEncoder::new(vector_type).build_record(agent_id, fields, source);
        self.insert(record.clone())?;
        Ok(record)
    }

    /// Moves a record to `status`, appending the new version.
    pub fn set_status(&self, vector_id: &str, status: VectorStatus) -> Result<VectorRecord> {
        let current = self
            .get(vector_id)?
            .ok_or_else(|| StoreError::NotFound(vector_id.to_string()))?;
        let next = current.transitioned(status)?;
        // vector is unchanged, so a record that stays live keeps its index entry
        self.store(next.clone(), false)?;
        info!(vector_id, from = ?current.metadata.status, to = ?status, "status changed");
        Ok(next)
    }

    pub fn archive(&self, vector_id: &str) -> Result<VectorRecord> {
        self.set_status(vector_id, VectorStatus::Archived)
    }

    pub fn delete(&self, vector_id: &str) -> Result<VectorRecord> {
        self.set_status(vector_id, VectorStatus::Deleted)
    }

    // --- READS ---

    fn maybe_contains(&self, vector_id: &str) -> Result<bool> {
        let bf = self.bloom_filter.read().map_err(poisoned("bloom filter"))?;
        Ok(bf.contains(vector_id.as_bytes()))
    }

    /// Latest version of `vector_id`, whatever its status.
    pub fn get(&self, vector_id: &str) -> Result<Option<VectorRecord>> {
        if !self.maybe_contains(vector_id)? {
            return Ok(None);
        }

        let offset = {
            let catalog = self.catalog_read()?;
            match catalog.get(vector_id).and_then(|e| e.offsets.last()) {
                Some(offset) => *offset,
                None => return Ok(None),
            }
        };
        self.log_lock()?.read(offset).map(Some)
    }

    /// All stored versions of `vector_id`, oldest first.
    pub fn history(&self, vector_id: &str) -> Result<Vec<VectorRecord>> {
        if !self.maybe_contains(vector_id)? {
            return Ok(Vec::new());
        }

        let offsets = match self.catalog_read()?.get(vector_id) {
            Some(entry) => entry.offsets.clone(),
            None => return Ok(Vec::new()),
        };

        let log = self.log_lock()?;
        offsets.into_iter().map(|offset| log.read(offset)).collect()
    }

    pub fn metadata(&self, vector_id: &str) -> Result<Option<VectorMetadata>> {
        Ok(self.catalog_read()?.get(vector_id).map(|e| e.metadata.clone()))
    }

    pub fn len(&self) -> usize {
        self.catalog.read().map(|c| c.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-k records by cosine similarity that pass the filter and threshold.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        if query.vector.len() != self.config.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: query.vector.len(),
            });
        }
        if query.top_k == 0 || query.threshold > 1.0 {
            return Ok(Vec::new());
        }

        let cache_key = if self.config.cache.enabled {
            let key = content_key(&serde_json::to_vec(query)?);
            let mut cache = self.cache_lock()?;
            if let Some(hits) = cache.get(key) {
                debug!(hits = hits.len(), "search served from cache");
                return Ok(hits);
            }
            Some((key, self.cache_generation.load(Ordering::SeqCst)))
        } else {
            None
        };

        let hits = self.search_index(query)?;

        if let Some((key, generation)) = cache_key {
            if !self.fill_cache(key, generation, &hits)? {
                debug!("store changed during search, result not cached");
            }
        }
        debug!(results = hits.len(), top_k = query.top_k, "search complete");
        Ok(hits)
    }

    fn search_index(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let catalog = self.catalog_read()?;
        let index = self.index_read()?;
        let accept = |id: &str| catalog.get(id).is_some_and(|e| query.filter.matches(&e.metadata));

        Ok(index
            .search(&query.vector, query.top_k, query.threshold, &accept)
            .into_iter()
            .filter_map(|n| {
                let metadata = catalog.get(&n.id)?.metadata.clone();
                Some(SearchHit { vector_id: n.id, similarity: n.similarity, metadata })
            })
            .collect())
    }

    /// Encodes `fields` and searches among active records of the same type.
    pub fn search_similar(
        &self,
        vector_type: VectorType,
        fields: &Value,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>> {
        let vector = FeatureEncoder::new(vector_type).encode(fields);
        let query = SearchQuery::new(vector)
            .top_k(top_k)
            .threshold(threshold)
            .vector_type(vector_type);
        self.search(&query)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();
        {
            let catalog = self.catalog_read()?;
            stats.records = catalog.len();
            for entry in catalog.values() {
                *stats.by_status.entry(entry.metadata.status).or_default() += 1;
                *stats.by_type.entry(entry.metadata.vector_type).or_default() += 1;
            }
        }
        {
            let index = self.index_read()?;
            stats.indexed = index.len();
            stats.index_kind = index.name();
        }
        stats.log_bytes = self.log_lock()?.len_bytes();
        stats.cache = self.cache_lock()?.stats();
        Ok(stats)
    }

    /// Drops expired search results. Returns how many went.
    pub fn purge_cache(&self) -> Result<usize> {
        Ok(self.cache_lock()?.purge_expired())
    }

    pub fn sync(&self) -> Result<()> {
        self.log_lock()?.sync()
    }

    // --- MAINTENANCE ---

    /// Rewrites the log keeping the last `history_limit` versions of each id.
    /// Ids whose latest version is `Deleted` are dropped entirely.
    pub fn compact(&self, history_limit: usize) -> Result<CompactionStats> {
        let history_limit = history_limit.max(1);
        info!(history_limit, "compaction started");

        // Stop-the-world: catalog and log held for the whole rewrite
        let mut catalog = self.catalog_write()?;
        let mut log = self.log_lock()?;

        let mut stats = CompactionStats::default();
        let mut keep: Vec<VectorRecord> = Vec::new();
        let mut owners: Vec<String> = Vec::new();

        // Preserve log order so replay after reopen sees the same history
        let mut live: Vec<(&String, &CatalogEntry)> = catalog
            .iter()
            .filter(|(_, e)| {
                if e.metadata.status == VectorStatus::Deleted {
                    stats.deleted_purged += 1;
                    stats.versions_dropped += e.offsets.len();
                    false
                } else {
                    true
                }
            })
            .collect();
        live.sort_by_key(|(_, e)| e.offsets.first().copied().unwrap_or_default());

        for (id, entry) in live {
            let start = entry.offsets.len().saturating_sub(history_limit);
            stats.versions_dropped += start;
            for &offset in &entry.offsets[start..] {
                keep.push(log.read(offset)?);
                owners.push(id.clone());
            }
            stats.live_records += 1;
        }
        stats.versions_kept = keep.len();

        let offsets = log.rewrite(&keep)?;

        let mut rebuilt: HashMap<String, CatalogEntry> = HashMap::with_capacity(stats.live_records);
        for ((id, record), offset) in owners.into_iter().zip(keep).zip(offsets) {
            let entry = rebuilt.entry(id).or_insert_with(|| CatalogEntry {
                offsets: Vec::new(),
                metadata: record.metadata.clone(),
            });
            entry.offsets.push(offset);
            entry.metadata = record.metadata;
        }
        *catalog = rebuilt;
        drop(log);

        // Purged ids may still be in the bloom filter; `get` falls through to the catalog
        self.invalidate_cache()?;

        info!(
            live = stats.live_records,
            kept = stats.versions_kept,
            dropped = stats.versions_dropped,
            purged = stats.deleted_purged,
            "compaction complete"
        );
        Ok(stats)
    }

    /// Binary (rkyv) image of the latest version of every record.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let records = self.latest_records()?;
        info!(records = records.len(), "serializing snapshot");
        let bytes = rkyv::to_bytes::<_, 4096>(&records).map_err(|e| StoreError::Encode(e.to_string()))?;
        Ok(bytes.into_vec())
    }

    /// Replaces the store contents with a snapshot taken by [`Self::snapshot`].
    pub fn restore(&self, snapshot: &[u8]) -> Result<usize> {
        let mut aligned = rkyv::AlignedVec::with_capacity(snapshot.len());
        aligned.extend_from_slice(snapshot);
        let records = rkyv::from_bytes::<Vec<VectorRecord>>(&aligned).map_err(|e| StoreError::Corrupt {
            offset: 0,
            reason: format!("{e:?}"),
        })?;
        self.replace_all(records)
    }

    /// Writes the latest version of every record as a JSON array.
    pub fn export_json(&self, path: &Path) -> Result<usize> {
        let records = self.latest_records()?;
        let mut writer = BufWriter::new(fs::File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &records)?;
        writer.flush()?;
        info!(path = %path.display(), records = records.len(), "exported records");
        Ok(records.len())
    }

    /// Replaces the store contents with records read by [`Self::export_json`].
    pub fn import_json(&self, path: &Path) -> Result<usize> {
        let file = fs::File::open(path)?;
        let records: Vec<VectorRecord> = serde_json::from_reader(BufReader::new(file))?;
        self.replace_all(records)
    }

    fn latest_records(&self) -> Result<Vec<VectorRecord>> {
        let catalog = self.catalog_read()?;
        let log = self.log_lock()?;

        let mut offsets: Vec<u64> = catalog.values().filter_map(|e| e.offsets.last().copied()).collect();
        offsets.sort_unstable();
        offsets.into_iter().map(|offset| log.read(offset)).collect()
    }

    fn replace_all(&self, records: Vec<VectorRecord>) -> Result<usize> {
        for record in &records {
            record.validate(self.config.dimensions)?;
        }

        info!(records = records.len(), "replacing store contents");
        self.log_lock()?.rewrite(&records)?;
        self.replay()?;
        self.invalidate_cache()?;
        Ok(records.len())
    }
}
