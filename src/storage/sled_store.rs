//! Durable result storage on sled
//!
//! One tree per record kind, prefixed with the job id. Keys start with the
//! big-endian record timestamp so trees iterate chronologically; values are
//! JSON. Writes are staged in memory and applied on `commit_writes` as one
//! sled transaction spanning every touched tree, followed by a flush.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::TransactionResult;
use sled::Transactional;
use tracing::{debug, info};

use super::persistence::{PersistenceError, PersistenceSink};
use crate::types::{
    Bucket, CategoryDefinition, ModelDebugOutput, ModelSizeStats, ModelSnapshot, Quantiles,
};

// ============================================================================
// Tree names
// ============================================================================

const BUCKETS: &str = "buckets";
/// Keys of committed interim buckets, so they can be removed without a scan
const INTERIM_INDEX: &str = "interim_buckets";
const CATEGORIES: &str = "categories";
const MODEL_DEBUG: &str = "model_debug";
const MODEL_SIZE_STATS: &str = "model_size_stats";
const MODEL_SNAPSHOTS: &str = "model_snapshots";
const QUANTILES: &str = "quantiles";
const JOB_STATS: &str = "job_stats";

const ALL_TREES: [&str; 8] = [
    BUCKETS,
    INTERIM_INDEX,
    CATEGORIES,
    MODEL_DEBUG,
    MODEL_SIZE_STATS,
    MODEL_SNAPSHOTS,
    QUANTILES,
    JOB_STATS,
];

const BUCKET_COUNT_KEY: &[u8] = b"bucket_count";
const AVG_PROCESSING_TIME_KEY: &[u8] = b"avg_processing_time_ms";

#[derive(Debug)]
enum StagedOp {
    Insert(Vec<u8>),
    Remove,
}

/// Pending writes keyed by tree then key; later writes replace earlier ones
#[derive(Debug, Default)]
struct Staging {
    trees: BTreeMap<&'static str, BTreeMap<Vec<u8>, StagedOp>>,
    staged_interim: Vec<Vec<u8>>,
}

impl Staging {
    fn insert(&mut self, tree: &'static str, key: Vec<u8>, value: Vec<u8>) {
        self.trees
            .entry(tree)
            .or_default()
            .insert(key, StagedOp::Insert(value));
    }

    fn remove(&mut self, tree: &'static str, key: Vec<u8>) {
        self.trees.entry(tree).or_default().insert(key, StagedOp::Remove);
    }

    fn len(&self) -> usize {
        self.trees.values().map(BTreeMap::len).sum()
    }
}

/// sled-backed [`PersistenceSink`] for one job
#[derive(Clone)]
pub struct SledResultsStore {
    db: Arc<sled::Db>,
    job_id: String,
    staging: Arc<Mutex<Staging>>,
    smoothing: f64,
}

impl SledResultsStore {
    /// Open or create the store at `path`
    pub fn open<P: AsRef<Path>>(path: P, job_id: &str) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        info!(job_id, path = %path.display(), "Results store opened");
        Ok(Self::from_db(Arc::new(db), job_id))
    }

    /// Wrap an already opened database
    pub fn from_db(db: Arc<sled::Db>, job_id: &str) -> Self {
        Self {
            db,
            job_id: job_id.to_string(),
            staging: Arc::new(Mutex::new(Staging::default())),
            smoothing: crate::config::defaults::PROCESSING_TIME_SMOOTHING,
        }
    }

    #[must_use]
    pub const fn with_processing_time_smoothing(mut self, alpha: f64) -> Self {
        self.smoothing = alpha;
        self
    }

    /// Drop every tree of this job, leaving other jobs in the database alone
    pub fn reset(&self) -> Result<(), PersistenceError> {
        *self.staging() = Staging::default();
        let mut dropped = 0usize;
        for name in ALL_TREES {
            if self.db.drop_tree(format!("{}/{}", self.job_id, name))? {
                dropped += 1;
            }
        }
        self.db.flush()?;
        info!(job_id = %self.job_id, dropped, "Stored results reset");
        Ok(())
    }

    fn tree(&self, name: &str) -> Result<sled::Tree, PersistenceError> {
        Ok(self.db.open_tree(format!("{}/{}", self.job_id, name))?)
    }

    fn staging(&self) -> MutexGuard<'_, Staging> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timestamp_key(timestamp: i64) -> Vec<u8> {
        timestamp.to_be_bytes().to_vec()
    }

    fn stage<T: Serialize>(
        &self,
        tree: &'static str,
        key: Vec<u8>,
        value: &T,
    ) -> Result<(), PersistenceError> {
        let value = serde_json::to_vec(value)?;
        self.staging().insert(tree, key, value);
        Ok(())
    }

    fn read_all<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<T>, PersistenceError> {
        let tree = self.tree(tree)?;
        let mut items = Vec::with_capacity(tree.len());
        for item in tree.iter() {
            let (_key, value) = item?;
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }

    /// Committed buckets, oldest first
    pub fn buckets(&self) -> Result<Vec<Bucket>, PersistenceError> {
        self.read_all(BUCKETS)
    }

    pub fn bucket(&self, timestamp: i64) -> Result<Option<Bucket>, PersistenceError> {
        match self.tree(BUCKETS)?.get(Self::timestamp_key(timestamp))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn quantiles(&self) -> Result<Vec<Quantiles>, PersistenceError> {
        self.read_all(QUANTILES)
    }

    /// Most recently timestamped quantiles
    ///
    /// `main` replays these into the renormalizer before a new run starts.
    pub fn latest_quantiles(&self) -> Result<Option<Quantiles>, PersistenceError> {
        match self.tree(QUANTILES)?.last()? {
            Some((_key, value)) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub fn categories(&self) -> Result<Vec<CategoryDefinition>, PersistenceError> {
        self.read_all(CATEGORIES)
    }

    pub fn model_snapshots(&self) -> Result<Vec<ModelSnapshot>, PersistenceError> {
        self.read_all(MODEL_SNAPSHOTS)
    }

    pub fn model_size_stats(&self) -> Result<Vec<ModelSizeStats>, PersistenceError> {
        self.read_all(MODEL_SIZE_STATS)
    }

    pub fn model_debug_outputs(&self) -> Result<Vec<ModelDebugOutput>, PersistenceError> {
        self.read_all(MODEL_DEBUG)
    }

    pub fn bucket_count(&self) -> Result<u64, PersistenceError> {
        Ok(self
            .tree(JOB_STATS)?
            .get(BUCKET_COUNT_KEY)?
            .and_then(|v| v.as_ref().try_into().ok())
            .map_or(0, u64::from_be_bytes))
    }

    pub fn average_processing_time_ms(&self) -> Result<Option<f64>, PersistenceError> {
        Ok(self
            .tree(JOB_STATS)?
            .get(AVG_PROCESSING_TIME_KEY)?
            .and_then(|v| v.as_ref().try_into().ok())
            .map(f64::from_be_bytes))
    }

    /// Writes staged but not yet committed
    pub fn pending_writes(&self) -> usize {
        self.staging().len()
    }
}

impl PersistenceSink for SledResultsStore {
    fn persist_bucket(&self, bucket: &Bucket) -> Result<(), PersistenceError> {
        let key = Self::timestamp_key(bucket.timestamp);
        let value = serde_json::to_vec(bucket)?;
        let mut staging = self.staging();
        // The bucket's own insert decides its index entry at commit
        if let Some(ops) = staging.trees.get_mut(INTERIM_INDEX) {
            ops.remove(&key);
        }
        if bucket.is_interim() {
            staging.staged_interim.push(key.clone());
        } else {
            staging.staged_interim.retain(|k| k != &key);
        }
        staging.insert(BUCKETS, key, value);
        Ok(())
    }

    fn persist_category_definition(
        &self,
        category: &CategoryDefinition,
    ) -> Result<(), PersistenceError> {
        self.stage(CATEGORIES, category.category_id.to_be_bytes().to_vec(), category)
    }

    fn persist_model_debug_output(&self, output: &ModelDebugOutput) -> Result<(), PersistenceError> {
        // Many outputs share a timestamp; suffix a unique id
        let mut key = Self::timestamp_key(output.timestamp);
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        self.stage(MODEL_DEBUG, key, output)
    }

    fn persist_model_size_stats(&self, stats: &ModelSizeStats) -> Result<(), PersistenceError> {
        self.stage(MODEL_SIZE_STATS, Self::timestamp_key(stats.timestamp), stats)
    }

    fn persist_model_snapshot(&self, snapshot: &ModelSnapshot) -> Result<(), PersistenceError> {
        let mut key = Self::timestamp_key(snapshot.timestamp);
        key.extend_from_slice(snapshot.snapshot_id.as_bytes());
        self.stage(MODEL_SNAPSHOTS, key, snapshot)
    }

    fn persist_quantiles(&self, quantiles: &Quantiles) -> Result<(), PersistenceError> {
        self.stage(QUANTILES, Self::timestamp_key(quantiles.timestamp), quantiles)
    }

    fn delete_interim_results(&self) -> Result<(), PersistenceError> {
        let index = self.tree(INTERIM_INDEX)?;
        let mut staging = self.staging();

        // Staged interim buckets never reach the tree
        for key in std::mem::take(&mut staging.staged_interim) {
            if let Some(ops) = staging.trees.get_mut(BUCKETS) {
                ops.remove(&key);
            }
        }

        let mut removed = 0usize;
        for item in index.iter() {
            let (key, _) = item?;
            staging.remove(BUCKETS, key.to_vec());
            staging.remove(INTERIM_INDEX, key.to_vec());
            removed += 1;
        }

        debug!(job_id = %self.job_id, removed, "Interim results scheduled for deletion");
        Ok(())
    }

    fn commit_writes(&self) -> Result<(), PersistenceError> {
        let mut staging = self.staging();
        let interim: HashSet<&Vec<u8>> = staging.staged_interim.iter().collect();

        let mut batches: BTreeMap<&'static str, sled::Batch> = BTreeMap::new();
        let mut written = 0usize;
        for (&name, ops) in &staging.trees {
            for (key, op) in ops {
                match op {
                    StagedOp::Insert(value) => {
                        if name == BUCKETS {
                            let index = batches.entry(INTERIM_INDEX).or_default();
                            if interim.contains(key) {
                                index.insert(key.as_slice(), &[] as &[u8]);
                            } else {
                                index.remove(key.as_slice());
                            }
                        }
                        batches
                            .entry(name)
                            .or_default()
                            .insert(key.as_slice(), value.as_slice());
                    }
                    StagedOp::Remove => batches.entry(name).or_default().remove(key.as_slice()),
                }
                written += 1;
            }
        }

        if !batches.is_empty() {
            let trees = batches
                .keys()
                .map(|name| self.tree(name))
                .collect::<Result<Vec<_>, _>>()?;
            let batches: Vec<sled::Batch> = batches.into_values().collect();

            // All trees change together or not at all
            let result: TransactionResult<(), ()> = trees.as_slice().transaction(|views| {
                for (view, batch) in views.iter().zip(&batches) {
                    view.apply_batch(batch)?;
                }
                Ok(())
            });
            result?;
        }

        // Staging is kept if the commit fails, so the next commit retries it
        *staging = Staging::default();
        drop(staging);

        self.db.flush()?;
        debug!(job_id = %self.job_id, written, "Results committed");
        Ok(())
    }

    fn increment_bucket_count(&self, count: u64) -> Result<(), PersistenceError> {
        self.tree(JOB_STATS)?.update_and_fetch(BUCKET_COUNT_KEY, |old| {
            let current = old
                .and_then(|v| v.try_into().ok())
                .map_or(0, u64::from_be_bytes);
            Some(current.saturating_add(count).to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_average_bucket_processing_time(&self, time_ms: u64) -> Result<(), PersistenceError> {
        let alpha = self.smoothing;
        let sample = time_ms as f64;
        self.tree(JOB_STATS)?
            .update_and_fetch(AVG_PROCESSING_TIME_KEY, |old| {
                let next = match old.and_then(|v| v.try_into().ok()).map(f64::from_be_bytes) {
                    Some(avg) => alpha.mul_add(sample, (1.0 - alpha) * avg),
                    None => sample,
                };
                Some(next.to_be_bytes().to_vec())
            })?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, SledResultsStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = SledResultsStore::open(temp_dir.path().join("results.db"), "job-1").unwrap();
        (temp_dir, store)
    }

    fn bucket(timestamp: i64, interim: bool) -> Bucket {
        Bucket {
            timestamp,
            is_interim: Some(interim),
            anomaly_score: 5.0,
            ..Bucket::default()
        }
    }

    #[test]
    fn test_writes_invisible_until_commit() {
        let (_dir, store) = open_store();
        store.persist_bucket(&bucket(1000, false)).unwrap();
        assert!(store.buckets().unwrap().is_empty());
        assert_eq!(store.pending_writes(), 1);

        store.commit_writes().unwrap();
        assert_eq!(store.buckets().unwrap().len(), 1);
        assert_eq!(store.pending_writes(), 0);
    }

    #[test]
    fn test_buckets_ordered_by_timestamp() {
        let (_dir, store) = open_store();
        for ts in [3000, 1000, 2000] {
            store.persist_bucket(&bucket(ts, false)).unwrap();
        }
        store.commit_writes().unwrap();

        let timestamps: Vec<i64> = store.buckets().unwrap().iter().map(|b| b.timestamp).collect();
        assert_eq!(timestamps, vec![1000, 2000, 3000]);
    }

    #[test]
    fn test_delete_committed_and_staged_interim() {
        let (_dir, store) = open_store();
        store.persist_bucket(&bucket(1000, false)).unwrap();
        store.persist_bucket(&bucket(2000, true)).unwrap();
        store.commit_writes().unwrap();

        store.persist_bucket(&bucket(3000, true)).unwrap();
        store.delete_interim_results().unwrap();
        store.commit_writes().unwrap();

        let timestamps: Vec<i64> = store.buckets().unwrap().iter().map(|b| b.timestamp).collect();
        assert_eq!(timestamps, vec![1000]);
    }

    #[test]
    fn test_final_bucket_survives_interim_delete() {
        let (_dir, store) = open_store();
        store.persist_bucket(&bucket(2000, true)).unwrap();
        store.commit_writes().unwrap();

        store.delete_interim_results().unwrap();
        store.persist_bucket(&bucket(2000, false)).unwrap();
        store.commit_writes().unwrap();

        let stored = store.bucket(2000).unwrap().unwrap();
        assert!(!stored.is_interim());

        // Nothing left in the interim index
        store.delete_interim_results().unwrap();
        store.commit_writes().unwrap();
        assert!(store.bucket(2000).unwrap().is_some());
    }

    #[test]
    fn test_reissued_interim_stays_indexed() {
        let (_dir, store) = open_store();
        store.persist_bucket(&bucket(2000, true)).unwrap();
        store.commit_writes().unwrap();

        store.delete_interim_results().unwrap();
        store.persist_bucket(&bucket(2000, true)).unwrap();
        store.commit_writes().unwrap();
        assert!(store.bucket(2000).unwrap().is_some());

        store.delete_interim_results().unwrap();
        store.commit_writes().unwrap();
        assert!(store.bucket(2000).unwrap().is_none());
    }

    #[test]
    fn test_job_stats() {
        let (_dir, store) = open_store();
        assert_eq!(store.bucket_count().unwrap(), 0);
        store.increment_bucket_count(1).unwrap();
        store.increment_bucket_count(2).unwrap();
        assert_eq!(store.bucket_count().unwrap(), 3);

        store.update_average_bucket_processing_time(100).unwrap();
        store.update_average_bucket_processing_time(200).unwrap();
        let avg = store.average_processing_time_ms().unwrap().unwrap();
        assert!((avg - 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_latest_quantiles() {
        let (_dir, store) = open_store();
        assert!(store.latest_quantiles().unwrap().is_none());
        for (ts, state) in [(5000, "older"), (9000, "newest"), (7000, "middle")] {
            store
                .persist_quantiles(&Quantiles {
                    timestamp: ts,
                    quantile_kind: None,
                    quantile_state: state.to_string(),
                })
                .unwrap();
        }
        store.commit_writes().unwrap();
        assert_eq!(store.latest_quantiles().unwrap().unwrap().quantile_state, "newest");
    }

    #[test]
    fn test_commit_spans_every_touched_tree() {
        let (_dir, store) = open_store();
        store.persist_bucket(&bucket(1000, true)).unwrap();
        store
            .persist_quantiles(&Quantiles {
                timestamp: 1000,
                quantile_kind: None,
                quantile_state: "q".to_string(),
            })
            .unwrap();
        store
            .persist_category_definition(&CategoryDefinition {
                category_id: 7,
                ..CategoryDefinition::default()
            })
            .unwrap();
        store.commit_writes().unwrap();

        assert_eq!(store.buckets().unwrap().len(), 1);
        assert_eq!(store.quantiles().unwrap().len(), 1);
        assert_eq!(store.categories().unwrap().len(), 1);
        assert_eq!(store.tree(INTERIM_INDEX).unwrap().len(), 1);
        assert_eq!(store.pending_writes(), 0);

        // Nothing staged commits cleanly
        store.commit_writes().unwrap();
    }

    #[test]
    fn test_reset_drops_only_this_job() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("shared.db")).unwrap());
        let a = SledResultsStore::from_db(Arc::clone(&db), "job-a");
        let b = SledResultsStore::from_db(db, "job-b");

        for store in [&a, &b] {
            store.persist_bucket(&bucket(1000, false)).unwrap();
            store.commit_writes().unwrap();
            store.increment_bucket_count(1).unwrap();
        }
        a.persist_bucket(&bucket(2000, false)).unwrap();

        a.reset().unwrap();
        assert!(a.buckets().unwrap().is_empty());
        assert_eq!(a.bucket_count().unwrap(), 0);
        assert_eq!(a.pending_writes(), 0);
        assert!(a.latest_quantiles().unwrap().is_none());

        assert_eq!(b.buckets().unwrap().len(), 1);
        assert_eq!(b.bucket_count().unwrap(), 1);
    }

    #[test]
    fn test_jobs_are_isolated() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Arc::new(sled::open(temp_dir.path().join("shared.db")).unwrap());
        let a = SledResultsStore::from_db(Arc::clone(&db), "job-a");
        let b = SledResultsStore::from_db(db, "job-b");

        a.persist_bucket(&bucket(1000, false)).unwrap();
        a.commit_writes().unwrap();

        assert_eq!(a.buckets().unwrap().len(), 1);
        assert!(b.buckets().unwrap().is_empty());
    }
}
