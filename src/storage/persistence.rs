//! PersistenceSink trait: pluggable result storage
//!
//! The dispatcher stages every decoded result through this trait and
//! publishes them with `commit_writes` at each flush and at stream end:
//! - `InMemorySink`: in-memory store for tests and `--in-memory` runs
//! - `SledResultsStore`: durable sled backend

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::types::{
    Bucket, CategoryDefinition, ModelDebugOutput, ModelSizeStats, ModelSnapshot, Quantiles,
};

/// Destination for decoded results
///
/// Implementations must be thread-safe (Send + Sync): the dispatcher runs on
/// its own worker thread while callers may inspect the sink.
pub trait PersistenceSink: Send + Sync {
    /// Stage a bucket together with its nested records and influencers
    fn persist_bucket(&self, bucket: &Bucket) -> Result<(), PersistenceError>;

    fn persist_category_definition(
        &self,
        category: &CategoryDefinition,
    ) -> Result<(), PersistenceError>;

    fn persist_model_debug_output(&self, output: &ModelDebugOutput) -> Result<(), PersistenceError>;

    fn persist_model_size_stats(&self, stats: &ModelSizeStats) -> Result<(), PersistenceError>;

    fn persist_model_snapshot(&self, snapshot: &ModelSnapshot) -> Result<(), PersistenceError>;

    fn persist_quantiles(&self, quantiles: &Quantiles) -> Result<(), PersistenceError>;

    /// Remove every non-final result previously written for the job
    fn delete_interim_results(&self) -> Result<(), PersistenceError>;

    /// Durably publish everything staged since the previous commit
    fn commit_writes(&self) -> Result<(), PersistenceError>;

    /// Add `count` processed buckets to the job's running total
    fn increment_bucket_count(&self, _count: u64) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Fold one bucket's processing time into the job's running average
    fn update_average_bucket_processing_time(&self, _time_ms: u64) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<sled::Error> for PersistenceError {
    fn from(err: sled::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<sled::transaction::TransactionError<()>> for PersistenceError {
    fn from(err: sled::transaction::TransactionError<()>) -> Self {
        match err {
            sled::transaction::TransactionError::Storage(e) => Self::from(e),
            sled::transaction::TransactionError::Abort(()) => {
                Self::Storage("transaction aborted".to_string())
            }
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Shared, ordered log of sink calls
pub type CallLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Default)]
struct MemoryState {
    staged_buckets: Vec<Bucket>,
    buckets: Vec<Bucket>,
    categories: Vec<CategoryDefinition>,
    debug_outputs: Vec<ModelDebugOutput>,
    size_stats: Vec<ModelSizeStats>,
    snapshots: Vec<ModelSnapshot>,
    quantiles: Vec<Quantiles>,
    bucket_count: u64,
    average_processing_time_ms: Option<f64>,
    commits: u64,
}

/// In-memory sink for testing and throwaway runs
///
/// Thread-safe via `RwLock`. Not durable: data is lost on restart. Buckets are
/// staged until `commit_writes`; every call is appended to the call log.
pub struct InMemorySink {
    state: RwLock<MemoryState>,
    calls: CallLog,
    smoothing: f64,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::with_call_log(CallLog::default())
    }

    /// Record calls into an existing log, shared with other collaborators
    pub fn with_call_log(calls: CallLog) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            calls,
            smoothing: crate::config::defaults::PROCESSING_TIME_SMOOTHING,
        }
    }

    #[must_use]
    pub const fn with_processing_time_smoothing(mut self, alpha: f64) -> Self {
        self.smoothing = alpha;
        self
    }

    fn log(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryState>, PersistenceError> {
        self.state
            .write()
            .map_err(|e| PersistenceError::Storage(e.to_string()))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Committed buckets in commit order
    pub fn buckets(&self) -> Vec<Bucket> {
        self.read().buckets.clone()
    }

    pub fn staged_bucket_count(&self) -> usize {
        self.read().staged_buckets.len()
    }

    pub fn quantiles(&self) -> Vec<Quantiles> {
        self.read().quantiles.clone()
    }

    pub fn categories(&self) -> Vec<CategoryDefinition> {
        self.read().categories.clone()
    }

    pub fn model_snapshots(&self) -> Vec<ModelSnapshot> {
        self.read().snapshots.clone()
    }

    pub fn model_size_stats(&self) -> Vec<ModelSizeStats> {
        self.read().size_stats.clone()
    }

    pub fn model_debug_outputs(&self) -> Vec<ModelDebugOutput> {
        self.read().debug_outputs.clone()
    }

    pub fn bucket_count(&self) -> u64 {
        self.read().bucket_count
    }

    pub fn average_processing_time_ms(&self) -> Option<f64> {
        self.read().average_processing_time_ms
    }

    pub fn commits(&self) -> u64 {
        self.read().commits
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceSink for InMemorySink {
    fn persist_bucket(&self, bucket: &Bucket) -> Result<(), PersistenceError> {
        self.log(format!("persist_bucket({})", bucket.timestamp));
        self.write()?.staged_buckets.push(bucket.clone());
        Ok(())
    }

    fn persist_category_definition(
        &self,
        category: &CategoryDefinition,
    ) -> Result<(), PersistenceError> {
        self.log(format!("persist_category_definition({})", category.category_id));
        self.write()?.categories.push(category.clone());
        Ok(())
    }

    fn persist_model_debug_output(&self, output: &ModelDebugOutput) -> Result<(), PersistenceError> {
        self.log(format!("persist_model_debug_output({})", output.timestamp));
        self.write()?.debug_outputs.push(output.clone());
        Ok(())
    }

    fn persist_model_size_stats(&self, stats: &ModelSizeStats) -> Result<(), PersistenceError> {
        self.log(format!("persist_model_size_stats({})", stats.model_bytes));
        self.write()?.size_stats.push(stats.clone());
        Ok(())
    }

    fn persist_model_snapshot(&self, snapshot: &ModelSnapshot) -> Result<(), PersistenceError> {
        self.log(format!("persist_model_snapshot({})", snapshot.snapshot_id));
        self.write()?.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn persist_quantiles(&self, quantiles: &Quantiles) -> Result<(), PersistenceError> {
        self.log(format!("persist_quantiles({})", quantiles.quantile_state));
        self.write()?.quantiles.push(quantiles.clone());
        Ok(())
    }

    fn delete_interim_results(&self) -> Result<(), PersistenceError> {
        self.log("delete_interim_results".to_string());
        let mut state = self.write()?;
        state.staged_buckets.retain(|b| !b.is_interim());
        state.buckets.retain(|b| !b.is_interim());
        Ok(())
    }

    fn commit_writes(&self) -> Result<(), PersistenceError> {
        self.log("commit_writes".to_string());
        let mut state = self.write()?;
        let staged = std::mem::take(&mut state.staged_buckets);
        for bucket in staged {
            // A later write for the same bucket replaces the earlier one
            state.buckets.retain(|b| b.timestamp != bucket.timestamp);
            state.buckets.push(bucket);
        }
        state.commits += 1;
        Ok(())
    }

    fn increment_bucket_count(&self, count: u64) -> Result<(), PersistenceError> {
        self.write()?.bucket_count += count;
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_average_bucket_processing_time(&self, time_ms: u64) -> Result<(), PersistenceError> {
        let alpha = self.smoothing;
        let mut state = self.write()?;
        let sample = time_ms as f64;
        state.average_processing_time_ms = Some(match state.average_processing_time_ms {
            Some(avg) => alpha.mul_add(sample, (1.0 - alpha) * avg),
            None => sample,
        });
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}
