//! One-shot alert observers offered each finalized bucket

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::types::{AlertTrigger, Bucket};

/// Callback registered for bucket alerts
///
/// An observer fires at most once: as soon as any of its triggers matches a
/// bucket it is removed from the registry and then fired.
pub trait AlertObserver: Send + Sync {
    fn triggers(&self) -> &[AlertTrigger];

    fn fire(&self, bucket: &Bucket);

    fn is_triggered(&self, bucket: &Bucket) -> bool {
        self.triggers().iter().any(|t| t.is_triggered(bucket))
    }
}

/// Ordered set of active observers
#[derive(Default)]
pub struct AlertRegistry {
    observers: Mutex<Vec<Arc<dyn AlertObserver>>>,
}

impl AlertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn AlertObserver>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, observer: Arc<dyn AlertObserver>) {
        self.lock().push(observer);
    }

    /// Remove a previously added observer. Returns false if it was not registered.
    pub fn remove(&self, observer: &Arc<dyn AlertObserver>) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Offer a bucket to every active observer.
    ///
    /// Interim buckets are never offered. Callbacks run after the lock is
    /// released, so an observer may add or remove observers from `fire`.
    /// Returns the number of observers fired.
    pub fn notify(&self, bucket: &Bucket) -> usize {
        if bucket.is_interim() {
            return 0;
        }

        let snapshot: Vec<Arc<dyn AlertObserver>> = self.lock().clone();
        if snapshot.is_empty() {
            return 0;
        }

        let fired: Vec<Arc<dyn AlertObserver>> = snapshot
            .into_iter()
            .filter(|o| o.is_triggered(bucket))
            .collect();
        if fired.is_empty() {
            return 0;
        }

        // Only fire observers this call actually removed, so a concurrent
        // notify can never fire the same registration twice
        let removed: Vec<Arc<dyn AlertObserver>> = {
            let mut observers = self.lock();
            fired
                .into_iter()
                .filter(|f| {
                    let before = observers.len();
                    observers.retain(|o| !Arc::ptr_eq(o, f));
                    observers.len() != before
                })
                .collect()
        };

        for observer in &removed {
            observer.fire(bucket);
        }
        removed.len()
    }
}

/// Observer that reports fired alerts through the log
pub struct LoggingAlertObserver {
    job_id: String,
    triggers: Vec<AlertTrigger>,
}

impl LoggingAlertObserver {
    pub const fn new(job_id: String, triggers: Vec<AlertTrigger>) -> Self {
        Self { job_id, triggers }
    }
}

impl AlertObserver for LoggingAlertObserver {
    fn triggers(&self) -> &[AlertTrigger] {
        &self.triggers
    }

    fn fire(&self, bucket: &Bucket) {
        warn!(
            job_id = %self.job_id,
            bucket_time = %bucket.bucket_time(),
            anomaly_score = bucket.anomaly_score,
            max_normalized_probability = bucket.max_normalized_probability,
            "🚨 Anomaly alert fired"
        );
    }
}
