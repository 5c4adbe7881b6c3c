//! Result processor lifecycle
//!
//! Owns the worker thread that runs a [`ResultDispatcher`] over one result
//! channel, and exposes the only API callers need: `start`,
//! `await_completion` and `wait_for_flush`.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use super::alerts::AlertRegistry;
use super::dispatcher::{DispatchStats, ResultDispatcher};
use super::flush::FlushBarrier;
use super::ProcessorError;
use crate::renormalizer::Renormalizer;
use crate::storage::{JobLock, PersistenceSink};

type Worker = JoinHandle<Result<DispatchStats, ProcessorError>>;

/// Processes one result stream for one job
pub struct ResultProcessor {
    job_id: String,
    sink: Arc<dyn PersistenceSink>,
    renormalizer: Arc<dyn Renormalizer>,
    barrier: Arc<FlushBarrier>,
    alerts: Arc<AlertRegistry>,
    job_lock: Mutex<Option<JobLock>>,
    worker: Mutex<Option<Worker>>,
    started: AtomicBool,
}

impl ResultProcessor {
    pub fn new(
        job_id: impl Into<String>,
        sink: Arc<dyn PersistenceSink>,
        renormalizer: Arc<dyn Renormalizer>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            sink,
            renormalizer,
            barrier: Arc::new(FlushBarrier::new()),
            alerts: Arc::new(AlertRegistry::new()),
            job_lock: Mutex::new(None),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Hold `lock` for the lifetime of the stream; it is released once the
    /// worker has finished cleanup.
    #[must_use]
    pub fn with_job_lock(self, lock: JobLock) -> Self {
        *self.job_lock.lock().unwrap_or_else(PoisonError::into_inner) = Some(lock);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Observers offered every finalized bucket
    pub const fn alerts(&self) -> &Arc<AlertRegistry> {
        &self.alerts
    }

    fn claim(&self) -> Result<(ResultDispatcher, Option<JobLock>), ProcessorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ProcessorError::AlreadyStarted);
        }
        let lock = self.job_lock.lock().unwrap_or_else(PoisonError::into_inner).take();
        let dispatcher = ResultDispatcher::new(
            self.job_id.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.renormalizer),
            Arc::clone(&self.barrier),
        )
        .with_alerts(Arc::clone(&self.alerts));
        Ok((dispatcher, lock))
    }

    /// Begin consuming `channel` on a dedicated worker thread
    pub fn start<R>(&self, channel: R, per_partition_normalization: bool) -> Result<(), ProcessorError>
    where
        R: Read + Send + 'static,
    {
        let (dispatcher, lock) = self.claim()?;
        let dispatcher = dispatcher.per_partition_normalization(per_partition_normalization);

        let handle = thread::Builder::new()
            .name(format!("{}-results", self.job_id))
            .spawn(move || {
                let result = dispatcher.run(channel);
                drop(lock);
                result
            })
            .map_err(|e| {
                // Nobody will ever end the stream, so release waiters here
                self.barrier.end();
                ProcessorError::Spawn(e)
            })?;

        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(job_id = %self.job_id, "Result processor worker started");
        Ok(())
    }

    /// Consume `channel` on the calling thread
    pub fn run<R: Read>(
        &self,
        channel: R,
        per_partition_normalization: bool,
    ) -> Result<DispatchStats, ProcessorError> {
        let (dispatcher, lock) = self.claim()?;
        let result = dispatcher
            .per_partition_normalization(per_partition_normalization)
            .run(channel);
        drop(lock);
        result
    }

    /// Block until the worker has finished and report how it ended
    pub fn await_completion(&self) -> Result<DispatchStats, ProcessorError> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ProcessorError::NotStarted)?;

        debug!(job_id = %self.job_id, "Waiting for result processor to finish");
        handle.join().map_err(|_| ProcessorError::WorkerPanicked)?
    }

    /// Block until `flush_id` is acknowledged or the stream ends.
    ///
    /// Returns `false` only on timeout.
    pub fn wait_for_flush(&self, flush_id: &str, timeout: Duration) -> bool {
        self.barrier.wait_for(flush_id, timeout)
    }

    /// [`wait_for_flush`](Self::wait_for_flush) with the configured
    /// `flush_wait_timeout_ms`
    pub fn wait_for_flush_default(&self, flush_id: &str) -> bool {
        let timeout = Duration::from_millis(crate::config::get().flush_wait_timeout_ms);
        self.wait_for_flush(flush_id, timeout)
    }

    /// Block until the worker has begun reading the stream
    pub fn wait_for_start(&self, timeout: Duration) -> bool {
        self.barrier.wait_for_start(timeout)
    }

    pub fn is_finished(&self) -> bool {
        self.barrier.is_finished()
    }
}
