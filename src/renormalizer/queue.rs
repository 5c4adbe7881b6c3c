//! Bounded-queue renormalizer actor
//!
//! `QueueRenormalizer` is the handle; `RenormalizerActor` owns the receiving
//! end and applies updates one at a time. The actor runs as a task on a
//! current-thread runtime hosted by the `<job_id>-renormalizer` thread, so the
//! handle works the same whether or not the caller lives inside a runtime.
//!
//! The `Renormalizer` methods are synchronous and block on the channels; call
//! them from a worker thread or `spawn_blocking`, never from an async task.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::Renormalizer;
use crate::types::Quantiles;

/// Rescores persisted results against new quantiles
pub trait ScoreUpdater: Send + Sync + 'static {
    fn update(&self, quantiles: &Quantiles, per_partition: bool) -> anyhow::Result<()>;
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Update {
        quantiles: Quantiles,
        per_partition: bool,
    },
    /// Answered once every command queued before it has run
    Idle { done: oneshot::Sender<()> },
    /// Answered with the number of updates abandoned behind the stop
    Stop { done: oneshot::Sender<usize> },
}

// ============================================================================
// Actor
// ============================================================================

struct RenormalizerActor {
    job_id: String,
    rx: mpsc::Receiver<Command>,
    updater: Arc<dyn ScoreUpdater>,
    /// Updates accepted but not finished, shared with the handle
    outstanding: Arc<watch::Sender<usize>>,
}

impl RenormalizerActor {
    async fn run(mut self) {
        info!(job_id = %self.job_id, "Renormalizer actor starting");

        let mut stop_reply = None;
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Update {
                    quantiles,
                    per_partition,
                } => {
                    debug!(
                        job_id = %self.job_id,
                        timestamp = quantiles.timestamp,
                        per_partition,
                        "Renormalizing"
                    );
                    if let Err(e) = self.updater.update(&quantiles, per_partition) {
                        error!(job_id = %self.job_id, error = %e, "Renormalization failed");
                    }
                    self.finish_one();
                }
                Command::Idle { done } => {
                    let _ = done.send(());
                }
                Command::Stop { done } => {
                    stop_reply = Some(done);
                    break;
                }
            }
        }

        // Anything that slipped in behind the stop is abandoned
        self.rx.close();
        let mut abandoned = 0usize;
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Update { .. } => {
                    abandoned += 1;
                    self.finish_one();
                }
                Command::Idle { done } => {
                    let _ = done.send(());
                }
                Command::Stop { done } => {
                    let _ = done.send(0);
                }
            }
        }
        if abandoned > 0 {
            warn!(job_id = %self.job_id, abandoned, "Renormalizer stopped with requests still queued");
        }
        if let Some(done) = stop_reply {
            let _ = done.send(abandoned);
        }

        info!(job_id = %self.job_id, "Renormalizer actor stopped");
    }

    fn finish_one(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Renormalizer that queues quantile updates for a dedicated actor
///
/// When the queue is full the caller blocks until the actor catches up;
/// updates are never dropped while the renormalizer is running.
pub struct QueueRenormalizer {
    job_id: String,
    tx: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl QueueRenormalizer {
    /// Spawn the actor on the thread `<job_id>-renormalizer`
    pub fn start(
        job_id: &str,
        capacity: usize,
        updater: Arc<dyn ScoreUpdater>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (outstanding, _) = watch::channel(0usize);
        let outstanding = Arc::new(outstanding);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let actor = RenormalizerActor {
            job_id: job_id.to_string(),
            rx,
            updater,
            outstanding: Arc::clone(&outstanding),
        };
        let worker = thread::Builder::new()
            .name(format!("{job_id}-renormalizer"))
            .spawn(move || runtime.block_on(actor.run()))?;

        info!(job_id, capacity, "Renormalizer started");

        Ok(Self {
            job_id: job_id.to_string(),
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            outstanding,
        })
    }

    fn sender(&self) -> Option<mpsc::Sender<Command>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn submit(&self, quantiles: &Quantiles, per_partition: bool) {
        let Some(tx) = self.sender() else {
            warn!(job_id = %self.job_id, "Renormalizer is shut down, ignoring quantiles");
            return;
        };

        self.outstanding.send_modify(|n| *n += 1);

        let cmd = Command::Update {
            quantiles: quantiles.clone(),
            per_partition,
        };
        let sent = match tx.try_send(cmd) {
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                debug!(job_id = %self.job_id, "Renormalizer queue full, waiting");
                tx.blocking_send(cmd).is_ok()
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
            Ok(()) => true,
        };

        if !sent {
            error!(job_id = %self.job_id, "Renormalizer actor has gone away");
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    /// Requests accepted but not yet completed
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Stop the actor without waiting for it
    ///
    /// Used on drop, which may run inside an async context where the
    /// blocking channel calls are not allowed.
    fn release(&self) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = tx {
            let (done, _) = oneshot::channel();
            if tx.try_send(Command::Stop { done }).is_err() {
                debug!(job_id = %self.job_id, "Renormalizer queue busy on drop, closing channel");
            }
        }
    }
}

impl Renormalizer for QueueRenormalizer {
    fn renormalise(&self, quantiles: &Quantiles) {
        self.submit(quantiles, false);
    }

    fn renormalise_with_partition(&self, quantiles: &Quantiles) {
        self.submit(quantiles, true);
    }

    fn wait_until_idle(&self) {
        let Some(tx) = self.sender() else {
            return;
        };
        let (done, idle) = oneshot::channel();
        if tx.blocking_send(Command::Idle { done }).is_err() {
            return;
        }
        // A dropped reply means the actor stopped, which is idle too
        let _ = idle.blocking_recv();
    }

    fn shutdown(&self) {
        let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };

        info!(job_id = %self.job_id, pending = self.outstanding(), "Shutting down renormalizer");

        // Stop queues behind pending work, so the actor drains first
        let (done, stopped) = oneshot::channel();
        if tx.blocking_send(Command::Stop { done }).is_err() {
            warn!(job_id = %self.job_id, "Renormalizer actor already exited");
        }
        drop(tx);
        if let Ok(abandoned) = stopped.blocking_recv() {
            debug!(job_id = %self.job_id, abandoned, "Renormalizer acknowledged stop");
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!(job_id = %self.job_id, "Renormalizer worker panicked");
            }
        }
    }
}

impl Drop for QueueRenormalizer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingUpdater {
        seen: Mutex<Vec<(String, bool)>>,
        delay: Duration,
    }

    impl ScoreUpdater for RecordingUpdater {
        fn update(&self, quantiles: &Quantiles, per_partition: bool) -> anyhow::Result<()> {
            thread::sleep(self.delay);
            self.seen
                .lock()
                .unwrap()
                .push((quantiles.quantile_state.clone(), per_partition));
            Ok(())
        }
    }

    fn quantiles(state: &str) -> Quantiles {
        Quantiles {
            quantile_state: state.to_string(),
            ..Quantiles::default()
        }
    }

    #[test]
    fn test_updates_run_in_order() {
        let updater = Arc::new(RecordingUpdater::default());
        let renormalizer = QueueRenormalizer::start("job", 4, updater.clone()).unwrap();

        renormalizer.renormalise(&quantiles("q1"));
        renormalizer.renormalise_with_partition(&quantiles("q2"));
        renormalizer.wait_until_idle();

        let seen = updater.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("q1".to_string(), false), ("q2".to_string(), true)]);
        assert_eq!(renormalizer.outstanding(), 0);
    }

    #[test]
    fn test_full_queue_blocks_instead_of_dropping() {
        let updater = Arc::new(RecordingUpdater {
            delay: Duration::from_millis(5),
            ..RecordingUpdater::default()
        });
        let renormalizer = QueueRenormalizer::start("job", 1, updater.clone()).unwrap();

        for i in 0..10 {
            renormalizer.renormalise(&quantiles(&format!("q{i}")));
        }
        renormalizer.wait_until_idle();
        assert_eq!(updater.seen.lock().unwrap().len(), 10);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_safe_without_work() {
        let renormalizer =
            QueueRenormalizer::start("job", 2, Arc::new(RecordingUpdater::default())).unwrap();
        renormalizer.shutdown();
        renormalizer.shutdown();
        renormalizer.wait_until_idle();
    }

    #[test]
    fn test_shutdown_drains_queued_work() {
        let updater = Arc::new(RecordingUpdater {
            delay: Duration::from_millis(10),
            ..RecordingUpdater::default()
        });
        let renormalizer = QueueRenormalizer::start("job", 8, updater.clone()).unwrap();
        renormalizer.renormalise(&quantiles("a"));
        renormalizer.renormalise(&quantiles("b"));
        renormalizer.shutdown();

        assert_eq!(updater.seen.lock().unwrap().len(), 2);
        assert_eq!(renormalizer.outstanding(), 0);
    }

    #[test]
    fn test_quantiles_after_shutdown_are_ignored() {
        let updater = Arc::new(RecordingUpdater::default());
        let renormalizer = QueueRenormalizer::start("job", 2, updater.clone()).unwrap();
        renormalizer.shutdown();
        renormalizer.renormalise(&quantiles("late"));
        assert!(updater.seen.lock().unwrap().is_empty());
        assert_eq!(renormalizer.outstanding(), 0);
    }

    #[test]
    fn test_handle_usable_from_spawn_blocking() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let updater = Arc::new(RecordingUpdater::default());
        let renormalizer = Arc::new(QueueRenormalizer::start("job", 2, updater.clone()).unwrap());

        let handle = Arc::clone(&renormalizer);
        runtime
            .block_on(runtime.spawn_blocking(move || {
                handle.renormalise(&quantiles("q1"));
                handle.shutdown();
            }))
            .unwrap();

        assert_eq!(updater.seen.lock().unwrap().len(), 1);
        // Dropping inside a runtime must not block or panic
        runtime.block_on(async move { drop(renormalizer) });
    }
}
