//! Flush barrier
//!
//! Lets caller threads block until the dispatcher has seen a given flush
//! acknowledgement, or until the result stream has ended. The dispatcher is
//! the only writer; any number of threads may wait concurrently.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Default)]
struct FlushState {
    /// Acknowledged ids not yet consumed by a waiter
    acknowledged: HashSet<String>,
    started: bool,
    finished: bool,
}

/// Condition-variable guarded flush bookkeeping shared between the
/// dispatcher and waiting callers
#[derive(Debug, Default)]
pub struct FlushBarrier {
    state: Mutex<FlushState>,
    condvar: Condvar,
}

impl FlushBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    // The state is a plain set and two flags, always consistent between
    // statements, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, FlushState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the stream as started. Called once before the first record is read.
    pub fn begin(&self) {
        self.lock().started = true;
        self.condvar.notify_all();
    }

    /// Record that the engine acknowledged `flush_id`
    pub fn acknowledge(&self, flush_id: &str) {
        self.lock().acknowledged.insert(flush_id.to_string());
        debug!(flush_id, "Flush acknowledged");
        self.condvar.notify_all();
    }

    /// Mark the stream as finished, releasing every current and future waiter
    pub fn end(&self) {
        self.lock().finished = true;
        self.condvar.notify_all();
    }

    /// Block until `flush_id` is acknowledged, the stream finishes, or
    /// `timeout` elapses.
    ///
    /// Returns `true` in the first two cases and `false` on timeout. An
    /// acknowledged id is consumed, so a second wait for the same id only
    /// succeeds once the stream has finished.
    pub fn wait_for(&self, flush_id: &str, timeout: Duration) -> bool {
        let guard = self.lock();
        let (mut state, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |s| {
                !s.finished && !s.acknowledged.contains(flush_id)
            })
            .unwrap_or_else(PoisonError::into_inner);

        if state.acknowledged.remove(flush_id) {
            return true;
        }
        state.finished
    }

    /// Block until [`begin`](Self::begin) has run or `timeout` elapses
    pub fn wait_for_start(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (state, _) = self
            .condvar
            .wait_timeout_while(guard, timeout, |s| !s.started)
            .unwrap_or_else(PoisonError::into_inner);
        state.started
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Number of acknowledged ids nobody has waited for yet
    pub fn pending_acknowledgements(&self) -> usize {
        self.lock().acknowledged.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_acknowledged_id_returns_immediately() {
        let barrier = FlushBarrier::new();
        barrier.acknowledge("f1");

        let start = Instant::now();
        assert!(barrier.wait_for("f1", Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(barrier.pending_acknowledgements(), 0);
    }

    #[test]
    fn test_unknown_id_times_out() {
        let barrier = FlushBarrier::new();
        barrier.acknowledge("f1");
        assert!(!barrier.wait_for("f2", Duration::from_millis(50)));
        assert_eq!(barrier.pending_acknowledgements(), 1);
    }

    #[test]
    fn test_acknowledgement_is_consumed_once() {
        let barrier = FlushBarrier::new();
        barrier.acknowledge("f1");
        assert!(barrier.wait_for("f1", Duration::from_millis(50)));
        assert!(!barrier.wait_for("f1", Duration::from_millis(50)));
    }

    #[test]
    fn test_end_releases_waiters() {
        let barrier = Arc::new(FlushBarrier::new());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || barrier.wait_for(&format!("never-{i}"), Duration::from_secs(10)))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        barrier.end();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(barrier.is_finished());
    }

    #[test]
    fn test_waiter_woken_by_acknowledge() {
        let barrier = Arc::new(FlushBarrier::new());
        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait_for("f7", Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        barrier.acknowledge("f6");
        barrier.acknowledge("f7");

        assert!(waiter.join().unwrap());
        assert_eq!(barrier.pending_acknowledgements(), 1);
    }

    #[test]
    fn test_wait_for_start() {
        let barrier = Arc::new(FlushBarrier::new());
        assert!(!barrier.wait_for_start(Duration::from_millis(10)));

        let waiter = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait_for_start(Duration::from_secs(10)))
        };
        barrier.begin();
        assert!(waiter.join().unwrap());
    }
}
