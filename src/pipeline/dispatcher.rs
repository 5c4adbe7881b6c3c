//! Result dispatcher
//!
//! The sequential loop at the heart of ingestion: pull a decoded record,
//! apply its side effects, repeat. Ordering matters here. Interim results are
//! deleted once before the first bucket of every segment (stream start, and
//! after each flush), and a flush is only acknowledged once everything before
//! it has been committed.

use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::alerts::AlertRegistry;
use super::flush::FlushBarrier;
use super::ProcessorError;
use crate::acquisition::{ResultRecordDecoder, ResultStreamReader};
use crate::renormalizer::Renormalizer;
use crate::storage::{PersistenceError, PersistenceSink};
use crate::types::{Bucket, DecodedRecord, FlushAcknowledgement, Quantiles};

// ============================================================================
// Statistics
// ============================================================================

/// Counters for one processed stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub records: u64,
    pub buckets: u64,
    pub interim_buckets: u64,
    pub interim_deletions: u64,
    pub quantiles: u64,
    pub flushes: u64,
    pub model_snapshots: u64,
    pub model_size_stats: u64,
    pub model_debug_outputs: u64,
    pub category_definitions: u64,
    pub alerts_fired: u64,
    pub field_warnings: u64,
    #[serde(skip)]
    pub elapsed: Duration,
}

// ============================================================================
// Cleanup
// ============================================================================

/// Runs the end-of-stream sequence exactly once: final commit, barrier end,
/// renormalizer shutdown. If the dispatch loop panics, `Drop` runs it.
struct StreamCleanup<'a> {
    job_id: &'a str,
    sink: &'a dyn PersistenceSink,
    barrier: &'a FlushBarrier,
    renormalizer: &'a dyn Renormalizer,
    done: bool,
}

impl StreamCleanup<'_> {
    fn run(&mut self) -> Result<(), PersistenceError> {
        if self.done {
            return Ok(());
        }
        self.done = true;

        let commit = self.sink.commit_writes();
        if let Err(e) = &commit {
            error!(job_id = %self.job_id, error = %e, "Final commit failed");
        }
        self.barrier.end();
        self.renormalizer.shutdown();
        commit
    }
}

impl Drop for StreamCleanup<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!(job_id = %self.job_id, "Dispatch loop unwound without cleanup, cleaning up now");
            let _ = self.run();
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Applies the side effects of each decoded record in stream order
pub struct ResultDispatcher {
    job_id: String,
    sink: Arc<dyn PersistenceSink>,
    renormalizer: Arc<dyn Renormalizer>,
    barrier: Arc<FlushBarrier>,
    alerts: Option<Arc<AlertRegistry>>,
    per_partition_normalization: bool,
    delete_interim_required: bool,
    stats: DispatchStats,
}

impl ResultDispatcher {
    pub fn new(
        job_id: impl Into<String>,
        sink: Arc<dyn PersistenceSink>,
        renormalizer: Arc<dyn Renormalizer>,
        barrier: Arc<FlushBarrier>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            sink,
            renormalizer,
            barrier,
            alerts: None,
            per_partition_normalization: false,
            delete_interim_required: true,
            stats: DispatchStats::default(),
        }
    }

    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<AlertRegistry>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    #[must_use]
    pub const fn per_partition_normalization(mut self, enabled: bool) -> Self {
        self.per_partition_normalization = enabled;
        self
    }

    /// Consume the whole channel.
    ///
    /// Always finishes with the cleanup sequence, whatever the outcome. The
    /// first error (stream, then persistence) is returned.
    pub fn run<R: Read>(mut self, channel: R) -> Result<DispatchStats, ProcessorError> {
        let started = Instant::now();
        self.delete_interim_required = true;
        self.barrier.begin();
        info!(
            job_id = %self.job_id,
            sink = self.sink.backend_name(),
            per_partition = self.per_partition_normalization,
            "📥 Result processing started"
        );

        let sink = Arc::clone(&self.sink);
        let barrier = Arc::clone(&self.barrier);
        let renormalizer = Arc::clone(&self.renormalizer);
        let job_id = self.job_id.clone();
        let mut cleanup = StreamCleanup {
            job_id: &job_id,
            sink: sink.as_ref(),
            barrier: barrier.as_ref(),
            renormalizer: renormalizer.as_ref(),
            done: false,
        };

        let outcome = self.process(channel);
        let commit = cleanup.run();

        self.stats.elapsed = started.elapsed();
        let result = match (outcome, commit) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(ProcessorError::Persistence(e)),
            (Ok(()), Ok(())) => Ok(self.stats.clone()),
        };

        self.log_summary(&result);
        result
    }

    fn process<R: Read>(&mut self, channel: R) -> Result<(), ProcessorError> {
        let reader = ResultStreamReader::new(channel);
        let mut decoder = ResultRecordDecoder::new();

        for object in reader {
            let object = object?;
            let decoded = decoder.decode(&object);
            self.stats.field_warnings = decoder.field_warnings();
            self.dispatch(decoded?)?;
        }
        Ok(())
    }

    /// Apply one record's side effects
    pub fn dispatch(&mut self, record: DecodedRecord) -> Result<(), PersistenceError> {
        self.stats.records += 1;
        debug!(job_id = %self.job_id, kind = record.kind(), "Dispatching record");

        match record {
            DecodedRecord::Bucket(bucket) => self.handle_bucket(*bucket)?,
            DecodedRecord::Quantiles(quantiles) => self.handle_quantiles(&quantiles)?,
            DecodedRecord::Flush(ack) => self.handle_flush(&ack)?,
            DecodedRecord::CategoryDefinition(category) => {
                self.sink.persist_category_definition(&category)?;
                self.stats.category_definitions += 1;
            }
            DecodedRecord::ModelDebugOutput(output) => {
                self.sink.persist_model_debug_output(&output)?;
                self.stats.model_debug_outputs += 1;
            }
            DecodedRecord::ModelSizeStats(stats) => {
                debug!(
                    job_id = %self.job_id,
                    model_bytes = stats.model_bytes,
                    memory_status = ?stats.memory_status,
                    "Model size stats"
                );
                self.sink.persist_model_size_stats(&stats)?;
                self.stats.model_size_stats += 1;
            }
            DecodedRecord::ModelSnapshot(snapshot) => {
                info!(job_id = %self.job_id, snapshot_id = %snapshot.snapshot_id, "Model snapshot");
                self.sink.persist_model_snapshot(&snapshot)?;
                self.stats.model_snapshots += 1;
            }
        }
        Ok(())
    }

    fn handle_bucket(&mut self, mut bucket: Bucket) -> Result<(), PersistenceError> {
        if self.delete_interim_required {
            debug!(job_id = %self.job_id, "Deleting interim results");
            self.sink.delete_interim_results()?;
            self.delete_interim_required = false;
            self.stats.interim_deletions += 1;
        }

        if self.per_partition_normalization {
            bucket.calc_max_normalized_probability_per_partition();
        }

        debug!(
            job_id = %self.job_id,
            bucket_time = %bucket.bucket_time(),
            interim = bucket.is_interim(),
            anomaly_score = bucket.anomaly_score,
            "Bucket"
        );
        self.sink.persist_bucket(&bucket)?;
        self.stats.buckets += 1;

        if bucket.is_interim() {
            self.stats.interim_buckets += 1;
        } else {
            self.sink.increment_bucket_count(1)?;
            self.sink
                .update_average_bucket_processing_time(bucket.processing_time_ms)?;
        }

        if let Some(alerts) = &self.alerts {
            self.stats.alerts_fired += alerts.notify(&bucket) as u64;
        }
        Ok(())
    }

    fn handle_quantiles(&mut self, quantiles: &Quantiles) -> Result<(), PersistenceError> {
        self.sink.persist_quantiles(quantiles)?;
        self.stats.quantiles += 1;

        if self.per_partition_normalization {
            self.renormalizer.renormalise_with_partition(quantiles);
        } else {
            self.renormalizer.renormalise(quantiles);
        }
        Ok(())
    }

    fn handle_flush(&mut self, ack: &FlushAcknowledgement) -> Result<(), PersistenceError> {
        info!(job_id = %self.job_id, flush_id = %ack.id, "Flush acknowledgement received");
        self.sink.commit_writes()?;
        self.barrier.acknowledge(&ack.id);
        self.delete_interim_required = true;
        self.stats.flushes += 1;
        Ok(())
    }

    fn log_summary(&self, result: &Result<DispatchStats, ProcessorError>) {
        let s = &self.stats;
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("Result Processing Statistics (job {})", self.job_id);
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("Records dispatched:   {}", s.records);
        info!("Buckets:              {} ({} interim)", s.buckets, s.interim_buckets);
        info!("Interim deletions:    {}", s.interim_deletions);
        info!("Quantiles:            {}", s.quantiles);
        info!("Flushes:              {}", s.flushes);
        info!("Model snapshots:      {}", s.model_snapshots);
        info!("Alerts fired:         {}", s.alerts_fired);
        info!("Field warnings:       {}", s.field_warnings);
        info!("Elapsed:              {:.2?}", s.elapsed);
        match result {
            Ok(_) => info!("Outcome:              ✓ stream complete"),
            Err(e) => error!("Outcome:              ✗ {}", e),
        }
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renormalizer::NoOpRenormalizer;
    use crate::storage::InMemorySink;
    use std::sync::Mutex;

    /// Renormalizer writing into the sink's call log
    struct LoggingRenormalizer {
        calls: crate::storage::CallLog,
    }

    impl Renormalizer for LoggingRenormalizer {
        fn renormalise(&self, quantiles: &Quantiles) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("renormalise({})", quantiles.quantile_state));
        }

        fn renormalise_with_partition(&self, quantiles: &Quantiles) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("renormalise_with_partition({})", quantiles.quantile_state));
        }

        fn wait_until_idle(&self) {}

        fn shutdown(&self) {
            self.calls.lock().unwrap().push("shutdown".to_string());
        }
    }

    fn dispatcher() -> (ResultDispatcher, Arc<InMemorySink>, Arc<FlushBarrier>) {
        let calls = crate::storage::CallLog::default();
        let sink = Arc::new(InMemorySink::with_call_log(Arc::clone(&calls)));
        let barrier = Arc::new(FlushBarrier::new());
        let dispatcher = ResultDispatcher::new(
            "test-job",
            sink.clone(),
            Arc::new(LoggingRenormalizer { calls }),
            barrier.clone(),
        );
        (dispatcher, sink, barrier)
    }

    #[test]
    fn test_segment_call_order() {
        let (dispatcher, sink, barrier) = dispatcher();
        let input = r#"
            {"timestamp": 10}
            {"quantileState": "q1", "timestamp": 10}
            {"timestamp": 20, "isInterim": true}
            {"flush": "f1"}
            {"timestamp": 30, "isInterim": false}
        "#;

        let stats = dispatcher.run(input.as_bytes()).unwrap();

        assert_eq!(
            sink.calls(),
            vec![
                "delete_interim_results",
                "persist_bucket(10000)",
                "persist_quantiles(q1)",
                "renormalise(q1)",
                "persist_bucket(20000)",
                "commit_writes",
                "delete_interim_results",
                "persist_bucket(30000)",
                "commit_writes",
                "shutdown",
            ]
        );
        assert_eq!(stats.buckets, 3);
        assert_eq!(stats.interim_buckets, 1);
        assert_eq!(stats.interim_deletions, 2);
        assert_eq!(stats.flushes, 1);
        assert!(barrier.is_finished());
        assert!(barrier.wait_for("f1", Duration::from_millis(1)));
    }

    #[test]
    fn test_no_interim_delete_without_buckets() {
        let (dispatcher, sink, _barrier) = dispatcher();
        let input = r#"[{"quantileState": "q"}, {"flush": "a"}, {"flush": "b"}]"#;
        dispatcher.run(input.as_bytes()).unwrap();

        assert!(!sink.calls().iter().any(|c| c == "delete_interim_results"));
    }

    #[test]
    fn test_per_partition_mode() {
        let (dispatcher, sink, _barrier) = dispatcher();
        let dispatcher = dispatcher.per_partition_normalization(true);
        let input = r#"
            {"timestamp": 1, "maxNormalizedProbability": 5.0, "records": [
                {"partitionFieldValue": "A", "normalizedProbability": 40.0},
                {"partitionFieldValue": "B", "normalizedProbability": 90.0}
            ]}
            {"quantileState": "q"}
        "#;
        dispatcher.run(input.as_bytes()).unwrap();

        let buckets = sink.buckets();
        assert_eq!(buckets.len(), 1);
        assert!((buckets[0].max_normalized_probability - 90.0).abs() < f64::EPSILON);
        assert!(sink
            .calls()
            .contains(&"renormalise_with_partition(q)".to_string()));
    }

    #[test]
    fn test_unknown_kind_aborts_after_cleanup() {
        let (dispatcher, sink, barrier) = dispatcher();
        let input = r#"{"timestamp": 1} {"unknown": 18} {"timestamp": 2}"#;

        let err = dispatcher.run(input.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::Stream(crate::acquisition::StreamError::UnknownRecordKind { .. })
        ));

        let calls = sink.calls();
        assert_eq!(calls.last().map(String::as_str), Some("shutdown"));
        assert!(calls.contains(&"commit_writes".to_string()));
        assert!(!calls.contains(&"persist_bucket(2000)".to_string()));
        assert!(barrier.is_finished());
        // The bucket before the failure was still committed
        assert_eq!(sink.buckets().len(), 1);
    }

    #[test]
    fn test_bucket_count_and_processing_time() {
        let (dispatcher, sink, _barrier) = dispatcher();
        let input = r#"
            {"timestamp": 1, "processingTimeMs": 100}
            {"timestamp": 2, "processingTimeMs": 300, "isInterim": true}
            {"timestamp": 3, "processingTimeMs": 200}
        "#;
        dispatcher.run(input.as_bytes()).unwrap();

        assert_eq!(sink.bucket_count(), 2);
        let avg = sink.average_processing_time_ms().unwrap();
        assert!((avg - 110.0).abs() < 1e-9);
    }

    struct FailingSink;

    impl PersistenceSink for FailingSink {
        fn persist_bucket(&self, _bucket: &Bucket) -> Result<(), PersistenceError> {
            Err(PersistenceError::Storage("disk full".to_string()))
        }
        fn persist_category_definition(
            &self,
            _category: &crate::types::CategoryDefinition,
        ) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn persist_model_debug_output(
            &self,
            _output: &crate::types::ModelDebugOutput,
        ) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn persist_model_size_stats(
            &self,
            _stats: &crate::types::ModelSizeStats,
        ) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn persist_model_snapshot(
            &self,
            _snapshot: &crate::types::ModelSnapshot,
        ) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn persist_quantiles(&self, _quantiles: &Quantiles) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn delete_interim_results(&self) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn commit_writes(&self) -> Result<(), PersistenceError> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "failing"
        }
    }

    #[test]
    fn test_persistence_failure_is_fatal() {
        let barrier = Arc::new(FlushBarrier::new());
        let dispatcher = ResultDispatcher::new(
            "test-job",
            Arc::new(FailingSink),
            Arc::new(NoOpRenormalizer),
            barrier.clone(),
        );
        let err = dispatcher
            .run(r#"{"timestamp": 1} {"flush": "f"}"#.as_bytes())
            .unwrap_err();

        assert!(matches!(err, ProcessorError::Persistence(_)));
        assert!(barrier.is_finished());
        // The flush after the failure was never reached
        assert_eq!(barrier.pending_acknowledgements(), 0);
    }

    #[test]
    fn test_alerts_offered_final_buckets() {
        use crate::pipeline::alerts::AlertObserver;
        use crate::types::AlertTrigger;

        struct Recorder {
            triggers: Vec<AlertTrigger>,
            fired: Mutex<Vec<i64>>,
        }
        impl AlertObserver for Recorder {
            fn triggers(&self) -> &[AlertTrigger] {
                &self.triggers
            }
            fn fire(&self, bucket: &Bucket) {
                self.fired.lock().unwrap().push(bucket.timestamp);
            }
        }

        let registry = Arc::new(AlertRegistry::new());
        let recorder = Arc::new(Recorder {
            triggers: vec![AlertTrigger::bucket(None, Some(50.0))],
            fired: Mutex::new(Vec::new()),
        });
        registry.add(recorder.clone());

        let (dispatcher, _sink, _barrier) = dispatcher();
        let stats = dispatcher
            .with_alerts(registry.clone())
            .run(
                r#"
                {"timestamp": 1, "anomalyScore": 80, "isInterim": true}
                {"timestamp": 2, "anomalyScore": 10}
                {"timestamp": 3, "anomalyScore": 70}
                {"timestamp": 4, "anomalyScore": 95}
                "#
                .as_bytes(),
            )
            .unwrap();

        assert_eq!(*recorder.fired.lock().unwrap(), vec![3000]);
        assert_eq!(stats.alerts_fired, 1);
        assert_eq!(registry.count(), 0);
    }
}
