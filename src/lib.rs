//! autodetect-ingest: anomaly-detection result ingestion
//!
//! Reads the result stream an anomaly-detection engine writes for one job,
//! decodes each record, and routes it to persistence, renormalization,
//! flush acknowledgement and alerting.
//!
//! ## Modules
//!
//! - **acquisition**: streaming JSON reader and record decoder
//! - **pipeline**: dispatcher, flush barrier, alerts and the processor lifecycle
//! - **storage**: persistence sinks (sled and in-memory) and the job lock
//! - **renormalizer**: quantile update handling
//! - **config**: TOML configuration and defaults

pub mod acquisition;
pub mod config;
pub mod pipeline;
pub mod renormalizer;
pub mod storage;
pub mod types;

pub use acquisition::{ResultRecordDecoder, ResultStreamReader, StreamError};
pub use config::IngestConfig;
pub use pipeline::{DispatchStats, ProcessorError, ResultDispatcher, ResultProcessor};
pub use renormalizer::{NoOpRenormalizer, QueueRenormalizer, Renormalizer, ScoreUpdater};
pub use storage::{InMemorySink, JobLock, PersistenceError, PersistenceSink, SledResultsStore};
pub use types::{Bucket, DecodedRecord, Quantiles};
