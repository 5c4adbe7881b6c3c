//! Result ingestion pipeline
//!
//! ```text
//! channel ─► ResultStreamReader ─► ResultRecordDecoder ─► ResultDispatcher
//!                                                          │
//!                      ┌───────────────┬───────────────────┼──────────────┐
//!                      ▼               ▼                   ▼              ▼
//!               PersistenceSink   Renormalizer        FlushBarrier   AlertRegistry
//! ```
//!
//! [`ResultProcessor`] owns the worker thread and is the entry point for
//! callers; the other types are exposed for embedding and tests.

pub mod alerts;
pub mod dispatcher;
mod error;
pub mod flush;
pub mod processor;

pub use alerts::{AlertObserver, AlertRegistry, LoggingAlertObserver};
pub use dispatcher::{DispatchStats, ResultDispatcher};
pub use error::ProcessorError;
pub use flush::FlushBarrier;
pub use processor::ResultProcessor;
