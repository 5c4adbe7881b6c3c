//! Result persistence
//!
//! [`PersistenceSink`] is the contract the dispatcher writes through.
//! [`SledResultsStore`] keeps results on disk, [`InMemorySink`] keeps them in
//! memory and records every call. [`JobLock`] stops two ingesters writing the
//! same job.

pub mod lockfile;
mod persistence;
mod sled_store;

pub use lockfile::JobLock;
pub use persistence::{CallLog, InMemorySink, PersistenceError, PersistenceSink};
pub use sled_store::SledResultsStore;
