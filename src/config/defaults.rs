//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Job
// ============================================================================

/// Job id used when none is configured.
pub const DEFAULT_JOB_ID: &str = "default";

/// Root directory for lock files and the results store.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Results database directory name under the data directory.
pub const RESULTS_DB_NAME: &str = "results.db";

// ============================================================================
// Flush
// ============================================================================

/// How long a caller waits for a flush acknowledgement (ms).
pub const FLUSH_WAIT_TIMEOUT_MS: u64 = 1_000;

// ============================================================================
// Renormalization
// ============================================================================

/// Quantile updates held in the renormalizer queue before submitters block.
pub const RENORMALIZER_QUEUE_CAPACITY: usize = 50;

// ============================================================================
// Job statistics
// ============================================================================

/// Weight of the newest sample in the bucket processing-time moving average.
pub const PROCESSING_TIME_SMOOTHING: f64 = 0.1;
