//! Ingest Configuration Module
//!
//! ## Loading Order
//!
//! 1. `INGEST_CONFIG` environment variable (path to TOML file)
//! 2. `ingest_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! ## Usage
//!
//! Call `config::init()` once at startup, then `config::get()` anywhere:
//!
//! ```ignore
//! // In main():
//! config::init(IngestConfig::load());
//!
//! // Anywhere in the codebase:
//! let timeout = config::get().flush_wait_timeout_ms;
//! ```

mod ingest_config;
pub mod defaults;

pub use ingest_config::*;

use std::sync::OnceLock;

/// Global ingest configuration, initialized once at startup.
static INGEST_CONFIG: OnceLock<IngestConfig> = OnceLock::new();

/// Initialize the global configuration.
///
/// Only the first call takes effect; later calls are logged and ignored.
pub fn init(config: IngestConfig) {
    if INGEST_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global configuration.
///
/// Falls back to built-in defaults if `init()` was never called.
pub fn get() -> &'static IngestConfig {
    INGEST_CONFIG.get_or_init(|| {
        tracing::warn!("config::get() called before config::init(), using defaults");
        IngestConfig::default()
    })
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    INGEST_CONFIG.get().is_some()
}
