//! Ingest configuration loaded from TOML
//!
//! Every tunable of the ingestion pipeline lives here. Each field has a
//! default matching `config::defaults`, so an empty or missing file yields a
//! working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::defaults;
use crate::types::AlertTrigger;

/// Environment variable naming a config file
pub const CONFIG_ENV_VAR: &str = "INGEST_CONFIG";

/// Config file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "ingest_config.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one ingester.
///
/// Load with `IngestConfig::load()` which searches:
/// 1. `$INGEST_CONFIG` env var
/// 2. `./ingest_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Job whose results are ingested
    #[serde(default = "default_job_id")]
    pub job_id: String,

    /// Directory for the job lock and results store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Rescore each partition separately and compute per-partition maxima
    #[serde(default)]
    pub per_partition_normalization: bool,

    /// Default timeout for flush waits (ms)
    #[serde(default = "default_flush_wait_timeout_ms")]
    pub flush_wait_timeout_ms: u64,

    #[serde(default = "default_renormalizer_queue_capacity")]
    pub renormalizer_queue_capacity: usize,

    /// Weight of the newest sample in the processing-time average, in (0, 1]
    #[serde(default = "default_processing_time_smoothing")]
    pub processing_time_smoothing: f64,

    /// One-shot alerts registered at startup
    #[serde(default)]
    pub alerts: Vec<AlertTrigger>,
}

fn default_job_id() -> String {
    defaults::DEFAULT_JOB_ID.to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(defaults::DEFAULT_DATA_DIR)
}
const fn default_flush_wait_timeout_ms() -> u64 {
    defaults::FLUSH_WAIT_TIMEOUT_MS
}
const fn default_renormalizer_queue_capacity() -> usize {
    defaults::RENORMALIZER_QUEUE_CAPACITY
}
const fn default_processing_time_smoothing() -> f64 {
    defaults::PROCESSING_TIME_SMOOTHING
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            job_id: default_job_id(),
            data_dir: default_data_dir(),
            per_partition_normalization: false,
            flush_wait_timeout_ms: default_flush_wait_timeout_ms(),
            renormalizer_queue_capacity: default_renormalizer_queue_capacity(),
            processing_time_smoothing: default_processing_time_smoothing(),
            alerts: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Load configuration using the standard search order:
    /// 1. `$INGEST_CONFIG` environment variable
    /// 2. `./ingest_config.toml` in the current working directory
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), job_id = %config.job_id, "Loaded ingest config from INGEST_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from INGEST_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "INGEST_CONFIG points to non-existent file, falling back");
            }
        }

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(job_id = %config.job_id, "Loaded ingest config from ./ingest_config.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./ingest_config.toml, using defaults");
                }
            }
        }

        info!("No ingest_config.toml found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check every field, reporting all problems at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.job_id.trim().is_empty() {
            errors.push("job_id must not be empty".to_string());
        }
        if self
            .job_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace())
        {
            errors.push(format!(
                "job_id '{}' must not contain path separators or whitespace",
                self.job_id
            ));
        }
        if self.flush_wait_timeout_ms == 0 {
            errors.push("flush_wait_timeout_ms must be > 0".to_string());
        }
        if self.renormalizer_queue_capacity == 0 {
            errors.push("renormalizer_queue_capacity must be > 0".to_string());
        }
        if !(self.processing_time_smoothing > 0.0 && self.processing_time_smoothing <= 1.0) {
            errors.push(format!(
                "processing_time_smoothing ({:.3}) must be in (0, 1]",
                self.processing_time_smoothing
            ));
        }
        for (i, alert) in self.alerts.iter().enumerate() {
            if alert.normalized_probability_threshold.is_none() && alert.anomaly_threshold.is_none() {
                errors.push(format!("alerts[{i}]: at least one threshold must be set"));
            }
            for (name, value) in [
                ("normalized_probability_threshold", alert.normalized_probability_threshold),
                ("anomaly_threshold", alert.anomaly_threshold),
            ] {
                if let Some(v) = value {
                    if !(0.0..=100.0).contains(&v) {
                        errors.push(format!("alerts[{i}].{name} ({v:.3}) must be in [0, 100]"));
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    pub fn results_db_path(&self) -> PathBuf {
        self.data_dir.join(defaults::RESULTS_DB_NAME)
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("Config parse error ({}): {1}", .0.display())]
    Parse(PathBuf, toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),

    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}
