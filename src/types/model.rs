//! Standalone model-state records emitted by the analytics engine

use serde::{Deserialize, Serialize};

/// Discovered message template used to categorize unstructured log lines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryDefinition {
    pub category_id: i64,
    pub terms: String,
    pub regex: String,
    pub max_matching_length: u64,
    pub examples: Vec<String>,
}

/// Memory pressure reported alongside model size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryStatus {
    #[default]
    Ok,
    SoftLimit,
    HardLimit,
}

impl MemoryStatus {
    /// Parse the wire representation, case-insensitive
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "SOFT_LIMIT" => Some(Self::SoftLimit),
            "HARD_LIMIT" => Some(Self::HardLimit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSizeStats {
    pub model_bytes: u64,
    pub total_by_field_count: u64,
    pub total_over_field_count: u64,
    pub total_partition_field_count: u64,
    pub bucket_allocation_failures_count: u64,
    pub memory_status: MemoryStatus,
    /// Epoch ms of the last bucket covered by these stats
    pub timestamp: i64,
    /// Epoch ms at which the engine produced these stats
    pub log_time: i64,
}

/// Statistical state used to rescore historical probabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantiles {
    pub timestamp: i64,
    pub quantile_kind: Option<String>,
    pub quantile_state: String,
}

/// Persisted checkpoint of the engine's model state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub snapshot_id: String,
    pub timestamp: i64,
    pub description: Option<String>,
    pub restore_priority: i64,
    pub snapshot_doc_count: u64,
    pub latest_record_time_stamp: i64,
    pub latest_result_time_stamp: i64,
    pub model_size_stats: Option<ModelSizeStats>,
    pub quantiles: Option<Quantiles>,
}

/// Model bounds emitted when debug output is enabled on a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDebugOutput {
    pub timestamp: i64,
    pub debug_feature: Option<String>,
    pub debug_lower: f64,
    pub debug_upper: f64,
    pub debug_median: f64,
    pub actual: f64,
    pub partition_field_name: Option<String>,
    pub partition_field_value: Option<String>,
    pub over_field_name: Option<String>,
    pub over_field_value: Option<String>,
    pub by_field_name: Option<String>,
    pub by_field_value: Option<String>,
}

/// Marker emitted once every result computed before a flush request is out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushAcknowledgement {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_status_parse() {
        assert_eq!(MemoryStatus::parse("ok"), Some(MemoryStatus::Ok));
        assert_eq!(MemoryStatus::parse("SOFT_LIMIT"), Some(MemoryStatus::SoftLimit));
        assert_eq!(MemoryStatus::parse("hard_limit"), Some(MemoryStatus::HardLimit));
        assert_eq!(MemoryStatus::parse("exhausted"), None);
    }

    #[test]
    fn test_memory_status_serializes_as_wire_name() {
        let json = serde_json::to_string(&MemoryStatus::SoftLimit).unwrap();
        assert_eq!(json, "\"SOFT_LIMIT\"");
    }
}
