//! Bucket result types
//!
//! A bucket is one fixed-width time slice of anomaly results for a job. Every
//! nested type here is a value object owned by its bucket.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// One time-bucketed summary of anomaly results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket start (epoch ms)
    pub timestamp: i64,
    pub raw_anomaly_score: f64,
    pub anomaly_score: f64,
    pub initial_anomaly_score: f64,
    pub max_normalized_probability: f64,
    pub record_count: u64,
    pub event_count: u64,
    /// `None` when the engine did not say
    pub is_interim: Option<bool>,
    /// Bucket span (seconds)
    pub bucket_span: u64,
    pub processing_time_ms: u64,
    pub records: Vec<AnomalyRecord>,
    pub bucket_influencers: Vec<BucketInfluencer>,
    pub influencers: Vec<Influencer>,
    pub partition_scores: Vec<PartitionScore>,
    /// Max normalized probability per partition value, filled in per-partition mode
    #[serde(default)]
    pub per_partition_max_probability: BTreeMap<String, f64>,
}

impl Bucket {
    pub fn is_interim(&self) -> bool {
        self.is_interim.unwrap_or(false)
    }

    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// RFC 3339 bucket time for logs, raw epoch millis when out of range
    pub fn bucket_time(&self) -> String {
        self.timestamp_utc()
            .map_or_else(|| self.timestamp.to_string(), |t| t.to_rfc3339())
    }

    /// Anomaly score of the partition with the given value, 0.0 if absent
    pub fn partition_anomaly_score(&self, partition_value: &str) -> f64 {
        self.partition_scores
            .iter()
            .find(|p| p.partition_field_value.as_deref() == Some(partition_value))
            .map_or(0.0, |p| p.anomaly_score)
    }

    /// Group records by partition value and keep the highest normalized
    /// probability seen in each group.
    ///
    /// Records without a partition value are grouped under the empty string.
    /// The bucket's overall `max_normalized_probability` becomes the maximum
    /// across partitions when any records are present.
    pub fn calc_max_normalized_probability_per_partition(&mut self) {
        let mut per_partition: BTreeMap<String, f64> = BTreeMap::new();

        for record in &self.records {
            let key = record.partition_field_value.clone().unwrap_or_default();
            let entry = per_partition.entry(key).or_insert(f64::MIN);
            if record.normalized_probability > *entry {
                *entry = record.normalized_probability;
            }
        }

        if let Some(max) = per_partition.values().copied().reduce(f64::max) {
            self.max_normalized_probability = max;
        }
        self.per_partition_max_probability = per_partition;
    }
}

/// A single anomalous observation inside a bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub detector_index: i64,
    pub probability: f64,
    pub anomaly_score: f64,
    pub normalized_probability: f64,
    pub initial_normalized_probability: f64,
    pub by_field_name: Option<String>,
    pub by_field_value: Option<String>,
    pub partition_field_name: Option<String>,
    pub partition_field_value: Option<String>,
    pub over_field_name: Option<String>,
    pub over_field_value: Option<String>,
    pub field_name: Option<String>,
    pub function: Option<String>,
    pub function_description: Option<String>,
    pub typical: Vec<f64>,
    pub actual: Vec<f64>,
    pub is_interim: Option<bool>,
    /// Epoch ms, 0 when the record carried none
    pub timestamp: i64,
    pub causes: Vec<AnomalyCause>,
    pub influencers: Vec<RecordInfluence>,
}

/// Contributing cause of a population anomaly
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnomalyCause {
    pub probability: f64,
    pub by_field_name: Option<String>,
    pub by_field_value: Option<String>,
    pub partition_field_name: Option<String>,
    pub partition_field_value: Option<String>,
    pub over_field_name: Option<String>,
    pub over_field_value: Option<String>,
    pub field_name: Option<String>,
    pub function: Option<String>,
    pub function_description: Option<String>,
    pub typical: Vec<f64>,
    pub actual: Vec<f64>,
}

/// Influencer field attached to an individual record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordInfluence {
    pub influencer_field_name: String,
    pub influencer_field_values: Vec<String>,
}

/// Per-influencer-field contribution to the bucket score
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BucketInfluencer {
    pub influencer_field_name: Option<String>,
    pub raw_anomaly_score: f64,
    pub initial_anomaly_score: f64,
    pub anomaly_score: f64,
    pub probability: f64,
}

/// Influencer value scored across the bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Influencer {
    pub influencer_field_name: Option<String>,
    pub influencer_field_value: Option<String>,
    pub initial_anomaly_score: f64,
    pub anomaly_score: f64,
    pub probability: f64,
}

/// Score of one partition inside a bucket
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionScore {
    pub partition_field_name: Option<String>,
    pub partition_field_value: Option<String>,
    pub anomaly_score: f64,
    pub probability: f64,
}
