//! Result record decoder
//!
//! Classifies each top-level JSON object by its discriminator field and
//! decodes it into a [`DecodedRecord`]. Decoding is lenient inside a record:
//! unknown fields are skipped and malformed values fall back to defaults,
//! both with a warning. Only an object that matches no record kind is fatal.
//!
//! Discriminators are checked in this order:
//!
//! | Field                | Record kind            |
//! |----------------------|------------------------|
//! | `timestamp` only     | `Bucket`               |
//! | `quantileState`      | `Quantiles`            |
//! | `snapshotId`         | `ModelSnapshot`        |
//! | `modelBytes`         | `ModelSizeStats`       |
//! | `debugFeature`       | `ModelDebugOutput`     |
//! | `flush`              | `FlushAcknowledgement` |
//! | `categoryDefinition` | `CategoryDefinition`   |

use serde_json::{Map, Value};
use tracing::warn;

use super::StreamError;
use crate::types::{
    AnomalyCause, AnomalyRecord, Bucket, BucketInfluencer, CategoryDefinition, DecodedRecord,
    FlushAcknowledgement, Influencer, MemoryStatus, ModelDebugOutput, ModelSizeStats,
    ModelSnapshot, PartitionScore, Quantiles, RecordInfluence,
};

// ============================================================================
// Wire field names
// ============================================================================

pub mod fields {
    pub const TIMESTAMP: &str = "timestamp";
    pub const QUANTILE_STATE: &str = "quantileState";
    pub const SNAPSHOT_ID: &str = "snapshotId";
    pub const MODEL_BYTES: &str = "modelBytes";
    pub const DEBUG_FEATURE: &str = "debugFeature";
    pub const FLUSH: &str = "flush";
    pub const CATEGORY_DEFINITION: &str = "categoryDefinition";

    /// Fields whose presence means the object is not a bucket
    pub const NON_BUCKET_DISCRIMINATORS: [&str; 6] = [
        QUANTILE_STATE,
        SNAPSHOT_ID,
        MODEL_BYTES,
        DEBUG_FEATURE,
        FLUSH,
        CATEGORY_DEFINITION,
    ];
}

/// Wire timestamps are epoch seconds
const MILLIS_PER_SECOND: i64 = 1000;

// ============================================================================
// Field conversion
// ============================================================================

/// Per-record conversion helpers that log and count field warnings
struct FieldReader<'a> {
    record: &'static str,
    warnings: &'a mut u64,
}

impl FieldReader<'_> {
    fn warn_malformed(&mut self, field: &str, value: &Value) {
        *self.warnings += 1;
        warn!(record = self.record, field, value = %value, "Malformed field value, using default");
    }

    fn unknown(&mut self, field: &str) {
        *self.warnings += 1;
        warn!(record = self.record, field, "Unknown field in result record, skipping");
    }

    fn f64(&mut self, field: &str, value: &Value) -> f64 {
        match value {
            Value::Null => 0.0,
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s.trim().parse().unwrap_or_else(|_| {
                self.warn_malformed(field, value);
                0.0
            }),
            _ => {
                self.warn_malformed(field, value);
                0.0
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn i64(&mut self, field: &str, value: &Value) -> i64 {
        match value {
            Value::Null => 0,
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .unwrap_or(0),
            Value::String(s) => s.trim().parse().unwrap_or_else(|_| {
                self.warn_malformed(field, value);
                0
            }),
            _ => {
                self.warn_malformed(field, value);
                0
            }
        }
    }

    fn u64(&mut self, field: &str, value: &Value) -> u64 {
        u64::try_from(self.i64(field, value)).unwrap_or(0)
    }

    fn timestamp_ms(&mut self, field: &str, value: &Value) -> i64 {
        self.i64(field, value).saturating_mul(MILLIS_PER_SECOND)
    }

    fn string(&mut self, field: &str, value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
            _ => {
                self.warn_malformed(field, value);
                None
            }
        }
    }

    fn bool(&mut self, field: &str, value: &Value) -> Option<bool> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(*b),
            _ => {
                self.warn_malformed(field, value);
                None
            }
        }
    }

    /// Accepts a single number or an array of numbers
    fn f64_list(&mut self, field: &str, value: &Value) -> Vec<f64> {
        match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items.iter().map(|v| self.f64(field, v)).collect(),
            _ => vec![self.f64(field, value)],
        }
    }

    fn string_list(&mut self, field: &str, value: &Value) -> Vec<String> {
        match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items.iter().filter_map(|v| self.string(field, v)).collect(),
            _ => self.string(field, value).into_iter().collect(),
        }
    }

    /// Applies `decode` to each object element of an array field
    fn objects<T>(
        &mut self,
        field: &str,
        value: &Value,
        mut decode: impl FnMut(&Map<String, Value>, &mut u64) -> T,
    ) -> Vec<T> {
        match value {
            Value::Null => Vec::new(),
            Value::Array(items) => {
                let mut decoded = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Object(map) => decoded.push(decode(map, &mut *self.warnings)),
                        other => self.warn_malformed(field, other),
                    }
                }
                decoded
            }
            other => {
                self.warn_malformed(field, other);
                Vec::new()
            }
        }
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Turns top-level JSON objects into typed result records
#[derive(Debug, Default)]
pub struct ResultRecordDecoder {
    field_warnings: u64,
}

impl ResultRecordDecoder {
    pub const fn new() -> Self {
        Self { field_warnings: 0 }
    }

    /// Total field warnings raised since construction
    pub const fn field_warnings(&self) -> u64 {
        self.field_warnings
    }

    /// Classify and decode one top-level object
    pub fn decode(&mut self, object: &Map<String, Value>) -> Result<DecodedRecord, StreamError> {
        let warnings = &mut self.field_warnings;

        let is_bucket = object.contains_key(fields::TIMESTAMP)
            && !fields::NON_BUCKET_DISCRIMINATORS
                .iter()
                .any(|f| object.contains_key(*f));

        let record = if is_bucket {
            DecodedRecord::Bucket(Box::new(decode_bucket(object, warnings)))
        } else if object.contains_key(fields::QUANTILE_STATE) {
            DecodedRecord::Quantiles(decode_quantiles(object, warnings))
        } else if object.contains_key(fields::SNAPSHOT_ID) {
            DecodedRecord::ModelSnapshot(Box::new(decode_model_snapshot(object, warnings)))
        } else if object.contains_key(fields::MODEL_BYTES) {
            DecodedRecord::ModelSizeStats(decode_model_size_stats(object, warnings))
        } else if object.contains_key(fields::DEBUG_FEATURE) {
            DecodedRecord::ModelDebugOutput(decode_model_debug_output(object, warnings))
        } else if object.contains_key(fields::FLUSH) {
            DecodedRecord::Flush(decode_flush(object, warnings))
        } else if object.contains_key(fields::CATEGORY_DEFINITION) {
            DecodedRecord::CategoryDefinition(decode_category_definition(object, warnings))
        } else {
            return Err(StreamError::unknown_kind(object.keys()));
        };

        Ok(record)
    }
}

// ============================================================================
// Per-kind decoders
// ============================================================================

fn decode_bucket(object: &Map<String, Value>, warnings: &mut u64) -> Bucket {
    let mut bucket = Bucket::default();
    let mut r = FieldReader { record: "bucket", warnings };

    for (key, value) in object {
        match key.as_str() {
            "timestamp" => bucket.timestamp = r.timestamp_ms(key, value),
            "rawAnomalyScore" => bucket.raw_anomaly_score = r.f64(key, value),
            "anomalyScore" => bucket.anomaly_score = r.f64(key, value),
            "initialAnomalyScore" => bucket.initial_anomaly_score = r.f64(key, value),
            "maxNormalizedProbability" => bucket.max_normalized_probability = r.f64(key, value),
            "recordCount" => bucket.record_count = r.u64(key, value),
            "eventCount" => bucket.event_count = r.u64(key, value),
            "isInterim" => bucket.is_interim = r.bool(key, value),
            "bucketSpan" => bucket.bucket_span = r.u64(key, value),
            "processingTimeMs" => bucket.processing_time_ms = r.u64(key, value),
            "records" => bucket.records = r.objects(key, value, decode_anomaly_record),
            "bucketInfluencers" => {
                bucket.bucket_influencers = r.objects(key, value, decode_bucket_influencer);
            }
            "influencers" => bucket.influencers = r.objects(key, value, decode_influencer),
            "partitionScores" => {
                bucket.partition_scores = r.objects(key, value, decode_partition_score);
            }
            _ => r.unknown(key),
        }
    }
    bucket
}

fn decode_anomaly_record(object: &Map<String, Value>, warnings: &mut u64) -> AnomalyRecord {
    let mut record = AnomalyRecord::default();
    let mut r = FieldReader { record: "record", warnings };

    for (key, value) in object {
        match key.as_str() {
            "detectorIndex" => record.detector_index = r.i64(key, value),
            "probability" => record.probability = r.f64(key, value),
            "anomalyScore" => record.anomaly_score = r.f64(key, value),
            "normalizedProbability" => record.normalized_probability = r.f64(key, value),
            "initialNormalizedProbability" => {
                record.initial_normalized_probability = r.f64(key, value);
            }
            "byFieldName" => record.by_field_name = r.string(key, value),
            "byFieldValue" => record.by_field_value = r.string(key, value),
            "partitionFieldName" => record.partition_field_name = r.string(key, value),
            "partitionFieldValue" => record.partition_field_value = r.string(key, value),
            "overFieldName" => record.over_field_name = r.string(key, value),
            "overFieldValue" => record.over_field_value = r.string(key, value),
            "fieldName" => record.field_name = r.string(key, value),
            "function" => record.function = r.string(key, value),
            "functionDescription" => record.function_description = r.string(key, value),
            "typical" => record.typical = r.f64_list(key, value),
            "actual" => record.actual = r.f64_list(key, value),
            "isInterim" => record.is_interim = r.bool(key, value),
            "timestamp" => record.timestamp = r.timestamp_ms(key, value),
            "causes" => record.causes = r.objects(key, value, decode_anomaly_cause),
            "influences" | "influencers" => {
                record.influencers = r.objects(key, value, decode_record_influence);
            }
            _ => r.unknown(key),
        }
    }
    record
}

fn decode_anomaly_cause(object: &Map<String, Value>, warnings: &mut u64) -> AnomalyCause {
    let mut cause = AnomalyCause::default();
    let mut r = FieldReader { record: "cause", warnings };

    for (key, value) in object {
        match key.as_str() {
            "probability" => cause.probability = r.f64(key, value),
            "byFieldName" => cause.by_field_name = r.string(key, value),
            "byFieldValue" => cause.by_field_value = r.string(key, value),
            "partitionFieldName" => cause.partition_field_name = r.string(key, value),
            "partitionFieldValue" => cause.partition_field_value = r.string(key, value),
            "overFieldName" => cause.over_field_name = r.string(key, value),
            "overFieldValue" => cause.over_field_value = r.string(key, value),
            "fieldName" => cause.field_name = r.string(key, value),
            "function" => cause.function = r.string(key, value),
            "functionDescription" => cause.function_description = r.string(key, value),
            "typical" => cause.typical = r.f64_list(key, value),
            "actual" => cause.actual = r.f64_list(key, value),
            _ => r.unknown(key),
        }
    }
    cause
}

fn decode_record_influence(object: &Map<String, Value>, warnings: &mut u64) -> RecordInfluence {
    let mut influence = RecordInfluence::default();
    let mut r = FieldReader { record: "influence", warnings };

    for (key, value) in object {
        match key.as_str() {
            "influencerFieldName" => {
                influence.influencer_field_name = r.string(key, value).unwrap_or_default();
            }
            "influencerFieldValues" => {
                influence.influencer_field_values = r.string_list(key, value);
            }
            _ => r.unknown(key),
        }
    }
    influence
}

fn decode_bucket_influencer(object: &Map<String, Value>, warnings: &mut u64) -> BucketInfluencer {
    let mut influencer = BucketInfluencer::default();
    let mut r = FieldReader { record: "bucketInfluencer", warnings };

    for (key, value) in object {
        match key.as_str() {
            "influencerFieldName" => influencer.influencer_field_name = r.string(key, value),
            "rawAnomalyScore" => influencer.raw_anomaly_score = r.f64(key, value),
            "initialAnomalyScore" => influencer.initial_anomaly_score = r.f64(key, value),
            "anomalyScore" => influencer.anomaly_score = r.f64(key, value),
            "probability" => influencer.probability = r.f64(key, value),
            _ => r.unknown(key),
        }
    }
    influencer
}

fn decode_influencer(object: &Map<String, Value>, warnings: &mut u64) -> Influencer {
    let mut influencer = Influencer::default();
    let mut r = FieldReader { record: "influencer", warnings };

    for (key, value) in object {
        match key.as_str() {
            "influencerFieldName" => influencer.influencer_field_name = r.string(key, value),
            "influencerFieldValue" => influencer.influencer_field_value = r.string(key, value),
            "initialAnomalyScore" => influencer.initial_anomaly_score = r.f64(key, value),
            "anomalyScore" => influencer.anomaly_score = r.f64(key, value),
            "probability" => influencer.probability = r.f64(key, value),
            _ => r.unknown(key),
        }
    }
    influencer
}

fn decode_partition_score(object: &Map<String, Value>, warnings: &mut u64) -> PartitionScore {
    let mut score = PartitionScore::default();
    let mut r = FieldReader { record: "partitionScore", warnings };

    for (key, value) in object {
        match key.as_str() {
            "partitionFieldName" => score.partition_field_name = r.string(key, value),
            "partitionFieldValue" => score.partition_field_value = r.string(key, value),
            "anomalyScore" => score.anomaly_score = r.f64(key, value),
            "probability" => score.probability = r.f64(key, value),
            _ => r.unknown(key),
        }
    }
    score
}

fn decode_quantiles(object: &Map<String, Value>, warnings: &mut u64) -> Quantiles {
    let mut quantiles = Quantiles::default();
    let mut r = FieldReader { record: "quantiles", warnings };

    for (key, value) in object {
        match key.as_str() {
            "timestamp" => quantiles.timestamp = r.timestamp_ms(key, value),
            "quantileKind" => quantiles.quantile_kind = r.string(key, value),
            // Older engines split the state across an array of lines
            "quantileState" => {
                quantiles.quantile_state = match value {
                    Value::Array(_) => r.string_list(key, value).join("\n"),
                    _ => r.string(key, value).unwrap_or_default(),
                };
            }
            _ => r.unknown(key),
        }
    }
    quantiles
}

fn decode_model_size_stats(object: &Map<String, Value>, warnings: &mut u64) -> ModelSizeStats {
    let mut stats = ModelSizeStats::default();
    let mut r = FieldReader { record: "modelSizeStats", warnings };

    for (key, value) in object {
        match key.as_str() {
            "modelBytes" => stats.model_bytes = r.u64(key, value),
            "totalByFieldCount" => stats.total_by_field_count = r.u64(key, value),
            "totalOverFieldCount" => stats.total_over_field_count = r.u64(key, value),
            "totalPartitionFieldCount" => stats.total_partition_field_count = r.u64(key, value),
            "bucketAllocationFailuresCount" => {
                stats.bucket_allocation_failures_count = r.u64(key, value);
            }
            "memoryStatus" => {
                let status = r.string(key, value);
                match status.as_deref().map(MemoryStatus::parse) {
                    Some(Some(parsed)) => stats.memory_status = parsed,
                    Some(None) => r.warn_malformed(key, value),
                    None => {}
                }
            }
            "timestamp" => stats.timestamp = r.timestamp_ms(key, value),
            "logTime" => stats.log_time = r.timestamp_ms(key, value),
            _ => r.unknown(key),
        }
    }
    stats
}

fn decode_model_snapshot(object: &Map<String, Value>, warnings: &mut u64) -> ModelSnapshot {
    let mut snapshot = ModelSnapshot::default();
    let mut r = FieldReader { record: "modelSnapshot", warnings };

    for (key, value) in object {
        match key.as_str() {
            "snapshotId" => snapshot.snapshot_id = r.string(key, value).unwrap_or_default(),
            "timestamp" => snapshot.timestamp = r.timestamp_ms(key, value),
            "description" => snapshot.description = r.string(key, value),
            "restorePriority" => snapshot.restore_priority = r.i64(key, value),
            "snapshotDocCount" => snapshot.snapshot_doc_count = r.u64(key, value),
            "latestRecordTimeStamp" => snapshot.latest_record_time_stamp = r.timestamp_ms(key, value),
            "latestResultTimeStamp" => snapshot.latest_result_time_stamp = r.timestamp_ms(key, value),
            "modelSizeStats" => match value {
                Value::Object(map) => {
                    snapshot.model_size_stats = Some(decode_model_size_stats(map, &mut *r.warnings));
                }
                Value::Null => {}
                other => r.warn_malformed(key, other),
            },
            "quantiles" => match value {
                Value::Object(map) => {
                    snapshot.quantiles = Some(decode_quantiles(map, &mut *r.warnings));
                }
                Value::Null => {}
                other => r.warn_malformed(key, other),
            },
            _ => r.unknown(key),
        }
    }
    snapshot
}

fn decode_model_debug_output(object: &Map<String, Value>, warnings: &mut u64) -> ModelDebugOutput {
    let mut output = ModelDebugOutput::default();
    let mut r = FieldReader { record: "modelDebugOutput", warnings };

    for (key, value) in object {
        match key.as_str() {
            "timestamp" => output.timestamp = r.timestamp_ms(key, value),
            "debugFeature" => output.debug_feature = r.string(key, value),
            "debugLower" => output.debug_lower = r.f64(key, value),
            "debugUpper" => output.debug_upper = r.f64(key, value),
            "debugMedian" => output.debug_median = r.f64(key, value),
            "actual" => output.actual = r.f64(key, value),
            "partitionFieldName" => output.partition_field_name = r.string(key, value),
            "partitionFieldValue" => output.partition_field_value = r.string(key, value),
            "overFieldName" => output.over_field_name = r.string(key, value),
            "overFieldValue" => output.over_field_value = r.string(key, value),
            "byFieldName" => output.by_field_name = r.string(key, value),
            "byFieldValue" => output.by_field_value = r.string(key, value),
            _ => r.unknown(key),
        }
    }
    output
}

fn decode_flush(object: &Map<String, Value>, warnings: &mut u64) -> FlushAcknowledgement {
    let mut ack = FlushAcknowledgement::default();
    let mut r = FieldReader { record: "flush", warnings };

    for (key, value) in object {
        match key.as_str() {
            "flush" => ack.id = r.string(key, value).unwrap_or_default(),
            _ => r.unknown(key),
        }
    }
    ack
}

fn decode_category_definition(object: &Map<String, Value>, warnings: &mut u64) -> CategoryDefinition {
    let mut category = CategoryDefinition::default();
    let mut r = FieldReader { record: "categoryDefinition", warnings };

    for (key, value) in object {
        match key.as_str() {
            "categoryDefinition" => category.category_id = r.i64(key, value),
            "terms" => category.terms = r.string(key, value).unwrap_or_default(),
            "regex" => category.regex = r.string(key, value).unwrap_or_default(),
            "maxMatchingLength" => category.max_matching_length = r.u64(key, value),
            "examples" => category.examples = r.string_list(key, value),
            _ => r.unknown(key),
        }
    }
    category
}
