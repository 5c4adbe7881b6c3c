//! Tagged union of every record kind the decoder can produce

use serde::{Deserialize, Serialize};

use super::{
    Bucket, CategoryDefinition, FlushAcknowledgement, ModelDebugOutput, ModelSizeStats,
    ModelSnapshot, Quantiles,
};

/// One decoded top-level result object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodedRecord {
    Bucket(Box<Bucket>),
    Quantiles(Quantiles),
    ModelSnapshot(Box<ModelSnapshot>),
    ModelSizeStats(ModelSizeStats),
    ModelDebugOutput(ModelDebugOutput),
    Flush(FlushAcknowledgement),
    CategoryDefinition(CategoryDefinition),
}

impl DecodedRecord {
    /// Short label used in logs and statistics
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Bucket(_) => "bucket",
            Self::Quantiles(_) => "quantiles",
            Self::ModelSnapshot(_) => "model_snapshot",
            Self::ModelSizeStats(_) => "model_size_stats",
            Self::ModelDebugOutput(_) => "model_debug_output",
            Self::Flush(_) => "flush",
            Self::CategoryDefinition(_) => "category_definition",
        }
    }
}
