//! Errors raised while reading and decoding the result stream

use thiserror::Error;

/// Fatal stream errors
///
/// Field-level problems inside a recognized record are not errors; they are
/// logged and the field is skipped or defaulted.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Top-level structure is neither an object sequence nor an array of objects
    #[error("Invalid result stream: {0}")]
    Format(String),

    /// A top-level object matched none of the known record kinds
    #[error("Unknown record kind with fields [{fields}]")]
    UnknownRecordKind { fields: String },

    #[error("Failed to read result channel: {0}")]
    ChannelRead(#[from] std::io::Error),

    /// Malformed or truncated JSON
    #[error("Malformed result JSON: {0}")]
    Decode(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        match e.classify() {
            serde_json::error::Category::Io => {
                Self::ChannelRead(std::io::Error::other(e.to_string()))
            }
            _ => Self::Decode(e.to_string()),
        }
    }
}

impl StreamError {
    pub fn unknown_kind<'a>(fields: impl Iterator<Item = &'a String>) -> Self {
        let fields: Vec<&str> = fields.map(String::as_str).collect();
        Self::UnknownRecordKind {
            fields: fields.join(", "),
        }
    }
}
