//! Result stream acquisition
//!
//! Reads the analytics engine's JSON output off a byte channel and decodes
//! each top-level object into a typed record.

mod error;
pub mod decoder;
pub mod stream_reader;

pub use decoder::ResultRecordDecoder;
pub use error::StreamError;
pub use stream_reader::ResultStreamReader;
