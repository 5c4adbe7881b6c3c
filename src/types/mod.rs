//! Result records produced by the anomaly-detection engine

mod alert;
mod bucket;
mod model;
mod record;

pub use alert::*;
pub use bucket::*;
pub use model::*;
pub use record::*;
