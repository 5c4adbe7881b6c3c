//! Renormalization triggering
//!
//! New quantiles mean the engine's score distribution has shifted, so
//! previously persisted probabilities must be rescored. The dispatcher only
//! hands quantiles over; the rescoring itself runs elsewhere.

pub mod queue;

pub use queue::{QueueRenormalizer, ScoreUpdater};

use crate::types::Quantiles;

/// Receiver of quantile updates
///
/// Both `renormalise` variants must return quickly; the work they trigger
/// runs independently of the dispatch loop.
pub trait Renormalizer: Send + Sync {
    fn renormalise(&self, quantiles: &Quantiles);

    /// Same as [`renormalise`](Self::renormalise) but rescoring each partition separately
    fn renormalise_with_partition(&self, quantiles: &Quantiles);

    /// Block until no renormalization is queued or running
    fn wait_until_idle(&self);

    /// Stop accepting work. Safe to call more than once, and when nothing ever ran.
    fn shutdown(&self);
}

/// Renormalizer that ignores every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpRenormalizer;

impl Renormalizer for NoOpRenormalizer {
    fn renormalise(&self, _quantiles: &Quantiles) {}

    fn renormalise_with_partition(&self, _quantiles: &Quantiles) {}

    fn wait_until_idle(&self) {}

    fn shutdown(&self) {}
}
