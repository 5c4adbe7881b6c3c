//! Alert trigger definitions

use serde::{Deserialize, Serialize};

use super::Bucket;

/// Which result level an alert watches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    #[default]
    Bucket,
    BucketInfluencer,
    Influencer,
}

/// Score thresholds at which an alert fires
///
/// At least one threshold should be set; a trigger with neither never fires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertTrigger {
    #[serde(default)]
    pub normalized_probability_threshold: Option<f64>,
    #[serde(default)]
    pub anomaly_threshold: Option<f64>,
    #[serde(default)]
    pub alert_type: AlertType,
}

impl AlertTrigger {
    pub const fn bucket(
        normalized_probability_threshold: Option<f64>,
        anomaly_threshold: Option<f64>,
    ) -> Self {
        Self {
            normalized_probability_threshold,
            anomaly_threshold,
            alert_type: AlertType::Bucket,
        }
    }

    /// True when the bucket reaches either threshold at this trigger's level
    pub fn is_triggered(&self, bucket: &Bucket) -> bool {
        let (probability, score) = match self.alert_type {
            AlertType::Bucket => (bucket.max_normalized_probability, bucket.anomaly_score),
            AlertType::BucketInfluencer => (
                bucket.max_normalized_probability,
                bucket
                    .bucket_influencers
                    .iter()
                    .map(|b| b.anomaly_score)
                    .fold(0.0, f64::max),
            ),
            AlertType::Influencer => (
                bucket.max_normalized_probability,
                bucket
                    .influencers
                    .iter()
                    .map(|i| i.anomaly_score)
                    .fold(0.0, f64::max),
            ),
        };

        self.normalized_probability_threshold
            .is_some_and(|threshold| probability >= threshold)
            || self
                .anomaly_threshold
                .is_some_and(|threshold| score >= threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Influencer;

    fn bucket(max_prob: f64, score: f64) -> Bucket {
        Bucket {
            max_normalized_probability: max_prob,
            anomaly_score: score,
            ..Bucket::default()
        }
    }

    #[test]
    fn test_probability_threshold() {
        let trigger = AlertTrigger::bucket(Some(80.0), None);
        assert!(trigger.is_triggered(&bucket(80.0, 0.0)));
        assert!(!trigger.is_triggered(&bucket(79.9, 99.0)));
    }

    #[test]
    fn test_anomaly_threshold() {
        let trigger = AlertTrigger::bucket(None, Some(50.0));
        assert!(trigger.is_triggered(&bucket(0.0, 75.0)));
        assert!(!trigger.is_triggered(&bucket(100.0, 10.0)));
    }

    #[test]
    fn test_no_thresholds_never_fires() {
        let trigger = AlertTrigger::default();
        assert!(!trigger.is_triggered(&bucket(100.0, 100.0)));
    }

    #[test]
    fn test_influencer_level_uses_influencer_scores() {
        let trigger = AlertTrigger {
            anomaly_threshold: Some(60.0),
            alert_type: AlertType::Influencer,
            ..AlertTrigger::default()
        };
        let mut b = bucket(0.0, 90.0);
        assert!(!trigger.is_triggered(&b));

        b.influencers.push(Influencer {
            anomaly_score: 65.0,
            ..Influencer::default()
        });
        assert!(trigger.is_triggered(&b));
    }
}
