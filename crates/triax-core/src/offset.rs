//! Robust per-layer time offset estimation from matched anchors.
//!
//! The offset for a layer is the median of `(candidate - reference)` timestamp
//! deltas across all matches that include the layer. The validity gate here is
//! what stops structurally incompatible time bases (absolute epoch vs.
//! session-relative seconds) from being "aligned": such inputs produce delta
//! distributions whose spread is far outside any sane stability threshold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::OffsetConfig;
use crate::error::{EngineError, Result};
use crate::matching::AnchorMatch;
use crate::stats;
use crate::stream::{epoch_to_datetime, Layer, TimeBase};

/// A validated constant clock correction for one layer.
///
/// Subtracting `offset_median` from the layer's timestamps expresses them on
/// the reference layer's clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentOffset {
    pub layer: Layer,
    /// Median of candidate-minus-reference deltas, in seconds.
    pub offset_median: f64,
    /// Spread of the delta distribution. Zero for a single sample.
    pub offset_stddev: f64,
    pub sample_count: usize,
}

/// Estimated absolute wall-clock start of a session-relative layer, derived
/// from its offset against an absolute-epoch reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsoluteTimeEstimate {
    pub layer: Layer,
    /// Epoch at which the layer's session clock read zero.
    pub session_start: DateTime<Utc>,
    /// One standard deviation of the underlying delta distribution.
    pub uncertainty_secs: f64,
}

impl AlignmentOffset {
    /// Wall-clock rendering of this layer's session start. `reference_base`
    /// is the declared time base of the layer this offset was estimated
    /// against; anything but absolute-Unix yields `None`, as does an instant
    /// chrono cannot represent.
    pub fn absolute_session_start(
        &self,
        reference_base: TimeBase,
    ) -> Option<AbsoluteTimeEstimate> {
        if reference_base != TimeBase::AbsoluteUnix {
            return None;
        }
        // A session-relative anchor at `c` matches a reference instant `r`,
        // and offset = median(c - r), so the session's zero sits at `-offset`.
        let estimate = epoch_to_datetime(-self.offset_median)?;
        Some(AbsoluteTimeEstimate {
            layer: self.layer.clone(),
            session_start: estimate,
            uncertainty_secs: self.offset_stddev,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OffsetEstimator {
    config: OffsetConfig,
}

impl OffsetEstimator {
    pub fn new(config: OffsetConfig) -> Self {
        Self { config }
    }

    /// Estimate one layer's offset from the matches that include it.
    ///
    /// Fails with [`EngineError::AlignmentUnstable`] when fewer than
    /// `min_matches` matches include the layer, or when the delta spread
    /// exceeds `stability_threshold_secs`. The raw deltas ride along in the
    /// error for diagnosis; alignment must not proceed for the layer.
    pub fn estimate(&self, layer: &Layer, matches: &[AnchorMatch]) -> Result<AlignmentOffset> {
        let deltas: Vec<f64> = matches.iter().filter_map(|m| m.delta_for(layer)).collect();

        let stddev = stats::stddev(&deltas).unwrap_or(0.0);
        if deltas.len() < self.config.min_matches {
            warn!(
                layer = %layer,
                found = deltas.len(),
                required = self.config.min_matches,
                "too few matched anchors for a trustworthy offset"
            );
            return Err(EngineError::AlignmentUnstable {
                layer: layer.clone(),
                stddev,
                stability_threshold: self.config.stability_threshold_secs,
                min_matches: self.config.min_matches,
                deltas,
            });
        }
        if stddev > self.config.stability_threshold_secs {
            warn!(
                layer = %layer,
                stddev_secs = stddev,
                threshold_secs = self.config.stability_threshold_secs,
                "offset delta distribution too unstable"
            );
            return Err(EngineError::AlignmentUnstable {
                layer: layer.clone(),
                stddev,
                stability_threshold: self.config.stability_threshold_secs,
                min_matches: self.config.min_matches,
                deltas,
            });
        }

        // Non-empty by the min_matches gate (min_matches >= 1 via config
        // validation), so the median exists.
        let median = stats::median(&deltas).unwrap_or(0.0);
        debug!(
            layer = %layer,
            offset_secs = median,
            stddev_secs = stddev,
            samples = deltas.len(),
            "offset estimated"
        );
        Ok(AlignmentOffset {
            layer: layer.clone(),
            offset_median: median,
            offset_stddev: stddev,
            sample_count: deltas.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::MatchCandidate;
    use crate::anchor::AnchorType;
    use std::collections::BTreeMap;

    fn match_with_delta(reference_ts: f64, layer: Layer, delta: f64) -> AnchorMatch {
        let mut candidates = BTreeMap::new();
        candidates.insert(
            layer,
            MatchCandidate {
                anchor_type: AnchorType::RateBurst,
                timestamp: reference_ts + delta,
                confidence: 0.8,
            },
        );
        AnchorMatch {
            reference_timestamp: reference_ts,
            reference_confidence: 0.9,
            candidates,
            layers_matched: 2,
            match_quality: 0.85,
        }
    }

    #[test]
    fn tight_cluster_yields_offset() {
        let matches: Vec<AnchorMatch> = [5.9, 6.0, 6.1, 6.0, 6.05]
            .iter()
            .enumerate()
            .map(|(i, &d)| match_with_delta(100.0 * i as f64, Layer::host(), d))
            .collect();

        let offset = OffsetEstimator::new(OffsetConfig::default())
            .estimate(&Layer::host(), &matches)
            .unwrap();
        assert!((offset.offset_median - 6.0).abs() < 0.01);
        assert!(offset.offset_stddev < 0.1);
        assert_eq!(offset.sample_count, 5);
    }

    #[test]
    fn median_robust_to_one_outlier() {
        let mut matches: Vec<AnchorMatch> = [5.9, 6.0, 6.1, 6.0, 6.05]
            .iter()
            .enumerate()
            .map(|(i, &d)| match_with_delta(100.0 * i as f64, Layer::host(), d))
            .collect();
        // One wild delta, still within a loose stability threshold.
        matches.push(match_with_delta(600.0, Layer::host(), 9.0));

        let config = OffsetConfig {
            stability_threshold_secs: 10.0,
            ..OffsetConfig::default()
        };
        let offset = OffsetEstimator::new(config)
            .estimate(&Layer::host(), &matches)
            .unwrap();
        assert!((offset.offset_median - 6.0).abs() < 0.1);
    }

    #[test]
    fn unstable_distribution_rejected() {
        // Deltas orders of magnitude apart, the epoch-vs-relative signature.
        let matches = vec![
            match_with_delta(0.0, Layer::power(), 1.7e9),
            match_with_delta(100.0, Layer::power(), 3.0),
            match_with_delta(200.0, Layer::power(), 1.7e9 + 50.0),
        ];
        let err = OffsetEstimator::new(OffsetConfig::default())
            .estimate(&Layer::power(), &matches)
            .unwrap_err();
        match err {
            EngineError::AlignmentUnstable { stddev, deltas, .. } => {
                assert!(stddev > 1e6);
                assert_eq!(deltas.len(), 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn too_few_matches_rejected() {
        let matches = vec![match_with_delta(0.0, Layer::host(), 6.0)];
        let config = OffsetConfig {
            min_matches: 3,
            ..OffsetConfig::default()
        };
        let err = OffsetEstimator::new(config)
            .estimate(&Layer::host(), &matches)
            .unwrap_err();
        assert!(matches!(err, EngineError::AlignmentUnstable { .. }));
    }

    #[test]
    fn single_match_has_zero_stddev() {
        let matches = vec![match_with_delta(0.0, Layer::host(), 6.0)];
        let offset = OffsetEstimator::new(OffsetConfig::default())
            .estimate(&Layer::host(), &matches)
            .unwrap();
        assert_eq!(offset.offset_stddev, 0.0);
        assert_eq!(offset.sample_count, 1);
    }

    #[test]
    fn absolute_session_start_from_offset() {
        // Relative anchor at 3600s matched an absolute instant; offset is
        // (relative - absolute), so the session zero is minus that.
        let epoch = 1_703_185_385.0;
        let offset = AlignmentOffset {
            layer: Layer::power(),
            offset_median: 3600.0 - epoch,
            offset_stddev: 1.2,
            sample_count: 4,
        };
        let estimate = offset.absolute_session_start(TimeBase::AbsoluteUnix).unwrap();
        assert_eq!(estimate.session_start.timestamp(), epoch as i64 - 3600);
        assert!((estimate.uncertainty_secs - 1.2).abs() < 1e-9);
    }

    #[test]
    fn relative_reference_yields_no_absolute_start() {
        // Against a session-relative reference the offset carries no epoch
        // information; rendering a wall-clock instant would be fabrication.
        let offset = AlignmentOffset {
            layer: Layer::host(),
            offset_median: 6.0,
            offset_stddev: 0.1,
            sample_count: 4,
        };
        assert!(offset
            .absolute_session_start(TimeBase::SessionRelative)
            .is_none());
    }
}
