//! Cross-layer anchor matching.
//!
//! Pairs each sufficiently-confident reference-layer anchor with the best
//! in-window anchor from every secondary layer. This is nearest/best-evidence
//! matching, not a bijective assignment: one secondary anchor may serve
//! several adjacent reference anchors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::anchor::{Anchor, AnchorType};
use crate::config::MatchConfig;
use crate::error::{EngineError, Result};
use crate::stream::{Layer, LayerStream};

/// One secondary layer's contribution to a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub anchor_type: AnchorType,
    /// Timestamp in the candidate layer's own time base.
    pub timestamp: f64,
    pub confidence: f64,
}

/// A reference anchor plus the best in-window candidate per secondary layer.
///
/// Invariant: every candidate satisfies
/// `|timestamp - reference_timestamp| <= window_secs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorMatch {
    pub reference_timestamp: f64,
    pub reference_confidence: f64,
    /// Secondary-layer candidates; a layer with no in-window anchor is absent.
    pub candidates: BTreeMap<Layer, MatchCandidate>,
    /// Layers represented, the reference included.
    pub layers_matched: usize,
    /// Mean confidence across the reference and all candidates.
    pub match_quality: f64,
}

impl AnchorMatch {
    /// Candidate-minus-reference timestamp delta for one layer, if present.
    pub fn delta_for(&self, layer: &Layer) -> Option<f64> {
        self.candidates
            .get(layer)
            .map(|c| c.timestamp - self.reference_timestamp)
    }
}

#[derive(Debug, Clone)]
pub struct AnchorMatcher {
    config: MatchConfig,
}

impl AnchorMatcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    /// Reject a secondary layer that cannot share a clock with the reference.
    ///
    /// Two gates. The declared time bases must agree: a session-relative
    /// stream paired with an absolute-epoch stream is meaningless even when
    /// the raw numbers happen to overlap. And the raw time ranges must not be
    /// disjoint by more than the matching window: epoch vs relative clocks
    /// sit many orders of magnitude apart and must fail loudly here, not
    /// produce an empty match set that looks like a quiet capture.
    pub fn ensure_compatible(
        &self,
        reference: &LayerStream,
        secondary: &LayerStream,
    ) -> Result<()> {
        let reference_range = reference.time_range();
        let secondary_range = secondary.time_range();

        if reference.time_base() != secondary.time_base() {
            warn!(
                layer = %secondary.layer(),
                layer_base = %secondary.time_base(),
                reference_base = %reference.time_base(),
                "declared time bases differ"
            );
            return Err(EngineError::IncompatibleTimeBase {
                layer: secondary.layer().clone(),
                layer_range: secondary_range,
                reference: reference.layer().clone(),
                reference_range,
                detail: format!(
                    "declared time bases differ: {} vs reference {}",
                    secondary.time_base(),
                    reference.time_base()
                ),
            });
        }

        let gap = reference_range.gap_to(&secondary_range);
        if gap > self.config.window_secs {
            warn!(
                layer = %secondary.layer(),
                gap_secs = gap,
                "raw time ranges are disjoint beyond the matching window"
            );
            return Err(EngineError::IncompatibleTimeBase {
                layer: secondary.layer().clone(),
                layer_range: secondary_range,
                reference: reference.layer().clone(),
                reference_range,
                detail: format!(
                    "ranges are {gap:.3}s apart, matching window is {:.3}s",
                    self.config.window_secs
                ),
            });
        }
        Ok(())
    }

    /// Match reference anchors against all secondary layers.
    ///
    /// Per reference anchor at or above `min_confidence`, the best candidate
    /// per secondary layer is the highest-confidence anchor within
    /// `±window_secs`; confidence ties break by smaller `|Δt|`. Matches are
    /// kept when they cover every secondary layer, or when their quality
    /// reaches `quality_threshold`.
    pub fn match_anchors(
        &self,
        reference: &[Anchor],
        secondaries: &BTreeMap<Layer, Vec<Anchor>>,
    ) -> Vec<AnchorMatch> {
        let window = self.config.window_secs;
        let mut matches = Vec::new();

        for anchor in reference {
            if anchor.confidence < self.config.min_confidence {
                continue;
            }

            let mut candidates = BTreeMap::new();
            for (layer, pool) in secondaries {
                if let Some(best) = best_in_window(pool, anchor.timestamp, window) {
                    candidates.insert(
                        layer.clone(),
                        MatchCandidate {
                            anchor_type: best.anchor_type,
                            timestamp: best.timestamp,
                            confidence: best.confidence,
                        },
                    );
                }
            }
            if candidates.is_empty() {
                continue;
            }

            let layers_matched = candidates.len() + 1;
            let confidence_sum: f64 =
                anchor.confidence + candidates.values().map(|c| c.confidence).sum::<f64>();
            let match_quality = confidence_sum / layers_matched as f64;

            let full_coverage = candidates.len() == secondaries.len();
            if !full_coverage && match_quality < self.config.quality_threshold {
                continue;
            }

            matches.push(AnchorMatch {
                reference_timestamp: anchor.timestamp,
                reference_confidence: anchor.confidence,
                candidates,
                layers_matched,
                match_quality,
            });
        }

        debug!(
            reference_anchors = reference.len(),
            matches = matches.len(),
            "anchor matching complete"
        );
        matches
    }
}

fn best_in_window(pool: &[Anchor], reference_ts: f64, window: f64) -> Option<&Anchor> {
    pool.iter()
        .filter(|a| (a.timestamp - reference_ts).abs() <= window)
        .max_by(|a, b| {
            let by_confidence = a
                .confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal);
            // max_by keeps the larger; for equal confidence, prefer the
            // smaller absolute delta.
            by_confidence.then_with(|| {
                let da = (a.timestamp - reference_ts).abs();
                let db = (b.timestamp - reference_ts).abs();
                db.partial_cmp(&da).unwrap_or(std::cmp::Ordering::Equal)
            })
        })
}
