//! Anchor extraction: distinctive, timestamped events used as synchronization
//! landmarks between layers.

pub mod detectors;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AnchorConfig;
use crate::error::{EngineError, Result};
use crate::stream::{Layer, LayerStream};

/// Which detector produced an anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorType {
    /// Event density burst relative to the median bucket density.
    RateBurst,
    /// Successive-delta outlier in the layer's key feature.
    MagnitudeShift,
    /// First sustained excursion above the baseline-derived threshold.
    BaselineExcursion,
}

/// A synchronization landmark within one layer. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub layer: Layer,
    /// Timestamp in the layer's own declared time base.
    pub timestamp: f64,
    pub anchor_type: AnchorType,
    /// Detector-specific heuristic in [0, 1].
    pub confidence: f64,
    /// Detector diagnostics (thresholds, observed values).
    pub metadata: BTreeMap<String, f64>,
}

/// Runs the enabled detectors over one layer's stream.
#[derive(Debug, Clone)]
pub struct AnchorExtractor {
    config: AnchorConfig,
}

impl AnchorExtractor {
    pub fn new(config: AnchorConfig) -> Self {
        Self { config }
    }

    /// Extract all anchors from one stream, sorted by timestamp (ties broken
    /// by descending confidence). Detectors that cannot compute contribute
    /// nothing; the result may be empty.
    pub fn extract(&self, stream: &LayerStream) -> Vec<Anchor> {
        let key_feature = self.config.key_features.get(stream.layer());

        let mut anchors = Vec::new();
        if self.config.rate_burst.enabled {
            anchors.extend(detectors::rate_burst(stream, &self.config.rate_burst));
        }
        if let Some(feature) = key_feature {
            if self.config.magnitude_shift.enabled {
                anchors.extend(detectors::magnitude_shift(
                    stream,
                    &self.config.magnitude_shift,
                    feature,
                ));
            }
            if self.config.baseline_excursion.enabled {
                anchors.extend(detectors::baseline_excursion(
                    stream,
                    &self.config.baseline_excursion,
                    feature,
                ));
            }
        } else {
            debug!(
                layer = %stream.layer(),
                "no key feature configured; value-based detectors skipped"
            );
        }

        anchors.sort_by(|a, b| {
            a.timestamp
                .partial_cmp(&b.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        debug!(
            layer = %stream.layer(),
            count = anchors.len(),
            "anchor extraction complete"
        );
        anchors
    }

    /// Extract anchors and enforce the configured minimum. Matching must not
    /// be attempted for a layer below it.
    pub fn extract_required(&self, stream: &LayerStream) -> Result<Vec<Anchor>> {
        let anchors = self.extract(stream);
        if anchors.len() < self.config.min_anchors {
            warn!(
                layer = %stream.layer(),
                found = anchors.len(),
                required = self.config.min_anchors,
                "too few anchors for matching"
            );
            return Err(EngineError::InsufficientAnchors {
                layer: stream.layer().clone(),
                found: anchors.len(),
                required: self.config.min_anchors,
            });
        }
        Ok(anchors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FeatureRegistry, RawEvent, TimeBase};

    fn step_stream(layer: Layer) -> LayerStream {
        let registry = FeatureRegistry::new().declare(layer.clone(), &["load"]);
        let events = (0..80)
            .map(|i| {
                let v = if i < 40 { 10.0 + (i % 3) as f64 * 0.1 } else { 50.0 };
                let mut features = BTreeMap::new();
                features.insert("load".to_string(), v);
                RawEvent::new(i as f64, features)
            })
            .collect();
        LayerStream::new(layer, TimeBase::SessionRelative, events, &registry).unwrap()
    }

    fn extractor_with_key(layer: Layer) -> AnchorExtractor {
        let mut config = AnchorConfig::default();
        config.key_features.insert(layer, "load".to_string());
        AnchorExtractor::new(config)
    }

    #[test]
    fn anchors_stay_within_stream_bounds() {
        let stream = step_stream(Layer::host());
        let anchors = extractor_with_key(Layer::host()).extract(&stream);
        assert!(!anchors.is_empty());
        let range = stream.time_range();
        for anchor in &anchors {
            assert!(anchor.timestamp >= range.start && anchor.timestamp <= range.end);
            assert!((0.0..=1.0).contains(&anchor.confidence));
        }
    }

    #[test]
    fn anchors_sorted_by_timestamp() {
        let stream = step_stream(Layer::host());
        let anchors = extractor_with_key(Layer::host()).extract(&stream);
        for pair in anchors.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[test]
    fn step_yields_excursion_and_shift_anchors() {
        let stream = step_stream(Layer::host());
        let anchors = extractor_with_key(Layer::host()).extract(&stream);
        assert!(anchors
            .iter()
            .any(|a| a.anchor_type == AnchorType::BaselineExcursion));
        assert!(anchors
            .iter()
            .any(|a| a.anchor_type == AnchorType::MagnitudeShift));
    }

    #[test]
    fn no_key_feature_skips_value_detectors() {
        let stream = step_stream(Layer::host());
        let anchors = AnchorExtractor::new(AnchorConfig::default()).extract(&stream);
        assert!(anchors
            .iter()
            .all(|a| a.anchor_type == AnchorType::RateBurst));
    }

    #[test]
    fn min_anchors_gate() {
        let layer = Layer::host();
        let registry = FeatureRegistry::new().declare(layer.clone(), &["load"]);
        // Uniform short stream: no detector fires.
        let events = (0..10)
            .map(|i| {
                let mut features = BTreeMap::new();
                features.insert("load".to_string(), 1.0);
                RawEvent::new(i as f64, features)
            })
            .collect();
        let stream =
            LayerStream::new(layer.clone(), TimeBase::SessionRelative, events, &registry)
                .unwrap();

        let err = extractor_with_key(layer)
            .extract_required(&stream)
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientAnchors { .. }));
    }
}
