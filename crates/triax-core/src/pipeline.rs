//! Per-session orchestration of the full analysis chain.
//!
//! Every stage is a pure transformation of the previous stage's output, so a
//! session analysis is one immutable value built front to back. Per-layer
//! validity gates stop only the affected layer; per-pair gates stop only the
//! affected pair; session-level incompatibilities (reference layer unusable,
//! clashing time bases) fail the whole session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::align::{AlignedTimeline, TimelineAligner};
use crate::anchor::{Anchor, AnchorExtractor};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::lagcorr::{LagCorrelationAnalyzer, LagSweep, PairSpec};
use crate::matching::{AnchorMatch, AnchorMatcher};
use crate::offset::{AlignmentOffset, OffsetEstimator};
use crate::path::{PropagationPath, PropagationPathReconstructor};
use crate::signature::{SignatureExtractor, SignatureSet};
use crate::stream::{Layer, LayerStream};

/// A layer dropped from the session by a validity gate, with the gate's
/// reason. The rest of the session proceeds without it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedLayer {
    pub layer: Layer,
    pub reason: String,
}

/// A layer/feature pair whose lag sweep could not run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPair {
    pub spec: PairSpec,
    pub reason: String,
}

/// Complete output of one session analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAnalysis {
    pub anchors: BTreeMap<Layer, Vec<Anchor>>,
    pub matches: Vec<AnchorMatch>,
    pub offsets: BTreeMap<Layer, AlignmentOffset>,
    pub rejected_layers: Vec<RejectedLayer>,
    pub timeline: AlignedTimeline,
    pub mean_match_quality: f64,
    pub sweeps: Vec<LagSweep>,
    pub skipped_pairs: Vec<SkippedPair>,
    pub path: Option<PropagationPath>,
}

/// The configured engine, ready to analyze sessions.
#[derive(Debug, Clone)]
pub struct AnalysisPipeline {
    config: EngineConfig,
}

impl AnalysisPipeline {
    /// Build a pipeline after validating the configuration.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the full chain for one session: anchors, matches, offsets, aligned
    /// timeline, lag sweeps for `pairs`, and the propagation path.
    ///
    /// Sessions are independent; callers may analyze many in parallel and
    /// concatenate the results.
    pub fn analyze_session(
        &self,
        streams: &[LayerStream],
        pairs: &[PairSpec],
    ) -> Result<SessionAnalysis> {
        let reference_layer = &self.config.matching.reference_layer;
        let reference = streams
            .iter()
            .find(|s| s.layer() == reference_layer)
            .ok_or_else(|| EngineError::MalformedInput {
                layer: reference_layer.clone(),
                detail: "session has no stream for the reference layer".into(),
            })?;

        // Clashing time bases fail the whole session before any matching.
        let matcher = AnchorMatcher::new(self.config.matching.clone());
        for stream in streams {
            if stream.layer() == reference_layer {
                continue;
            }
            matcher.ensure_compatible(reference, stream)?;
        }

        // Anchor extraction. The reference layer must produce anchors; a
        // secondary layer that cannot is rejected and the session continues.
        let extractor = AnchorExtractor::new(self.config.anchors.clone());
        let mut rejected_layers = Vec::new();
        let mut anchors = BTreeMap::new();
        anchors.insert(
            reference_layer.clone(),
            extractor.extract_required(reference)?,
        );
        let mut secondary_anchors = BTreeMap::new();
        for stream in streams {
            if stream.layer() == reference_layer {
                continue;
            }
            match extractor.extract_required(stream) {
                Ok(found) => {
                    anchors.insert(stream.layer().clone(), found.clone());
                    secondary_anchors.insert(stream.layer().clone(), found);
                }
                Err(err) => {
                    warn!(layer = %stream.layer(), %err, "layer rejected before matching");
                    rejected_layers.push(RejectedLayer {
                        layer: stream.layer().clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let matches = matcher.match_anchors(&anchors[reference_layer], &secondary_anchors);
        let mean_match_quality = if matches.is_empty() {
            0.0
        } else {
            matches.iter().map(|m| m.match_quality).sum::<f64>() / matches.len() as f64
        };

        // Offset estimation gates each secondary layer independently.
        let estimator = OffsetEstimator::new(self.config.offset.clone());
        let mut offsets = BTreeMap::new();
        for layer in secondary_anchors.keys() {
            match estimator.estimate(layer, &matches) {
                Ok(offset) => {
                    offsets.insert(layer.clone(), offset);
                }
                Err(err) => {
                    warn!(layer = %layer, %err, "layer rejected at offset estimation");
                    rejected_layers.push(RejectedLayer {
                        layer: layer.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        // Alignment over the reference plus every validated layer.
        let mut shifts = BTreeMap::new();
        shifts.insert(reference_layer.clone(), 0.0);
        for (layer, offset) in &offsets {
            shifts.insert(layer.clone(), offset.offset_median);
        }
        let aligned_streams: Vec<LayerStream> = streams
            .iter()
            .filter(|s| shifts.contains_key(s.layer()))
            .cloned()
            .collect();
        let timeline =
            TimelineAligner::new(self.config.grid.clone()).align(&aligned_streams, &shifts, reference_layer)?;

        // Lag sweeps gate each pair independently.
        let analyzer = LagCorrelationAnalyzer::new(self.config.lag.clone());
        let mut sweeps = Vec::new();
        let mut skipped_pairs = Vec::new();
        for spec in pairs {
            match analyzer.analyze(&timeline, spec) {
                Ok(sweep) => sweeps.push(sweep),
                Err(err) => {
                    debug!(%err, "lag pair skipped");
                    skipped_pairs.push(SkippedPair {
                        spec: spec.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let optima: Vec<_> = sweeps.iter().map(|s| s.optimal.clone()).collect();
        let reconstructor = PropagationPathReconstructor::new(
            self.config.path.clone(),
            self.config.lag.significance_alpha,
        );
        let path = reconstructor.reconstruct(&optima, mean_match_quality);
        if let Some(path) = &path {
            path.validate()?;
        }

        Ok(SessionAnalysis {
            anchors,
            matches,
            offsets,
            rejected_layers,
            timeline,
            mean_match_quality,
            sweeps,
            skipped_pairs,
            path,
        })
    }

    /// Cross-session signature extraction over category-labeled timelines.
    pub fn extract_signatures(
        &self,
        labeled: &[(String, AlignedTimeline)],
    ) -> Result<SignatureSet> {
        SignatureExtractor::new(self.config.signature.clone()).extract(labeled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{FeatureRegistry, RawEvent, TimeBase};

    fn pipeline() -> AnalysisPipeline {
        let mut config = EngineConfig::default();
        config
            .anchors
            .key_features
            .insert(Layer::network(), "pkts".to_string());
        config
            .anchors
            .key_features
            .insert(Layer::host(), "cpu".to_string());
        AnalysisPipeline::new(config).unwrap()
    }

    fn step_stream(layer: Layer, feature: &str, onset: f64, len: usize) -> LayerStream {
        let registry = FeatureRegistry::new().declare(layer.clone(), &[feature]);
        let events = (0..len)
            .map(|i| {
                let t = i as f64;
                let v = if t < onset { 10.0 + (i % 3) as f64 * 0.1 } else { 60.0 };
                let mut features = std::collections::BTreeMap::new();
                features.insert(feature.to_string(), v);
                RawEvent::new(t, features)
            })
            .collect();
        LayerStream::new(layer, TimeBase::SessionRelative, events, &registry).unwrap()
    }

    #[test]
    fn invalid_config_rejected_up_front() {
        let mut config = EngineConfig::default();
        config.grid.resolution_secs = -1.0;
        assert!(AnalysisPipeline::new(config).is_err());
    }

    #[test]
    fn missing_reference_stream_rejected() {
        let streams = vec![step_stream(Layer::host(), "cpu", 40.0, 120)];
        let err = pipeline()
            .analyze_session(&streams, &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedInput { .. }));
    }

    #[test]
    fn secondary_layer_without_anchors_is_rejected_not_fatal() {
        let streams = vec![
            step_stream(Layer::network(), "pkts", 40.0, 120),
            // Flat power stream with no key feature configured: no anchors.
            step_stream(Layer::power(), "draw", 1e9, 120),
        ];
        let analysis = pipeline().analyze_session(&streams, &[]).unwrap();
        assert_eq!(analysis.rejected_layers.len(), 1);
        assert_eq!(analysis.rejected_layers[0].layer, Layer::power());
        // The reference layer still aligned on its own.
        assert!(analysis.timeline.report.grid_len > 0);
    }

    #[test]
    fn incompatible_time_base_fails_session() {
        let registry = FeatureRegistry::new().declare(Layer::host(), &["cpu"]);
        let epoch_events = (0..120)
            .map(|i| {
                let mut features = std::collections::BTreeMap::new();
                features.insert("cpu".to_string(), 10.0);
                RawEvent::new(1.7e9 + i as f64, features)
            })
            .collect();
        let epoch_host = LayerStream::new(
            Layer::host(),
            TimeBase::AbsoluteUnix,
            epoch_events,
            &registry,
        )
        .unwrap();

        let streams = vec![step_stream(Layer::network(), "pkts", 40.0, 120), epoch_host];
        let err = pipeline().analyze_session(&streams, &[]).unwrap_err();
        assert!(matches!(err, EngineError::IncompatibleTimeBase { .. }));
    }

    #[test]
    fn overlapping_ranges_with_mixed_declarations_fail_session() {
        // Both streams cover t=0..119 numerically; only the declared time
        // bases reveal that the host numbers mean something else entirely.
        let registry = FeatureRegistry::new().declare(Layer::host(), &["cpu"]);
        let epoch_events = (0..120)
            .map(|i| {
                let mut features = std::collections::BTreeMap::new();
                features.insert("cpu".to_string(), 10.0);
                RawEvent::new(i as f64, features)
            })
            .collect();
        let mislabeled_host = LayerStream::new(
            Layer::host(),
            TimeBase::AbsoluteUnix,
            epoch_events,
            &registry,
        )
        .unwrap();

        let streams = vec![
            step_stream(Layer::network(), "pkts", 40.0, 120),
            mislabeled_host,
        ];
        let err = pipeline().analyze_session(&streams, &[]).unwrap_err();
        match err {
            EngineError::IncompatibleTimeBase { layer, detail, .. } => {
                assert_eq!(layer, Layer::host());
                assert!(detail.contains("declared time bases differ"), "{detail}");
            }
            other => panic!("expected IncompatibleTimeBase, got {other}"),
        }
    }
}
