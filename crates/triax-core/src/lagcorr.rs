//! Time-lagged cross-correlation between layer pairs on the aligned grid.
//!
//! For each integer lag in `[-max_lag, +max_lag]` the second series is shifted
//! against the first and Pearson r is computed over the overlap. Sign
//! convention: a negative optimal lag means the first-named layer's signal
//! precedes the second's by that many grid units.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::align::AlignedTimeline;
use crate::config::LagConfig;
use crate::error::{EngineError, Result};
use crate::stats;
use crate::stream::Layer;

/// One layer/feature pair to test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairSpec {
    pub first_layer: Layer,
    pub first_feature: String,
    pub second_layer: Layer,
    pub second_feature: String,
}

impl PairSpec {
    pub fn new(
        first_layer: Layer,
        first_feature: impl Into<String>,
        second_layer: Layer,
        second_feature: impl Into<String>,
    ) -> Self {
        Self {
            first_layer,
            first_feature: first_feature.into(),
            second_layer,
            second_feature: second_feature.into(),
        }
    }
}

/// Correlation at one tested lag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagSample {
    pub lag: i64,
    pub r: f64,
    pub p_value: f64,
    pub sample_count: usize,
}

/// A lag whose overlap was too small for a meaningful p-value; reported, not
/// silently treated as zero correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedLag {
    pub lag: i64,
    pub overlap: usize,
    pub required: usize,
}

/// The selected optimum for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagCorrelationResult {
    pub layer_pair: (Layer, Layer),
    pub feature_pair: (String, String),
    /// Optimal lag in grid units; negative means the first layer leads.
    pub lag: i64,
    /// Optimal lag in seconds (`lag * grid resolution`).
    pub lag_secs: f64,
    pub correlation_r: f64,
    pub p_value: f64,
    pub sample_count: usize,
}

/// Full sweep output: the optimum plus every tested and skipped lag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagSweep {
    pub optimal: LagCorrelationResult,
    pub tested: Vec<LagSample>,
    pub skipped: Vec<SkippedLag>,
}

impl LagSweep {
    /// Human-readable lead/lag statement for reporting.
    pub fn interpret(&self) -> String {
        let (first, second) = &self.optimal.layer_pair;
        let secs = self.optimal.lag_secs.abs();
        if self.optimal.lag < 0 {
            format!("{first} leads {second} by {secs:.1}s")
        } else if self.optimal.lag > 0 {
            format!("{second} leads {first} by {secs:.1}s")
        } else {
            format!("{first} and {second} respond synchronously")
        }
    }
}

/// Spread of optimal lags across independent sessions of one attack category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagDispersion {
    pub category: String,
    pub layer_pair: (Layer, Layer),
    pub sessions: usize,
    pub mean_secs: f64,
    pub median_secs: f64,
    /// Interquartile range of the per-session optimal lags.
    pub iqr_secs: f64,
}

/// Summarize per-session optimal lags for one category and layer pair.
/// Sessions stay independent; this is concatenation plus summary. `None` when
/// `results` is empty or mixes layer pairs.
pub fn lag_dispersion(
    category: impl Into<String>,
    results: &[&LagCorrelationResult],
) -> Option<LagDispersion> {
    let first_pair = &results.first()?.layer_pair;
    if results.iter().any(|r| &r.layer_pair != first_pair) {
        return None;
    }
    let lags: Vec<f64> = results.iter().map(|r| r.lag_secs).collect();
    Some(LagDispersion {
        category: category.into(),
        layer_pair: first_pair.clone(),
        sessions: lags.len(),
        mean_secs: stats::mean(&lags)?,
        median_secs: stats::median(&lags)?,
        iqr_secs: stats::percentile(&lags, 75.0)? - stats::percentile(&lags, 25.0)?,
    })
}

#[derive(Debug, Clone)]
pub struct LagCorrelationAnalyzer {
    config: LagConfig,
}

impl LagCorrelationAnalyzer {
    pub fn new(config: LagConfig) -> Self {
        Self { config }
    }

    /// Sweep all lags for one pair and select the optimum by maximum `|r|`,
    /// ties broken by smaller `|lag|`.
    ///
    /// Lags whose overlap falls below `min_samples`, or whose overlap is
    /// degenerate (a constant series), are recorded in `skipped`. When every
    /// lag is skipped the whole pair fails with
    /// [`EngineError::InsufficientSamples`].
    pub fn analyze(&self, timeline: &AlignedTimeline, spec: &PairSpec) -> Result<LagSweep> {
        let first = timeline.feature_series(&spec.first_layer, &spec.first_feature);
        let second = timeline.feature_series(&spec.second_layer, &spec.second_feature);
        let n = first.len() as i64;
        let max_lag = self.config.max_lag as i64;

        let mut tested = Vec::new();
        let mut skipped = Vec::new();
        let mut best_overlap = 0usize;

        for lag in -max_lag..=max_lag {
            // Pair first[i + lag] with second[i]; a series delayed by d grid
            // units relative to the first peaks at lag = -d.
            let mut x = Vec::new();
            let mut y = Vec::new();
            for i in 0..n {
                let j = i + lag;
                if j < 0 || j >= n {
                    continue;
                }
                if let (Some(a), Some(b)) = (first[j as usize], second[i as usize]) {
                    x.push(a);
                    y.push(b);
                }
            }

            best_overlap = best_overlap.max(x.len());
            if x.len() < self.config.min_samples {
                skipped.push(SkippedLag {
                    lag,
                    overlap: x.len(),
                    required: self.config.min_samples,
                });
                continue;
            }
            match stats::pearson_test(&x, &y) {
                Some((r, p)) => tested.push(LagSample {
                    lag,
                    r,
                    p_value: p,
                    sample_count: x.len(),
                }),
                None => skipped.push(SkippedLag {
                    lag,
                    overlap: x.len(),
                    required: self.config.min_samples,
                }),
            }
        }

        let best = tested
            .iter()
            .max_by(|a, b| {
                a.r
                    .abs()
                    .partial_cmp(&b.r.abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.lag.abs().cmp(&a.lag.abs()))
            })
            .cloned()
            .ok_or_else(|| EngineError::InsufficientSamples {
                context: format!(
                    "lag correlation {}:{} vs {}:{}",
                    spec.first_layer, spec.first_feature, spec.second_layer, spec.second_feature
                ),
                found: best_overlap,
                required: self.config.min_samples,
            })?;

        let optimal = LagCorrelationResult {
            layer_pair: (spec.first_layer.clone(), spec.second_layer.clone()),
            feature_pair: (spec.first_feature.clone(), spec.second_feature.clone()),
            lag: best.lag,
            lag_secs: best.lag as f64 * timeline.report.resolution_secs,
            correlation_r: best.r,
            p_value: best.p_value,
            sample_count: best.sample_count,
        };
        debug!(
            first = %spec.first_layer,
            second = %spec.second_layer,
            lag = optimal.lag,
            r = optimal.correlation_r,
            "lag sweep complete"
        );
        Ok(LagSweep {
            optimal,
            tested,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::{AlignedSample, AlignmentReport, AlignedTimeline, LayerCell};
    use std::collections::BTreeMap;

    /// Deterministic wandering signal with enough structure that only the
    /// true shift correlates strongly.
    fn base_signal(n: usize) -> Vec<f64> {
        let mut state: u64 = 42;
        let mut value = 0.0f64;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let step = ((state >> 33) % 200) as f64 / 100.0 - 1.0;
            value += step;
            out.push(value);
        }
        out
    }

    fn timeline_from(
        first: &[Option<f64>],
        second: &[Option<f64>],
    ) -> AlignedTimeline {
        let samples = first
            .iter()
            .zip(second.iter())
            .enumerate()
            .map(|(i, (a, b))| {
                let mut cells = BTreeMap::new();
                if let Some(v) = a {
                    cells.insert(
                        crate::stream::Layer::network(),
                        LayerCell {
                            features: [("f".to_string(), *v)].into_iter().collect(),
                            completeness_ratio: 1.0,
                            forward_filled: false,
                        },
                    );
                }
                if let Some(v) = b {
                    cells.insert(
                        crate::stream::Layer::host(),
                        LayerCell {
                            features: [("g".to_string(), *v)].into_iter().collect(),
                            completeness_ratio: 1.0,
                            forward_filled: false,
                        },
                    );
                }
                AlignedSample {
                    grid_timestamp: i as f64,
                    cells,
                }
            })
            .collect::<Vec<_>>();
        let grid_len = samples.len();
        AlignedTimeline {
            samples,
            report: AlignmentReport {
                grid_start: 0.0,
                grid_len,
                resolution_secs: 1.0,
                coverage: BTreeMap::new(),
            },
        }
    }

    fn pair() -> PairSpec {
        PairSpec::new(
            crate::stream::Layer::network(),
            "f",
            crate::stream::Layer::host(),
            "g",
        )
    }

    #[test]
    fn recovers_known_shift() {
        // Second series is the first delayed by 4 grid units, so the first
        // leads and the optimum must be lag = -4.
        let base = base_signal(120);
        let first: Vec<Option<f64>> = base.iter().map(|&v| Some(v)).collect();
        let second: Vec<Option<f64>> = (0..base.len())
            .map(|i| if i >= 4 { Some(base[i - 4]) } else { None })
            .collect();

        let sweep = LagCorrelationAnalyzer::new(LagConfig::default())
            .analyze(&timeline_from(&first, &second), &pair())
            .unwrap();
        assert_eq!(sweep.optimal.lag, -4);
        assert!(sweep.optimal.correlation_r.abs() > 0.9);
        assert!(sweep.optimal.p_value < 0.01);
        assert_eq!(sweep.interpret(), "network leads host by 4.0s");
    }

    #[test]
    fn shift_with_noise_still_recovered() {
        let base = base_signal(120);
        let first: Vec<Option<f64>> = base.iter().map(|&v| Some(v)).collect();
        // Delayed copy plus small deterministic perturbation.
        let second: Vec<Option<f64>> = (0..base.len())
            .map(|i| {
                if i >= 6 {
                    Some(base[i - 6] + ((i % 7) as f64 - 3.0) * 0.05)
                } else {
                    None
                }
            })
            .collect();

        let sweep = LagCorrelationAnalyzer::new(LagConfig::default())
            .analyze(&timeline_from(&first, &second), &pair())
            .unwrap();
        assert_eq!(sweep.optimal.lag, -6);
        assert!(sweep.optimal.correlation_r.abs() > 0.9);
    }

    #[test]
    fn zero_lag_for_synchronous_series() {
        let base = base_signal(100);
        let first: Vec<Option<f64>> = base.iter().map(|&v| Some(v)).collect();
        let second = first.clone();
        let sweep = LagCorrelationAnalyzer::new(LagConfig::default())
            .analyze(&timeline_from(&first, &second), &pair())
            .unwrap();
        assert_eq!(sweep.optimal.lag, 0);
        assert!(sweep.interpret().contains("synchronously"));
    }

    #[test]
    fn full_sweep_retained() {
        let base = base_signal(100);
        let first: Vec<Option<f64>> = base.iter().map(|&v| Some(v)).collect();
        let sweep = LagCorrelationAnalyzer::new(LagConfig::default())
            .analyze(&timeline_from(&first, &first.clone()), &pair())
            .unwrap();
        // 21 lags in [-10, 10], all with ample overlap.
        assert_eq!(sweep.tested.len(), 21);
        assert!(sweep.skipped.is_empty());
    }

    #[test]
    fn thin_overlap_skipped_and_reported() {
        let base = base_signal(12);
        let first: Vec<Option<f64>> = base.iter().map(|&v| Some(v)).collect();
        let sweep = LagCorrelationAnalyzer::new(LagConfig::default())
            .analyze(&timeline_from(&first, &first.clone()), &pair())
            .unwrap();
        // Extreme lags leave fewer than min_samples overlapping points.
        assert!(!sweep.skipped.is_empty());
        for skip in &sweep.skipped {
            assert!(skip.overlap < skip.required);
        }
    }

    #[test]
    fn dispersion_across_sessions() {
        let result = |lag: i64| LagCorrelationResult {
            layer_pair: (crate::stream::Layer::network(), crate::stream::Layer::host()),
            feature_pair: ("f".into(), "g".into()),
            lag,
            lag_secs: lag as f64,
            correlation_r: 0.9,
            p_value: 1e-4,
            sample_count: 50,
        };
        let sessions = [result(-5), result(-6), result(-6), result(-7)];
        let refs: Vec<&LagCorrelationResult> = sessions.iter().collect();
        let dispersion = lag_dispersion("dos", &refs).unwrap();
        assert_eq!(dispersion.sessions, 4);
        assert!((dispersion.median_secs - -6.0).abs() < 1e-9);
        assert!((dispersion.mean_secs - -6.0).abs() < 1e-9);
        // p75 = -5.75, p25 = -6.25 with linear interpolation.
        assert!((dispersion.iqr_secs - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dispersion_rejects_mixed_pairs() {
        let a = LagCorrelationResult {
            layer_pair: (crate::stream::Layer::network(), crate::stream::Layer::host()),
            feature_pair: ("f".into(), "g".into()),
            lag: -5,
            lag_secs: -5.0,
            correlation_r: 0.9,
            p_value: 1e-4,
            sample_count: 50,
        };
        let mut b = a.clone();
        b.layer_pair = (crate::stream::Layer::host(), crate::stream::Layer::power());
        assert!(lag_dispersion("dos", &[&a, &b]).is_none());
    }

    #[test]
    fn all_lags_skipped_is_an_error() {
        let first: Vec<Option<f64>> = vec![Some(1.0), Some(2.0), None, None];
        let second: Vec<Option<f64>> = vec![None, None, Some(1.0), Some(2.0)];
        let err = LagCorrelationAnalyzer::new(LagConfig::default())
            .analyze(&timeline_from(&first, &second), &pair())
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientSamples { .. }));
    }
}
