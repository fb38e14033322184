//! Engine configuration and TOML parsing.
//!
//! Every threshold the algorithms use lives here. The detector confidences and
//! quality cutoffs default to the values the reference analysis used, but they
//! are uncalibrated heuristics; deployments are expected to tune them.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::stream::Layer;

/// Top-level engine configuration, loadable from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Anchor detection settings.
    #[serde(default)]
    pub anchors: AnchorConfig,

    /// Cross-layer anchor matching settings.
    #[serde(default)]
    pub matching: MatchConfig,

    /// Offset estimation validity gate.
    #[serde(default)]
    pub offset: OffsetConfig,

    /// Common-grid construction settings.
    #[serde(default)]
    pub grid: GridConfig,

    /// Time-lagged correlation settings.
    #[serde(default)]
    pub lag: LagConfig,

    /// Propagation path reconstruction settings.
    #[serde(default)]
    pub path: PathConfig,

    /// Attack signature extraction settings.
    #[serde(default)]
    pub signature: SignatureConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the algorithms cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.matching.window_secs <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "matching.window_secs must be positive, got {}",
                self.matching.window_secs
            )));
        }
        if !(0.0..=1.0).contains(&self.matching.min_confidence) {
            return Err(EngineError::InvalidConfig(format!(
                "matching.min_confidence must be in [0, 1], got {}",
                self.matching.min_confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.matching.quality_threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "matching.quality_threshold must be in [0, 1], got {}",
                self.matching.quality_threshold
            )));
        }
        if self.offset.min_matches == 0 {
            return Err(EngineError::InvalidConfig(
                "offset.min_matches must be at least 1".into(),
            ));
        }
        if self.offset.stability_threshold_secs <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "offset.stability_threshold_secs must be positive, got {}",
                self.offset.stability_threshold_secs
            )));
        }
        if self.grid.resolution_secs <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "grid.resolution_secs must be positive, got {}",
                self.grid.resolution_secs
            )));
        }
        if self.grid.max_fill_gap_secs < 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "grid.max_fill_gap_secs must be non-negative, got {}",
                self.grid.max_fill_gap_secs
            )));
        }
        if self.lag.max_lag == 0 {
            return Err(EngineError::InvalidConfig(
                "lag.max_lag must be at least 1".into(),
            ));
        }
        if self.lag.min_samples < 3 {
            return Err(EngineError::InvalidConfig(format!(
                "lag.min_samples must be at least 3 (Pearson p-value needs n-2 > 0), got {}",
                self.lag.min_samples
            )));
        }
        if !(0.0..1.0).contains(&self.lag.significance_alpha) || self.lag.significance_alpha == 0.0
        {
            return Err(EngineError::InvalidConfig(format!(
                "lag.significance_alpha must be in (0, 1), got {}",
                self.lag.significance_alpha
            )));
        }
        if self.path.causal_order.len() < 2 {
            return Err(EngineError::InvalidConfig(
                "path.causal_order needs at least two layers".into(),
            ));
        }
        if self.signature.min_category_samples < 2 {
            return Err(EngineError::InvalidConfig(
                "signature.min_category_samples must be at least 2".into(),
            ));
        }
        Ok(())
    }
}

/// Anchor detection configuration.
///
/// `key_features` names, per layer, the feature each value-based detector
/// watches (the reference analysis used a CPU counter for host and raw power
/// draw for power). A layer without an entry only gets rate-based anchors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Feature watched by the value-based detectors, per layer.
    #[serde(default)]
    pub key_features: BTreeMap<Layer, String>,

    /// Minimum anchors a layer must produce before matching is attempted.
    #[serde(default = "default_min_anchors")]
    pub min_anchors: usize,

    /// Rate-burst detector settings.
    #[serde(default)]
    pub rate_burst: RateBurstConfig,

    /// Magnitude-shift detector settings.
    #[serde(default)]
    pub magnitude_shift: MagnitudeShiftConfig,

    /// Baseline-excursion detector settings.
    #[serde(default)]
    pub baseline_excursion: BaselineExcursionConfig,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            key_features: BTreeMap::new(),
            min_anchors: default_min_anchors(),
            rate_burst: RateBurstConfig::default(),
            magnitude_shift: MagnitudeShiftConfig::default(),
            baseline_excursion: BaselineExcursionConfig::default(),
        }
    }
}

fn default_min_anchors() -> usize {
    1
}

/// Flags time buckets whose event density exceeds a multiple of the median
/// bucket density.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateBurstConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bucket width in seconds for density counting.
    #[serde(default = "default_burst_bucket")]
    pub bucket_secs: f64,
    /// A bucket is a burst when its count exceeds this multiple of the median.
    #[serde(default = "default_burst_factor")]
    pub burst_factor: f64,
    /// Minimum number of buckets before the median density is meaningful.
    #[serde(default = "default_burst_min_buckets")]
    pub min_buckets: usize,
    /// Confidence attached to emitted anchors. Uncalibrated heuristic.
    #[serde(default = "default_burst_confidence")]
    pub confidence: f64,
}

impl Default for RateBurstConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bucket_secs: default_burst_bucket(),
            burst_factor: default_burst_factor(),
            min_buckets: default_burst_min_buckets(),
            confidence: default_burst_confidence(),
        }
    }
}

fn default_burst_bucket() -> f64 {
    1.0
}

fn default_burst_factor() -> f64 {
    3.0
}

fn default_burst_min_buckets() -> usize {
    4
}

fn default_burst_confidence() -> f64 {
    0.7
}

/// Flags samples whose successive delta in the key feature exceeds a high
/// percentile of all observed deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MagnitudeShiftConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Percentile of successive absolute deltas used as the threshold.
    #[serde(default = "default_shift_percentile")]
    pub delta_percentile: f64,
    /// Minimum number of samples before deltas are meaningful.
    #[serde(default = "default_shift_min_samples")]
    pub min_samples: usize,
    /// Confidence attached to emitted anchors. Uncalibrated heuristic.
    #[serde(default = "default_shift_confidence")]
    pub confidence: f64,
}

impl Default for MagnitudeShiftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delta_percentile: default_shift_percentile(),
            min_samples: default_shift_min_samples(),
            confidence: default_shift_confidence(),
        }
    }
}

fn default_shift_percentile() -> f64 {
    95.0
}

fn default_shift_min_samples() -> usize {
    10
}

fn default_shift_confidence() -> f64 {
    0.6
}

/// Detects the first sustained excursion above a baseline-derived threshold
/// (`mean + sigma_factor * stddev` over the leading baseline fraction),
/// confirmed over a follow-up window before an anchor is emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineExcursionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Leading fraction of the stream treated as baseline.
    #[serde(default = "default_baseline_fraction")]
    pub baseline_fraction: f64,
    /// Threshold is baseline mean plus this many baseline stddevs.
    #[serde(default = "default_sigma_factor")]
    pub sigma_factor: f64,
    /// Width of the sliding window whose mean must exceed the threshold.
    #[serde(default = "default_excursion_window")]
    pub window_secs: f64,
    /// The excursion must hold on average over this confirmation span.
    #[serde(default = "default_confirmation")]
    pub confirmation_secs: f64,
    /// Confidence attached to emitted anchors. Uncalibrated heuristic.
    #[serde(default = "default_excursion_confidence")]
    pub confidence: f64,
}

impl Default for BaselineExcursionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baseline_fraction: default_baseline_fraction(),
            sigma_factor: default_sigma_factor(),
            window_secs: default_excursion_window(),
            confirmation_secs: default_confirmation(),
            confidence: default_excursion_confidence(),
        }
    }
}

fn default_baseline_fraction() -> f64 {
    0.25
}

fn default_sigma_factor() -> f64 {
    2.0
}

fn default_excursion_window() -> f64 {
    5.0
}

fn default_confirmation() -> f64 {
    10.0
}

fn default_excursion_confidence() -> f64 {
    0.9
}

/// Cross-layer anchor matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    /// The layer whose clock everything is aligned to.
    #[serde(default = "default_reference_layer")]
    pub reference_layer: Layer,
    /// Maximum |Δt| between a reference anchor and a secondary candidate.
    #[serde(default = "default_match_window")]
    pub window_secs: f64,
    /// Reference anchors below this confidence are not matched.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Partial matches are kept only above this mean-confidence quality.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            reference_layer: default_reference_layer(),
            window_secs: default_match_window(),
            min_confidence: default_min_confidence(),
            quality_threshold: default_quality_threshold(),
        }
    }
}

fn default_reference_layer() -> Layer {
    Layer::network()
}

fn default_match_window() -> f64 {
    10.0
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_quality_threshold() -> f64 {
    0.75
}

/// Offset estimation validity gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffsetConfig {
    /// Minimum matched anchors per layer before an offset is trusted.
    #[serde(default = "default_min_matches")]
    pub min_matches: usize,
    /// Maximum stddev of the delta distribution before the offset is rejected.
    #[serde(default = "default_stability_threshold")]
    pub stability_threshold_secs: f64,
}

impl Default for OffsetConfig {
    fn default() -> Self {
        Self {
            min_matches: default_min_matches(),
            stability_threshold_secs: default_stability_threshold(),
        }
    }
}

fn default_min_matches() -> usize {
    1
}

fn default_stability_threshold() -> f64 {
    5.0
}

/// How one feature is aggregated into a grid bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Mean,
    Max,
    Sum,
    /// Population standard deviation of the bucket's samples; zero for a
    /// single sample. Useful as a per-bucket spread feature.
    Std,
}

/// Common-grid construction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Grid bucket width in seconds.
    #[serde(default = "default_resolution")]
    pub resolution_secs: f64,
    /// Gaps up to this long are forward-filled; longer gaps stay empty.
    #[serde(default = "default_fill_gap")]
    pub max_fill_gap_secs: f64,
    /// Per-feature aggregation overrides; anything unlisted uses `Mean`.
    #[serde(default)]
    pub aggregations: BTreeMap<String, Aggregation>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            resolution_secs: default_resolution(),
            max_fill_gap_secs: default_fill_gap(),
            aggregations: BTreeMap::new(),
        }
    }
}

fn default_resolution() -> f64 {
    1.0
}

fn default_fill_gap() -> f64 {
    3.0
}

/// Time-lagged correlation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagConfig {
    /// Lags from `-max_lag` to `+max_lag` grid units are swept.
    #[serde(default = "default_max_lag")]
    pub max_lag: usize,
    /// Minimum overlapping samples for a lag's p-value to be meaningful.
    #[serde(default = "default_lag_min_samples")]
    pub min_samples: usize,
    /// Two-sided significance level for correlation tests.
    #[serde(default = "default_alpha")]
    pub significance_alpha: f64,
}

impl Default for LagConfig {
    fn default() -> Self {
        Self {
            max_lag: default_max_lag(),
            min_samples: default_lag_min_samples(),
            significance_alpha: default_alpha(),
        }
    }
}

fn default_max_lag() -> usize {
    10
}

fn default_lag_min_samples() -> usize {
    5
}

fn default_alpha() -> f64 {
    0.05
}

/// Propagation path reconstruction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Physically-plausible causal ordering of layers.
    #[serde(default = "default_causal_order")]
    pub causal_order: Vec<Layer>,
    /// Weight of |r| vs. match quality in the hop confidence blend.
    #[serde(default = "default_r_weight")]
    pub correlation_weight: f64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            causal_order: default_causal_order(),
            correlation_weight: default_r_weight(),
        }
    }
}

fn default_causal_order() -> Vec<Layer> {
    vec![Layer::network(), Layer::host(), Layer::power()]
}

fn default_r_weight() -> f64 {
    0.5
}

/// Which distribution-equality test the signature extractor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EqualityTest {
    /// One-way ANOVA F-test. Assumes roughly normal features.
    Anova,
    /// Kruskal-Wallis rank test. Default: the telemetry features this engine
    /// was built around are heavy-tailed.
    #[default]
    KruskalWallis,
}

/// Attack signature extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Minimum samples a category must contribute per feature.
    #[serde(default = "default_category_samples")]
    pub min_category_samples: usize,
    /// How many top-ranked features to summarize per layer.
    #[serde(default = "default_top_features")]
    pub top_features_per_layer: usize,
    /// Percentiles reported in each feature summary.
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
    /// Distribution-equality test to run across categories.
    #[serde(default)]
    pub equality_test: EqualityTest,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            min_category_samples: default_category_samples(),
            top_features_per_layer: default_top_features(),
            percentiles: default_percentiles(),
            equality_test: EqualityTest::default(),
        }
    }
}

fn default_category_samples() -> usize {
    5
}

fn default_top_features() -> usize {
    5
}

fn default_percentiles() -> Vec<f64> {
    vec![25.0, 50.0, 75.0, 95.0]
}

fn default_true() -> bool {
    true
}
