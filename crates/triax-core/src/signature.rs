//! Per-attack-category statistical signatures over the aligned grid.
//!
//! For every layer/feature the extractor tests whether the feature's
//! distribution differs across attack categories, ranks features by ascending
//! p-value, and summarizes the top-ranked features per category. Features a
//! category cannot support with enough samples are excluded and reported,
//! never silently filled.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::align::AlignedTimeline;
use crate::config::{EqualityTest, SignatureConfig};
use crate::error::{EngineError, Result};
use crate::stats;
use crate::stream::Layer;

/// Summary statistics for one feature within one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub mean: f64,
    pub std: f64,
    pub sample_count: usize,
    /// `(percentile, value)` pairs in configured order.
    pub percentiles: Vec<(f64, f64)>,
}

/// A feature ranked by its power to separate attack categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminativeFeature {
    pub layer: Layer,
    pub feature: String,
    /// F statistic or Kruskal-Wallis H, per the configured test.
    pub statistic: f64,
    pub p_value: f64,
}

/// A layer/feature whose equality test could not be run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFeature {
    pub layer: Layer,
    pub feature: String,
    pub detail: String,
}

/// Per-category profile over the top-ranked features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackSignature {
    pub category: String,
    pub layers: BTreeMap<Layer, BTreeMap<String, FeatureSummary>>,
}

/// Full extraction output: signatures, the global ranking, and every skipped
/// feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureSet {
    pub signatures: Vec<AttackSignature>,
    /// All tested features, ascending p-value.
    pub ranking: Vec<DiscriminativeFeature>,
    pub skipped: Vec<SkippedFeature>,
}

#[derive(Debug, Clone)]
pub struct SignatureExtractor {
    config: SignatureConfig,
}

impl SignatureExtractor {
    pub fn new(config: SignatureConfig) -> Self {
        Self { config }
    }

    /// Extract signatures from category-labeled aligned timelines.
    ///
    /// Forward-filled cells are carried estimates, not measurements, and are
    /// excluded from the statistics. Fails with
    /// [`EngineError::InsufficientSamples`] when fewer than two categories are
    /// present.
    pub fn extract(&self, labeled: &[(String, AlignedTimeline)]) -> Result<SignatureSet> {
        let categories: BTreeSet<&String> = labeled.iter().map(|(c, _)| c).collect();
        if categories.len() < 2 {
            return Err(EngineError::InsufficientSamples {
                context: "signature extraction needs multiple attack categories".into(),
                found: categories.len(),
                required: 2,
            });
        }

        // (layer, feature) -> category -> observed values.
        let mut values: BTreeMap<(Layer, String), BTreeMap<&String, Vec<f64>>> = BTreeMap::new();
        for (category, timeline) in labeled {
            for sample in &timeline.samples {
                for (layer, cell) in &sample.cells {
                    if cell.forward_filled {
                        continue;
                    }
                    for (feature, &value) in &cell.features {
                        values
                            .entry((layer.clone(), feature.clone()))
                            .or_default()
                            .entry(category)
                            .or_default()
                            .push(value);
                    }
                }
            }
        }

        let mut ranking = Vec::new();
        let mut skipped = Vec::new();
        for ((layer, feature), by_category) in &values {
            match self.test_feature(by_category, &categories) {
                Ok((statistic, p_value)) => ranking.push(DiscriminativeFeature {
                    layer: layer.clone(),
                    feature: feature.clone(),
                    statistic,
                    p_value,
                }),
                Err(detail) => skipped.push(SkippedFeature {
                    layer: layer.clone(),
                    feature: feature.clone(),
                    detail,
                }),
            }
        }
        ranking.sort_by(|a, b| {
            a.p_value
                .partial_cmp(&b.p_value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (&a.layer, &a.feature).cmp(&(&b.layer, &b.feature)))
        });

        // Top N per layer, in ranking order.
        let mut per_layer_taken: BTreeMap<&Layer, usize> = BTreeMap::new();
        let mut selected: BTreeSet<(&Layer, &String)> = BTreeSet::new();
        for entry in &ranking {
            let taken = per_layer_taken.entry(&entry.layer).or_insert(0);
            if *taken < self.config.top_features_per_layer {
                *taken += 1;
                selected.insert((&entry.layer, &entry.feature));
            }
        }

        let mut signatures = Vec::new();
        for category in &categories {
            let mut layers: BTreeMap<Layer, BTreeMap<String, FeatureSummary>> = BTreeMap::new();
            for ((layer, feature), by_category) in &values {
                if !selected.contains(&(layer, feature)) {
                    continue;
                }
                let Some(observations) = by_category.get(category) else {
                    continue;
                };
                if let Some(summary) = self.summarize(observations) {
                    layers
                        .entry(layer.clone())
                        .or_default()
                        .insert(feature.clone(), summary);
                }
            }
            signatures.push(AttackSignature {
                category: (*category).clone(),
                layers,
            });
        }

        debug!(
            categories = categories.len(),
            ranked = ranking.len(),
            skipped = skipped.len(),
            "signature extraction complete"
        );
        Ok(SignatureSet {
            signatures,
            ranking,
            skipped,
        })
    }

    /// Run the configured equality test for one feature, or explain why it
    /// cannot run.
    fn test_feature(
        &self,
        by_category: &BTreeMap<&String, Vec<f64>>,
        categories: &BTreeSet<&String>,
    ) -> std::result::Result<(f64, f64), String> {
        for category in categories {
            let found = by_category.get(category).map(|v| v.len()).unwrap_or(0);
            if found < self.config.min_category_samples {
                return Err(format!(
                    "category '{category}' has {found} samples, need {}",
                    self.config.min_category_samples
                ));
            }
        }

        let groups: Vec<&[f64]> = by_category.values().map(|v| v.as_slice()).collect();
        let outcome = match self.config.equality_test {
            EqualityTest::Anova => stats::one_way_anova(&groups),
            EqualityTest::KruskalWallis => stats::kruskal_wallis(&groups),
        };
        outcome.ok_or_else(|| "degenerate distribution, equality test undefined".into())
    }

    fn summarize(&self, observations: &[f64]) -> Option<FeatureSummary> {
        let mean = stats::mean(observations)?;
        let std = stats::stddev(observations).unwrap_or(0.0);
        let mut percentiles = Vec::with_capacity(self.config.percentiles.len());
        for &pct in &self.config.percentiles {
            percentiles.push((pct, stats::percentile(observations, pct)?));
        }
        Some(FeatureSummary {
            mean,
            std,
            sample_count: observations.len(),
            percentiles,
        })
    }
}
