//! Timeline alignment: applies validated offsets and resamples every layer
//! onto one common time grid.
//!
//! The grid spans the intersection of the shifted per-layer ranges, never the
//! union: if the ranges share no time at all the alignment fails loudly
//! instead of producing rows that pair unrelated periods.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Aggregation, GridConfig};
use crate::error::{EngineError, Result};
use crate::stats;
use crate::stream::{Layer, LayerStream, TimeRange};

/// One layer's aggregated contribution to a grid bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCell {
    /// Aggregated feature values for this bucket.
    pub features: BTreeMap<String, f64>,
    /// Fraction of this layer's expected samples actually observed in the
    /// bucket. Zero for forward-filled cells: a filled value is a carried
    /// estimate, never a measurement.
    pub completeness_ratio: f64,
    pub forward_filled: bool,
}

/// One row of the common grid. A layer absent from `cells` had no data in the
/// bucket and the gap was too long to fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedSample {
    /// Bucket start, on the reference layer's clock.
    pub grid_timestamp: f64,
    pub cells: BTreeMap<Layer, LayerCell>,
}

/// Per-layer coverage accounting over the whole grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerCoverage {
    pub buckets_with_data: usize,
    pub buckets_filled: usize,
    pub buckets_empty: usize,
    /// `buckets_with_data / total buckets`.
    pub data_fraction: f64,
}

/// Structured quality summary of an alignment run. Downstream code inspects
/// this instead of a pass/fail boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub grid_start: f64,
    pub grid_len: usize,
    pub resolution_secs: f64,
    pub coverage: BTreeMap<Layer, LayerCoverage>,
}

/// The aligned grid plus its quality report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedTimeline {
    pub samples: Vec<AlignedSample>,
    pub report: AlignmentReport,
}

impl AlignedTimeline {
    /// One feature of one layer across the grid; `None` where the bucket has
    /// no cell for the layer.
    pub fn feature_series(&self, layer: &Layer, feature: &str) -> Vec<Option<f64>> {
        self.samples
            .iter()
            .map(|s| {
                s.cells
                    .get(layer)
                    .and_then(|cell| cell.features.get(feature).copied())
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct TimelineAligner {
    config: GridConfig,
}

impl TimelineAligner {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    /// Align `streams` onto a common grid.
    ///
    /// `shifts` maps every stream's layer to the offset subtracted from its
    /// timestamps (zero for the reference layer). Fails with
    /// [`EngineError::IncompatibleTimeBase`] when the shifted ranges share no
    /// time, and with [`EngineError::MalformedInput`] when a stream arrives
    /// without a shift entry.
    pub fn align(
        &self,
        streams: &[LayerStream],
        shifts: &BTreeMap<Layer, f64>,
        reference: &Layer,
    ) -> Result<AlignedTimeline> {
        if streams.is_empty() {
            return Err(EngineError::MalformedInput {
                layer: reference.clone(),
                detail: "no streams supplied for alignment".into(),
            });
        }

        let mut shifted_ranges: Vec<(&LayerStream, f64, TimeRange)> = Vec::new();
        for stream in streams {
            let shift = *shifts.get(stream.layer()).ok_or_else(|| {
                EngineError::MalformedInput {
                    layer: stream.layer().clone(),
                    detail: "no validated offset supplied for this layer".into(),
                }
            })?;
            shifted_ranges.push((stream, shift, stream.time_range().shifted(-shift)));
        }

        let reference_range = shifted_ranges
            .iter()
            .find(|(s, _, _)| s.layer() == reference)
            .map(|&(_, _, r)| r)
            .ok_or_else(|| EngineError::MalformedInput {
                layer: reference.clone(),
                detail: "reference layer has no stream".into(),
            })?;

        let mut span = reference_range;
        for (stream, _, range) in &shifted_ranges {
            span = span.intersect(range).ok_or_else(|| {
                warn!(layer = %stream.layer(), "shifted ranges share no time");
                EngineError::IncompatibleTimeBase {
                    layer: stream.layer().clone(),
                    layer_range: *range,
                    reference: reference.clone(),
                    reference_range,
                    detail: "shifted time ranges have an empty intersection".into(),
                }
            })?;
        }

        let resolution = self.config.resolution_secs;
        let grid_len = (span.duration() / resolution).floor() as usize + 1;

        let mut samples: Vec<AlignedSample> = (0..grid_len)
            .map(|i| AlignedSample {
                grid_timestamp: span.start + i as f64 * resolution,
                cells: BTreeMap::new(),
            })
            .collect();
        let mut coverage = BTreeMap::new();

        for (stream, shift, _) in &shifted_ranges {
            let layer_coverage = self.fill_layer(stream, *shift, span, &mut samples, grid_len);
            coverage.insert(stream.layer().clone(), layer_coverage);
        }

        debug!(
            grid_len,
            resolution_secs = resolution,
            layers = shifted_ranges.len(),
            "timeline aligned"
        );
        Ok(AlignedTimeline {
            samples,
            report: AlignmentReport {
                grid_start: span.start,
                grid_len,
                resolution_secs: resolution,
                coverage,
            },
        })
    }

    fn fill_layer(
        &self,
        stream: &LayerStream,
        shift: f64,
        span: TimeRange,
        samples: &mut [AlignedSample],
        grid_len: usize,
    ) -> LayerCoverage {
        let resolution = self.config.resolution_secs;

        // Bucket raw values.
        let mut buckets: Vec<BTreeMap<String, Vec<f64>>> = vec![BTreeMap::new(); grid_len];
        let mut in_span = 0usize;
        for event in stream.events() {
            let t = event.timestamp - shift;
            if t < span.start || t > span.end {
                continue;
            }
            let idx = (((t - span.start) / resolution).floor() as usize).min(grid_len - 1);
            in_span += 1;
            for (name, &value) in &event.features {
                buckets[idx].entry(name.clone()).or_default().push(value);
            }
        }

        let expected_per_bucket = (in_span as f64 / grid_len as f64).max(1.0);

        // Aggregate, then forward-fill short gaps.
        let mut with_data = 0usize;
        let mut filled = 0usize;
        let mut last_data: Option<(usize, LayerCell)> = None;
        for (idx, bucket) in buckets.iter().enumerate() {
            if bucket.is_empty() {
                if let Some((last_idx, ref cell)) = last_data {
                    let gap = (idx - last_idx) as f64 * resolution;
                    if gap <= self.config.max_fill_gap_secs {
                        let mut carried = cell.clone();
                        carried.completeness_ratio = 0.0;
                        carried.forward_filled = true;
                        samples[idx].cells.insert(stream.layer().clone(), carried);
                        filled += 1;
                    }
                }
                continue;
            }

            let count = bucket.values().map(|v| v.len()).max().unwrap_or(0);
            let mut features = BTreeMap::new();
            for (name, values) in bucket {
                features.insert(name.clone(), self.aggregate(name, values));
            }
            let cell = LayerCell {
                features,
                completeness_ratio: (count as f64 / expected_per_bucket).min(1.0),
                forward_filled: false,
            };
            samples[idx]
                .cells
                .insert(stream.layer().clone(), cell.clone());
            last_data = Some((idx, cell));
            with_data += 1;
        }

        LayerCoverage {
            buckets_with_data: with_data,
            buckets_filled: filled,
            buckets_empty: grid_len - with_data - filled,
            data_fraction: with_data as f64 / grid_len as f64,
        }
    }

    fn aggregate(&self, feature: &str, values: &[f64]) -> f64 {
        let kind = self
            .config
            .aggregations
            .get(feature)
            .copied()
            .unwrap_or_default();
        match kind {
            Aggregation::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Sum => values.iter().sum(),
            // Buckets are never empty here, so the population stddev exists.
            Aggregation::Std => stats::stddev_population(values).unwrap_or(0.0),
        }
    }
}
