//! Input boundary types: layers, declared time bases, the feature registry,
//! and validated per-layer event streams.
//!
//! The core never parses telemetry files. An ingestion collaborator hands over
//! ordered `(timestamp, feature map)` records plus a declared time base per
//! layer; everything here exists to validate that contract once, at the
//! boundary, so the statistical stages can assume clean input.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One independently-sampled telemetry source.
///
/// Layers are named, not enumerated, so a deployment can add a signal type
/// through configuration rather than new branch logic. The conventional names
/// are `network`, `host`, and `power`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Layer(String);

impl Layer {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn network() -> Self {
        Self::new("network")
    }

    pub fn host() -> Self {
        Self::new("host")
    }

    pub fn power() -> Self {
        Self::new("power")
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Layer {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Declared interpretation of a layer's timestamps.
///
/// The declaration is part of the input contract: a stream cannot be built
/// without one, which is what lets the engine detect absolute-epoch vs
/// session-relative confusion instead of silently merging unrelated periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBase {
    /// Seconds since the Unix epoch.
    AbsoluteUnix,
    /// Seconds since the start of the capture session.
    SessionRelative,
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBase::AbsoluteUnix => f.write_str("absolute_unix"),
            TimeBase::SessionRelative => f.write_str("session_relative"),
        }
    }
}

/// Closed interval of timestamps, in a single layer's declared unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Intersection with another range, or `None` when disjoint.
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start <= end {
            Some(TimeRange { start, end })
        } else {
            None
        }
    }

    /// Gap between two disjoint ranges; zero when they touch or overlap.
    pub fn gap_to(&self, other: &TimeRange) -> f64 {
        if self.intersect(other).is_some() {
            0.0
        } else if self.end < other.start {
            other.start - self.end
        } else {
            self.start - other.end
        }
    }

    /// Shift both endpoints by `delta` seconds.
    pub fn shifted(&self, delta: f64) -> TimeRange {
        TimeRange {
            start: self.start + delta,
            end: self.end + delta,
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.3}, {:.3}]", self.start, self.end)
    }
}

/// Declares, per layer, the exact feature names the core expects.
///
/// Unknown or missing features are rejected at the boundary instead of
/// propagating absent-column ambiguity into the statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureRegistry {
    features: BTreeMap<Layer, Vec<String>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer with its declared feature names.
    pub fn declare(mut self, layer: Layer, features: &[&str]) -> Self {
        self.features
            .insert(layer, features.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn features_for(&self, layer: &Layer) -> Option<&[String]> {
        self.features.get(layer).map(|v| v.as_slice())
    }

    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.features.keys()
    }

    fn validate_event(&self, layer: &Layer, event: &RawEvent) -> Result<()> {
        let declared = self
            .features
            .get(layer)
            .ok_or_else(|| EngineError::MalformedInput {
                layer: layer.clone(),
                detail: "layer is not declared in the feature registry".into(),
            })?;

        for name in event.features.keys() {
            if !declared.iter().any(|d| d == name) {
                return Err(EngineError::MalformedInput {
                    layer: layer.clone(),
                    detail: format!("unknown feature '{name}' at t={:.3}", event.timestamp),
                });
            }
        }
        for name in declared {
            if !event.features.contains_key(name) {
                return Err(EngineError::MalformedInput {
                    layer: layer.clone(),
                    detail: format!("missing feature '{name}' at t={:.3}", event.timestamp),
                });
            }
        }
        Ok(())
    }
}

/// A single raw telemetry record. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Timestamp in seconds, interpreted per the stream's declared time base.
    pub timestamp: f64,
    /// Named numeric features for this record.
    pub features: BTreeMap<String, f64>,
}

impl RawEvent {
    pub fn new(timestamp: f64, features: BTreeMap<String, f64>) -> Self {
        Self {
            timestamp,
            features,
        }
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }
}

/// A validated, time-ordered event stream for one layer.
///
/// Construction is the only place input validation happens; downstream stages
/// receive a stream that is known to be non-empty, finite, monotonic, and
/// registry-conformant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerStream {
    layer: Layer,
    time_base: TimeBase,
    events: Vec<RawEvent>,
}

impl LayerStream {
    /// Validate and wrap a layer's raw events.
    ///
    /// Fails with [`EngineError::MalformedInput`] when the stream is empty,
    /// any timestamp is non-finite or out of order, or any event's feature
    /// map deviates from the registry declaration.
    pub fn new(
        layer: Layer,
        time_base: TimeBase,
        events: Vec<RawEvent>,
        registry: &FeatureRegistry,
    ) -> Result<Self> {
        if events.is_empty() {
            return Err(EngineError::MalformedInput {
                layer,
                detail: "stream contains no events".into(),
            });
        }

        let mut prev = f64::NEG_INFINITY;
        for event in &events {
            if !event.timestamp.is_finite() {
                return Err(EngineError::MalformedInput {
                    layer,
                    detail: format!("non-finite timestamp {:?}", event.timestamp),
                });
            }
            if event.timestamp < prev {
                return Err(EngineError::MalformedInput {
                    layer,
                    detail: format!(
                        "timestamps not monotonic: {:.3} follows {:.3}",
                        event.timestamp, prev
                    ),
                });
            }
            prev = event.timestamp;

            for (name, value) in &event.features {
                if !value.is_finite() {
                    return Err(EngineError::MalformedInput {
                        layer,
                        detail: format!(
                            "non-finite value for '{name}' at t={:.3}",
                            event.timestamp
                        ),
                    });
                }
            }
            registry.validate_event(&layer, event)?;
        }

        Ok(Self {
            layer,
            time_base,
            events,
        })
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The stream's raw timestamp span. Streams are never empty.
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(
            self.events[0].timestamp,
            self.events[self.events.len() - 1].timestamp,
        )
    }

    /// Values of one feature, in timestamp order.
    pub fn feature_series(&self, name: &str) -> Vec<f64> {
        self.events
            .iter()
            .filter_map(|e| e.feature(name))
            .collect()
    }
}

/// Render an absolute-Unix timestamp for reporting. Returns `None` for
/// timestamps chrono cannot represent.
pub fn epoch_to_datetime(epoch_secs: f64) -> Option<DateTime<Utc>> {
    let secs = epoch_secs.floor() as i64;
    let nanos = ((epoch_secs - epoch_secs.floor()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}
