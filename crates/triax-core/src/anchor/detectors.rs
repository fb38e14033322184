//! Anchor detectors.
//!
//! Each detector is a pure function over one validated stream. A detector that
//! cannot compute (too few samples, missing key feature, degenerate baseline)
//! emits no anchors; it never errors and never fabricates.

use std::collections::BTreeMap;

use crate::config::{BaselineExcursionConfig, MagnitudeShiftConfig, RateBurstConfig};
use crate::stats;
use crate::stream::LayerStream;

use super::{Anchor, AnchorType};

/// Flags buckets whose event count exceeds a multiple of the median bucket
/// count. The anchor timestamp is the first event inside the burst bucket, so
/// every anchor stays within the stream's raw timestamp bounds.
pub fn rate_burst(stream: &LayerStream, config: &RateBurstConfig) -> Vec<Anchor> {
    let events = stream.events();
    let t0 = events[0].timestamp;
    let span = events[events.len() - 1].timestamp - t0;
    let bucket_count = ((span / config.bucket_secs).floor() as usize).saturating_add(1);
    if bucket_count < config.min_buckets {
        return Vec::new();
    }

    // Buckets are stored sparsely: a stream spanning a huge interval has at
    // most one occupied bucket per event, while the empty buckets only enter
    // the median as an implicit run of zeros.
    let mut occupied: BTreeMap<usize, (usize, f64)> = BTreeMap::new();
    for event in events {
        let idx = ((event.timestamp - t0) / config.bucket_secs).floor() as usize;
        let idx = idx.min(bucket_count - 1);
        let entry = occupied.entry(idx).or_insert((0, event.timestamp));
        entry.0 += 1;
    }

    let median = match sparse_count_median(&occupied, bucket_count) {
        Some(m) => m,
        None => return Vec::new(),
    };
    // Sparse streams have a zero/near-zero median bucket count; clamp so a
    // bucket needs more than `burst_factor` events in absolute terms too.
    let threshold = config.burst_factor * median.max(1.0);

    let mut anchors = Vec::new();
    for &(count, first_ts) in occupied.values() {
        if (count as f64) > threshold {
            let mut metadata = BTreeMap::new();
            metadata.insert("bucket_count".to_string(), count as f64);
            metadata.insert("median_bucket_count".to_string(), median);
            anchors.push(Anchor {
                layer: stream.layer().clone(),
                timestamp: first_ts,
                anchor_type: AnchorType::RateBurst,
                confidence: config.confidence,
                metadata,
            });
        }
    }
    anchors
}

/// Median bucket count over `total` buckets, of which only `occupied` are
/// non-zero. Matches [`stats::median`] over the dense count sequence: the
/// implicit zeros sort first, and an even total averages the middle pair.
fn sparse_count_median(
    occupied: &BTreeMap<usize, (usize, f64)>,
    total: usize,
) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let zeros = total - occupied.len();
    let mut nonzero: Vec<usize> = occupied.values().map(|&(c, _)| c).collect();
    nonzero.sort_unstable();
    let count_at = |k: usize| -> f64 {
        if k < zeros {
            0.0
        } else {
            nonzero[k - zeros] as f64
        }
    };
    if total % 2 == 1 {
        Some(count_at(total / 2))
    } else {
        Some((count_at(total / 2 - 1) + count_at(total / 2)) / 2.0)
    }
}

/// Flags samples whose successive absolute delta in the key feature exceeds a
/// high percentile of all observed deltas.
pub fn magnitude_shift(
    stream: &LayerStream,
    config: &MagnitudeShiftConfig,
    key_feature: &str,
) -> Vec<Anchor> {
    let events = stream.events();
    if events.len() < config.min_samples {
        return Vec::new();
    }

    let mut deltas = Vec::with_capacity(events.len().saturating_sub(1));
    for pair in events.windows(2) {
        let (a, b) = (pair[0].feature(key_feature), pair[1].feature(key_feature));
        if let (Some(a), Some(b)) = (a, b) {
            deltas.push((b - a).abs());
        }
    }
    if deltas.len() + 1 < config.min_samples {
        return Vec::new();
    }
    let threshold = match stats::percentile(&deltas, config.delta_percentile) {
        Some(t) if t > 0.0 => t,
        // Constant or near-constant series: no shift is distinctive.
        _ => return Vec::new(),
    };

    let mut anchors = Vec::new();
    for (i, pair) in events.windows(2).enumerate() {
        let (a, b) = (pair[0].feature(key_feature), pair[1].feature(key_feature));
        if let (Some(a), Some(b)) = (a, b) {
            let delta = (b - a).abs();
            if delta > threshold {
                let mut metadata = BTreeMap::new();
                metadata.insert("delta".to_string(), delta);
                metadata.insert("threshold".to_string(), threshold);
                anchors.push(Anchor {
                    layer: stream.layer().clone(),
                    timestamp: events[i + 1].timestamp,
                    anchor_type: AnchorType::MagnitudeShift,
                    confidence: config.confidence,
                    metadata,
                });
            }
        }
    }
    anchors
}

/// Detects the first sustained excursion of the key feature above a
/// baseline-derived threshold.
///
/// The leading `baseline_fraction` of samples establishes `mean + kσ`. The
/// first sample whose trailing `window_secs` mean exceeds the threshold, and
/// whose forward `confirmation_secs` mean also exceeds it, becomes the single
/// emitted anchor. The trailing window keeps the anchor at the onset instead
/// of ahead of it; the forward confirmation rejects one-sample transients. At
/// most one anchor per stream: this marks onset, not every elevated sample.
pub fn baseline_excursion(
    stream: &LayerStream,
    config: &BaselineExcursionConfig,
    key_feature: &str,
) -> Vec<Anchor> {
    let samples: Vec<(f64, f64)> = stream
        .events()
        .iter()
        .filter_map(|e| e.feature(key_feature).map(|v| (e.timestamp, v)))
        .collect();

    let baseline_len = (samples.len() as f64 * config.baseline_fraction).floor() as usize;
    if baseline_len < 2 || baseline_len >= samples.len() {
        return Vec::new();
    }

    let baseline: Vec<f64> = samples[..baseline_len].iter().map(|&(_, v)| v).collect();
    let (mean, std) = match (stats::mean(&baseline), stats::stddev_population(&baseline)) {
        (Some(m), Some(s)) => (m, s),
        _ => return Vec::new(),
    };
    let threshold = mean + config.sigma_factor * std;

    let forward_mean = |start: usize, span: f64| -> f64 {
        let t_start = samples[start].0;
        let mut sum = 0.0;
        let mut n = 0usize;
        for &(t, v) in &samples[start..] {
            if t > t_start + span {
                break;
            }
            sum += v;
            n += 1;
        }
        sum / n as f64
    };
    let trailing_mean = |end: usize, span: f64| -> f64 {
        let t_end = samples[end].0;
        let mut sum = 0.0;
        let mut n = 0usize;
        for &(t, v) in samples[..=end].iter().rev() {
            if t < t_end - span {
                break;
            }
            sum += v;
            n += 1;
        }
        sum / n as f64
    };

    for i in baseline_len..samples.len() {
        let window_mean = trailing_mean(i, config.window_secs);
        if window_mean <= threshold {
            continue;
        }
        let confirm_mean = forward_mean(i, config.confirmation_secs);
        if confirm_mean <= threshold {
            continue;
        }
        let mut metadata = BTreeMap::new();
        metadata.insert("threshold".to_string(), threshold);
        metadata.insert("window_mean".to_string(), window_mean);
        metadata.insert("confirmation_mean".to_string(), confirm_mean);
        metadata.insert("baseline_mean".to_string(), mean);
        return vec![Anchor {
            layer: stream.layer().clone(),
            timestamp: samples[i].0,
            anchor_type: AnchorType::BaselineExcursion,
            confidence: config.confidence,
            metadata,
        }];
    }
    Vec::new()
}
