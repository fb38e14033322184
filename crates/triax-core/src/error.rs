//! Error types for the alignment engine.
//!
//! Every variant carries the offending measurements so a caller can decide
//! whether to relax thresholds instead of guessing from a message string.

use thiserror::Error;

use crate::stream::{Layer, TimeRange};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Input stream violates the boundary contract: timestamps non-monotonic,
    /// non-finite, or features not matching the declared registry.
    #[error("malformed input for layer '{layer}': {detail}")]
    MalformedInput { layer: Layer, detail: String },

    /// A layer produced too few anchors to attempt matching.
    #[error("layer '{layer}' produced {found} anchors, need at least {required}")]
    InsufficientAnchors {
        layer: Layer,
        found: usize,
        required: usize,
    },

    /// The offset estimate failed its validity gate. The raw delta
    /// distribution is included for diagnosis.
    #[error(
        "offset for layer '{layer}' is unstable: stddev {stddev:.3}s over {} samples \
         (limit {stability_threshold:.3}s, min samples {min_matches})",
        .deltas.len()
    )]
    AlignmentUnstable {
        layer: Layer,
        stddev: f64,
        stability_threshold: f64,
        min_matches: usize,
        deltas: Vec<f64>,
    },

    /// Per-layer time ranges do not overlap at all, before or after offset
    /// application. Mixing absolute-epoch and session-relative clocks lands
    /// here; it must never degrade into a concatenation of unrelated periods.
    #[error(
        "time bases are incompatible: layer '{layer}' covers {layer_range}, \
         reference '{reference}' covers {reference_range} ({detail})"
    )]
    IncompatibleTimeBase {
        layer: Layer,
        layer_range: TimeRange,
        reference: Layer,
        reference_range: TimeRange,
        detail: String,
    },

    /// A correlation or signature test was attempted with too few samples.
    /// The specific test is skipped and reported, never fabricated.
    #[error("{context}: {found} samples available, need at least {required}")]
    InsufficientSamples {
        context: String,
        found: usize,
        required: usize,
    },

    /// A reconstructed propagation path violates causal ordering. The path is
    /// attached so it can be inspected rather than silently discarded.
    #[error("propagation path violates causal ordering: {detail}")]
    ImplausiblePath {
        detail: String,
        path: crate::path::PropagationPath,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("config file error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
