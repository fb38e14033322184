//! # triax-core
//!
//! Cross-layer telemetry alignment and correlation engine for attack
//! forensics.
//!
//! The engine takes independently-clocked telemetry streams (conventionally
//! network, host, and power) captured around an attack on a physical device
//! and reconstructs their temporal relationships: per-layer clock offsets
//! from matched anchor events, one aligned time grid, time-lagged
//! cross-correlations, a causal propagation path, and per-category attack
//! signatures. Streams with structurally incompatible time bases are detected
//! and rejected; the engine never fabricates an alignment or a correlation it
//! cannot defend statistically.
//!
//! Ingestion of telemetry file formats, classifiers over the aligned output,
//! and persistence are external collaborators; this crate is in-memory only.

pub mod align;
pub mod anchor;
pub mod config;
pub mod error;
pub mod lagcorr;
pub mod matching;
pub mod offset;
pub mod path;
pub mod pipeline;
pub mod signature;
pub mod stats;
pub mod stream;

pub use align::{AlignedSample, AlignedTimeline, AlignmentReport, TimelineAligner};
pub use anchor::{Anchor, AnchorExtractor, AnchorType};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use lagcorr::{LagCorrelationAnalyzer, LagCorrelationResult, LagSweep, PairSpec};
pub use matching::{AnchorMatch, AnchorMatcher};
pub use offset::{AlignmentOffset, OffsetEstimator};
pub use path::{PropagationPath, PropagationPathReconstructor};
pub use pipeline::{AnalysisPipeline, SessionAnalysis};
pub use signature::{AttackSignature, SignatureExtractor, SignatureSet};
pub use stream::{FeatureRegistry, Layer, LayerStream, RawEvent, TimeBase, TimeRange};
