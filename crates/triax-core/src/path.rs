//! Causal propagation path reconstruction from pairwise lag results.
//!
//! Pairwise optima are chained along the configured causal order
//! (conventionally network -> host -> power). A hop is accepted only when its
//! lag points in the causal direction and its correlation is significant; a
//! layer absent from every accepted hop is omitted, yielding a shorter path
//! that states the attack did not originate there.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PathConfig;
use crate::error::{EngineError, Result};
use crate::lagcorr::LagCorrelationResult;
use crate::stream::Layer;

/// One step of the path: the layer and how far behind the path origin its
/// response sits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathHop {
    pub layer: Layer,
    /// Seconds behind the first layer of the path. Zero for the origin.
    pub cumulative_lag_secs: f64,
}

/// An ordered causal chain across layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationPath {
    pub hops: Vec<PathHop>,
    /// Weighted blend of per-hop `|r|` and the session's match quality.
    pub path_confidence: f64,
}

impl PropagationPath {
    pub fn origin(&self) -> Option<&Layer> {
        self.hops.first().map(|h| &h.layer)
    }

    /// Reject a path whose cumulative lag ever decreases: effects cannot
    /// precede their causes along the declared order.
    pub fn validate(&self) -> Result<()> {
        for pair in self.hops.windows(2) {
            if pair[1].cumulative_lag_secs < pair[0].cumulative_lag_secs {
                return Err(EngineError::ImplausiblePath {
                    detail: format!(
                        "cumulative lag drops from {:.3}s at '{}' to {:.3}s at '{}'",
                        pair[0].cumulative_lag_secs,
                        pair[0].layer,
                        pair[1].cumulative_lag_secs,
                        pair[1].layer
                    ),
                    path: self.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PropagationPathReconstructor {
    config: PathConfig,
    /// Two-sided significance level for accepting a hop.
    alpha: f64,
}

impl PropagationPathReconstructor {
    pub fn new(config: PathConfig, alpha: f64) -> Self {
        Self { config, alpha }
    }

    /// Chain pairwise results into the longest causal path.
    ///
    /// `match_quality` is the session's mean anchor-match quality, blended
    /// with each hop's `|r|` into the path confidence. Returns `None` when no
    /// consecutive causal pair yields an accepted hop.
    pub fn reconstruct(
        &self,
        results: &[LagCorrelationResult],
        match_quality: f64,
    ) -> Option<PropagationPath> {
        let order = &self.config.causal_order;
        let w = self.config.correlation_weight;

        // Segments of consecutive accepted hops along the causal order; the
        // longest one (earliest on ties) becomes the path.
        let mut best: Option<PropagationPath> = None;
        let mut current: Option<(Vec<PathHop>, Vec<f64>)> = None;

        for pair in order.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let hop = self.causal_hop(results, from, to);

            match hop {
                Some((delay_secs, r_abs)) => {
                    let confidence = w * r_abs + (1.0 - w) * match_quality;
                    let (hops, confidences) = current.get_or_insert_with(|| {
                        (
                            vec![PathHop {
                                layer: from.clone(),
                                cumulative_lag_secs: 0.0,
                            }],
                            Vec::new(),
                        )
                    });
                    let cumulative =
                        hops.last().map(|h| h.cumulative_lag_secs).unwrap_or(0.0) + delay_secs;
                    hops.push(PathHop {
                        layer: to.clone(),
                        cumulative_lag_secs: cumulative,
                    });
                    confidences.push(confidence);
                }
                None => {
                    Self::commit(&mut best, current.take());
                }
            }
        }
        Self::commit(&mut best, current.take());

        if let Some(path) = &best {
            debug!(
                hops = path.hops.len(),
                confidence = path.path_confidence,
                "propagation path reconstructed"
            );
        }
        best
    }

    /// Delay (seconds, non-negative) and `|r|` for the causal hop from -> to,
    /// if a significant result in the causal direction exists. A result's
    /// negative lag means its first layer leads, so the `(from, to)`
    /// orientation needs `lag <= 0` and the reversed one `lag >= 0`.
    fn causal_hop(
        &self,
        results: &[LagCorrelationResult],
        from: &Layer,
        to: &Layer,
    ) -> Option<(f64, f64)> {
        for result in results {
            let (a, b) = &result.layer_pair;
            let delay_secs = if a == from && b == to && result.lag <= 0 {
                -result.lag_secs
            } else if a == to && b == from && result.lag >= 0 {
                result.lag_secs
            } else {
                continue;
            };
            if result.p_value < self.alpha {
                return Some((delay_secs, result.correlation_r.abs()));
            }
        }
        None
    }

    fn commit(best: &mut Option<PropagationPath>, segment: Option<(Vec<PathHop>, Vec<f64>)>) {
        let Some((hops, confidences)) = segment else {
            return;
        };
        if hops.len() < 2 {
            return;
        }
        let replaces = best
            .as_ref()
            .map(|b| hops.len() > b.hops.len())
            .unwrap_or(true);
        if replaces {
            let path_confidence =
                confidences.iter().sum::<f64>() / confidences.len() as f64;
            *best = Some(PropagationPath {
                hops,
                path_confidence,
            });
        }
    }
}
