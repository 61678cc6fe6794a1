//! # Hypothesis Generator
//!
//! ## Responsibility
//! Propose candidate parameter changes worth testing, ranked by how well
//! they address what production is currently struggling with.
//!
//! ## Guarantees
//! - Valid: every proposed candidate applies cleanly to the baseline; out
//!   of range combinations are dropped here and never reach an experiment
//! - Deterministic ranking: same metrics and baseline give the same order
//!
//! ## NOT Responsible For
//! - Deciding anything; proposals are advisory and only experiments grade them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::score::ProductionMetrics;
use crate::field::{Parameter, ParameterDelta, ThresholdConfig};

/// Relative step sizes explored around the baseline.
pub const RELATIVE_STEPS: [f64; 4] = [-0.2, -0.1, 0.1, 0.2];

/// Penalty per unit of total relative change.
const MAGNITUDE_PENALTY: f64 = 0.1;

/// A parameter change to be graded by an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentCandidate {
    /// Unique id.
    pub candidate_id: Uuid,
    /// Relative changes to apply to the baseline.
    pub parameter_deltas: Vec<ParameterDelta>,
    /// When the candidate was proposed.
    pub generated_at: DateTime<Utc>,
    /// Heuristic score at proposal time. Advisory only.
    pub projected_score: f64,
}

impl ExperimentCandidate {
    /// Candidate built by hand rather than by [`propose`].
    pub fn manual(parameter_deltas: Vec<ParameterDelta>) -> Self {
        Self {
            candidate_id: Uuid::new_v4(),
            parameter_deltas,
            generated_at: Utc::now(),
            projected_score: 0.0,
        }
    }

    /// Largest absolute relative change across all deltas.
    pub fn max_magnitude(&self) -> f64 {
        self.parameter_deltas
            .iter()
            .map(|d| d.relative.abs())
            .fold(0.0, f64::max)
    }
}

/// Direction production pressure pushes a parameter: positive means
/// "increase would help". Neutral until at least one window was observed.
fn desire(parameter: Parameter, metrics: &ProductionMetrics) -> f64 {
    if metrics.windows == 0 {
        return 0.0;
    }
    let fp = metrics.false_positive_rate();
    let fn_ = metrics.false_negative_rate();
    let thrash = metrics.thrash_rate();
    match parameter {
        // Higher thresholds and quorum: fewer false alarms, more misses.
        Parameter::ThetaErrorHot
        | Parameter::ThetaLatencyHot
        | Parameter::ThetaSpareHigh
        | Parameter::QuorumThreshold => fp - fn_,
        // Slower injection damps oscillation.
        Parameter::InjectError | Parameter::InjectLatency | Parameter::InjectSpare => -thrash,
        // Faster decay damps oscillation.
        Parameter::DecayError | Parameter::DecayLatency | Parameter::DecaySpare => thrash,
    }
}

/// Heuristic score of a delta set against current production behaviour.
pub fn heuristic_score(deltas: &[ParameterDelta], metrics: &ProductionMetrics) -> f64 {
    let alignment: f64 = deltas
        .iter()
        .map(|d| desire(d.parameter, metrics) * d.relative)
        .sum();
    let magnitude: f64 = deltas.iter().map(|d| d.relative.abs()).sum();
    alignment - MAGNITUDE_PENALTY * magnitude
}

/// Every single and pairwise perturbation of the tunable parameters.
pub fn neighborhood() -> Vec<Vec<ParameterDelta>> {
    let params = Parameter::all();
    let mut sets = Vec::new();
    for &p in params {
        for &r in &RELATIVE_STEPS {
            sets.push(vec![ParameterDelta::new(p, r)]);
        }
    }
    for (i, &p) in params.iter().enumerate() {
        for &q in &params[i + 1..] {
            for &rp in &RELATIVE_STEPS {
                for &rq in &RELATIVE_STEPS {
                    sets.push(vec![ParameterDelta::new(p, rp), ParameterDelta::new(q, rq)]);
                }
            }
        }
    }
    sets
}

/// Propose up to `count` candidates, best heuristic score first.
///
/// # Panics
/// This function never panics.
pub fn propose(
    recent: &ProductionMetrics,
    baseline: &ThresholdConfig,
    count: usize,
) -> Vec<ExperimentCandidate> {
    let mut scored: Vec<(f64, Vec<ParameterDelta>)> = neighborhood()
        .into_iter()
        .filter(|deltas| match baseline.with_deltas(deltas) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "candidate outside valid range, dropped");
                false
            }
        })
        .map(|deltas| (heuristic_score(&deltas, recent), deltas))
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0));

    let now = Utc::now();
    scored
        .into_iter()
        .take(count)
        .map(|(projected_score, parameter_deltas)| ExperimentCandidate {
            candidate_id: Uuid::new_v4(),
            parameter_deltas,
            generated_at: now,
            projected_score,
        })
        .collect()
}
