//! # Scoring
//!
//! ## Responsibility
//! Reduce per-tick instance traces (or live production ticks) to per-window
//! [`MetricVector`]s and fold those into one composite score.
//!
//! Every metric is normalized to `[0, 1]` with higher meaning better:
//!
//! | Metric | Value |
//! |---|---|
//! | efficiency | mean `quality / ceiling`, penalized while quarantined |
//! | response | mean `min(1, target_ms / effective_latency_ms)` |
//! | thrashing | `1 - thrashing ticks / window ticks` |
//! | false_positive | `1 - corrective actions on healthy ticks / healthy ticks` |
//! | false_negative | `1 - unapproved incident ticks / incident ticks` |
//! | recovery | `1 - mean ticks from incident onset to first approval / window` |
//!
//! ## NOT Responsible For
//! - Significance testing (see [`super::analyst`])

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::instance::{tick_efficiency, InstanceTrace, TickRecord};

/// Composite weights must sum to one within this tolerance.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ─── MetricVector ────────────────────────────────────────────────────────────

/// Names of the six scored metrics, in [`MetricVector::values`] order.
pub const METRIC_NAMES: [&str; 6] = [
    "efficiency",
    "response",
    "thrashing",
    "false_positive",
    "false_negative",
    "recovery",
];

/// Six normalized, higher-is-better metrics for one window.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricVector {
    /// Service quality delivered.
    pub efficiency: f64,
    /// Latency relative to target.
    pub response: f64,
    /// Absence of capacity oscillation.
    pub thrashing: f64,
    /// Absence of corrective actions on healthy ticks.
    pub false_positive: f64,
    /// Share of incident ticks the quorum approved.
    pub false_negative: f64,
    /// Speed of the first approval after an incident starts.
    pub recovery: f64,
}

impl MetricVector {
    /// Values in [`METRIC_NAMES`] order.
    pub fn values(&self) -> [f64; 6] {
        [
            self.efficiency,
            self.response,
            self.thrashing,
            self.false_positive,
            self.false_negative,
            self.recovery,
        ]
    }

    /// Inverse of [`MetricVector::values`].
    pub fn from_values(v: [f64; 6]) -> Self {
        Self {
            efficiency: v[0],
            response: v[1],
            thrashing: v[2],
            false_positive: v[3],
            false_negative: v[4],
            recovery: v[5],
        }
    }

    /// Weighted sum.
    pub fn composite(&self, weights: &CompositeWeights) -> f64 {
        self.values()
            .iter()
            .zip(weights.values())
            .map(|(v, w)| v * w)
            .sum()
    }
}

// ─── CompositeWeights ────────────────────────────────────────────────────────

/// Invalid composite weights.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("composite weights must be non-negative and sum to 1.0, got sum {0}")]
pub struct WeightsError(pub f64);

/// Weight of each metric in the composite score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct CompositeWeights {
    /// Weight of `efficiency`.
    pub efficiency: f64,
    /// Weight of `response`.
    pub response: f64,
    /// Weight of `thrashing`.
    pub thrashing: f64,
    /// Weight of `false_positive`.
    pub false_positive: f64,
    /// Weight of `false_negative`.
    pub false_negative: f64,
    /// Weight of `recovery`.
    pub recovery: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            efficiency: 0.25,
            response: 0.20,
            thrashing: 0.20,
            false_positive: 0.15,
            false_negative: 0.15,
            recovery: 0.05,
        }
    }
}

impl CompositeWeights {
    /// Weights in [`METRIC_NAMES`] order.
    pub fn values(&self) -> [f64; 6] {
        [
            self.efficiency,
            self.response,
            self.thrashing,
            self.false_positive,
            self.false_negative,
            self.recovery,
        ]
    }

    /// # Errors
    /// [`WeightsError`] when a weight is negative or non-finite, or the sum is not one.
    pub fn validate(&self) -> Result<(), WeightsError> {
        let values = self.values();
        let sum: f64 = values.iter().sum();
        if values.iter().any(|w| !w.is_finite() || *w < 0.0) || (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(WeightsError(sum));
        }
        Ok(())
    }
}

// ─── Windowing ───────────────────────────────────────────────────────────────

/// Parameters for cutting traces into windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpec {
    /// Ticks excluded from the start of every trace.
    pub warmup_ticks: u64,
    /// Ticks per window. Trailing partial windows are dropped.
    pub window_ticks: u64,
    /// Latency target in ms for the response metric.
    pub response_target_ms: f64,
}

/// Onset-to-first-approval delay for every incident that starts in
/// `records`, keyed by the onset tick's index. Incidents never approved
/// before they end count the full incident length.
pub fn recovery_delays(records: &[TickRecord]) -> Vec<Option<u64>> {
    let mut delays = vec![None; records.len()];
    let mut i = 0;
    while i < records.len() {
        let onset = records[i].phase.is_incident() && (i == 0 || records[i - 1].phase != records[i].phase);
        if onset {
            let mut j = i;
            let mut delay = None;
            while j < records.len() && records[j].phase == records[i].phase {
                if records[j].approved {
                    delay = Some((j - i) as u64);
                    break;
                }
                j += 1;
            }
            delays[i] = Some(delay.unwrap_or((j - i) as u64));
        }
        i += 1;
    }
    delays
}

/// Score one window of consecutive tick records.
pub fn score_window(
    records: &[TickRecord],
    delays: &[Option<u64>],
    quality_ceiling: u32,
    response_target_ms: f64,
) -> MetricVector {
    let n = records.len().max(1) as f64;

    let efficiency = records
        .iter()
        .map(|r| tick_efficiency(r, quality_ceiling))
        .sum::<f64>()
        / n;

    let response = records
        .iter()
        .map(|r| {
            if r.effective_latency_ms <= 0.0 {
                1.0
            } else {
                (response_target_ms / r.effective_latency_ms).min(1.0)
            }
        })
        .sum::<f64>()
        / n;

    let thrash_ticks = records.iter().filter(|r| r.thrashing).count() as f64;

    let healthy: Vec<&TickRecord> = records.iter().filter(|r| !r.phase.is_incident()).collect();
    let fp_rate = if healthy.is_empty() {
        0.0
    } else {
        let corrective: u32 = healthy.iter().map(|r| r.corrective_actions).sum();
        (f64::from(corrective) / healthy.len() as f64).min(1.0)
    };

    let incident: Vec<&TickRecord> = records.iter().filter(|r| r.phase.is_incident()).collect();
    let fn_rate = if incident.is_empty() {
        0.0
    } else {
        incident.iter().filter(|r| !r.approved).count() as f64 / incident.len() as f64
    };

    let onsets: Vec<u64> = delays.iter().flatten().copied().collect();
    let recovery = if onsets.is_empty() {
        1.0
    } else {
        let mean = onsets.iter().sum::<u64>() as f64 / onsets.len() as f64;
        (1.0 - mean / n).clamp(0.0, 1.0)
    };

    MetricVector {
        efficiency,
        response,
        thrashing: 1.0 - thrash_ticks / n,
        false_positive: 1.0 - fp_rate,
        false_negative: 1.0 - fn_rate,
        recovery,
    }
}

/// Cut a trace into post-warmup windows and score each one.
pub fn windows_from_trace(trace: &InstanceTrace, spec: &WindowSpec) -> Vec<MetricVector> {
    let window = spec.window_ticks.max(1) as usize;
    let warmup = (spec.warmup_ticks as usize).min(trace.records.len());
    let delays = recovery_delays(&trace.records);
    let records = &trace.records[warmup..];
    let delays = &delays[warmup..];
    records
        .chunks_exact(window)
        .zip(delays.chunks_exact(window))
        .map(|(r, d)| score_window(r, d, trace.quality_ceiling, spec.response_target_ms))
        .collect()
}

/// Warmup ticks for a run: `ceil(duration * fraction)`.
pub fn warmup_ticks(duration_ticks: u64, warmup_fraction: f64) -> u64 {
    let fraction = warmup_fraction.clamp(0.0, 1.0);
    ((duration_ticks as f64) * fraction).ceil() as u64
}

// ─── ProductionMetrics ───────────────────────────────────────────────────────

/// Recent behaviour of the live controller, as consumed by the hypothesis
/// generator and the rollback rule.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductionMetrics {
    /// Mean metric vector over the recent windows.
    pub metrics: MetricVector,
    /// Composite of `metrics`.
    pub composite: f64,
    /// Number of windows aggregated.
    pub windows: usize,
}

impl ProductionMetrics {
    /// Aggregate window vectors.
    pub fn from_windows(windows: &[MetricVector], weights: &CompositeWeights) -> Self {
        if windows.is_empty() {
            return Self::default();
        }
        let mut sums = [0.0; 6];
        for w in windows {
            for (s, v) in sums.iter_mut().zip(w.values()) {
                *s += v;
            }
        }
        let n = windows.len() as f64;
        let metrics = MetricVector::from_values(sums.map(|s| s / n));
        Self {
            metrics,
            composite: metrics.composite(weights),
            windows: windows.len(),
        }
    }

    /// Corrective actions per healthy tick.
    pub fn false_positive_rate(&self) -> f64 {
        1.0 - self.metrics.false_positive
    }

    /// Unapproved share of incident ticks.
    pub fn false_negative_rate(&self) -> f64 {
        1.0 - self.metrics.false_negative
    }

    /// Share of ticks spent thrashing.
    pub fn thrash_rate(&self) -> f64 {
        1.0 - self.metrics.thrashing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Crossings, FieldState};
    use crate::self_tune::instance::Arm;
    use crate::self_tune::workload::Phase;

    fn record(tick: u64, phase: Phase, approved: bool, corrective: u32) -> TickRecord {
        TickRecord {
            tick,
            phase,
            field: FieldState::default(),
            crossings: Crossings::default(),
            quorum: 0.0,
            approved,
            acting: Vec::new(),
            corrective_actions: corrective,
            cumulative_actions: 0,
            quality: 10,
            quarantined: false,
            effective_latency_ms: 250.0,
            thrashing: false,
        }
    }

    #[test]
    fn test_default_weights_are_valid() {
        assert!(CompositeWeights::default().validate().is_ok());
        let bad = CompositeWeights {
            recovery: 0.5,
            ..CompositeWeights::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_perfect_window_scores_one() {
        let records: Vec<_> = (0..60).map(|t| record(t, Phase::Steady, false, 0)).collect();
        let delays = recovery_delays(&records);
        let m = score_window(&records, &delays, 10, 500.0);
        assert!((m.composite(&CompositeWeights::default()) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_false_positive_counts_healthy_corrections() {
        let mut records: Vec<_> = (0..10).map(|t| record(t, Phase::Steady, false, 0)).collect();
        records[3].corrective_actions = 1;
        let delays = recovery_delays(&records);
        let m = score_window(&records, &delays, 10, 500.0);
        assert!((m.false_positive - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_false_negative_and_recovery() {
        let mut records: Vec<_> = (0..10).map(|t| record(t, Phase::Steady, false, 0)).collect();
        for r in records.iter_mut().skip(5) {
            r.phase = Phase::LatencySpike;
        }
        records[7].approved = true;
        records[8].approved = true;
        records[9].approved = true;
        let delays = recovery_delays(&records);
        assert_eq!(delays[5], Some(2));
        let m = score_window(&records, &delays, 10, 500.0);
        assert!((m.false_negative - 0.6).abs() < 1e-12);
        assert!((m.recovery - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_windows_exclude_warmup_and_partial_tail() {
        let trace = InstanceTrace {
            arm: Arm::Control,
            replica: 0,
            quality_ceiling: 10,
            records: (0..3_600).map(|t| record(t, Phase::Steady, false, 0)).collect(),
        };
        let spec = WindowSpec {
            warmup_ticks: warmup_ticks(3_600, 0.05),
            window_ticks: 60,
            response_target_ms: 500.0,
        };
        assert_eq!(spec.warmup_ticks, 180);
        assert_eq!(windows_from_trace(&trace, &spec).len(), 57);
    }

    #[test]
    fn test_production_metrics_rates() {
        let w = MetricVector {
            false_positive: 0.8,
            false_negative: 0.7,
            thrashing: 0.9,
            ..MetricVector::default()
        };
        let p = ProductionMetrics::from_windows(&[w, w], &CompositeWeights::default());
        assert_eq!(p.windows, 2);
        assert!((p.false_positive_rate() - 0.2).abs() < 1e-12);
        assert!((p.false_negative_rate() - 0.3).abs() < 1e-12);
        assert!((p.thrash_rate() - 0.1).abs() < 1e-12);
    }
}
