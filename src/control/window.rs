//! # Production Windows
//!
//! ## Responsibility
//! Fold live production ticks into the same per-window [`MetricVector`]s
//! experiments produce, so the hypothesis generator sees what production
//! struggles with and the adoption gate can detect post-adoption regressions.
//!
//! ## Guarantees
//! - Same scoring as experiments: windows go through [`score_window`]
//! - Bounded memory: one window of tick records plus a fixed ring of
//!   recent window vectors
//!
//! ## NOT Responsible For
//! - Ground truth. Production has no scripted phases, so a tick counts as an
//!   incident when its raw normalized input (before any field smoothing)
//!   already crosses the hot threshold.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::agents::PlantState;
use crate::control::engine::TickOutcome;
use crate::field::{Normalization, SignalSample, ThresholdConfig};
use crate::self_tune::instance::{ThrashTracker, TickRecord};
use crate::self_tune::score::{
    recovery_delays, score_window, CompositeWeights, MetricVector, ProductionMetrics,
};
use crate::self_tune::workload::Phase;

/// One completed production window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionWindow {
    /// Sequence number since the loop started.
    pub index: u64,
    /// First tick in the window.
    pub start_tick: u64,
    /// Last tick in the window.
    pub end_tick: u64,
    /// Baseline version in force when the window closed.
    pub baseline_version: u64,
    /// Every tick of the window ran under `baseline_version`. `false` when a
    /// baseline switch landed inside the window.
    pub uniform_baseline: bool,
    /// Scored metrics.
    pub metrics: MetricVector,
    /// Composite of `metrics`.
    pub composite: f64,
}

/// Classify a production tick from its raw input.
///
/// Latency wins over errors when both are hot.
pub fn incident_proxy(samples: &[SignalSample], normalization: &Normalization, thresholds: &ThresholdConfig) -> Phase {
    let mut error: f64 = 0.0;
    let mut latency: f64 = 0.0;
    for s in samples {
        let n = normalization.normalize(s);
        error = error.max(n.error);
        latency = latency.max(n.latency);
    }
    if latency > thresholds.theta_l_hot {
        Phase::LatencySpike
    } else if error > thresholds.theta_e_hot {
        Phase::ErrorCascade
    } else {
        Phase::Steady
    }
}

/// Mean raw latency across samples, `0.0` with none.
pub fn mean_latency_ms(samples: &[SignalSample]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.raw_latency_ms.max(0.0)).sum::<f64>() / samples.len() as f64
}

/// Parameters of the accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSettings {
    /// Ticks per window.
    pub window_ticks: u64,
    /// Horizon for the thrashing flag.
    pub thrash_window_ticks: u64,
    /// Latency target for the response metric.
    pub response_target_ms: f64,
    /// Highest quality level.
    pub quality_ceiling: u32,
    /// Composite weights.
    pub weights: CompositeWeights,
    /// Completed windows kept for [`WindowAccumulator::recent`].
    pub recent_windows: usize,
}

/// Turns live ticks into [`ProductionWindow`]s.
#[derive(Debug, Clone)]
pub struct WindowAccumulator {
    settings: WindowSettings,
    records: Vec<TickRecord>,
    thrash: ThrashTracker,
    cumulative_actions: u64,
    next_index: u64,
    opened_under: u64,
    recent: VecDeque<MetricVector>,
}

impl WindowAccumulator {
    /// Empty accumulator.
    pub fn new(settings: WindowSettings) -> Self {
        Self {
            thrash: ThrashTracker::new(settings.thrash_window_ticks),
            records: Vec::with_capacity(settings.window_ticks as usize),
            cumulative_actions: 0,
            next_index: 0,
            opened_under: 0,
            recent: VecDeque::with_capacity(settings.recent_windows),
            settings,
        }
    }

    /// Add one tick. Returns the window it completed, if any.
    pub fn observe(
        &mut self,
        outcome: &TickOutcome,
        phase: Phase,
        plant: &PlantState,
        effective_latency_ms: f64,
        baseline_version: u64,
    ) -> Option<ProductionWindow> {
        if self.records.is_empty() {
            self.opened_under = baseline_version;
        }
        self.cumulative_actions += outcome.actions.len() as u64;
        let thrashing = self.thrash.observe(outcome.tick, &outcome.actions);
        self.records.push(TickRecord::from_outcome(
            outcome,
            phase,
            plant,
            self.cumulative_actions,
            effective_latency_ms,
            thrashing,
        ));
        if (self.records.len() as u64) < self.settings.window_ticks.max(1) {
            return None;
        }

        let delays = recovery_delays(&self.records);
        let metrics = score_window(
            &self.records,
            &delays,
            self.settings.quality_ceiling,
            self.settings.response_target_ms,
        );
        let window = ProductionWindow {
            index: self.next_index,
            start_tick: self.records.first().map_or(outcome.tick, |r| r.tick),
            end_tick: outcome.tick,
            baseline_version,
            // Versions only increase, so equal ends mean one version throughout.
            uniform_baseline: self.opened_under == baseline_version,
            metrics,
            composite: metrics.composite(&self.settings.weights),
        };
        self.next_index += 1;
        self.records.clear();
        if self.settings.recent_windows > 0 {
            if self.recent.len() == self.settings.recent_windows {
                self.recent.pop_front();
            }
            self.recent.push_back(metrics);
        }
        Some(window)
    }

    /// Aggregate of the most recent completed windows.
    pub fn recent(&self) -> ProductionMetrics {
        let windows: Vec<MetricVector> = self.recent.iter().copied().collect();
        ProductionMetrics::from_windows(&windows, &self.settings.weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{ComponentId, Evaluation, FieldState};

    fn settings(window_ticks: u64) -> WindowSettings {
        WindowSettings {
            window_ticks,
            thrash_window_ticks: 120,
            response_target_ms: 500.0,
            quality_ceiling: 10,
            weights: CompositeWeights::default(),
            recent_windows: 2,
        }
    }

    fn outcome(tick: u64, approved: bool) -> TickOutcome {
        TickOutcome {
            tick,
            field: FieldState::default(),
            evaluation: Evaluation {
                approved,
                ..Evaluation::default()
            },
            actions: Vec::new(),
        }
    }

    fn sample(errors: u64, latency: f64) -> SignalSample {
        SignalSample {
            component_id: ComponentId::new("svc-0"),
            timestamp: 0,
            raw_error_count: errors,
            raw_latency_ms: latency,
            raw_capacity_estimate: 500.0,
        }
    }

    #[test]
    fn test_incident_proxy_uses_raw_input() {
        let n = Normalization::default();
        let t = ThresholdConfig::default();
        assert_eq!(incident_proxy(&[sample(0, 200.0)], &n, &t), Phase::Steady);
        assert_eq!(incident_proxy(&[sample(0, 900.0)], &n, &t), Phase::LatencySpike);
        assert_eq!(incident_proxy(&[sample(40, 200.0)], &n, &t), Phase::ErrorCascade);
        assert_eq!(incident_proxy(&[], &n, &t), Phase::Steady);
    }

    #[test]
    fn test_window_closes_every_window_ticks() {
        let plant = PlantState {
            quality: 10,
            quarantined: None,
        };
        let mut acc = WindowAccumulator::new(settings(3));
        assert!(acc.observe(&outcome(0, false), Phase::Steady, &plant, 200.0, 1).is_none());
        assert!(acc.observe(&outcome(1, false), Phase::Steady, &plant, 200.0, 1).is_none());
        let w = acc.observe(&outcome(2, false), Phase::Steady, &plant, 200.0, 1).unwrap();
        assert_eq!((w.index, w.start_tick, w.end_tick), (0, 0, 2));
        assert!((w.metrics.efficiency - 1.0).abs() < 1e-12);
        assert!((w.metrics.response - 1.0).abs() < 1e-12);
        assert_eq!(acc.recent().windows, 1);
    }

    #[test]
    fn test_missed_incident_lowers_false_negative_metric() {
        let plant = PlantState {
            quality: 10,
            quarantined: None,
        };
        let mut acc = WindowAccumulator::new(settings(2));
        acc.observe(&outcome(0, false), Phase::LatencySpike, &plant, 900.0, 1);
        let w = acc.observe(&outcome(1, true), Phase::LatencySpike, &plant, 900.0, 1).unwrap();
        assert!((w.metrics.false_negative - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_switch_inside_window_marks_mixed_baseline() {
        let plant = PlantState {
            quality: 10,
            quarantined: None,
        };
        let mut acc = WindowAccumulator::new(settings(2));
        acc.observe(&outcome(0, false), Phase::Steady, &plant, 200.0, 1);
        let w = acc.observe(&outcome(1, false), Phase::Steady, &plant, 200.0, 2).unwrap();
        assert_eq!(w.baseline_version, 2);
        assert!(!w.uniform_baseline);

        acc.observe(&outcome(2, false), Phase::Steady, &plant, 200.0, 2);
        let w = acc.observe(&outcome(3, false), Phase::Steady, &plant, 200.0, 2).unwrap();
        assert!(w.uniform_baseline);
    }

    #[test]
    fn test_recent_keeps_bounded_history() {
        let plant = PlantState {
            quality: 5,
            quarantined: None,
        };
        let mut acc = WindowAccumulator::new(settings(1));
        for t in 0..5 {
            acc.observe(&outcome(t, false), Phase::Steady, &plant, 100.0, 1);
        }
        let recent = acc.recent();
        assert_eq!(recent.windows, 2);
        assert!((recent.metrics.efficiency - 0.5).abs() < 1e-12);
    }
}
