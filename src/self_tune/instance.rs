//! # Simulated Instance
//!
//! ## Responsibility
//! One isolated copy of the controller driven by replayed telemetry, with a
//! simple plant model so agent actions feed back into the signals:
//! lowering quality cuts latency and frees capacity, quarantining a
//! component suppresses its errors.
//!
//! ## Guarantees
//! - Isolated: owns its field, agent and plant state; configs are value copies
//! - Cancellable: the cancel signal is checked between ticks
//! - Faults surface: a non-finite field aborts the run with a state dump
//!
//! ## NOT Responsible For
//! - Scoring (see [`super::score`])
//! - Scheduling instances (see [`super::experiment`])

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use super::workload::{Phase, Workload};
use crate::agents::{AgentAction, AgentConfig, AgentKind, PlantState};
use crate::control::engine::{ControlEngine, TickOutcome};
use crate::field::{Crossings, FieldState, Normalization, SignalProcessor, SignalSample, ThresholdConfig, Topology};

/// Latency reduction per quality step below the ceiling.
const LATENCY_RELIEF_PER_STEP: f64 = 0.06;
/// Capacity gain per quality step below the ceiling.
const CAPACITY_GAIN_PER_STEP: f64 = 0.05;
/// Fraction of errors a quarantined component still reports.
const QUARANTINE_ERROR_FACTOR: f64 = 0.3;
/// Efficiency multiplier while a component is quarantined.
const QUARANTINE_EFFICIENCY: f64 = 0.9;

// ─── Identity ────────────────────────────────────────────────────────────────

/// Which side of an experiment an instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arm {
    /// Runs the current baseline.
    Control,
    /// Runs baseline plus the candidate delta.
    Candidate,
}

impl fmt::Display for Arm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arm::Control => f.write_str("control"),
            Arm::Candidate => f.write_str("candidate"),
        }
    }
}

/// Everything needed to build one instance. Cloned per instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Arm membership.
    pub arm: Arm,
    /// Replica index; also the workload stream.
    pub replica: u32,
    /// Thresholds for this arm.
    pub thresholds: ThresholdConfig,
    /// Agent tunables.
    pub agents: AgentConfig,
    /// Signal normalization.
    pub normalization: Normalization,
    /// Component graph.
    pub topology: Topology,
    /// Window in which more than one capacity direction flip counts as thrashing.
    pub thrash_window_ticks: u64,
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why an instance stopped early.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InstanceError {
    /// The instance reached an invalid state.
    #[error("{arm} replica {replica} faulted at tick {tick}: {reason}")]
    Fault {
        /// Arm of the faulted instance.
        arm: Arm,
        /// Replica index.
        replica: u32,
        /// Tick at which the fault was detected.
        tick: u64,
        /// What went wrong.
        reason: String,
        /// Debug dump of the instance state.
        dump: String,
    },

    /// The cancel signal fired.
    #[error("{arm} replica {replica} cancelled at tick {tick}")]
    Cancelled {
        /// Arm of the cancelled instance.
        arm: Arm,
        /// Replica index.
        replica: u32,
        /// Tick at which cancellation was observed.
        tick: u64,
    },
}

// ─── Trace ───────────────────────────────────────────────────────────────────

/// What an instance recorded on one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickRecord {
    /// Tick index.
    pub tick: u64,
    /// Ground-truth workload phase.
    pub phase: Phase,
    /// Aggregate field.
    pub field: FieldState,
    /// Crossing flags.
    pub crossings: Crossings,
    /// Quorum value.
    pub quorum: f64,
    /// Quorum approved.
    pub approved: bool,
    /// Agents that acted.
    pub acting: Vec<AgentKind>,
    /// Reduction or quarantine actions this tick.
    pub corrective_actions: u32,
    /// Actions since the start of the run.
    pub cumulative_actions: u64,
    /// Quality level after this tick's actions.
    pub quality: u32,
    /// Whether a component is quarantined after this tick's actions.
    pub quarantined: bool,
    /// Mean latency the service delivered this tick, after plant effects.
    pub effective_latency_ms: f64,
    /// Capacity direction flipped more than once within the thrash window.
    pub thrashing: bool,
}

/// Full per-tick history of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTrace {
    /// Arm membership.
    pub arm: Arm,
    /// Replica index.
    pub replica: u32,
    /// Highest quality level, for efficiency normalization.
    pub quality_ceiling: u32,
    /// One record per tick, in order.
    pub records: Vec<TickRecord>,
}

impl TickRecord {
    /// Build a record from one engine step.
    pub fn from_outcome(
        outcome: &TickOutcome,
        phase: Phase,
        plant: &PlantState,
        cumulative_actions: u64,
        effective_latency_ms: f64,
        thrashing: bool,
    ) -> Self {
        Self {
            tick: outcome.tick,
            phase,
            field: outcome.field,
            crossings: outcome.evaluation.crossings,
            quorum: outcome.evaluation.quorum,
            approved: outcome.evaluation.approved,
            acting: outcome.actions.iter().map(|a| a.kind.agent()).collect(),
            corrective_actions: outcome.actions.iter().filter(|a| a.kind.is_corrective()).count() as u32,
            cumulative_actions,
            quality: plant.quality,
            quarantined: plant.quarantined.is_some(),
            effective_latency_ms,
            thrashing,
        }
    }
}

/// Flags capacity oscillation: more than one direction flip among the
/// capacity moves of the last `window` ticks.
#[derive(Debug, Clone)]
pub struct ThrashTracker {
    window: u64,
    moves: VecDeque<(u64, i8)>,
}

impl ThrashTracker {
    /// Tracker over a `window`-tick horizon.
    pub fn new(window: u64) -> Self {
        Self {
            window,
            moves: VecDeque::new(),
        }
    }

    /// Record this tick's actions and report whether the controller is thrashing.
    pub fn observe(&mut self, tick: u64, actions: &[AgentAction]) -> bool {
        for action in actions {
            let dir = action.kind.capacity_direction();
            if dir != 0 {
                self.moves.push_back((tick, dir));
            }
        }
        while let Some(&(t, _)) = self.moves.front() {
            if t + self.window <= tick {
                self.moves.pop_front();
            } else {
                break;
            }
        }
        let flips = self
            .moves
            .iter()
            .zip(self.moves.iter().skip(1))
            .filter(|((_, a), (_, b))| a != b)
            .count();
        flips > 1
    }
}

// ─── SimulatedInstance ───────────────────────────────────────────────────────

/// One isolated controller plus plant, run tick by tick against a workload.
pub struct SimulatedInstance {
    spec: InstanceSpec,
    engine: ControlEngine,
    workload: Arc<dyn Workload>,
    thrash: ThrashTracker,
    cumulative_actions: u64,
}

impl fmt::Debug for SimulatedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedInstance")
            .field("arm", &self.spec.arm)
            .field("replica", &self.spec.replica)
            .field("cumulative_actions", &self.cumulative_actions)
            .finish()
    }
}

impl SimulatedInstance {
    /// Build an instance with fresh state.
    pub fn new(spec: InstanceSpec, workload: Arc<dyn Workload>) -> Self {
        let processor = SignalProcessor::new(spec.topology.clone(), spec.normalization.clone());
        let engine = ControlEngine::new(processor, spec.thresholds.clone(), spec.agents.clone());
        Self {
            thrash: ThrashTracker::new(spec.thrash_window_ticks),
            spec,
            engine,
            workload,
            cumulative_actions: 0,
        }
    }

    /// Run for `duration_ticks`, checking `cancel` before every tick.
    ///
    /// # Errors
    /// [`InstanceError::Cancelled`] when cancelled, [`InstanceError::Fault`]
    /// when the field becomes non-finite.
    pub fn run(
        mut self,
        duration_ticks: u64,
        cancel: &watch::Receiver<bool>,
    ) -> Result<InstanceTrace, InstanceError> {
        let mut records = Vec::with_capacity(duration_ticks.min(1 << 16) as usize);
        for tick in 0..duration_ticks {
            if *cancel.borrow() {
                return Err(InstanceError::Cancelled {
                    arm: self.spec.arm,
                    replica: self.spec.replica,
                    tick,
                });
            }
            records.push(self.step(tick)?);
        }
        Ok(InstanceTrace {
            arm: self.spec.arm,
            replica: self.spec.replica,
            quality_ceiling: self.spec.agents.quality_ceiling,
            records,
        })
    }

    /// Advance one tick.
    ///
    /// # Errors
    /// [`InstanceError::Fault`] when the resulting field is not finite.
    pub fn step(&mut self, tick: u64) -> Result<TickRecord, InstanceError> {
        let raw = self.workload.generate(u64::from(self.spec.replica), tick);
        let (samples, effective_latency_ms) = self.apply_plant(raw);

        let outcome = self.engine.step(tick, &samples);
        if !outcome.field.is_finite() {
            return Err(self.fault(tick, "non-finite field value"));
        }

        self.cumulative_actions += outcome.actions.len() as u64;
        let thrashing = self.thrash.observe(tick, &outcome.actions);
        Ok(TickRecord::from_outcome(
            &outcome,
            self.workload.phase_at(tick),
            self.engine.agents().plant(),
            self.cumulative_actions,
            effective_latency_ms,
            thrashing,
        ))
    }

    /// Apply the current plant state to raw samples. Returns the adjusted
    /// samples and their mean effective latency.
    fn apply_plant(&self, raw: Vec<SignalSample>) -> (Vec<SignalSample>, f64) {
        let plant = self.engine.agents().plant();
        let headroom = f64::from(self.spec.agents.quality_ceiling.saturating_sub(plant.quality));
        let latency_factor = (1.0 - LATENCY_RELIEF_PER_STEP * headroom).max(0.0);
        let capacity_factor = 1.0 + CAPACITY_GAIN_PER_STEP * headroom;

        let mut total_latency = 0.0;
        let samples: Vec<SignalSample> = raw
            .into_iter()
            .map(|mut s| {
                s.raw_latency_ms *= latency_factor;
                s.raw_capacity_estimate *= capacity_factor;
                if plant.quarantined.as_ref() == Some(&s.component_id) {
                    s.raw_error_count = (s.raw_error_count as f64 * QUARANTINE_ERROR_FACTOR).round() as u64;
                }
                total_latency += s.raw_latency_ms;
                s
            })
            .collect();
        let mean = if samples.is_empty() {
            0.0
        } else {
            total_latency / samples.len() as f64
        };
        (samples, mean)
    }

    fn fault(&self, tick: u64, reason: &str) -> InstanceError {
        let dump = format!(
            "thresholds={:?} fields={:?} agents={:?}",
            self.engine.thresholds(),
            self.engine.processor().component_fields(),
            self.engine.agents().snapshot()
        );
        InstanceError::Fault {
            arm: self.spec.arm,
            replica: self.spec.replica,
            tick,
            reason: reason.to_owned(),
            dump,
        }
    }
}

/// Efficiency of one tick in `[0, 1]`.
pub fn tick_efficiency(record: &TickRecord, quality_ceiling: u32) -> f64 {
    if quality_ceiling == 0 {
        return 0.0;
    }
    let base = f64::from(record.quality) / f64::from(quality_ceiling);
    if record.quarantined {
        base * QUARANTINE_EFFICIENCY
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::SignalTriple;
    use crate::self_tune::workload::{WorkloadConfig, WorkloadReplayer};

    fn spec(arm: Arm, replica: u32) -> InstanceSpec {
        let workload = WorkloadReplayer::new(WorkloadConfig::default());
        let topology = Topology::new(workload.components().to_vec(), &[], SignalTriple::splat(0.0)).unwrap();
        InstanceSpec {
            arm,
            replica,
            thresholds: ThresholdConfig::default(),
            agents: AgentConfig::default(),
            normalization: Normalization::default(),
            topology,
            thrash_window_ticks: 120,
        }
    }

    fn workload() -> Arc<dyn Workload> {
        Arc::new(WorkloadReplayer::new(WorkloadConfig::default()))
    }

    #[test]
    fn test_run_records_every_tick() {
        let (_tx, rx) = watch::channel(false);
        let trace = SimulatedInstance::new(spec(Arm::Control, 0), workload())
            .run(500, &rx)
            .unwrap();
        assert_eq!(trace.records.len(), 500);
        assert_eq!(trace.records[499].tick, 499);
        assert_eq!(trace.quality_ceiling, 10);
    }

    #[test]
    fn test_identical_specs_produce_identical_traces() {
        let (_tx, rx) = watch::channel(false);
        let a = SimulatedInstance::new(spec(Arm::Control, 2), workload()).run(1_000, &rx).unwrap();
        let b = SimulatedInstance::new(spec(Arm::Candidate, 2), workload()).run(1_000, &rx).unwrap();
        assert_eq!(a.records, b.records);
    }

    #[test]
    fn test_latency_spike_lowers_quality() {
        let (_tx, rx) = watch::channel(false);
        let trace = SimulatedInstance::new(spec(Arm::Control, 0), workload()).run(900, &rx).unwrap();
        let min_quality = trace.records.iter().map(|r| r.quality).min().unwrap();
        assert!(min_quality < 10, "no reduction during the latency spike");
    }

    #[test]
    fn test_cancel_stops_before_first_tick() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = SimulatedInstance::new(spec(Arm::Candidate, 1), workload())
            .run(100, &rx)
            .unwrap_err();
        assert_eq!(
            err,
            InstanceError::Cancelled {
                arm: Arm::Candidate,
                replica: 1,
                tick: 0
            }
        );
    }

    #[test]
    fn test_non_finite_field_is_a_fault() {
        let mut s = spec(Arm::Control, 0);
        s.thresholds.injection_gains = SignalTriple::new(f64::INFINITY, 0.2, 0.2);
        let (_tx, rx) = watch::channel(false);
        let err = SimulatedInstance::new(s, workload()).run(10, &rx).unwrap_err();
        match err {
            InstanceError::Fault { tick, dump, .. } => {
                assert_eq!(tick, 0);
                assert!(dump.contains("fields="));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_thrash_tracker_needs_two_flips_in_window() {
        use crate::agents::ActionKind;
        use crate::field::ComponentId;
        let act = |kind, tick| AgentAction {
            component_id: ComponentId::new("svc-0"),
            kind,
            magnitude: 1.0,
            tick,
        };
        let mut t = ThrashTracker::new(100);
        assert!(!t.observe(0, &[act(ActionKind::ReduceQuality, 0)]));
        assert!(!t.observe(30, &[act(ActionKind::IncreaseQuality, 30)]));
        assert!(t.observe(60, &[act(ActionKind::ReduceQuality, 60)]));
        // The first move ages out of the window.
        assert!(!t.observe(100, &[]));
    }

    #[test]
    fn test_quarantine_efficiency_penalty() {
        let record = TickRecord {
            tick: 0,
            phase: Phase::Steady,
            field: FieldState::default(),
            crossings: Crossings::default(),
            quorum: 0.0,
            approved: false,
            acting: Vec::new(),
            corrective_actions: 0,
            cumulative_actions: 0,
            quality: 10,
            quarantined: true,
            effective_latency_ms: 200.0,
            thrashing: false,
        };
        assert!((tick_efficiency(&record, 10) - 0.9).abs() < 1e-12);
    }
}
