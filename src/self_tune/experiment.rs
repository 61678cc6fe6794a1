//! # Experiment Orchestrator
//!
//! ## Responsibility
//! Run a controlled experiment for one candidate: `replicas_per_arm`
//! isolated instances on the baseline, the same number on
//! `baseline + delta`, all replaying the same workload streams, then hand
//! the post-warmup window series to the analyst.
//!
//! ## Guarantees
//! - Isolated: instances share no mutable state; configs are value copies
//! - Paired: replica `r` of both arms replays workload stream `r`
//! - Bounded: at most `max_concurrent_experiments` experiments run at once
//! - Fail-closed: any instance fault fails the whole experiment, which is
//!   logged with a state dump and never graded
//! - Cancellable: a cancel signal stops every instance between ticks; the
//!   run is discarded
//!
//! ## NOT Responsible For
//! - Choosing candidates (see [`super::hypothesis`])
//! - Adopting results (see [`super::gate`])

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::analyst::{analyze, AnalystConfig, MetricRegression, MetricSummary, Recommendation};
use super::baseline::BaselineVersion;
use super::hypothesis::ExperimentCandidate;
use super::instance::{Arm, InstanceError, InstanceSpec, InstanceTrace, SimulatedInstance};
use super::score::{warmup_ticks, windows_from_trace, MetricVector, WindowSpec};
use super::workload::{Workload, WorkloadConfig};
use crate::agents::AgentConfig;
use crate::field::threshold::ParameterError;
use crate::field::{Normalization, ParameterDelta, Topology};
use crate::metrics;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by the experiment orchestrator.
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// The candidate does not apply cleanly to the baseline.
    #[error("candidate rejected: {0}")]
    InvalidCandidate(#[from] ParameterError),

    /// Run parameters cannot produce a gradeable experiment.
    #[error("invalid run: {0}")]
    InvalidRun(String),

    /// Not enough post-warmup windows to test significance.
    #[error("insufficient samples: have {have}, need {need}")]
    InsufficientSamples {
        /// Windows in the smaller arm.
        have: usize,
        /// Minimum windows per arm.
        need: usize,
    },

    /// An instance panicked or reached an invalid state.
    #[error("experiment {experiment_id} failed: {detail}")]
    InstanceFault {
        /// The failed experiment.
        experiment_id: Uuid,
        /// What went wrong.
        detail: String,
    },

    /// The run was cancelled and discarded.
    #[error("experiment {0} cancelled")]
    Cancelled(Uuid),

    /// The experiment pool was shut down.
    #[error("experiment pool closed")]
    PoolClosed,
}

// ---------------------------------------------------------------------------
// ExperimentConfig
// ---------------------------------------------------------------------------

/// Configuration for experiment runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Instances per arm.
    pub replicas_per_arm: u32,
    /// Simulated ticks per instance.
    pub duration_ticks: u64,
    /// Leading share of every run excluded from statistics.
    pub warmup_fraction: f64,
    /// Ticks per scored window.
    pub window_ticks: u64,
    /// Window in which more than one capacity direction flip counts as thrashing.
    pub thrash_window_ticks: u64,
    /// Latency target for the response metric.
    pub response_target_ms: f64,
    /// Experiments allowed to run concurrently.
    pub max_concurrent_experiments: usize,
    /// Replayed workload.
    pub workload: WorkloadConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            replicas_per_arm: 5,
            duration_ticks: 3_600,
            warmup_fraction: 0.05,
            window_ticks: 60,
            thrash_window_ticks: 120,
            response_target_ms: 500.0,
            max_concurrent_experiments: 2,
            workload: WorkloadConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ExperimentResult
// ---------------------------------------------------------------------------

/// Graded outcome of one experiment. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResult {
    /// Experiment id.
    pub experiment_id: Uuid,
    /// Candidate that was tested.
    pub candidate_id: Uuid,
    /// Baseline version both arms were derived from.
    pub baseline_version: u64,
    /// Changes the candidate arm applied.
    pub parameter_changes: Vec<ParameterDelta>,
    /// Instances per arm.
    pub replicas_per_arm: u32,
    /// Ticks per instance.
    pub duration_ticks: u64,
    /// Control arm statistics.
    pub control_metrics_summary: MetricSummary,
    /// Candidate arm statistics.
    pub candidate_metrics_summary: MetricSummary,
    /// Two-sided Welch p-value on the composite.
    pub p_value: f64,
    /// Cohen's d on the composite.
    pub effect_size: f64,
    /// Mean control composite.
    pub composite_score_control: f64,
    /// Mean candidate composite.
    pub composite_score_candidate: f64,
    /// Relative composite change.
    pub improvement_pct: f64,
    /// Metrics that got worse.
    pub regressions: Vec<MetricRegression>,
    /// Analyst verdict.
    pub recommendation: Recommendation,
    /// When grading finished.
    pub completed_at: DateTime<Utc>,
}

impl ExperimentResult {
    /// Largest absolute relative change the candidate applied.
    pub fn max_magnitude(&self) -> f64 {
        self.parameter_changes
            .iter()
            .map(|d| d.relative.abs())
            .fold(0.0, f64::max)
    }
}

// ---------------------------------------------------------------------------
// Experiment log
// ---------------------------------------------------------------------------

/// How an experiment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentStatus {
    /// Graded.
    Completed,
    /// An instance faulted; not graded.
    Failed,
    /// Cancelled; discarded.
    Cancelled,
}

impl ExperimentStatus {
    fn as_str(self) -> &'static str {
        match self {
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Failed => "failed",
            ExperimentStatus::Cancelled => "cancelled",
        }
    }
}

/// One entry of the append-only experiment log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentLogEntry {
    /// Experiment id.
    pub experiment_id: Uuid,
    /// Candidate id.
    pub candidate_id: Uuid,
    /// Baseline version tested against.
    pub baseline_version: u64,
    /// Outcome.
    pub status: ExperimentStatus,
    /// Failure reason and state dump, for failed runs.
    pub detail: Option<String>,
    /// Graded result, for completed runs.
    pub result: Option<ExperimentResult>,
    /// When the entry was appended.
    pub logged_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Static settings an orchestrator is built from.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    /// Run parameters.
    pub experiment: ExperimentConfig,
    /// Grading thresholds.
    pub analyst: AnalystConfig,
    /// Agent tunables shared by every instance.
    pub agents: AgentConfig,
    /// Signal normalization shared by every instance.
    pub normalization: Normalization,
}

struct OrchestratorInner {
    settings: OrchestratorSettings,
    topology: Topology,
    workload: Arc<dyn Workload>,
    pool: Semaphore,
    cancel: watch::Receiver<bool>,
    log: Mutex<Vec<ExperimentLogEntry>>,
}

/// Runs experiments on a bounded pool of blocking worker threads.
///
/// Cloning produces a handle to the same pool and log.
#[derive(Clone)]
pub struct ExperimentOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for ExperimentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentOrchestrator")
            .field("available_slots", &self.inner.pool.available_permits())
            .field("logged", &self.inner.log.lock().len())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl ExperimentOrchestrator {
    /// Build an orchestrator.
    ///
    /// `cancel` flipping to `true` stops every running experiment between ticks.
    pub fn new(
        settings: OrchestratorSettings,
        topology: Topology,
        workload: Arc<dyn Workload>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let slots = settings.experiment.max_concurrent_experiments.max(1);
        Self {
            inner: Arc::new(OrchestratorInner {
                settings,
                topology,
                workload,
                pool: Semaphore::new(slots),
                cancel,
                log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Settings this orchestrator runs with.
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Append-only log of every experiment that started.
    pub fn log(&self) -> Vec<ExperimentLogEntry> {
        self.inner.log.lock().clone()
    }

    /// Run with the configured replica count and duration.
    ///
    /// # Errors
    /// See [`ExperimentOrchestrator::run_experiment`].
    pub async fn run(
        &self,
        candidate: &ExperimentCandidate,
        baseline: &BaselineVersion,
    ) -> Result<ExperimentResult, ExperimentError> {
        let cfg = &self.inner.settings.experiment;
        self.run_experiment(candidate, baseline, cfg.replicas_per_arm, cfg.duration_ticks)
            .await
    }

    /// Run `2 * replicas_per_arm` instances for `duration_ticks` and grade
    /// the candidate against the baseline.
    ///
    /// # Errors
    /// - [`ExperimentError::InvalidCandidate`] if the delta leaves a valid range
    /// - [`ExperimentError::InvalidRun`] for zero replicas or duration
    /// - [`ExperimentError::InstanceFault`] if any instance faults or panics
    /// - [`ExperimentError::Cancelled`] if the cancel signal fires
    /// - [`ExperimentError::InsufficientSamples`] if too few windows survive warmup
    ///
    /// # Panics
    /// This function never panics.
    pub async fn run_experiment(
        &self,
        candidate: &ExperimentCandidate,
        baseline: &BaselineVersion,
        replicas_per_arm: u32,
        duration_ticks: u64,
    ) -> Result<ExperimentResult, ExperimentError> {
        let settings = &self.inner.settings;
        let candidate_config = baseline.config.with_deltas(&candidate.parameter_deltas)?;
        if replicas_per_arm == 0 || duration_ticks == 0 {
            return Err(ExperimentError::InvalidRun(format!(
                "replicas_per_arm={replicas_per_arm} duration_ticks={duration_ticks}"
            )));
        }

        let _permit = self
            .inner
            .pool
            .acquire()
            .await
            .map_err(|_| ExperimentError::PoolClosed)?;

        let experiment_id = Uuid::new_v4();
        info!(
            %experiment_id,
            candidate_id = %candidate.candidate_id,
            baseline_version = baseline.version,
            replicas_per_arm,
            duration_ticks,
            "experiment started"
        );

        // Local stop signal: follows the global cancel, and also fires when
        // a sibling instance faults.
        let (stop_tx, stop_rx) = watch::channel(*self.inner.cancel.borrow());
        let stop_tx = Arc::new(stop_tx);
        let mut global = self.inner.cancel.clone();
        let forward = {
            let stop_tx = Arc::clone(&stop_tx);
            tokio::spawn(async move {
                loop {
                    if *global.borrow_and_update() {
                        let _ = stop_tx.send(true);
                        break;
                    }
                    if global.changed().await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut set = JoinSet::new();
        for replica in 0..replicas_per_arm {
            for (arm, thresholds) in [
                (Arm::Control, baseline.config.clone()),
                (Arm::Candidate, candidate_config.clone()),
            ] {
                let spec = InstanceSpec {
                    arm,
                    replica,
                    thresholds,
                    agents: settings.agents.clone(),
                    normalization: settings.normalization.clone(),
                    topology: self.inner.topology.clone(),
                    thrash_window_ticks: settings.experiment.thrash_window_ticks,
                };
                let workload = Arc::clone(&self.inner.workload);
                let stop = stop_rx.clone();
                set.spawn_blocking(move || SimulatedInstance::new(spec, workload).run(duration_ticks, &stop));
            }
        }

        let mut traces: Vec<InstanceTrace> = Vec::with_capacity(2 * replicas_per_arm as usize);
        let mut fault: Option<String> = None;
        let mut cancelled = false;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(trace)) => traces.push(trace),
                Ok(Err(InstanceError::Fault {
                    arm,
                    replica,
                    tick,
                    reason,
                    dump,
                })) => {
                    error!(
                        %experiment_id,
                        %arm,
                        replica,
                        tick,
                        reason = %reason,
                        dump = %dump,
                        "experiment instance faulted"
                    );
                    fault.get_or_insert(format!("{arm} replica {replica} at tick {tick}: {reason}; {dump}"));
                    let _ = stop_tx.send(true);
                }
                Ok(Err(InstanceError::Cancelled { .. })) => cancelled = true,
                Err(join_err) => {
                    let detail = if join_err.is_panic() {
                        format!("instance panicked: {}", panic_message(join_err.into_panic()))
                    } else {
                        format!("instance task aborted: {join_err}")
                    };
                    error!(%experiment_id, detail = %detail, "experiment instance faulted");
                    fault.get_or_insert(detail);
                    let _ = stop_tx.send(true);
                }
            }
        }
        forward.abort();

        if let Some(detail) = fault {
            self.append(experiment_id, candidate, baseline, ExperimentStatus::Failed, Some(detail.clone()), None);
            return Err(ExperimentError::InstanceFault {
                experiment_id,
                detail,
            });
        }
        if cancelled {
            warn!(%experiment_id, "experiment cancelled, results discarded");
            self.append(experiment_id, candidate, baseline, ExperimentStatus::Cancelled, None, None);
            return Err(ExperimentError::Cancelled(experiment_id));
        }

        traces.sort_by_key(|t| (t.arm == Arm::Candidate, t.replica));
        let spec = WindowSpec {
            warmup_ticks: warmup_ticks(duration_ticks, settings.experiment.warmup_fraction),
            window_ticks: settings.experiment.window_ticks,
            response_target_ms: settings.experiment.response_target_ms,
        };
        let mut control: Vec<MetricVector> = Vec::new();
        let mut treated: Vec<MetricVector> = Vec::new();
        for trace in &traces {
            let windows = windows_from_trace(trace, &spec);
            match trace.arm {
                Arm::Control => control.extend(windows),
                Arm::Candidate => treated.extend(windows),
            }
        }

        let analysis = match analyze(&control, &treated, &settings.analyst) {
            Ok(a) => a,
            Err(e) => {
                self.append(experiment_id, candidate, baseline, ExperimentStatus::Failed, Some(e.to_string()), None);
                return Err(e);
            }
        };

        let result = ExperimentResult {
            experiment_id,
            candidate_id: candidate.candidate_id,
            baseline_version: baseline.version,
            parameter_changes: candidate.parameter_deltas.clone(),
            replicas_per_arm,
            duration_ticks,
            composite_score_control: analysis.control.composite_mean,
            composite_score_candidate: analysis.candidate.composite_mean,
            control_metrics_summary: analysis.control,
            candidate_metrics_summary: analysis.candidate,
            p_value: analysis.p_value,
            effect_size: analysis.effect_size,
            improvement_pct: analysis.improvement_pct,
            regressions: analysis.regressions,
            recommendation: analysis.recommendation,
            completed_at: Utc::now(),
        };

        info!(
            %experiment_id,
            p_value = result.p_value,
            effect_size = result.effect_size,
            improvement_pct = result.improvement_pct,
            recommendation = result.recommendation.as_str(),
            "experiment graded"
        );
        self.append(
            experiment_id,
            candidate,
            baseline,
            ExperimentStatus::Completed,
            None,
            Some(result.clone()),
        );
        Ok(result)
    }

    fn append(
        &self,
        experiment_id: Uuid,
        candidate: &ExperimentCandidate,
        baseline: &BaselineVersion,
        status: ExperimentStatus,
        detail: Option<String>,
        result: Option<ExperimentResult>,
    ) {
        metrics::inc_experiment_outcome(status.as_str());
        self.inner.log.lock().push(ExperimentLogEntry {
            experiment_id,
            candidate_id: candidate.candidate_id,
            baseline_version: baseline.version,
            status,
            detail,
            result,
            logged_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{Parameter, SignalTriple, ThresholdConfig};
    use crate::self_tune::baseline::BaselineSource;
    use crate::self_tune::workload::WorkloadReplayer;

    fn orchestrator(cancel: watch::Receiver<bool>) -> ExperimentOrchestrator {
        let workload = WorkloadReplayer::new(WorkloadConfig::default());
        let topology = Topology::new(workload.components().to_vec(), &[], SignalTriple::splat(0.0)).unwrap();
        ExperimentOrchestrator::new(OrchestratorSettings::default(), topology, Arc::new(workload), cancel)
    }

    fn baseline() -> BaselineVersion {
        BaselineVersion {
            version: 1,
            config: ThresholdConfig::default(),
            source: BaselineSource::Initial,
            created_at: Utc::now(),
            description: "test".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_zero_delta_is_not_significant() {
        let (_tx, rx) = watch::channel(false);
        let o = orchestrator(rx);
        let result = o
            .run_experiment(&ExperimentCandidate::manual(Vec::new()), &baseline(), 2, 600)
            .await
            .unwrap();
        assert_eq!(result.improvement_pct, 0.0);
        assert!((result.p_value - 1.0).abs() < 1e-12);
        assert_eq!(result.recommendation, Recommendation::Inconclusive);
        assert_eq!(o.log().len(), 1);
        assert_eq!(o.log()[0].status, ExperimentStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_candidate_rejected_before_running() {
        let (_tx, rx) = watch::channel(false);
        let o = orchestrator(rx);
        let candidate = ExperimentCandidate::manual(vec![ParameterDelta::new(Parameter::InjectError, 10.0)]);
        let err = o.run_experiment(&candidate, &baseline(), 1, 100).await.unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidCandidate(_)));
        assert!(o.log().is_empty());
    }

    #[tokio::test]
    async fn test_zero_replicas_is_invalid() {
        let (_tx, rx) = watch::channel(false);
        let o = orchestrator(rx);
        let err = o
            .run_experiment(&ExperimentCandidate::manual(Vec::new()), &baseline(), 0, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::InvalidRun(_)));
    }

    #[tokio::test]
    async fn test_cancelled_run_is_discarded() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let o = orchestrator(rx);
        let err = o
            .run_experiment(&ExperimentCandidate::manual(Vec::new()), &baseline(), 2, 600)
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::Cancelled(_)));
        assert_eq!(o.log()[0].status, ExperimentStatus::Cancelled);
        assert!(o.log()[0].result.is_none());
    }

    #[tokio::test]
    async fn test_too_short_run_has_insufficient_samples() {
        let (_tx, rx) = watch::channel(false);
        let o = orchestrator(rx);
        let err = o
            .run_experiment(&ExperimentCandidate::manual(Vec::new()), &baseline(), 1, 60)
            .await
            .unwrap_err();
        assert!(matches!(err, ExperimentError::InsufficientSamples { .. }));
    }
}
