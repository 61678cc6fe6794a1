//! # Research Loop Wiring
//!
//! Closes the loop between production and the experimentation harness.
//!
//! ## Loop
//! ```text
//! ControlLoop ──ProductionWindow──► research task ──window─────► AdoptionGate (rollback rule)
//!                                        │
//!                      every interval    └──► propose ──► ExperimentOrchestrator ──► AdoptionGate
//!                                                                                        │
//! ControlLoop ◄───────────────────── watch<BaselineVersion> ◄─────────────────────────────┘
//! ```
//!
//! One research cycle runs at a time. Experiments inside a cycle run
//! concurrently, bounded by the orchestrator's pool, and their results are
//! handed to the gate one at a time as they complete.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use super::experiment::{ExperimentError, ExperimentOrchestrator, ExperimentResult};
use super::gate::{AdoptionGate, AdoptionRecord, GateError};
use super::hypothesis::{propose, ExperimentCandidate};
use super::score::{CompositeWeights, MetricVector, ProductionMetrics};
use crate::control::window::ProductionWindow;

/// Cadence of the research layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ResearchConfig {
    /// Time between research cycles.
    pub interval_ms: u64,
    /// Candidates tested per cycle.
    pub candidates_per_cycle: usize,
    /// Production windows needed before the first cycle.
    pub min_production_windows: usize,
    /// Recent production windows the generator looks at.
    pub recent_windows: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            interval_ms: 600_000,
            candidates_per_cycle: 2,
            min_production_windows: 3,
            recent_windows: 10,
        }
    }
}

/// What one research cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Candidates proposed.
    pub proposed: usize,
    /// Experiments that produced a graded result.
    pub graded: usize,
    /// Gate decisions, in the order they were taken.
    pub records: Vec<AdoptionRecord>,
    /// Experiments or gate calls that failed.
    pub failures: Vec<String>,
}

/// Run one research cycle against the gate's current baseline.
///
/// A result that loses an adoption race is re-run once against the latest
/// baseline.
///
/// # Panics
/// This function never panics.
pub async fn run_research_cycle(
    orchestrator: &ExperimentOrchestrator,
    gate: &AdoptionGate,
    recent: &ProductionMetrics,
    count: usize,
) -> CycleReport {
    let baseline = gate.current_baseline();
    let candidates = propose(recent, &baseline.config, count);
    let mut report = CycleReport {
        proposed: candidates.len(),
        ..CycleReport::default()
    };
    info!(
        baseline_version = baseline.version,
        proposed = report.proposed,
        "research cycle started"
    );

    let mut set: JoinSet<(ExperimentCandidate, Result<ExperimentResult, ExperimentError>)> = JoinSet::new();
    for candidate in candidates {
        let orchestrator = orchestrator.clone();
        let baseline = baseline.clone();
        set.spawn(async move {
            let result = orchestrator.run(&candidate, &baseline).await;
            (candidate, result)
        });
    }

    let mut retry: Vec<ExperimentCandidate> = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((candidate, Ok(result))) => {
                report.graded += 1;
                match gate.consider(&result) {
                    Ok(record) => report.records.push(record),
                    Err(GateError::Conflict { .. }) => retry.push(candidate),
                    Err(e) => report.failures.push(e.to_string()),
                }
            }
            Ok((_, Err(e))) => {
                warn!(error = %e, "experiment did not produce a result");
                report.failures.push(e.to_string());
            }
            Err(e) => {
                error!(error = %e, "experiment task failed");
                report.failures.push(e.to_string());
            }
        }
    }

    for candidate in retry {
        let latest = gate.current_baseline();
        info!(
            candidate_id = %candidate.candidate_id,
            baseline_version = latest.version,
            "re-running candidate against latest baseline"
        );
        match orchestrator.run(&candidate, &latest).await {
            Ok(result) => {
                report.graded += 1;
                match gate.consider(&result) {
                    Ok(record) => report.records.push(record),
                    Err(e) => report.failures.push(e.to_string()),
                }
            }
            Err(e) => report.failures.push(e.to_string()),
        }
    }

    info!(
        graded = report.graded,
        decisions = report.records.len(),
        failures = report.failures.len(),
        "research cycle finished"
    );
    report
}

/// Handles for the background research task.
#[derive(Debug)]
pub struct ResearchHandles {
    /// The research task.
    pub task: JoinHandle<()>,
    /// Reports of completed cycles, oldest first.
    pub reports: Arc<Mutex<Vec<CycleReport>>>,
}

impl ResearchHandles {
    /// Abort the research task immediately.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Start the research loop.
///
/// The task consumes production windows (feeding the gate's rollback rule
/// and the generator's view of production) and starts a research cycle
/// every `config.interval_ms` once enough windows have arrived. It stops
/// when `shutdown` turns `true` or the window channel closes.
pub fn start_research_loop(
    orchestrator: ExperimentOrchestrator,
    gate: AdoptionGate,
    mut windows: mpsc::Receiver<ProductionWindow>,
    weights: CompositeWeights,
    config: ResearchConfig,
    mut shutdown: watch::Receiver<bool>,
) -> ResearchHandles {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let task = {
        let reports = Arc::clone(&reports);
        tokio::spawn(async move {
            let mut recent: Vec<MetricVector> = Vec::new();
            let mut cycle: Option<JoinHandle<CycleReport>> = None;
            let mut interval = tokio::time::interval(Duration::from_millis(config.interval_ms.max(1)));
            info!(interval_ms = config.interval_ms, "research loop started");
            loop {
                tokio::select! {
                    window = windows.recv() => {
                        let Some(window) = window else {
                            info!("production window channel closed, research loop stopping");
                            break;
                        };
                        if let Err(e) = gate.observe_production_window(&window) {
                            error!(error = %e, "rollback rule failed");
                        }
                        recent.push(window.metrics);
                        if recent.len() > config.recent_windows.max(1) {
                            recent.remove(0);
                        }
                    }
                    _ = interval.tick() => {
                        if let Some(handle) = cycle.take() {
                            if handle.is_finished() {
                                match handle.await {
                                    Ok(report) => reports.lock().push(report),
                                    Err(e) => error!(error = %e, "research cycle task failed"),
                                }
                            } else {
                                cycle = Some(handle);
                                continue;
                            }
                        }
                        if recent.len() < config.min_production_windows {
                            continue;
                        }
                        let metrics = ProductionMetrics::from_windows(&recent, &weights);
                        let orchestrator = orchestrator.clone();
                        let gate = gate.clone();
                        let count = config.candidates_per_cycle;
                        cycle = Some(tokio::spawn(async move {
                            run_research_cycle(&orchestrator, &gate, &metrics, count).await
                        }));
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            if let Some(handle) = cycle {
                handle.abort();
            }
        })
    };
    ResearchHandles { task, reports }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{SignalTriple, ThresholdConfig, Topology};
    use crate::self_tune::baseline::BaselineStore;
    use crate::self_tune::experiment::{ExperimentConfig, OrchestratorSettings};
    use crate::self_tune::gate::GateConfig;
    use crate::self_tune::workload::{Workload, WorkloadConfig, WorkloadReplayer};

    fn parts(cancel: watch::Receiver<bool>) -> (ExperimentOrchestrator, AdoptionGate) {
        let workload = WorkloadReplayer::new(WorkloadConfig::default());
        let topology = Topology::new(workload.components().to_vec(), &[], SignalTriple::splat(0.0)).unwrap();
        let settings = OrchestratorSettings {
            experiment: ExperimentConfig {
                replicas_per_arm: 2,
                duration_ticks: 600,
                ..ExperimentConfig::default()
            },
            ..OrchestratorSettings::default()
        };
        let orchestrator = ExperimentOrchestrator::new(settings, topology, Arc::new(workload), cancel);
        let gate = AdoptionGate::new(
            GateConfig::default(),
            BaselineStore::new(ThresholdConfig::default()).unwrap(),
        );
        (orchestrator, gate)
    }

    #[tokio::test]
    async fn test_cycle_grades_every_proposal() {
        let (_tx, rx) = watch::channel(false);
        let (o, g) = parts(rx);
        let report = run_research_cycle(&o, &g, &ProductionMetrics::default(), 2).await;
        assert_eq!(report.proposed, 2);
        assert!(report.graded + report.failures.len() >= 2);
        assert!(report.records.len() <= report.graded);
        // A lost adoption race re-runs the candidate, adding a log entry.
        assert!(o.log().len() >= 2);
        assert_eq!(g.history().len(), report.records.len());
    }

    #[tokio::test]
    async fn test_loop_feeds_windows_to_gate_and_stops() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (o, g) = parts(cancel_rx);
        let (win_tx, win_rx) = mpsc::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = ResearchConfig {
            interval_ms: 3_600_000,
            ..ResearchConfig::default()
        };
        let handles = start_research_loop(o, g, win_rx, CompositeWeights::default(), config, stop_rx);
        win_tx
            .send(ProductionWindow {
                index: 0,
                start_tick: 0,
                end_tick: 59,
                baseline_version: 1,
                uniform_baseline: true,
                metrics: MetricVector::default(),
                composite: 0.5,
            })
            .await
            .unwrap();
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handles.task).await.unwrap().unwrap();
        assert!(handles.reports.lock().is_empty());
    }
}
