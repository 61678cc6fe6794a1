//! # Operator Console
//!
//! ## Responsibility
//! The read/approve surface a human uses: the live production view, the
//! active baseline and its history, pending approvals, the experiment log,
//! the adoption audit trail, alerts, and counters.
//!
//! ## Guarantees
//! - Read operations never block the control loop: they read the latest
//!   published [`LiveView`] and copy state out of the gate and orchestrator.
//! - Approvals and rejections go through the [`AdoptionGate`], so they obey
//!   the same single-writer and conflict rules as automatic decisions.
//!
//! ## NOT Responsible For
//! - Transport (HTTP, TUI). Callers wrap the console in whatever they expose.
//! - Deciding adoptions (that belongs to `self_tune::gate`)

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::info;
use uuid::Uuid;

use crate::control::LiveView;
use crate::field::ThresholdConfig;
use crate::metrics::{self, MetricsSummary};
use crate::self_tune::baseline::{BaselineDiff, BaselineError, BaselineVersion};
use crate::self_tune::experiment::{ExperimentLogEntry, ExperimentOrchestrator};
use crate::self_tune::gate::{AdoptionGate, AdoptionRecord, GateError, OperatorAlert, PendingApproval};

/// Errors returned by operator commands.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// The approver name is empty.
    #[error("approver must be named")]
    MissingApprover,

    /// No experiment with this id was logged.
    #[error("unknown experiment {0}")]
    UnknownExperiment(Uuid),

    /// The gate refused the command.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// A baseline lookup failed.
    #[error(transparent)]
    Baseline(#[from] BaselineError),

    /// Exporting the audit trail failed.
    #[error("audit export failed: {0}")]
    Export(#[from] serde_json::Error),
}

/// One screen of operator status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorStatus {
    /// Active baseline version.
    pub baseline_version: u64,
    /// Active thresholds.
    pub thresholds: ThresholdConfig,
    /// Latest production view.
    pub live: LiveView,
    /// Results waiting for a human.
    pub pending_approvals: usize,
    /// Experiments logged so far.
    pub experiments_logged: usize,
}

/// Handle over the gate, the orchestrator and the live view.
///
/// Cloning is cheap; every clone sees the same state.
#[derive(Debug, Clone)]
pub struct OperatorConsole {
    gate: AdoptionGate,
    orchestrator: ExperimentOrchestrator,
    live: watch::Receiver<LiveView>,
}

impl OperatorConsole {
    /// Build a console.
    pub fn new(gate: AdoptionGate, orchestrator: ExperimentOrchestrator, live: watch::Receiver<LiveView>) -> Self {
        Self {
            gate,
            orchestrator,
            live,
        }
    }

    /// Current baseline, live view, and queue sizes.
    pub fn status(&self) -> OperatorStatus {
        let baseline = self.gate.current_baseline();
        OperatorStatus {
            baseline_version: baseline.version,
            thresholds: baseline.config,
            live: self.live_view(),
            pending_approvals: self.gate.pending().len(),
            experiments_logged: self.orchestrator.log().len(),
        }
    }

    /// Latest production view.
    pub fn live_view(&self) -> LiveView {
        self.live.borrow().clone()
    }

    /// Active baseline.
    pub fn current_baseline(&self) -> BaselineVersion {
        self.gate.current_baseline()
    }

    /// Every baseline version, oldest first.
    pub fn baseline_history(&self) -> Vec<BaselineVersion> {
        self.gate.store().history()
    }

    /// Parameter changes between two baseline versions.
    ///
    /// # Errors
    /// [`OperatorError::Baseline`] if either version is unknown.
    pub fn baseline_diff(&self, from: u64, to: u64) -> Result<BaselineDiff, OperatorError> {
        Ok(self.gate.store().diff(from, to)?)
    }

    /// Results the gate deferred to a human.
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.gate.pending()
    }

    /// Approve a deferred result.
    ///
    /// # Errors
    /// - [`OperatorError::MissingApprover`] for a blank approver
    /// - [`OperatorError::Gate`] if nothing is pending under `experiment_id`
    ///   or the result no longer matches the current baseline
    pub fn approve(&self, experiment_id: Uuid, approver: &str) -> Result<AdoptionRecord, OperatorError> {
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(OperatorError::MissingApprover);
        }
        let record = self.gate.approve(experiment_id, approver)?;
        info!(%experiment_id, approver, "operator approved experiment");
        Ok(record)
    }

    /// Reject a deferred result.
    ///
    /// # Errors
    /// - [`OperatorError::MissingApprover`] for a blank approver
    /// - [`OperatorError::Gate`] if nothing is pending under `experiment_id`
    pub fn reject(&self, experiment_id: Uuid, approver: &str, reason: &str) -> Result<AdoptionRecord, OperatorError> {
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(OperatorError::MissingApprover);
        }
        let record = self.gate.reject(experiment_id, approver, reason)?;
        info!(%experiment_id, approver, reason, "operator rejected experiment");
        Ok(record)
    }

    /// Append-only experiment log.
    pub fn experiment_log(&self) -> Vec<ExperimentLogEntry> {
        self.orchestrator.log()
    }

    /// One experiment's log entry.
    ///
    /// # Errors
    /// [`OperatorError::UnknownExperiment`] if it was never logged.
    pub fn experiment(&self, experiment_id: Uuid) -> Result<ExperimentLogEntry, OperatorError> {
        self.orchestrator
            .log()
            .into_iter()
            .find(|e| e.experiment_id == experiment_id)
            .ok_or(OperatorError::UnknownExperiment(experiment_id))
    }

    /// Every gate decision, oldest first.
    pub fn adoption_history(&self) -> Vec<AdoptionRecord> {
        self.gate.history()
    }

    /// The adoption audit trail as pretty JSON.
    ///
    /// # Errors
    /// [`OperatorError::Export`] if serialization fails.
    pub fn export_audit_json(&self) -> Result<String, OperatorError> {
        Ok(serde_json::to_string_pretty(&self.gate.history())?)
    }

    /// Rollback and approval-request alerts raised from now on.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<OperatorAlert> {
        self.gate.subscribe_alerts()
    }

    /// Counter snapshot. Zeroed if metrics were never initialised.
    pub fn metrics_summary(&self) -> MetricsSummary {
        metrics::get_metrics_summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{SignalTriple, Topology};
    use crate::self_tune::baseline::BaselineStore;
    use crate::self_tune::experiment::OrchestratorSettings;
    use crate::self_tune::gate::GateConfig;
    use crate::self_tune::workload::{Workload, WorkloadConfig, WorkloadReplayer};
    use std::sync::Arc;

    fn console() -> (OperatorConsole, watch::Sender<LiveView>) {
        let workload = WorkloadReplayer::new(WorkloadConfig::default());
        let topology = Topology::new(workload.components().to_vec(), &[], SignalTriple::splat(0.0)).unwrap();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let orchestrator = ExperimentOrchestrator::new(
            OrchestratorSettings::default(),
            topology,
            Arc::new(workload),
            cancel_rx,
        );
        let gate = AdoptionGate::new(
            GateConfig::default(),
            BaselineStore::new(ThresholdConfig::default()).unwrap(),
        );
        let (live_tx, live_rx) = watch::channel(LiveView::default());
        (OperatorConsole::new(gate, orchestrator, live_rx), live_tx)
    }

    #[test]
    fn test_status_reflects_live_view() {
        let (c, live_tx) = console();
        live_tx.send_replace(LiveView {
            tick: 42,
            baseline_version: 1,
            quality: 7,
            ..LiveView::default()
        });
        let s = c.status();
        assert_eq!(s.baseline_version, 1);
        assert_eq!(s.live.tick, 42);
        assert_eq!(s.live.quality, 7);
        assert_eq!(s.pending_approvals, 0);
        assert_eq!(s.experiments_logged, 0);
    }

    #[test]
    fn test_blank_approver_rejected() {
        let (c, _live) = console();
        let err = c.approve(Uuid::new_v4(), "  ").unwrap_err();
        assert!(matches!(err, OperatorError::MissingApprover));
        let err = c.reject(Uuid::new_v4(), "", "no").unwrap_err();
        assert!(matches!(err, OperatorError::MissingApprover));
    }

    #[test]
    fn test_approve_unknown_is_not_pending() {
        let (c, _live) = console();
        let id = Uuid::new_v4();
        let err = c.approve(id, "alice").unwrap_err();
        assert!(matches!(err, OperatorError::Gate(GateError::NotPending(x)) if x == id));
    }

    #[test]
    fn test_unknown_experiment() {
        let (c, _live) = console();
        let id = Uuid::new_v4();
        assert!(matches!(c.experiment(id), Err(OperatorError::UnknownExperiment(x)) if x == id));
    }

    #[test]
    fn test_baseline_history_and_diff() {
        let (c, _live) = console();
        assert_eq!(c.baseline_history().len(), 1);
        assert_eq!(c.current_baseline().version, 1);
        assert!(c.baseline_diff(1, 1).unwrap().changes.is_empty());
        assert!(matches!(c.baseline_diff(1, 9), Err(OperatorError::Baseline(_))));
    }

    #[test]
    fn test_empty_audit_exports_as_json_array() {
        let (c, _live) = console();
        let json = c.export_audit_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.as_array().unwrap().is_empty());
        assert!(c.adoption_history().is_empty());
    }
}
