//! # Adoption Gate
//!
//! ## Responsibility
//! The only writer of the baseline. Turns graded experiment results into
//! adoption decisions, holds oversized changes for a human, and rolls back
//! adoptions that regress in production.
//!
//! ## Guarantees
//! - Single writer: every baseline change goes through one lock, in order
//! - Conflict-safe: a result graded against a stale baseline version is
//!   refused with [`GateError::Conflict`] and never applied
//! - Anti-thrash: a parameter whose recent adoptions and rollbacks already
//!   flipped direction cannot be flipped again
//! - Auditable: every decision, including rollbacks, lands in an append-only
//!   history of [`AdoptionRecord`]s
//! - Alerting: rollbacks log at `error`, bump a Prometheus counter, and are
//!   broadcast on the alert channel
//! - Version-aware probation: only production windows that ran entirely
//!   under the adopted version count toward a rollback, and probation ends
//!   after `probation_windows` clean windows
//! - Durable: with `ledger_path` set, versions, history, pending approvals
//!   and probation are rewritten atomically after every change, and
//!   [`AdoptionGate::open`] resumes from them
//!
//! ## NOT Responsible For
//! - Grading experiments (see [`super::analyst`])
//! - Measuring production windows (see `control::window`)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::analyst::Recommendation;
use super::baseline::{BaselineError, BaselineSource, BaselineStore, BaselineVersion};
use super::experiment::ExperimentResult;
use crate::control::checkpoint::{self, Checkpoint};
use crate::control::window::ProductionWindow;
use crate::field::{Parameter, ParameterDelta, ThresholdConfig};
use crate::metrics;

/// Approver recorded for decisions the gate takes on its own.
pub const AUTO_APPROVER: &str = "auto";

const ALERT_CAPACITY: usize = 64;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced by the adoption gate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateError {
    /// The result was graded against a baseline that is no longer current.
    #[error("result graded against baseline v{tested}, current is v{current}; retry against latest")]
    Conflict {
        /// Version the experiment ran against.
        tested: u64,
        /// Version currently active.
        current: u64,
    },

    /// No deferred result with this experiment id is waiting.
    #[error("no pending approval for experiment {0}")]
    NotPending(Uuid),

    /// The baseline store refused the change.
    #[error(transparent)]
    Baseline(#[from] BaselineError),

    /// The candidate delta no longer applies to the current baseline.
    #[error("candidate does not apply to current baseline: {0}")]
    InvalidCandidate(String),

    /// The persisted ledger could not be read.
    #[error("adoption ledger unreadable: {0}")]
    Ledger(String),
}

// ─── Config ───────────────────────────────────────────────────────────────────

/// Tunables of the adoption gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GateConfig {
    /// Records per parameter inspected by the anti-thrash rule.
    pub anti_thrash_records: usize,
    /// Largest relative change adopted without a human.
    pub max_auto_magnitude: f64,
    /// Consecutive regressed production windows that trigger a rollback.
    pub rollback_windows: u32,
    /// Allowed shortfall of production composite below the experiment's
    /// candidate composite, as a fraction.
    pub rollback_tolerance: f64,
    /// Clean production windows after which an adoption leaves probation.
    pub probation_windows: u32,
    /// Where to persist the ledger; `None` keeps it in memory only.
    pub ledger_path: Option<PathBuf>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            anti_thrash_records: 6,
            max_auto_magnitude: 0.15,
            rollback_windows: 3,
            rollback_tolerance: 0.10,
            probation_windows: 30,
            ledger_path: None,
        }
    }
}

// ─── Records ──────────────────────────────────────────────────────────────────

/// What the gate decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdoptionDecision {
    /// Applied; a new baseline version exists.
    Adopt,
    /// Refused.
    Rejected,
    /// Held for a human in the approval queue.
    Deferred,
    /// A previous adoption was reverted.
    RolledBack,
}

impl AdoptionDecision {
    /// Lowercase label for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            AdoptionDecision::Adopt => "adopt",
            AdoptionDecision::Rejected => "rejected",
            AdoptionDecision::Deferred => "deferred",
            AdoptionDecision::RolledBack => "rolled_back",
        }
    }
}

/// One entry of the adoption history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdoptionRecord {
    /// Experiment the decision concerns. For rollbacks, the experiment whose
    /// adoption was reverted.
    pub experiment_id: Uuid,
    /// Decision.
    pub decision: AdoptionDecision,
    /// `"auto"` or the operator who decided.
    pub approver: String,
    /// When the decision was taken.
    pub timestamp: DateTime<Utc>,
    /// Baseline version created by this decision, if any.
    pub resulting_baseline_version: Option<u64>,
    /// Changes applied (or proposed, for refusals). For rollbacks, the
    /// changes that undo the reverted adoption.
    pub parameter_changes: Vec<ParameterDelta>,
    /// For rollbacks, the version whose config was restored.
    pub reverted_to_version: Option<u64>,
    /// Why.
    pub reason: String,
}

/// A deferred result waiting for an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    /// The graded result.
    pub result: ExperimentResult,
    /// When it was deferred.
    pub deferred_at: DateTime<Utc>,
    /// Why it needs a human.
    pub reason: String,
}

/// Kind of operator alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// An adoption regressed in production and was reverted.
    Rollback,
    /// A change is waiting in the approval queue.
    ApprovalRequested,
}

/// Message on the operator alert channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAlert {
    /// Kind.
    pub kind: AlertKind,
    /// Experiment concerned.
    pub experiment_id: Uuid,
    /// Baseline version active after the event.
    pub baseline_version: u64,
    /// Human-readable text.
    pub message: String,
    /// When raised.
    pub raised_at: DateTime<Utc>,
}

// ─── Pure evaluation ──────────────────────────────────────────────────────────

/// Outcome of [`evaluate`] before any side effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Apply automatically.
    Adopt,
    /// Refuse.
    Refuse(String),
    /// Ask a human.
    Defer(String),
}

/// Direction a history record moved `parameter`, if it touched it.
fn moved(record: &AdoptionRecord, parameter: Parameter) -> Option<i8> {
    if !matches!(
        record.decision,
        AdoptionDecision::Adopt | AdoptionDecision::RolledBack
    ) {
        return None;
    }
    record
        .parameter_changes
        .iter()
        .find(|d| d.parameter == parameter)
        .map(ParameterDelta::direction)
        .filter(|&d| d != 0)
}

/// Direction flips of `parameter` over its last `window` moves plus `proposed`.
pub fn direction_flips(
    history: &[AdoptionRecord],
    parameter: Parameter,
    proposed: i8,
    window: usize,
) -> usize {
    let mut moves: Vec<i8> = history
        .iter()
        .rev()
        .filter_map(|r| moved(r, parameter))
        .take(window)
        .collect();
    moves.reverse();
    if proposed != 0 {
        moves.push(proposed);
    }
    moves.windows(2).filter(|w| w[0] != w[1]).count()
}

/// Decide what to do with `result` given the adoption history.
///
/// Pure: no lock, no I/O, no baseline access.
///
/// # Panics
/// This function never panics.
pub fn evaluate(result: &ExperimentResult, history: &[AdoptionRecord], config: &GateConfig) -> Verdict {
    if result.recommendation != Recommendation::Adopt {
        return Verdict::Refuse(format!(
            "analyst recommendation is {}",
            result.recommendation.as_str()
        ));
    }
    if result.parameter_changes.iter().all(|d| d.direction() == 0) {
        return Verdict::Refuse("candidate changes nothing".to_owned());
    }
    for delta in &result.parameter_changes {
        let flips = direction_flips(
            history,
            delta.parameter,
            delta.direction(),
            config.anti_thrash_records,
        );
        if flips > 1 {
            return Verdict::Refuse(format!(
                "{} would flip direction {flips} times within the last {} records",
                delta.parameter, config.anti_thrash_records
            ));
        }
    }
    let magnitude = result.max_magnitude();
    if magnitude > config.max_auto_magnitude {
        return Verdict::Defer(format!(
            "magnitude {magnitude:.3} exceeds auto-adopt limit {:.3}",
            config.max_auto_magnitude
        ));
    }
    Verdict::Adopt
}

// ─── Gate ─────────────────────────────────────────────────────────────────────

/// Post-adoption watch feeding the rollback rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probation {
    /// Experiment whose adoption is watched.
    pub experiment_id: Uuid,
    /// Candidate composite the experiment promised.
    pub expected_composite: f64,
    /// Version the adoption created.
    pub adopted_version: u64,
    /// Version a rollback restores.
    pub prior_version: u64,
    /// Changes the adoption applied.
    pub changes: Vec<ParameterDelta>,
    /// Consecutive regressed windows so far.
    pub regressed_streak: u32,
    /// Clean windows so far.
    #[serde(default)]
    pub clean_windows: u32,
}

/// Everything the gate needs to survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateLedger {
    /// Baseline versions, oldest first.
    pub versions: Vec<BaselineVersion>,
    /// Adoption history, oldest first.
    pub history: Vec<AdoptionRecord>,
    /// Deferred results still waiting for an operator.
    pub pending: Vec<PendingApproval>,
    /// Adoption under probation, if any.
    pub probation: Option<Probation>,
}

struct GateInner {
    config: GateConfig,
    store: BaselineStore,
    history: Vec<AdoptionRecord>,
    pending: Vec<PendingApproval>,
    probation: Option<Probation>,
    baseline_tx: watch::Sender<BaselineVersion>,
}

/// Serialized writer of the baseline and the adoption history.
///
/// Cloning produces a handle to the same gate.
#[derive(Clone)]
pub struct AdoptionGate {
    inner: Arc<Mutex<GateInner>>,
    alerts: broadcast::Sender<OperatorAlert>,
}

impl std::fmt::Debug for AdoptionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AdoptionGate")
            .field("baseline_version", &inner.store.current().version)
            .field("history", &inner.history.len())
            .field("pending", &inner.pending.len())
            .finish()
    }
}

impl AdoptionGate {
    /// Build a gate that owns writes to `store`.
    pub fn new(config: GateConfig, store: BaselineStore) -> Self {
        Self::assemble(config, store, Vec::new(), Vec::new(), None)
    }

    /// Rebuild a gate from a persisted ledger.
    ///
    /// # Errors
    /// [`GateError::Baseline`] if the ledger's version history is invalid.
    pub fn restore(config: GateConfig, ledger: GateLedger) -> Result<Self, GateError> {
        let store = BaselineStore::from_versions(ledger.versions)?;
        Ok(Self::assemble(
            config,
            store,
            ledger.history,
            ledger.pending,
            ledger.probation,
        ))
    }

    /// Open the gate for a (re)starting controller.
    ///
    /// Prefers the ledger at `config.ledger_path`. Without one, a production
    /// checkpoint seeds the store with its version and thresholds so version
    /// numbering and the active config carry over. Otherwise `initial` becomes
    /// version 1.
    ///
    /// # Errors
    /// - [`GateError::Ledger`] if the ledger exists but cannot be read
    /// - [`GateError::Baseline`] if the seed config or history is invalid
    pub fn open(
        config: GateConfig,
        initial: ThresholdConfig,
        resumed: Option<&Checkpoint>,
    ) -> Result<Self, GateError> {
        if let Some(path) = config.ledger_path.clone() {
            let ledger: Option<GateLedger> =
                checkpoint::read_json(&path).map_err(|e| GateError::Ledger(e.to_string()))?;
            if let Some(ledger) = ledger {
                let gate = Self::restore(config, ledger)?;
                let current = gate.current_baseline().version;
                info!(
                    path = %path.display(),
                    baseline_version = current,
                    records = gate.history().len(),
                    "adoption ledger restored"
                );
                if let Some(cp) = resumed.filter(|cp| cp.baseline_version != current) {
                    warn!(
                        checkpoint_version = cp.baseline_version,
                        baseline_version = current,
                        "checkpoint and ledger disagree, following the ledger"
                    );
                }
                return Ok(gate);
            }
        }
        let store = match resumed {
            Some(cp) => {
                info!(baseline_version = cp.baseline_version, "seeding baseline from checkpoint");
                BaselineStore::resumed(cp.baseline_version, cp.thresholds.clone())?
            }
            None => BaselineStore::new(initial)?,
        };
        Ok(Self::new(config, store))
    }

    fn assemble(
        config: GateConfig,
        store: BaselineStore,
        history: Vec<AdoptionRecord>,
        pending: Vec<PendingApproval>,
        probation: Option<Probation>,
    ) -> Self {
        let (baseline_tx, _) = watch::channel(store.current());
        let (alerts, _) = broadcast::channel(ALERT_CAPACITY);
        metrics::set_baseline_version(store.current().version);
        let inner = GateInner {
            config,
            store,
            history,
            pending,
            probation,
            baseline_tx,
        };
        persist(&inner);
        Self {
            inner: Arc::new(Mutex::new(inner)),
            alerts,
        }
    }

    /// Snapshot of the durable state.
    pub fn ledger(&self) -> GateLedger {
        ledger_of(&self.inner.lock())
    }

    /// Receiver that sees every new baseline version.
    pub fn subscribe_baseline(&self) -> watch::Receiver<BaselineVersion> {
        self.inner.lock().baseline_tx.subscribe()
    }

    /// Receiver for operator alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<OperatorAlert> {
        self.alerts.subscribe()
    }

    /// Active baseline.
    pub fn current_baseline(&self) -> BaselineVersion {
        self.inner.lock().store.current()
    }

    /// Read handle to the version history.
    pub fn store(&self) -> BaselineStore {
        self.inner.lock().store.clone()
    }

    /// Every decision so far, oldest first.
    pub fn history(&self) -> Vec<AdoptionRecord> {
        self.inner.lock().history.clone()
    }

    /// Deferred results waiting for an operator.
    pub fn pending(&self) -> Vec<PendingApproval> {
        self.inner.lock().pending.clone()
    }

    /// Gate configuration.
    pub fn config(&self) -> GateConfig {
        self.inner.lock().config.clone()
    }

    /// Decide on a graded result.
    ///
    /// # Errors
    /// - [`GateError::Conflict`] if an ADOPT result was graded against a
    ///   baseline version other than the current one
    /// - [`GateError::Baseline`] if the store refuses the new config
    ///
    /// # Panics
    /// This function never panics.
    pub fn consider(&self, result: &ExperimentResult) -> Result<AdoptionRecord, GateError> {
        let mut inner = self.inner.lock();
        let current = inner.store.current();

        if result.recommendation == Recommendation::Adopt && result.baseline_version != current.version {
            warn!(
                experiment_id = %result.experiment_id,
                tested = result.baseline_version,
                current = current.version,
                "adoption conflict, result graded against stale baseline"
            );
            return Err(GateError::Conflict {
                tested: result.baseline_version,
                current: current.version,
            });
        }

        let record = match evaluate(result, &inner.history, &inner.config) {
            Verdict::Adopt => {
                let version = adopt_locked(
                    &mut inner,
                    result,
                    BaselineSource::Adoption {
                        experiment_id: result.experiment_id,
                    },
                )?;
                info!(
                    experiment_id = %result.experiment_id,
                    baseline_version = version.version,
                    improvement_pct = result.improvement_pct,
                    "candidate adopted"
                );
                AdoptionRecord {
                    experiment_id: result.experiment_id,
                    decision: AdoptionDecision::Adopt,
                    approver: AUTO_APPROVER.to_owned(),
                    timestamp: Utc::now(),
                    resulting_baseline_version: Some(version.version),
                    parameter_changes: result.parameter_changes.clone(),
                    reverted_to_version: None,
                    reason: format!(
                        "p={:.4} d={:.3} improvement={:.3}",
                        result.p_value, result.effect_size, result.improvement_pct
                    ),
                }
            }
            Verdict::Refuse(reason) => {
                info!(experiment_id = %result.experiment_id, reason = %reason, "candidate rejected");
                AdoptionRecord {
                    experiment_id: result.experiment_id,
                    decision: AdoptionDecision::Rejected,
                    approver: AUTO_APPROVER.to_owned(),
                    timestamp: Utc::now(),
                    resulting_baseline_version: None,
                    parameter_changes: result.parameter_changes.clone(),
                    reverted_to_version: None,
                    reason,
                }
            }
            Verdict::Defer(reason) => {
                warn!(
                    experiment_id = %result.experiment_id,
                    reason = %reason,
                    "candidate deferred to approval queue"
                );
                inner.pending.push(PendingApproval {
                    result: result.clone(),
                    deferred_at: Utc::now(),
                    reason: reason.clone(),
                });
                let _ = self.alerts.send(OperatorAlert {
                    kind: AlertKind::ApprovalRequested,
                    experiment_id: result.experiment_id,
                    baseline_version: current.version,
                    message: reason.clone(),
                    raised_at: Utc::now(),
                });
                AdoptionRecord {
                    experiment_id: result.experiment_id,
                    decision: AdoptionDecision::Deferred,
                    approver: AUTO_APPROVER.to_owned(),
                    timestamp: Utc::now(),
                    resulting_baseline_version: None,
                    parameter_changes: result.parameter_changes.clone(),
                    reverted_to_version: None,
                    reason,
                }
            }
        };

        Ok(push_record(&mut inner, record))
    }

    /// Adopt a deferred result on an operator's word.
    ///
    /// # Errors
    /// - [`GateError::NotPending`] if nothing with this id is queued
    /// - [`GateError::Conflict`] if the baseline moved since the experiment
    ///   ran; the entry is dropped from the queue
    pub fn approve(&self, experiment_id: Uuid, approver: &str) -> Result<AdoptionRecord, GateError> {
        let mut inner = self.inner.lock();
        let pending = take_pending(&mut inner, experiment_id)?;
        let result = pending.result;
        let current = inner.store.current().version;
        if result.baseline_version != current {
            warn!(
                %experiment_id,
                tested = result.baseline_version,
                current,
                "approved candidate is stale, dropped"
            );
            push_record(
                &mut inner,
                AdoptionRecord {
                    experiment_id,
                    decision: AdoptionDecision::Rejected,
                    approver: approver.to_owned(),
                    timestamp: Utc::now(),
                    resulting_baseline_version: None,
                    parameter_changes: result.parameter_changes.clone(),
                    reverted_to_version: None,
                    reason: format!(
                        "approved but stale: graded against v{}, current is v{current}",
                        result.baseline_version
                    ),
                },
            );
            return Err(GateError::Conflict {
                tested: result.baseline_version,
                current,
            });
        }
        let version = adopt_locked(
            &mut inner,
            &result,
            BaselineSource::OperatorApproval {
                experiment_id,
                approver: approver.to_owned(),
            },
        )?;
        info!(%experiment_id, approver, baseline_version = version.version, "deferred candidate approved");
        let record = AdoptionRecord {
            experiment_id,
            decision: AdoptionDecision::Adopt,
            approver: approver.to_owned(),
            timestamp: Utc::now(),
            resulting_baseline_version: Some(version.version),
            parameter_changes: result.parameter_changes.clone(),
            reverted_to_version: None,
            reason: format!("operator approval after deferral: {}", pending.reason),
        };
        Ok(push_record(&mut inner, record))
    }

    /// Refuse a deferred result on an operator's word.
    ///
    /// # Errors
    /// [`GateError::NotPending`] if nothing with this id is queued.
    pub fn reject(&self, experiment_id: Uuid, approver: &str, reason: &str) -> Result<AdoptionRecord, GateError> {
        let mut inner = self.inner.lock();
        let pending = take_pending(&mut inner, experiment_id)?;
        info!(%experiment_id, approver, reason, "deferred candidate rejected");
        let record = AdoptionRecord {
            experiment_id,
            decision: AdoptionDecision::Rejected,
            approver: approver.to_owned(),
            timestamp: Utc::now(),
            resulting_baseline_version: None,
            parameter_changes: pending.result.parameter_changes,
            reverted_to_version: None,
            reason: reason.to_owned(),
        };
        Ok(push_record(&mut inner, record))
    }

    /// Feed one completed production window to the rollback rule.
    ///
    /// Windows that did not run entirely under the adopted version (closed
    /// under an older baseline, or straddling the switch) are ignored.
    /// Returns the ROLLED_BACK record when this window completes the
    /// regression streak.
    ///
    /// # Errors
    /// [`GateError::Baseline`] if the prior version cannot be restored.
    ///
    /// # Panics
    /// This function never panics.
    pub fn observe_production_window(&self, window: &ProductionWindow) -> Result<Option<AdoptionRecord>, GateError> {
        let mut inner = self.inner.lock();
        let tolerance = inner.config.rollback_tolerance;
        let needed = inner.config.rollback_windows.max(1);
        let probation_windows = inner.config.probation_windows.max(1);
        let Some(probation) = inner.probation.as_mut() else {
            return Ok(None);
        };
        if window.baseline_version != probation.adopted_version || !window.uniform_baseline {
            debug!(
                window = window.index,
                window_version = window.baseline_version,
                adopted_version = probation.adopted_version,
                uniform = window.uniform_baseline,
                "window not under adopted baseline, skipped by rollback rule"
            );
            return Ok(None);
        }

        let composite = window.composite;
        let floor = probation.expected_composite * (1.0 - tolerance);
        if composite < floor {
            probation.regressed_streak += 1;
            warn!(
                experiment_id = %probation.experiment_id,
                composite,
                floor,
                streak = probation.regressed_streak,
                "production window regressed after adoption"
            );
        } else {
            probation.regressed_streak = 0;
            probation.clean_windows += 1;
        }

        if probation.regressed_streak < needed {
            if probation.clean_windows >= probation_windows {
                info!(
                    experiment_id = %probation.experiment_id,
                    baseline_version = probation.adopted_version,
                    clean_windows = probation.clean_windows,
                    "adoption passed probation"
                );
                inner.probation = None;
            }
            persist(&inner);
            return Ok(None);
        }

        let probation = probation.clone();
        inner.probation = None;
        let prior = inner.store.get(probation.prior_version)?;
        let restored = inner.store.publish(
            prior.config,
            BaselineSource::Rollback {
                from_version: probation.adopted_version,
                to_version: probation.prior_version,
            },
            format!("rollback of experiment {}", probation.experiment_id),
        )?;
        inner.baseline_tx.send_replace(restored.clone());
        metrics::inc_rollback();
        metrics::set_baseline_version(restored.version);

        let message = format!(
            "{} consecutive regressed windows after adopting v{}; restored v{} as v{}",
            probation.regressed_streak, probation.adopted_version, probation.prior_version, restored.version
        );
        error!(
            experiment_id = %probation.experiment_id,
            from_version = probation.adopted_version,
            to_version = probation.prior_version,
            baseline_version = restored.version,
            "automatic rollback"
        );
        let _ = self.alerts.send(OperatorAlert {
            kind: AlertKind::Rollback,
            experiment_id: probation.experiment_id,
            baseline_version: restored.version,
            message: message.clone(),
            raised_at: Utc::now(),
        });

        let record = AdoptionRecord {
            experiment_id: probation.experiment_id,
            decision: AdoptionDecision::RolledBack,
            approver: AUTO_APPROVER.to_owned(),
            timestamp: Utc::now(),
            resulting_baseline_version: Some(restored.version),
            parameter_changes: probation.changes.iter().map(ParameterDelta::inverse).collect(),
            reverted_to_version: Some(probation.prior_version),
            reason: message,
        };
        Ok(Some(push_record(&mut inner, record)))
    }
}

fn ledger_of(inner: &GateInner) -> GateLedger {
    GateLedger {
        versions: inner.store.history(),
        history: inner.history.clone(),
        pending: inner.pending.clone(),
        probation: inner.probation.clone(),
    }
}

fn persist(inner: &GateInner) {
    let Some(path) = inner.config.ledger_path.as_deref() else {
        return;
    };
    write_ledger(path, &ledger_of(inner));
}

fn write_ledger(path: &Path, ledger: &GateLedger) {
    match checkpoint::write_json(path, ledger) {
        Ok(()) => debug!(path = %path.display(), records = ledger.history.len(), "adoption ledger written"),
        Err(e) => warn!(path = %path.display(), error = %e, "adoption ledger write failed"),
    }
}

fn take_pending(inner: &mut GateInner, experiment_id: Uuid) -> Result<PendingApproval, GateError> {
    let idx = inner
        .pending
        .iter()
        .position(|p| p.result.experiment_id == experiment_id)
        .ok_or(GateError::NotPending(experiment_id))?;
    Ok(inner.pending.remove(idx))
}

fn push_record(inner: &mut GateInner, record: AdoptionRecord) -> AdoptionRecord {
    metrics::inc_adoption_decision(record.decision.as_str());
    inner.history.push(record.clone());
    persist(inner);
    record
}

fn adopt_locked(
    inner: &mut GateInner,
    result: &ExperimentResult,
    source: BaselineSource,
) -> Result<BaselineVersion, GateError> {
    let prior = inner.store.current();
    let config = prior
        .config
        .with_deltas(&result.parameter_changes)
        .map_err(|e| GateError::InvalidCandidate(e.to_string()))?;
    let version = inner.store.publish(
        config,
        source,
        format!("adopt experiment {}", result.experiment_id),
    )?;
    inner.baseline_tx.send_replace(version.clone());
    metrics::set_baseline_version(version.version);
    inner.probation = Some(Probation {
        experiment_id: result.experiment_id,
        expected_composite: result.composite_score_candidate,
        adopted_version: version.version,
        prior_version: prior.version,
        changes: result.parameter_changes.clone(),
        regressed_streak: 0,
        clean_windows: 0,
    });
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::ThresholdConfig;
    use crate::self_tune::analyst::MetricSummary;

    fn result(baseline_version: u64, deltas: Vec<ParameterDelta>, recommendation: Recommendation) -> ExperimentResult {
        ExperimentResult {
            experiment_id: Uuid::new_v4(),
            candidate_id: Uuid::new_v4(),
            baseline_version,
            parameter_changes: deltas,
            replicas_per_arm: 5,
            duration_ticks: 3_600,
            control_metrics_summary: MetricSummary::default(),
            candidate_metrics_summary: MetricSummary::default(),
            p_value: 0.001,
            effect_size: 1.2,
            composite_score_control: 0.6,
            composite_score_candidate: 0.7,
            improvement_pct: 0.16,
            regressions: Vec::new(),
            recommendation,
            completed_at: Utc::now(),
        }
    }

    fn gate() -> AdoptionGate {
        AdoptionGate::new(
            GateConfig::default(),
            BaselineStore::new(ThresholdConfig::default()).unwrap(),
        )
    }

    fn small(p: Parameter, r: f64) -> Vec<ParameterDelta> {
        vec![ParameterDelta::new(p, r)]
    }

    fn window(baseline_version: u64, composite: f64) -> ProductionWindow {
        ProductionWindow {
            index: 0,
            start_tick: 0,
            end_tick: 59,
            baseline_version,
            uniform_baseline: true,
            metrics: crate::self_tune::score::MetricVector::default(),
            composite,
        }
    }

    #[test]
    fn test_non_adopt_recommendation_is_rejected() {
        let g = gate();
        let rec = g
            .consider(&result(1, small(Parameter::ThetaErrorHot, 0.1), Recommendation::Inconclusive))
            .unwrap();
        assert_eq!(rec.decision, AdoptionDecision::Rejected);
        assert_eq!(g.current_baseline().version, 1);
    }

    #[test]
    fn test_adopt_publishes_new_baseline() {
        let g = gate();
        let mut rx = g.subscribe_baseline();
        let rec = g
            .consider(&result(1, small(Parameter::ThetaErrorHot, 0.1), Recommendation::Adopt))
            .unwrap();
        assert_eq!(rec.decision, AdoptionDecision::Adopt);
        assert_eq!(rec.resulting_baseline_version, Some(2));
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().version, 2);
        let expected = ThresholdConfig::default().theta_e_hot * 1.1;
        assert!((g.current_baseline().config.theta_e_hot - expected).abs() < 1e-12);
    }

    #[test]
    fn test_stale_result_is_conflict() {
        let g = gate();
        g.consider(&result(1, small(Parameter::ThetaErrorHot, 0.1), Recommendation::Adopt))
            .unwrap();
        let err = g
            .consider(&result(1, small(Parameter::DecaySpare, 0.1), Recommendation::Adopt))
            .unwrap_err();
        assert_eq!(err, GateError::Conflict { tested: 1, current: 2 });
        assert_eq!(g.history().len(), 1);
    }

    #[test]
    fn test_large_change_is_deferred_then_approved() {
        let g = gate();
        let mut alerts = g.subscribe_alerts();
        let r = result(1, small(Parameter::ThetaLatencyHot, 0.2), Recommendation::Adopt);
        let rec = g.consider(&r).unwrap();
        assert_eq!(rec.decision, AdoptionDecision::Deferred);
        assert_eq!(g.pending().len(), 1);
        assert_eq!(alerts.try_recv().unwrap().kind, AlertKind::ApprovalRequested);

        let approved = g.approve(r.experiment_id, "oncall").unwrap();
        assert_eq!(approved.decision, AdoptionDecision::Adopt);
        assert_eq!(approved.approver, "oncall");
        assert!(g.pending().is_empty());
        assert_eq!(g.current_baseline().version, 2);
        assert!(matches!(
            g.current_baseline().source,
            BaselineSource::OperatorApproval { .. }
        ));
    }

    #[test]
    fn test_deferred_reject_and_unknown_id() {
        let g = gate();
        let r = result(1, small(Parameter::QuorumThreshold, -0.2), Recommendation::Adopt);
        g.consider(&r).unwrap();
        let rec = g.reject(r.experiment_id, "oncall", "too risky").unwrap();
        assert_eq!(rec.decision, AdoptionDecision::Rejected);
        assert_eq!(
            g.reject(r.experiment_id, "oncall", "again").unwrap_err(),
            GateError::NotPending(r.experiment_id)
        );
    }

    #[test]
    fn test_direction_flips_counts_adoptions_and_rollbacks() {
        let mk = |decision, r| AdoptionRecord {
            experiment_id: Uuid::new_v4(),
            decision,
            approver: AUTO_APPROVER.to_owned(),
            timestamp: Utc::now(),
            resulting_baseline_version: None,
            parameter_changes: small(Parameter::ThetaErrorHot, r),
            reverted_to_version: None,
            reason: String::new(),
        };
        let history = vec![
            mk(AdoptionDecision::Adopt, 0.1),
            mk(AdoptionDecision::Rejected, -0.1),
            mk(AdoptionDecision::RolledBack, -0.09),
        ];
        assert_eq!(direction_flips(&history, Parameter::ThetaErrorHot, 1, 6), 2);
        assert_eq!(direction_flips(&history, Parameter::ThetaErrorHot, -1, 6), 1);
        assert_eq!(direction_flips(&history, Parameter::DecayError, 1, 6), 0);
    }

    #[test]
    fn test_no_rollback_without_probation() {
        let g = gate();
        assert_eq!(g.observe_production_window(&window(1, 0.0)).unwrap(), None);
    }

    #[test]
    fn test_recovered_window_resets_streak() {
        let g = gate();
        g.consider(&result(1, small(Parameter::DecayLatency, 0.1), Recommendation::Adopt))
            .unwrap();
        assert!(g.observe_production_window(&window(2, 0.1)).unwrap().is_none());
        assert!(g.observe_production_window(&window(2, 0.1)).unwrap().is_none());
        assert!(g.observe_production_window(&window(2, 0.7)).unwrap().is_none());
        assert!(g.observe_production_window(&window(2, 0.1)).unwrap().is_none());
        assert!(g.observe_production_window(&window(2, 0.1)).unwrap().is_none());
        let rec = g.observe_production_window(&window(2, 0.1)).unwrap().unwrap();
        assert_eq!(rec.decision, AdoptionDecision::RolledBack);
    }

    #[test]
    fn test_windows_before_switch_do_not_count() {
        let g = gate();
        g.consider(&result(1, small(Parameter::DecayLatency, 0.1), Recommendation::Adopt))
            .unwrap();
        // Bad windows still closing under v1, then one straddling the switch.
        for _ in 0..5 {
            assert!(g.observe_production_window(&window(1, 0.0)).unwrap().is_none());
        }
        let straddling = ProductionWindow {
            uniform_baseline: false,
            ..window(2, 0.0)
        };
        assert!(g.observe_production_window(&straddling).unwrap().is_none());
        assert_eq!(g.current_baseline().version, 2);
        assert_eq!(g.ledger().probation.map(|p| p.regressed_streak), Some(0));

        // Fully post-switch regressions still roll back.
        g.observe_production_window(&window(2, 0.0)).unwrap();
        g.observe_production_window(&window(2, 0.0)).unwrap();
        let rec = g.observe_production_window(&window(2, 0.0)).unwrap().unwrap();
        assert_eq!(rec.decision, AdoptionDecision::RolledBack);
    }

    #[test]
    fn test_probation_ends_after_clean_windows() {
        let config = GateConfig {
            probation_windows: 4,
            ..GateConfig::default()
        };
        let g = AdoptionGate::new(config, BaselineStore::new(ThresholdConfig::default()).unwrap());
        g.consider(&result(1, small(Parameter::DecayLatency, 0.1), Recommendation::Adopt))
            .unwrap();
        for _ in 0..4 {
            g.observe_production_window(&window(2, 0.7)).unwrap();
        }
        assert!(g.ledger().probation.is_none());
        for _ in 0..5 {
            assert!(g.observe_production_window(&window(2, 0.0)).unwrap().is_none());
        }
        assert_eq!(g.current_baseline().version, 2);
    }

    #[test]
    fn test_stale_approval_leaves_terminal_record() {
        let g = gate();
        let big = result(1, small(Parameter::QuorumThreshold, 0.2), Recommendation::Adopt);
        g.consider(&big).unwrap();
        g.consider(&result(1, small(Parameter::DecayError, 0.1), Recommendation::Adopt))
            .unwrap();
        assert_eq!(
            g.approve(big.experiment_id, "oncall").unwrap_err(),
            GateError::Conflict { tested: 1, current: 2 }
        );
        let last = g.history().pop().unwrap();
        assert_eq!(last.experiment_id, big.experiment_id);
        assert_eq!(last.decision, AdoptionDecision::Rejected);
        assert_eq!(last.approver, "oncall");
        assert!(last.reason.contains("stale"));
    }

    #[test]
    fn test_ledger_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = GateConfig {
            ledger_path: Some(dir.path().join("ledger.json")),
            ..GateConfig::default()
        };
        let g = AdoptionGate::open(config.clone(), ThresholdConfig::default(), None).unwrap();
        g.consider(&result(1, small(Parameter::ThetaErrorHot, 0.1), Recommendation::Adopt))
            .unwrap();
        let deferred = result(2, small(Parameter::ThetaLatencyHot, 0.2), Recommendation::Adopt);
        g.consider(&deferred).unwrap();
        let before = g.ledger();
        drop(g);

        let reopened = AdoptionGate::open(config, ThresholdConfig::default(), None).unwrap();
        let after = reopened.ledger();
        assert_eq!(after.versions.len(), before.versions.len());
        assert_eq!(after.history.len(), before.history.len());
        assert_eq!(after.history[1].decision, AdoptionDecision::Deferred);
        assert_eq!(reopened.current_baseline().version, 2);
        let expected = ThresholdConfig::default().theta_e_hot * 1.1;
        assert!((reopened.current_baseline().config.theta_e_hot - expected).abs() < 1e-12);
        assert_eq!(reopened.pending().len(), 1);
        assert!(reopened.ledger().probation.is_some());
    }

    #[test]
    fn test_corrupt_ledger_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, b"{not json").unwrap();
        let config = GateConfig {
            ledger_path: Some(path),
            ..GateConfig::default()
        };
        assert!(matches!(
            AdoptionGate::open(config, ThresholdConfig::default(), None),
            Err(GateError::Ledger(_))
        ));
    }
}
