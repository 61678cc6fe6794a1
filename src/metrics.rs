//! Prometheus metrics for the controller.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** spawning the
//! control or research loops. The helper functions (`inc_ticks`,
//! `inc_agent_action`, …) are no-ops if `init_metrics` was never called, so
//! the controller is always safe to run and observability simply degrades.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `field_controller_ticks_total` | Counter | |
//! | `field_controller_field` | Gauge | `signal` |
//! | `field_controller_agent_actions_total` | Counter | `agent` |
//! | `field_controller_actions_shed_total` | Counter | |
//! | `field_controller_telemetry_gaps_total` | Counter | |
//! | `field_controller_experiments_total` | Counter | `status` |
//! | `field_controller_adoption_decisions_total` | Counter | `decision` |
//! | `field_controller_rollbacks_total` | Counter | |
//! | `field_controller_baseline_version` | Gauge | |

use crate::field::{FieldState, Signal};
use crate::ControllerError;
use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the controller, bundled together so they can
/// be stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Production ticks completed.
    pub ticks_total: IntCounter,
    /// Aggregate production field per channel.
    pub field: GaugeVec,
    /// Agent actions per agent.
    pub agent_actions: CounterVec,
    /// Actions dropped because the consumer was full.
    pub actions_shed: IntCounter,
    /// Component-ticks without telemetry.
    pub telemetry_gaps: IntCounter,
    /// Experiments per final status.
    pub experiments: CounterVec,
    /// Adoption gate decisions per kind.
    pub adoption_decisions: CounterVec,
    /// Automatic rollbacks.
    pub rollbacks: IntCounter,
    /// Active baseline version.
    pub baseline_version: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> Result<C, ControllerError> {
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| ControllerError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn init_err(e: prometheus::Error) -> ControllerError {
    ControllerError::Other(format!("metrics init failed: {e}"))
}

fn build(prefix: &str) -> Result<Metrics, ControllerError> {
    let registry = Registry::new();
    let name = |n: &str| format!("{prefix}_{n}");

    let ticks_total = register(
        &registry,
        IntCounter::new(name("ticks_total"), "Production ticks completed").map_err(init_err)?,
    )?;
    let field = register(
        &registry,
        GaugeVec::new(Opts::new(name("field"), "Aggregate production field"), &["signal"]).map_err(init_err)?,
    )?;
    let agent_actions = register(
        &registry,
        CounterVec::new(Opts::new(name("agent_actions_total"), "Agent actions"), &["agent"]).map_err(init_err)?,
    )?;
    let actions_shed = register(
        &registry,
        IntCounter::new(name("actions_shed_total"), "Actions dropped on a full queue").map_err(init_err)?,
    )?;
    let telemetry_gaps = register(
        &registry,
        IntCounter::new(name("telemetry_gaps_total"), "Component ticks without telemetry").map_err(init_err)?,
    )?;
    let experiments = register(
        &registry,
        CounterVec::new(Opts::new(name("experiments_total"), "Experiments by outcome"), &["status"])
            .map_err(init_err)?,
    )?;
    let adoption_decisions = register(
        &registry,
        CounterVec::new(
            Opts::new(name("adoption_decisions_total"), "Adoption gate decisions"),
            &["decision"],
        )
        .map_err(init_err)?,
    )?;
    let rollbacks = register(
        &registry,
        IntCounter::new(name("rollbacks_total"), "Automatic baseline rollbacks").map_err(init_err)?,
    )?;
    let baseline_version = register(
        &registry,
        IntGauge::new(name("baseline_version"), "Active baseline version").map_err(init_err)?,
    )?;

    Ok(Metrics {
        registry,
        ticks_total,
        field,
        agent_actions,
        actions_shed,
        telemetry_gaps,
        experiments,
        adoption_decisions,
        rollbacks,
        baseline_version,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`ControllerError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), ControllerError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build("field_controller")?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one production tick. No-op before init.
pub fn inc_ticks() {
    if let Some(m) = metrics() {
        m.ticks_total.inc();
    }
}

/// Publish the aggregate production field. No-op before init.
pub fn set_field(field: &FieldState) {
    if let Some(m) = metrics() {
        for signal in Signal::ALL {
            if let Ok(g) = m.field.get_metric_with_label_values(&[signal.as_str()]) {
                g.set(field.get(signal));
            }
        }
    }
}

/// Count one agent action. No-op before init.
pub fn inc_agent_action(agent: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.agent_actions.get_metric_with_label_values(&[agent]) {
            c.inc();
        }
    }
}

/// Count one shed action. No-op before init.
pub fn inc_actions_shed() {
    if let Some(m) = metrics() {
        m.actions_shed.inc();
    }
}

/// Count components that missed telemetry this tick. No-op before init.
pub fn inc_telemetry_gaps(n: u64) {
    if let Some(m) = metrics() {
        m.telemetry_gaps.inc_by(n);
    }
}

/// Count one finished experiment by status. No-op before init.
pub fn inc_experiment_outcome(status: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.experiments.get_metric_with_label_values(&[status]) {
            c.inc();
        }
    }
}

/// Count one adoption gate decision. No-op before init.
pub fn inc_adoption_decision(decision: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.adoption_decisions.get_metric_with_label_values(&[decision]) {
            c.inc();
        }
    }
}

/// Count one automatic rollback. No-op before init.
pub fn inc_rollback() {
    if let Some(m) = metrics() {
        m.rollbacks.inc();
    }
}

/// Publish the active baseline version. No-op before init.
pub fn set_baseline_version(version: u64) {
    if let Some(m) = metrics() {
        m.baseline_version.set(i64::try_from(version).unwrap_or(i64::MAX));
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// A structured snapshot of the labelled counters, for the operator console.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricsSummary {
    /// Production ticks completed.
    pub ticks: u64,
    /// Agent actions keyed by agent.
    pub agent_actions: HashMap<String, u64>,
    /// Experiments keyed by status.
    pub experiments: HashMap<String, u64>,
    /// Gate decisions keyed by decision.
    pub adoption_decisions: HashMap<String, u64>,
    /// Automatic rollbacks.
    pub rollbacks: u64,
}

fn by_label(vec: &CounterVec, label: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for family in vec.collect() {
        for metric in family.get_metric() {
            let key = metric
                .get_label()
                .iter()
                .find(|l| l.get_name() == label)
                .map_or("unknown", |l| l.get_value());
            out.insert(key.to_string(), metric.get_counter().get_value() as u64);
        }
    }
    out
}

fn summarize(m: &Metrics) -> MetricsSummary {
    MetricsSummary {
        ticks: m.ticks_total.get(),
        agent_actions: by_label(&m.agent_actions, "agent"),
        experiments: by_label(&m.experiments, "status"),
        adoption_decisions: by_label(&m.adoption_decisions, "decision"),
        rollbacks: m.rollbacks.get(),
    }
}

/// Return a structured summary of current metric counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    metrics().map_or_else(MetricsSummary::default, summarize)
}
