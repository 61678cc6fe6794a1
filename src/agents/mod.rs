//! # Operational Agent Set
//!
//! ## Responsibility
//! Turn the quorum decision of one tick into concrete remediation actions:
//! lower or raise the service quality level, quarantine or release a
//! component. Owns the agent cooldowns and the plant state they act upon.
//!
//! ## Guarantees
//! - Mutual exclusion: capacity-increase is gated on `!L_hot` and
//!   capacity-reduction on `L_hot`, so both never act on the same tick
//! - Bounded: quality stays within `[quality_floor, quality_ceiling]`;
//!   an action that would leave the range is a logged no-op with no cooldown
//! - Deterministic: [`AgentSet::step`] depends only on its inputs and the
//!   set's own state
//!
//! ## NOT Responsible For
//! - Deciding *whether* the service is stressed (see `field::threshold`)
//! - Delivering actions to the service (see `control::runtime`)

pub mod capacity;
pub mod isolation;

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::field::{ComponentId, Evaluation, FieldState, Signal, SignalProcessor};
use crate::metrics;

pub use capacity::{CapacityIncrease, CapacityReduction};
pub use isolation::Isolation;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Tunables shared by every agent in the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct AgentConfig {
    /// Ticks a capacity agent waits after acting before it may act again.
    pub cooldown_ticks: u32,
    /// Lowest quality level the reduction agent may reach.
    pub quality_floor: u32,
    /// Highest quality level; also the starting level.
    pub quality_ceiling: u32,
    /// Consecutive ticks without `E_hot` before a quarantine is lifted.
    pub isolation_release_ticks: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cooldown_ticks: 30,
            quality_floor: 1,
            quality_ceiling: 10,
            isolation_release_ticks: 10,
        }
    }
}

// ─── Identity & actions ──────────────────────────────────────────────────────

/// The three named agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Lowers the quality level under latency pressure.
    CapacityReduction,
    /// Raises the quality level when spare capacity is high and all is calm.
    CapacityIncrease,
    /// Quarantines the component with the most error pressure.
    Isolation,
}

impl AgentKind {
    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::CapacityReduction => "capacity_reduction",
            AgentKind::CapacityIncrease => "capacity_increase",
            AgentKind::Isolation => "isolation",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an action does to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Quality level down by `magnitude` steps.
    ReduceQuality,
    /// Quality level up by `magnitude` steps.
    IncreaseQuality,
    /// Stop routing work to the component.
    Quarantine,
    /// Resume routing work to a previously quarantined component.
    Release,
}

impl ActionKind {
    /// The agent that emits this kind of action.
    pub fn agent(self) -> AgentKind {
        match self {
            ActionKind::ReduceQuality => AgentKind::CapacityReduction,
            ActionKind::IncreaseQuality => AgentKind::CapacityIncrease,
            ActionKind::Quarantine | ActionKind::Release => AgentKind::Isolation,
        }
    }

    /// `-1` for reduce, `+1` for increase, `0` otherwise.
    pub fn capacity_direction(self) -> i8 {
        match self {
            ActionKind::ReduceQuality => -1,
            ActionKind::IncreaseQuality => 1,
            ActionKind::Quarantine | ActionKind::Release => 0,
        }
    }

    /// Reduction and quarantine are corrective; the rest restore service.
    pub fn is_corrective(self) -> bool {
        matches!(self, ActionKind::ReduceQuality | ActionKind::Quarantine)
    }
}

/// One remediation emitted to the managed service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    /// Component the action targets.
    pub component_id: ComponentId,
    /// What to do.
    pub kind: ActionKind,
    /// Size of the change (quality steps, or `1.0` for quarantine toggles).
    pub magnitude: f64,
    /// Tick on which the action was decided.
    pub tick: u64,
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Per-agent state.
///
/// `cooldown_remaining` only ever counts down, except when the agent acts
/// and it is reset to the configured cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentState {
    /// Capacity agents: acted this tick. Isolation: quarantine in force.
    pub active: bool,
    /// Ticks until a capacity agent may act again.
    pub cooldown_remaining: u32,
    /// Isolation only: consecutive ticks without `E_hot` while quarantined.
    pub clean_streak: u32,
}

/// The part of the managed service the agents change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlantState {
    /// Current quality level.
    pub quality: u32,
    /// Component currently quarantined, if any.
    pub quarantined: Option<ComponentId>,
}

/// What an agent sees when it decides.
#[derive(Debug, Clone, Copy)]
pub struct AgentInput<'a> {
    /// Current tick.
    pub tick: u64,
    /// Crossings and quorum for this tick.
    pub evaluation: &'a Evaluation,
    /// Aggregate field values for this tick.
    pub field: &'a FieldState,
    /// Plant state before any action of this tick.
    pub plant: &'a PlantState,
    /// Component with the most pressure per channel.
    pub targets: &'a Targets,
    /// Shared agent tunables.
    pub config: &'a AgentConfig,
}

/// Hottest component per channel, as reported by the signal processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    /// Most error pressure.
    pub error: ComponentId,
    /// Most latency pressure.
    pub latency: ComponentId,
    /// Most spare capacity.
    pub spare: ComponentId,
}

impl Targets {
    /// Read the hottest components from a processor.
    pub fn from_processor(processor: &SignalProcessor) -> Self {
        Self {
            error: processor.hottest(Signal::Error).clone(),
            latency: processor.hottest(Signal::Latency).clone(),
            spare: processor.hottest(Signal::Spare).clone(),
        }
    }

    /// The same component on every channel.
    pub fn uniform(component: ComponentId) -> Self {
        Self {
            error: component.clone(),
            latency: component.clone(),
            spare: component,
        }
    }
}

/// One operational agent: a pure decision over its own state.
pub trait OperationalAgent {
    /// Which agent this is.
    fn kind(&self) -> AgentKind;

    /// Decide for one tick. Returns the agent's next state and, if it acts,
    /// the action to apply.
    fn consider(&self, input: &AgentInput<'_>, state: &AgentState) -> (AgentState, Option<AgentAction>);
}

// ─── AgentSet ────────────────────────────────────────────────────────────────

/// Serializable snapshot of an [`AgentSet`] for checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSetSnapshot {
    /// Capacity-reduction state.
    pub reduction: AgentState,
    /// Capacity-increase state.
    pub increase: AgentState,
    /// Isolation state.
    pub isolation: AgentState,
    /// Plant state.
    pub plant: PlantState,
}

/// The three agents plus the plant they share.
#[derive(Debug, Clone)]
pub struct AgentSet {
    config: AgentConfig,
    reduction: AgentState,
    increase: AgentState,
    isolation: AgentState,
    plant: PlantState,
}

impl AgentSet {
    /// New set at full quality with nothing quarantined.
    pub fn new(config: AgentConfig) -> Self {
        let plant = PlantState {
            quality: config.quality_ceiling,
            quarantined: None,
        };
        Self {
            config,
            reduction: AgentState::default(),
            increase: AgentState::default(),
            isolation: AgentState::default(),
            plant,
        }
    }

    /// Run every agent for one tick, apply their actions to the plant and
    /// return them in the order they were applied.
    ///
    /// # Panics
    /// This function never panics.
    pub fn step(
        &mut self,
        tick: u64,
        evaluation: &Evaluation,
        field: &FieldState,
        targets: &Targets,
    ) -> Vec<AgentAction> {
        let mut actions = Vec::new();
        let plant = self.plant.clone();
        let input = AgentInput {
            tick,
            evaluation,
            field,
            plant: &plant,
            targets,
            config: &self.config,
        };

        let (reduction, a) = CapacityReduction.consider(&input, &self.reduction);
        let (increase, b) = CapacityIncrease.consider(&input, &self.increase);
        let (isolation, c) = Isolation.consider(&input, &self.isolation);
        self.reduction = reduction;
        self.increase = increase;
        self.isolation = isolation;

        for action in [a, b, c].into_iter().flatten() {
            self.apply(&action);
            metrics::inc_agent_action(action.kind.agent().as_str());
            info!(
                tick,
                agent = %action.kind.agent(),
                component = %action.component_id,
                kind = ?action.kind,
                quality = self.plant.quality,
                "agent acted"
            );
            actions.push(action);
        }
        if actions.is_empty() && evaluation.approved {
            debug!(tick, quorum = evaluation.quorum, "quorum approved but no agent acted");
        }
        actions
    }

    fn apply(&mut self, action: &AgentAction) {
        let steps = action.magnitude.max(0.0) as u32;
        match action.kind {
            ActionKind::ReduceQuality => {
                self.plant.quality = self
                    .plant
                    .quality
                    .saturating_sub(steps)
                    .max(self.config.quality_floor);
            }
            ActionKind::IncreaseQuality => {
                self.plant.quality = self
                    .plant
                    .quality
                    .saturating_add(steps)
                    .min(self.config.quality_ceiling);
            }
            ActionKind::Quarantine => self.plant.quarantined = Some(action.component_id.clone()),
            ActionKind::Release => self.plant.quarantined = None,
        }
    }

    /// State of one agent.
    pub fn state(&self, kind: AgentKind) -> &AgentState {
        match kind {
            AgentKind::CapacityReduction => &self.reduction,
            AgentKind::CapacityIncrease => &self.increase,
            AgentKind::Isolation => &self.isolation,
        }
    }

    /// Current plant state.
    pub fn plant(&self) -> &PlantState {
        &self.plant
    }

    /// Agent configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Capture everything needed to resume.
    pub fn snapshot(&self) -> AgentSetSnapshot {
        AgentSetSnapshot {
            reduction: self.reduction,
            increase: self.increase,
            isolation: self.isolation,
            plant: self.plant.clone(),
        }
    }

    /// Resume from a snapshot. Quality is clamped into the configured range.
    pub fn restore(&mut self, snapshot: AgentSetSnapshot) {
        self.reduction = snapshot.reduction;
        self.increase = snapshot.increase;
        self.isolation = snapshot.isolation;
        self.plant = snapshot.plant;
        self.plant.quality = self
            .plant
            .quality
            .clamp(self.config.quality_floor, self.config.quality_ceiling);
    }
}
