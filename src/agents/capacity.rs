//! Capacity agents: step the service quality level down under latency
//! pressure and back up when the service is calm with capacity to spare.

use tracing::debug;

use super::{ActionKind, AgentAction, AgentInput, AgentKind, AgentState, OperationalAgent};

/// Quality steps per action.
const QUALITY_STEP: f64 = 1.0;

/// Shared cooldown bookkeeping. The cooldown counts down first, so an agent
/// that acted on tick `t` may act again on tick `t + cooldown_ticks`.
fn tick_cooldown(state: &AgentState) -> AgentState {
    AgentState {
        active: false,
        cooldown_remaining: state.cooldown_remaining.saturating_sub(1),
        clean_streak: 0,
    }
}

/// Acts when `approved && L_hot && cooldown == 0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityReduction;

impl OperationalAgent for CapacityReduction {
    fn kind(&self) -> AgentKind {
        AgentKind::CapacityReduction
    }

    fn consider(&self, input: &AgentInput<'_>, state: &AgentState) -> (AgentState, Option<AgentAction>) {
        let mut next = tick_cooldown(state);
        let triggered = input.evaluation.approved && input.evaluation.crossings.latency_hot;
        if !triggered || next.cooldown_remaining > 0 {
            return (next, None);
        }
        if input.plant.quality <= input.config.quality_floor {
            debug!(
                tick = input.tick,
                agent = %self.kind(),
                quality = input.plant.quality,
                "already at quality floor, no-op"
            );
            return (next, None);
        }
        next.active = true;
        next.cooldown_remaining = input.config.cooldown_ticks;
        let action = AgentAction {
            component_id: input.targets.latency.clone(),
            kind: ActionKind::ReduceQuality,
            magnitude: QUALITY_STEP,
            tick: input.tick,
        };
        (next, Some(action))
    }
}

/// Acts when `!L_hot && S_high && cooldown == 0`. Quorum approval plays no
/// part; `!L_hot` alone keeps it exclusive with [`CapacityReduction`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityIncrease;

impl OperationalAgent for CapacityIncrease {
    fn kind(&self) -> AgentKind {
        AgentKind::CapacityIncrease
    }

    fn consider(&self, input: &AgentInput<'_>, state: &AgentState) -> (AgentState, Option<AgentAction>) {
        let mut next = tick_cooldown(state);
        let c = &input.evaluation.crossings;
        let triggered = !c.latency_hot && c.spare_high;
        if !triggered || next.cooldown_remaining > 0 {
            return (next, None);
        }
        if input.plant.quality >= input.config.quality_ceiling {
            debug!(
                tick = input.tick,
                agent = %self.kind(),
                quality = input.plant.quality,
                "already at quality ceiling, no-op"
            );
            return (next, None);
        }
        next.active = true;
        next.cooldown_remaining = input.config.cooldown_ticks;
        let action = AgentAction {
            component_id: input.targets.spare.clone(),
            kind: ActionKind::IncreaseQuality,
            magnitude: QUALITY_STEP,
            tick: input.tick,
        };
        (next, Some(action))
    }
}
