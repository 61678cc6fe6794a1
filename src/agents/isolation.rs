//! Isolation agent: quarantine the component with the most error pressure
//! while errors are hot, release it after a run of clean ticks.
//!
//! One component is quarantined at a time. The agent has no cooldown.

use super::{ActionKind, AgentAction, AgentInput, AgentKind, AgentState, OperationalAgent};

/// Quarantines on `approved && E_hot`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Isolation;

impl OperationalAgent for Isolation {
    fn kind(&self) -> AgentKind {
        AgentKind::Isolation
    }

    fn consider(&self, input: &AgentInput<'_>, state: &AgentState) -> (AgentState, Option<AgentAction>) {
        let error_hot = input.evaluation.crossings.error_hot;

        match &input.plant.quarantined {
            None => {
                if input.evaluation.approved && error_hot {
                    let next = AgentState {
                        active: true,
                        cooldown_remaining: 0,
                        clean_streak: 0,
                    };
                    let action = AgentAction {
                        component_id: input.targets.error.clone(),
                        kind: ActionKind::Quarantine,
                        magnitude: 1.0,
                        tick: input.tick,
                    };
                    (next, Some(action))
                } else {
                    (AgentState::default(), None)
                }
            }
            Some(component) => {
                if error_hot {
                    let next = AgentState {
                        active: true,
                        cooldown_remaining: 0,
                        clean_streak: 0,
                    };
                    return (next, None);
                }
                let streak = state.clean_streak.saturating_add(1);
                if streak >= input.config.isolation_release_ticks {
                    let action = AgentAction {
                        component_id: component.clone(),
                        kind: ActionKind::Release,
                        magnitude: 1.0,
                        tick: input.tick,
                    };
                    (AgentState::default(), Some(action))
                } else {
                    let next = AgentState {
                        active: true,
                        cooldown_remaining: 0,
                        clean_streak: streak,
                    };
                    (next, None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentConfig, PlantState, Targets};
    use crate::field::{ComponentId, Crossings, Evaluation, FieldState};

    fn decide(error_hot: bool, approved: bool, plant: &PlantState, state: AgentState) -> (AgentState, Option<AgentAction>) {
        let evaluation = Evaluation {
            crossings: Crossings {
                error_hot,
                ..Crossings::default()
            },
            quorum: if error_hot { 0.4 } else { 0.0 },
            approved,
        };
        let targets = Targets {
            error: ComponentId::new("db"),
            latency: ComponentId::new("api"),
            spare: ComponentId::new("api"),
        };
        let config = AgentConfig {
            isolation_release_ticks: 3,
            ..AgentConfig::default()
        };
        let field = FieldState::default();
        let input = AgentInput {
            tick: 1,
            evaluation: &evaluation,
            field: &field,
            plant,
            targets: &targets,
            config: &config,
        };
        Isolation.consider(&input, &state)
    }

    fn healthy() -> PlantState {
        PlantState {
            quality: 10,
            quarantined: None,
        }
    }

    fn isolated() -> PlantState {
        PlantState {
            quality: 10,
            quarantined: Some(ComponentId::new("db")),
        }
    }

    #[test]
    fn test_quarantines_hottest_error_component() {
        let (state, action) = decide(true, true, &healthy(), AgentState::default());
        let action = action.unwrap();
        assert_eq!(action.kind, ActionKind::Quarantine);
        assert_eq!(action.component_id, ComponentId::new("db"));
        assert!(state.active);
    }

    #[test]
    fn test_no_quarantine_without_approval() {
        let (state, action) = decide(true, false, &healthy(), AgentState::default());
        assert!(action.is_none());
        assert!(!state.active);
    }

    #[test]
    fn test_releases_after_clean_streak() {
        let plant = isolated();
        let mut state = AgentState {
            active: true,
            ..AgentState::default()
        };
        for expected in 1..3 {
            let (next, action) = decide(false, false, &plant, state);
            assert!(action.is_none());
            assert_eq!(next.clean_streak, expected);
            state = next;
        }
        let (next, action) = decide(false, false, &plant, state);
        assert_eq!(action.unwrap().kind, ActionKind::Release);
        assert!(!next.active);
    }

    #[test]
    fn test_hot_tick_resets_clean_streak() {
        let state = AgentState {
            active: true,
            cooldown_remaining: 0,
            clean_streak: 2,
        };
        let (next, action) = decide(true, true, &isolated(), state);
        assert!(action.is_none());
        assert_eq!(next.clean_streak, 0);
        assert!(next.active);
    }
}
