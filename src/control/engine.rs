//! One synchronous tick of the operational layer: process signals, evaluate
//! the quorum, let the agents act.
//!
//! Shared by the production loop and by every experiment instance so both
//! run exactly the same control logic.

use crate::agents::{AgentAction, AgentConfig, AgentSet, Targets};
use crate::field::{evaluate, Evaluation, FieldState, SignalProcessor, SignalSample, ThresholdConfig};

/// Everything one tick produced.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    /// Tick index.
    pub tick: u64,
    /// Aggregate field after the tick.
    pub field: FieldState,
    /// Crossings and quorum on that field.
    pub evaluation: Evaluation,
    /// Actions applied this tick, in order.
    pub actions: Vec<AgentAction>,
}

/// Processor, thresholds and agents of one instance.
///
/// Exactly one owner mutates an engine; it is never shared across threads.
#[derive(Debug, Clone)]
pub struct ControlEngine {
    processor: SignalProcessor,
    thresholds: ThresholdConfig,
    agents: AgentSet,
}

impl ControlEngine {
    /// Assemble an engine from its parts.
    pub fn new(processor: SignalProcessor, thresholds: ThresholdConfig, agents: AgentConfig) -> Self {
        Self {
            processor,
            thresholds,
            agents: AgentSet::new(agents),
        }
    }

    /// Run one tick.
    ///
    /// # Panics
    /// This function never panics.
    pub fn step(&mut self, tick: u64, samples: &[SignalSample]) -> TickOutcome {
        let field = self.processor.tick(samples, &self.thresholds);
        let evaluation = evaluate(&field, &self.thresholds);
        let targets = Targets::from_processor(&self.processor);
        let actions = self.agents.step(tick, &evaluation, &field, &targets);
        TickOutcome {
            tick,
            field,
            evaluation,
            actions,
        }
    }

    /// Swap in a new threshold config. Field and agent state carry over.
    pub fn set_thresholds(&mut self, thresholds: ThresholdConfig) {
        self.thresholds = thresholds;
    }

    /// Current thresholds.
    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    /// The signal processor.
    pub fn processor(&self) -> &SignalProcessor {
        &self.processor
    }

    /// Mutable processor access, for checkpoint restore.
    pub fn processor_mut(&mut self) -> &mut SignalProcessor {
        &mut self.processor
    }

    /// The agent set.
    pub fn agents(&self) -> &AgentSet {
        &self.agents
    }

    /// Mutable agent access, for checkpoint restore.
    pub fn agents_mut(&mut self) -> &mut AgentSet {
        &mut self.agents
    }
}
