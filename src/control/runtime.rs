//! # Production Control Loop
//!
//! ## Responsibility
//! Drive a [`ControlEngine`] against live telemetry on a fixed interval and
//! hand its decisions to the managed service.
//!
//! ## Guarantees
//! - Never blocks: telemetry is drained with `try_recv`, actions and windows
//!   go out with `try_send` and are shed (and counted) when the consumer is
//!   full, checkpoints are handed to a background writer
//! - One writer: the loop task is the only mutator of the production field
//!   and agent state
//! - Baseline follow: a new baseline published by the adoption gate takes
//!   effect on the next tick; field and agent state carry over
//!
//! ## NOT Responsible For
//! - Deciding baselines (see `self_tune::gate`)
//! - Executing actions on the service (the consumer of the action channel)

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::checkpoint::{Checkpoint, CheckpointWriter};
use super::engine::{ControlEngine, TickOutcome};
use super::telemetry::{self, TelemetryFeed, TelemetrySender};
use super::window::{incident_proxy, mean_latency_ms, ProductionWindow, WindowAccumulator, WindowSettings};
use crate::agents::AgentAction;
use crate::field::{ComponentId, Evaluation, FieldState};
use crate::metrics;
use crate::self_tune::baseline::BaselineVersion;
use crate::self_tune::score::ProductionMetrics;

/// Settings of the production loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Wall-clock length of one tick.
    pub tick_interval_ms: u64,
    /// Queued telemetry samples before producers see backpressure.
    pub telemetry_capacity: usize,
    /// Queued actions before new ones are shed.
    pub action_capacity: usize,
    /// Queued production windows before new ones are shed.
    pub window_capacity: usize,
    /// Where to checkpoint; `None` disables persistence.
    pub checkpoint_path: Option<PathBuf>,
    /// Ticks per production window.
    pub window_ticks: u64,
    /// Completed windows folded into [`ProductionMetrics`].
    pub recent_windows: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            telemetry_capacity: 1_024,
            action_capacity: 256,
            window_capacity: 16,
            checkpoint_path: None,
            window_ticks: 60,
            recent_windows: 10,
        }
    }
}

/// Read-only view of production, republished every tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveView {
    /// Last completed tick.
    pub tick: u64,
    /// Baseline version in force.
    pub baseline_version: u64,
    /// Aggregate field.
    pub field: FieldState,
    /// Per-component fields.
    pub component_fields: Vec<(ComponentId, FieldState)>,
    /// Crossings and quorum.
    pub evaluation: Evaluation,
    /// Current quality level.
    pub quality: u32,
    /// Quarantined component, if any.
    pub quarantined: Option<ComponentId>,
    /// Components without telemetry on the last tick.
    pub telemetry_gaps: usize,
    /// Actions shed since start because the consumer was full.
    pub actions_shed: u64,
    /// Aggregate of recent production windows.
    pub recent: ProductionMetrics,
}

/// Channels the rest of the system uses to talk to a [`ControlLoop`].
#[derive(Debug)]
pub struct ControlPorts {
    /// Push telemetry here.
    pub telemetry: TelemetrySender,
    /// Actions for the managed service.
    pub actions: mpsc::Receiver<AgentAction>,
    /// Completed production windows.
    pub windows: mpsc::Receiver<ProductionWindow>,
    /// Live view, updated every tick.
    pub live: watch::Receiver<LiveView>,
}

/// The production loop.
#[derive(Debug)]
pub struct ControlLoop {
    engine: ControlEngine,
    feed: TelemetryFeed,
    actions_tx: mpsc::Sender<AgentAction>,
    windows_tx: mpsc::Sender<ProductionWindow>,
    live_tx: watch::Sender<LiveView>,
    baseline_rx: watch::Receiver<BaselineVersion>,
    baseline_version: u64,
    accumulator: WindowAccumulator,
    checkpoint: Option<CheckpointWriter>,
    interval: Duration,
    next_tick: u64,
    actions_shed: u64,
}

impl ControlLoop {
    /// Build a loop around `engine`, following `baseline`.
    ///
    /// The engine's thresholds are replaced by the current baseline. Must be
    /// called inside a Tokio runtime when checkpointing is enabled.
    pub fn new(
        mut engine: ControlEngine,
        mut baseline: watch::Receiver<BaselineVersion>,
        config: &RuntimeConfig,
        window: WindowSettings,
    ) -> (Self, ControlPorts) {
        let current = baseline.borrow_and_update().clone();
        engine.set_thresholds(current.config);
        let (telemetry_tx, feed) = telemetry::channel(config.telemetry_capacity);
        let (actions_tx, actions_rx) = mpsc::channel(config.action_capacity.max(1));
        let (windows_tx, windows_rx) = mpsc::channel(config.window_capacity.max(1));
        let (live_tx, live_rx) = watch::channel(LiveView {
            baseline_version: current.version,
            ..LiveView::default()
        });
        let window = WindowSettings {
            window_ticks: config.window_ticks,
            recent_windows: config.recent_windows,
            ..window
        };
        let this = Self {
            engine,
            feed,
            actions_tx,
            windows_tx,
            live_tx,
            baseline_rx: baseline,
            baseline_version: current.version,
            accumulator: WindowAccumulator::new(window),
            checkpoint: config.checkpoint_path.clone().map(CheckpointWriter::spawn),
            interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            next_tick: 0,
            actions_shed: 0,
        };
        let ports = ControlPorts {
            telemetry: telemetry_tx,
            actions: actions_rx,
            windows: windows_rx,
            live: live_rx,
        };
        (this, ports)
    }

    /// Resume field and agent state from a checkpoint.
    ///
    /// Thresholds keep following the baseline channel: the gate is opened
    /// from the same checkpoint (or its ledger), so the published version is
    /// authoritative and a disagreeing checkpoint only earns a warning.
    pub fn resume(&mut self, checkpoint: Checkpoint) {
        info!(
            tick = checkpoint.tick,
            baseline_version = checkpoint.baseline_version,
            "resuming from checkpoint"
        );
        if checkpoint.baseline_version != self.baseline_version {
            warn!(
                checkpoint_version = checkpoint.baseline_version,
                baseline_version = self.baseline_version,
                "checkpoint ran a different baseline, following the published one"
            );
        }
        self.engine
            .processor_mut()
            .restore(&checkpoint.fields, checkpoint.tick + 1);
        self.engine.agents_mut().restore(checkpoint.agents);
        self.next_tick = checkpoint.tick + 1;
    }

    /// The engine, for inspection.
    pub fn engine(&self) -> &ControlEngine {
        &self.engine
    }

    /// Next tick index.
    pub fn next_tick(&self) -> u64 {
        self.next_tick
    }

    /// Run one tick immediately.
    ///
    /// # Panics
    /// This function never panics.
    pub fn step_once(&mut self) -> TickOutcome {
        let tick = self.next_tick;
        self.next_tick += 1;

        if self.baseline_rx.has_changed().unwrap_or(false) {
            let next = self.baseline_rx.borrow_and_update().clone();
            if next.version != self.baseline_version {
                info!(
                    tick,
                    from_version = self.baseline_version,
                    baseline_version = next.version,
                    "baseline switched"
                );
                self.baseline_version = next.version;
                self.engine.set_thresholds(next.config);
            }
        }

        let drained = self.feed.drain();
        if drained.disconnected {
            debug!(tick, "all telemetry producers disconnected");
        }
        let phase = incident_proxy(
            &drained.samples,
            self.engine.processor().normalization(),
            self.engine.thresholds(),
        );
        let effective_latency_ms = mean_latency_ms(&drained.samples);

        let outcome = self.engine.step(tick, &drained.samples);
        let gaps = self.engine.processor().gaps_last_tick();
        metrics::inc_ticks();
        metrics::set_field(&outcome.field);
        if gaps > 0 {
            metrics::inc_telemetry_gaps(gaps as u64);
        }

        for action in &outcome.actions {
            match self.actions_tx.try_send(action.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.actions_shed += 1;
                    metrics::inc_actions_shed();
                    warn!(tick, agent = %action.kind.agent(), "action queue full, action shed");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(tick, "action consumer gone, action dropped");
                }
            }
        }

        let plant = self.engine.agents().plant().clone();
        if let Some(window) =
            self.accumulator
                .observe(&outcome, phase, &plant, effective_latency_ms, self.baseline_version)
        {
            debug!(index = window.index, composite = window.composite, "production window closed");
            if let Err(TrySendError::Full(_)) = self.windows_tx.try_send(window) {
                warn!(tick, "window queue full, production window shed");
            }
        }

        if let Some(writer) = &self.checkpoint {
            let submitted = writer.submit(Checkpoint {
                tick,
                baseline_version: self.baseline_version,
                thresholds: self.engine.thresholds().clone(),
                fields: self.engine.processor().component_fields(),
                agents: self.engine.agents().snapshot(),
                saved_at: Utc::now(),
            });
            if !submitted {
                debug!(tick, "checkpoint writer busy, checkpoint skipped");
            }
        }

        self.live_tx.send_replace(LiveView {
            tick,
            baseline_version: self.baseline_version,
            field: outcome.field,
            component_fields: self.engine.processor().component_fields(),
            evaluation: outcome.evaluation,
            quality: plant.quality,
            quarantined: plant.quarantined,
            telemetry_gaps: gaps,
            actions_shed: self.actions_shed,
            recent: self.accumulator.recent(),
        });
        outcome
    }

    /// Tick on the configured interval until `shutdown` turns `true` or its
    /// sender is dropped, then flush the checkpoint writer.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "control loop started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.step_once();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(tick = self.next_tick, "control loop stopped");
        if let Some(writer) = self.checkpoint.take() {
            writer.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{ActionKind, AgentConfig};
    use crate::field::{Normalization, SignalProcessor, SignalSample, ThresholdConfig};
    use crate::self_tune::baseline::{BaselineSource, BaselineStore};
    use crate::self_tune::score::CompositeWeights;

    fn window() -> WindowSettings {
        WindowSettings {
            window_ticks: 60,
            thrash_window_ticks: 120,
            response_target_ms: 500.0,
            quality_ceiling: 10,
            weights: CompositeWeights::default(),
            recent_windows: 10,
        }
    }

    fn engine() -> ControlEngine {
        let processor = SignalProcessor::single(ComponentId::new("svc-0"), Normalization::default());
        ControlEngine::new(processor, ThresholdConfig::default(), AgentConfig::default())
    }

    fn sample(latency: f64) -> SignalSample {
        SignalSample {
            component_id: ComponentId::new("svc-0"),
            timestamp: 0,
            raw_error_count: 0,
            raw_latency_ms: latency,
            raw_capacity_estimate: 100.0,
        }
    }

    fn setup(config: RuntimeConfig) -> (ControlLoop, ControlPorts, watch::Sender<BaselineVersion>) {
        let store = BaselineStore::new(ThresholdConfig::default()).unwrap();
        let (tx, rx) = watch::channel(store.current());
        let (l, p) = ControlLoop::new(engine(), rx, &config, window());
        (l, p, tx)
    }

    #[tokio::test]
    async fn test_sustained_latency_emits_reduction() {
        let (mut l, mut ports, _tx) = setup(RuntimeConfig::default());
        let mut reduced = false;
        for _ in 0..30 {
            ports.telemetry.try_send(sample(950.0)).unwrap();
            l.step_once();
            while let Ok(a) = ports.actions.try_recv() {
                reduced |= a.kind == ActionKind::ReduceQuality;
            }
        }
        assert!(reduced);
        assert!(ports.live.borrow().quality < 10);
    }

    #[tokio::test]
    async fn test_full_action_queue_sheds() {
        let config = RuntimeConfig {
            action_capacity: 1,
            ..RuntimeConfig::default()
        };
        let (mut l, ports, _tx) = setup(config);
        // High latency and errors together trigger reduction and quarantine.
        for _ in 0..30 {
            ports
                .telemetry
                .try_send(SignalSample {
                    raw_error_count: 45,
                    ..sample(950.0)
                })
                .unwrap();
            l.step_once();
        }
        assert!(ports.live.borrow().actions_shed > 0);
    }

    #[tokio::test]
    async fn test_new_baseline_applies_next_tick() {
        let (mut l, _ports, tx) = setup(RuntimeConfig::default());
        l.step_once();
        let next = BaselineVersion {
            version: 2,
            config: ThresholdConfig {
                theta_l_hot: 0.9,
                ..ThresholdConfig::default()
            },
            source: BaselineSource::Initial,
            created_at: Utc::now(),
            description: "test".to_owned(),
        };
        tx.send(next).unwrap();
        l.step_once();
        assert!((l.engine().thresholds().theta_l_hot - 0.9).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_windows_are_published() {
        let config = RuntimeConfig {
            window_ticks: 5,
            ..RuntimeConfig::default()
        };
        let (mut l, mut ports, _tx) = setup(config);
        for _ in 0..5 {
            l.step_once();
        }
        let w = ports.windows.try_recv().unwrap();
        assert_eq!((w.start_tick, w.end_tick), (0, 4));
    }

    #[tokio::test]
    async fn test_resume_continues_tick_numbering() {
        let (mut l, _ports, _tx) = setup(RuntimeConfig::default());
        let mut agents = crate::agents::AgentSet::new(AgentConfig::default()).snapshot();
        agents.plant.quality = 4;
        l.resume(Checkpoint {
            tick: 99,
            baseline_version: 1,
            thresholds: ThresholdConfig::default(),
            fields: vec![(ComponentId::new("svc-0"), FieldState::new(0.0, 0.5, 0.0))],
            agents,
            saved_at: Utc::now(),
        });
        assert_eq!(l.next_tick(), 100);
        let out = l.step_once();
        assert_eq!(out.tick, 100);
        assert_eq!(l.engine().agents().plant().quality, 4);
        assert!(out.field.latency > 0.3);
    }

    #[tokio::test]
    async fn test_resume_keeps_published_baseline() {
        let (mut l, ports, _tx) = setup(RuntimeConfig::default());
        l.resume(Checkpoint {
            tick: 9,
            baseline_version: 7,
            thresholds: ThresholdConfig {
                theta_l_hot: 0.9,
                ..ThresholdConfig::default()
            },
            fields: Vec::new(),
            agents: crate::agents::AgentSet::new(AgentConfig::default()).snapshot(),
            saved_at: Utc::now(),
        });
        l.step_once();
        assert_eq!(ports.live.borrow().baseline_version, 1);
        assert_eq!(l.engine().thresholds(), &ThresholdConfig::default());
    }

    #[tokio::test]
    async fn test_run_ticks_until_shutdown() {
        let config = RuntimeConfig {
            tick_interval_ms: 5,
            ..RuntimeConfig::default()
        };
        let (l, ports, _tx) = setup(config);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(l.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(ports.live.borrow().tick > 0);
    }
}
