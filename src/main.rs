//! Demo binary for tokio-field-controller
//!
//! Drives the production control loop with replayed telemetry, runs the
//! research loop beside it, and prints the adoption audit trail on exit.
//!
//! ## Usage
//!
//! ```text
//! field-controller [--config controller.toml] [--ticks N] [--research-now]
//! ```
//!
//! - `--ticks N`: stop after N production ticks instead of waiting for Ctrl-C
//! - `--research-now`: run one research cycle at startup, before any
//!   production window has been observed
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_field_controller::config::loader::load_from_file;
use tokio_field_controller::control::checkpoint;
use tokio_field_controller::control::window::WindowSettings;
use tokio_field_controller::field::SignalProcessor;
use tokio_field_controller::self_tune::score::ProductionMetrics;
use tokio_field_controller::self_tune::workload::{Workload, WorkloadReplayer};
use tokio_field_controller::self_tune::{run_research_cycle, start_research_loop};
use tokio_field_controller::{
    init_tracing_with, metrics, AdoptionGate, ControlEngine, ControlLoop, ControllerConfig,
    ControllerError, ExperimentOrchestrator, OperatorConsole,
};
use tracing::{debug, error, info, warn};

/// Replay stream reserved for the production feed; experiment replicas use
/// streams `0..replicas_per_arm`.
const PRODUCTION_STREAM: u64 = u64::MAX;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    ticks: Option<u64>,
    research_now: bool,
}

fn parse_args() -> Result<Args, ControllerError> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let path = it
                    .next()
                    .ok_or_else(|| ControllerError::Other("--config needs a path".into()))?;
                args.config = Some(PathBuf::from(path));
            }
            "--ticks" => {
                let n = it
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| ControllerError::Other("--ticks needs a number".into()))?;
                args.ticks = Some(n);
            }
            "--research-now" => args.research_now = true,
            other => return Err(ControllerError::Other(format!("unknown argument '{other}'"))),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => load_from_file(path)?,
        None => ControllerConfig::default(),
    };

    // Initialize structured tracing (JSON or pretty, config or LOG_FORMAT env)
    let _ = init_tracing_with(config.observability.log_format);

    // Initialize Prometheus metrics registry before any loop runs.
    metrics::init_metrics()?;

    info!(config = ?args.config, "starting field controller");

    let workload = Arc::new(WorkloadReplayer::new(config.experiment.workload.clone()));
    let topology = config.signal.topology(workload.components())?;

    let resumed = match &config.runtime.checkpoint_path {
        Some(path) => {
            let cp = checkpoint::load(path)?;
            if cp.is_none() {
                info!(path = %path.display(), "no checkpoint found, starting fresh");
            }
            cp
        }
        None => None,
    };

    // ── Research side ──────────────────────────────────────────────────
    let gate = AdoptionGate::open(config.gate.clone(), config.thresholds.clone(), resumed.as_ref())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = ExperimentOrchestrator::new(
        config.orchestrator_settings(),
        topology.clone(),
        Arc::clone(&workload) as Arc<dyn Workload>,
        shutdown_rx.clone(),
    );

    // ── Production side ────────────────────────────────────────────────
    let engine = ControlEngine::new(
        SignalProcessor::new(topology, config.signal.normalization.clone()),
        config.thresholds.clone(),
        config.agents.clone(),
    );
    let window = WindowSettings {
        window_ticks: config.runtime.window_ticks,
        thrash_window_ticks: config.experiment.thrash_window_ticks,
        response_target_ms: config.experiment.response_target_ms,
        quality_ceiling: config.agents.quality_ceiling,
        weights: config.analyst.weights.clone(),
        recent_windows: config.runtime.recent_windows,
    };
    let (mut control, ports) = ControlLoop::new(engine, gate.subscribe_baseline(), &config.runtime, window);
    if let Some(cp) = resumed {
        control.resume(cp);
    }
    let start_tick = control.next_tick();

    let console = OperatorConsole::new(gate.clone(), orchestrator.clone(), ports.live.clone());

    if args.research_now {
        let report = run_research_cycle(
            &orchestrator,
            &gate,
            &ProductionMetrics::default(),
            config.research.candidates_per_cycle,
        )
        .await;
        info!(
            proposed = report.proposed,
            graded = report.graded,
            decisions = report.records.len(),
            "startup research cycle finished"
        );
    }

    // ── Tasks ──────────────────────────────────────────────────────────
    let control_task = tokio::spawn(control.run(shutdown_rx.clone()));

    let research = start_research_loop(
        orchestrator,
        gate,
        ports.windows,
        config.analyst.weights.clone(),
        config.research.clone(),
        shutdown_rx.clone(),
    );

    let feeder = {
        let telemetry = ports.telemetry.clone();
        let workload = Arc::clone(&workload);
        let interval = Duration::from_millis(config.runtime.tick_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut tick = start_tick;
            loop {
                ticker.tick().await;
                for sample in workload.generate(PRODUCTION_STREAM, tick) {
                    if telemetry.send(sample).await.is_err() {
                        return;
                    }
                }
                tick += 1;
            }
        })
    };

    let actions = {
        let mut rx = ports.actions;
        tokio::spawn(async move {
            while let Some(action) = rx.recv().await {
                debug!(
                    tick = action.tick,
                    component = %action.component_id.as_str(),
                    kind = ?action.kind,
                    magnitude = action.magnitude,
                    "action delivered"
                );
            }
        })
    };

    let alerts = {
        let mut rx = console.subscribe_alerts();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(alert) => warn!(kind = ?alert.kind, experiment_id = %alert.experiment_id, message = %alert.message, "operator alert"),
                    Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "alert stream lagged"),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // ── Wait ───────────────────────────────────────────────────────────
    match args.ticks {
        Some(n) => {
            let mut live = ports.live.clone();
            let target = start_tick + n;
            loop {
                if live.borrow().tick + 1 >= target {
                    break;
                }
                if live.changed().await.is_err() {
                    break;
                }
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
        }
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    feeder.abort();
    if let Err(e) = control_task.await {
        error!(error = %e, "control loop task failed");
    }
    if let Err(e) = research.task.await {
        if !e.is_cancelled() {
            error!(error = %e, "research loop task failed");
        }
    }
    actions.abort();
    alerts.abort();

    let status = console.status();
    info!(
        tick = status.live.tick,
        baseline_version = status.baseline_version,
        pending_approvals = status.pending_approvals,
        experiments = status.experiments_logged,
        "final status"
    );
    println!("{}", console.export_audit_json()?);
    if config.observability.dump_metrics_on_exit {
        println!("{}", metrics::gather_metrics());
    }
    Ok(())
}
