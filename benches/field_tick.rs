//! Field tick benchmarks: the per-tick cost the production loop and every
//! experiment instance pay.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio_field_controller::agents::AgentConfig;
use tokio_field_controller::field::{
    evaluate, ComponentId, Normalization, SignalProcessor, SignalSample, SignalTriple, ThresholdConfig, Topology,
};
use tokio_field_controller::self_tune::hypothesis::neighborhood;
use tokio_field_controller::self_tune::workload::{Workload, WorkloadConfig, WorkloadReplayer};
use tokio_field_controller::ControlEngine;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ring(n: usize) -> (Vec<ComponentId>, Vec<(ComponentId, ComponentId)>) {
    let nodes: Vec<ComponentId> = (0..n).map(|i| ComponentId::new(format!("svc-{i}"))).collect();
    let edges = (0..n).map(|i| (nodes[i].clone(), nodes[(i + 1) % n].clone())).collect();
    (nodes, edges)
}

fn samples(nodes: &[ComponentId], tick: u64) -> Vec<SignalSample> {
    nodes
        .iter()
        .enumerate()
        .map(|(i, c)| SignalSample {
            component_id: c.clone(),
            timestamp: tick,
            raw_error_count: (tick + i as u64) % 5,
            raw_latency_ms: 300.0 + (i as f64) * 10.0,
            raw_capacity_estimate: 400.0,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Bench: signal processor tick with diffusion over a ring
// ---------------------------------------------------------------------------

fn bench_processor_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("processor_tick");
    let config = ThresholdConfig::default();
    for n in [3usize, 32, 256] {
        let (nodes, edges) = ring(n);
        let topology = Topology::new(nodes.clone(), &edges, SignalTriple::splat(0.1)).unwrap_or_else(|e| {
            panic!("bench topology: {e}");
        });
        let mut processor = SignalProcessor::new(topology, Normalization::default());
        let batch = samples(&nodes, 0);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| black_box(processor.tick(black_box(&batch), &config)))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: full engine step on replayed workload
// ---------------------------------------------------------------------------

fn bench_engine_step(c: &mut Criterion) {
    let workload = WorkloadReplayer::new(WorkloadConfig::default());
    let topology = Topology::new(workload.components().to_vec(), &[], SignalTriple::splat(0.0))
        .unwrap_or_else(|e| panic!("bench topology: {e}"));
    let mut engine = ControlEngine::new(
        SignalProcessor::new(topology, Normalization::default()),
        ThresholdConfig::default(),
        AgentConfig::default(),
    );
    let batches: Vec<Vec<SignalSample>> = (0..2_700).map(|t| workload.generate(0, t)).collect();
    let mut tick = 0u64;
    c.bench_function("engine_step_replayed", |b| {
        b.iter(|| {
            let batch = &batches[(tick % 2_700) as usize];
            let out = engine.step(tick, black_box(batch));
            tick += 1;
            black_box(out)
        })
    });
}

// ---------------------------------------------------------------------------
// Bench: quorum evaluation and hypothesis neighborhood
// ---------------------------------------------------------------------------

fn bench_evaluate(c: &mut Criterion) {
    let config = ThresholdConfig::default();
    let field = tokio_field_controller::FieldState::new(0.35, 0.65, 0.2);
    c.bench_function("evaluate_quorum", |b| b.iter(|| black_box(evaluate(black_box(&field), &config))));
}

fn bench_neighborhood(c: &mut Criterion) {
    c.bench_function("hypothesis_neighborhood", |b| b.iter(|| black_box(neighborhood().len())));
}

criterion_group!(
    benches,
    bench_processor_tick,
    bench_engine_step,
    bench_evaluate,
    bench_neighborhood
);
criterion_main!(benches);
