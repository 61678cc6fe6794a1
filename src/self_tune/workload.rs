//! # Workload Replayer
//!
//! ## Responsibility
//! Produce synthetic [`SignalSample`]s for experiment instances on a fixed,
//! cyclic multi-phase schedule, and report which phase any tick falls in so
//! scoring can tell healthy ticks from incident ticks.
//!
//! ## Guarantees
//! - Deterministic: samples are a pure function of `(seed, stream, tick)`
//! - Random access: tick `N` can be generated without generating `0..N`
//! - Paired: stream `r` is identical for every caller, so the control and
//!   candidate arms of replica `r` see the same input tick by tick
//!
//! ## NOT Responsible For
//! - Running instances (see [`super::instance`])

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::field::{ComponentId, SignalSample};

// ─── Phase ───────────────────────────────────────────────────────────────────

/// A segment of the replay schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nominal load.
    Steady,
    /// Latency ramps up, holds, ramps down.
    LatencySpike,
    /// One component's error rate ramps up, the others rise mildly.
    ErrorCascade,
    /// Spare capacity collapses and latency follows.
    CapacityCrunch,
}

impl Phase {
    /// Everything except [`Phase::Steady`] is an incident the controller
    /// should respond to.
    pub fn is_incident(self) -> bool {
        !matches!(self, Phase::Steady)
    }
}

// ─── Workload trait ──────────────────────────────────────────────────────────

/// Source of replayed telemetry for experiment instances.
pub trait Workload: Send + Sync {
    /// Components that samples are produced for.
    fn components(&self) -> &[ComponentId];

    /// Samples for `tick` on replay stream `stream`.
    fn generate(&self, stream: u64, tick: u64) -> Vec<SignalSample>;

    /// Ground-truth phase of `tick`. Identical across streams.
    fn phase_at(&self, tick: u64) -> Phase;
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Replayer tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Base seed. Streams are derived from it.
    pub seed: u64,
    /// Number of components per instance.
    pub components: usize,
    /// Ticks of each steady phase.
    pub steady_ticks: u64,
    /// Ticks of each incident phase.
    pub incident_ticks: u64,
    /// Relative amplitude of uniform noise on latency and capacity.
    pub noise: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            seed: 0x5eed_f1e1d,
            components: 3,
            steady_ticks: 600,
            incident_ticks: 300,
            noise: 0.08,
        }
    }
}

// ─── Noise seeding ───────────────────────────────────────────────────────────

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

fn noise_seed(seed: u64, stream: u64, tick: u64, component: u64) -> u64 {
    splitmix64(splitmix64(splitmix64(splitmix64(seed) ^ stream) ^ tick) ^ component)
}

/// Trapezoid in `[0, 1]`: up over the first third, flat, down over the last.
fn envelope(progress: f64) -> f64 {
    (3.0 * progress).min(1.0).min(3.0 * (1.0 - progress)).max(0.0)
}

// ─── WorkloadReplayer ────────────────────────────────────────────────────────

/// Cyclic schedule: steady, latency spike, steady, error cascade, steady,
/// capacity crunch, repeat.
#[derive(Debug, Clone)]
pub struct WorkloadReplayer {
    config: WorkloadConfig,
    components: Vec<ComponentId>,
    schedule: Vec<(Phase, u64)>,
    cycle_len: u64,
}

impl WorkloadReplayer {
    /// Build a replayer. Zero-length phases and component counts are raised
    /// to one.
    pub fn new(config: WorkloadConfig) -> Self {
        let steady = config.steady_ticks.max(1);
        let incident = config.incident_ticks.max(1);
        let schedule = vec![
            (Phase::Steady, steady),
            (Phase::LatencySpike, incident),
            (Phase::Steady, steady),
            (Phase::ErrorCascade, incident),
            (Phase::Steady, steady),
            (Phase::CapacityCrunch, incident),
        ];
        let cycle_len = schedule.iter().map(|(_, len)| len).sum();
        let components = (0..config.components.max(1))
            .map(|i| ComponentId::new(format!("svc-{i}")))
            .collect();
        Self {
            config,
            components,
            schedule,
            cycle_len,
        }
    }

    /// Ticks in one full schedule cycle.
    pub fn cycle_len(&self) -> u64 {
        self.cycle_len
    }

    /// `(phase, offset into phase, phase length, cycle index)`.
    fn locate(&self, tick: u64) -> (Phase, u64, u64, u64) {
        let cycle = tick / self.cycle_len;
        let mut offset = tick % self.cycle_len;
        for &(phase, len) in &self.schedule {
            if offset < len {
                return (phase, offset, len, cycle);
            }
            offset -= len;
        }
        (Phase::Steady, 0, 1, cycle)
    }

    /// First tick of the phase containing `tick`.
    pub fn phase_start(&self, tick: u64) -> u64 {
        let (_, offset, _, _) = self.locate(tick);
        tick - offset
    }
}

impl Workload for WorkloadReplayer {
    fn components(&self) -> &[ComponentId] {
        &self.components
    }

    fn generate(&self, stream: u64, tick: u64) -> Vec<SignalSample> {
        let (phase, offset, len, cycle) = self.locate(tick);
        let env = envelope(offset as f64 / len as f64);
        let n = self.components.len() as u64;
        let cascade_target = cycle % n;

        self.components
            .iter()
            .enumerate()
            .map(|(i, component)| {
                let idx = i as u64;
                let (mut latency, mut errors, mut capacity) = match phase {
                    Phase::Steady => (200.0, 2.0, 500.0),
                    Phase::LatencySpike => (200.0 + 700.0 * env, 2.0, 500.0 - 150.0 * env),
                    Phase::ErrorCascade => {
                        let errors = if idx == cascade_target {
                            2.0 + 38.0 * env
                        } else {
                            2.0 + 6.0 * env
                        };
                        (200.0 + 150.0 * env, errors, 450.0)
                    }
                    Phase::CapacityCrunch => {
                        (200.0 + 550.0 * env, 2.0 + 3.0 * env, 500.0 - 450.0 * env)
                    }
                };
                latency *= 1.0 + 0.05 * i as f64;

                let mut rng = StdRng::seed_from_u64(noise_seed(self.config.seed, stream, tick, idx));
                let amp = self.config.noise;
                latency *= 1.0 + amp * rng.gen_range(-1.0..1.0);
                capacity *= 1.0 + amp * rng.gen_range(-1.0..1.0);
                errors *= 1.0 + 2.0 * amp * rng.gen_range(-1.0..1.0);

                SignalSample {
                    component_id: component.clone(),
                    timestamp: tick,
                    raw_error_count: errors.round().max(0.0) as u64,
                    raw_latency_ms: latency.max(0.0),
                    raw_capacity_estimate: capacity.max(0.0),
                }
            })
            .collect()
    }

    fn phase_at(&self, tick: u64) -> Phase {
        self.locate(tick).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replayer() -> WorkloadReplayer {
        WorkloadReplayer::new(WorkloadConfig::default())
    }

    #[test]
    fn test_same_seed_and_tick_is_byte_identical() {
        let a = replayer();
        let b = replayer();
        for tick in [0, 1, 650, 1_700, 2_699, 9_999] {
            let ja = serde_json::to_string(&a.generate(3, tick)).unwrap();
            let jb = serde_json::to_string(&b.generate(3, tick)).unwrap();
            assert_eq!(ja, jb, "tick {tick}");
        }
    }

    #[test]
    fn test_random_access_matches_sequential() {
        let r = replayer();
        let sequential: Vec<_> = (0..50).map(|t| r.generate(0, t)).collect();
        assert_eq!(r.generate(0, 42), sequential[42]);
    }

    #[test]
    fn test_streams_differ() {
        let r = replayer();
        assert_ne!(r.generate(0, 10), r.generate(1, 10));
    }

    #[test]
    fn test_schedule_phases_in_order() {
        let r = replayer();
        assert_eq!(r.cycle_len(), 2_700);
        assert_eq!(r.phase_at(0), Phase::Steady);
        assert_eq!(r.phase_at(600), Phase::LatencySpike);
        assert_eq!(r.phase_at(899), Phase::LatencySpike);
        assert_eq!(r.phase_at(900), Phase::Steady);
        assert_eq!(r.phase_at(1_500), Phase::ErrorCascade);
        assert_eq!(r.phase_at(2_400), Phase::CapacityCrunch);
        assert_eq!(r.phase_at(2_700), Phase::Steady);
        assert_eq!(r.phase_start(750), 600);
    }

    #[test]
    fn test_latency_spike_peaks_mid_phase() {
        let r = replayer();
        let steady = r.generate(0, 100)[0].raw_latency_ms;
        let peak = r.generate(0, 750)[0].raw_latency_ms;
        assert!(peak > 2.0 * steady, "steady={steady} peak={peak}");
    }

    #[test]
    fn test_error_cascade_concentrates_on_one_component() {
        let r = replayer();
        let samples = r.generate(0, 1_650);
        let max = samples.iter().map(|s| s.raw_error_count).max().unwrap();
        let min = samples.iter().map(|s| s.raw_error_count).min().unwrap();
        assert!(max > 3 * min.max(1), "max={max} min={min}");
    }

    #[test]
    fn test_one_sample_per_component_with_tick_timestamp() {
        let r = replayer();
        let samples = r.generate(0, 77);
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.timestamp == 77));
    }
}
