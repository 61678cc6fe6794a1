//! Telemetry intake for the production loop.
//!
//! Producers push [`SignalSample`]s through a bounded `mpsc` sender; the
//! control loop drains whatever has arrived at each tick without waiting.
//! A component with no sample in a tick is a telemetry gap and injects
//! nothing.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::field::SignalSample;

/// Sending half handed to telemetry producers.
pub type TelemetrySender = mpsc::Sender<SignalSample>;

/// Samples drained for one tick.
#[derive(Debug, Default)]
pub struct Drained {
    /// Samples in arrival order.
    pub samples: Vec<SignalSample>,
    /// Every producer has dropped its sender.
    pub disconnected: bool,
}

/// Receiving half owned by the control loop.
#[derive(Debug)]
pub struct TelemetryFeed {
    rx: mpsc::Receiver<SignalSample>,
    max_per_tick: usize,
}

/// Create a feed with room for `capacity` queued samples.
pub fn channel(capacity: usize) -> (TelemetrySender, TelemetryFeed) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        tx,
        TelemetryFeed {
            rx,
            max_per_tick: capacity,
        },
    )
}

impl TelemetryFeed {
    /// Take every sample that has arrived, up to the queue capacity, without
    /// blocking.
    pub fn drain(&mut self) -> Drained {
        let mut out = Drained::default();
        while out.samples.len() < self.max_per_tick {
            match self.rx.try_recv() {
                Ok(sample) => out.samples.push(sample),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    out.disconnected = true;
                    break;
                }
            }
        }
        out
    }
}
