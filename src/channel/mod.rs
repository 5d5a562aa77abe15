//! Lock-free channels connecting the worker stages.
//!
//! Two shapes cover every cross-worker path in the gateway:
//!
//! - [`LatestValue`]: single-slot, latest-wins publication (sensor
//!   snapshots, continuous commands, the action request).
//! - [`SpscOverwrite`]: bounded mailbox that drops its oldest entry under
//!   backpressure (one-shot events, logger sample rings).
//!
//! Neither ever blocks a producer; staleness and drop counters are the only
//! backpressure signals.

mod latest;
mod ring;

pub use latest::LatestValue;
pub use ring::SpscOverwrite;

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic `f64` stored as its bit pattern.
///
/// Used for the command-freshness stamp, which is written by the TCP stage
/// and read by the controller and USB stages every tick.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(v: f64) -> Self {
        AtomicF64(AtomicU64::new(v.to_bits()))
    }

    pub fn load(&self, order: Ordering) -> f64 {
        f64::from_bits(self.0.load(order))
    }

    pub fn store(&self, v: f64, order: Ordering) {
        self.0.store(v.to_bits(), order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_f64_roundtrip() {
        let a = AtomicF64::new(0.0);
        a.store(123.456, Ordering::Release);
        assert_eq!(a.load(Ordering::Acquire), 123.456);
    }
}
