//! Timestamp sources.
//!
//! `mono_s` counts seconds from a process-wide fixed origin so that values
//! taken by different threads are directly comparable; `epoch_s` is ordinary
//! wall-clock seconds. All freshness decisions (command watchdog, uptime)
//! use the monotonic side only.

use crate::core::Timestamps;
use once_cell::sync::Lazy;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static MONO_ORIGIN: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds since the process-wide monotonic origin.
pub fn monotonic_now() -> f64 {
    MONO_ORIGIN.elapsed().as_secs_f64()
}

/// Seconds since the system epoch.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Both clocks, sampled together.
pub fn now_timestamps() -> Timestamps {
    Timestamps {
        epoch_s: epoch_now(),
        mono_s: monotonic_now(),
    }
}
