//! State co-owned by every worker stage.
//!
//! One `Arc<SharedState>` is handed to each worker at spawn; it owns every
//! cross-worker channel, the diagnostic counters, and the swappable config
//! pointer. Workers never hold references to each other, only to this.
//!
//! Channel wiring (producer → consumer):
//!
//! - `latest_state`: USB → TCP broadcast, controller
//! - `latest_remote_cmd`, `latest_setpoint`: TCP → controller
//! - `latest_action_request`: controller → USB
//! - `hw_event_q`: TCP → USB (one-shot hardware events)
//! - `sys_event_q`: TCP → controller (flag edges, config applies)
//! - `state_ring`, `action_ring`, `event_ring`: USB → logger
//! - `sys_event_ring`: TCP → logger

use crate::channel::{AtomicF64, LatestValue, SpscOverwrite};
use crate::clock;
use crate::config::RuntimeConfig;
use crate::core::{
    ActionSample, Actions, EventCmd, EventSample, Setpoint, StateSample, States, SystemState,
};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub const STATE_RING_CAPACITY: usize = 4096;
pub const ACTION_RING_CAPACITY: usize = 2048;
pub const EVENT_RING_CAPACITY: usize = 2048;
pub const EVENT_QUEUE_CAPACITY: usize = 256;

pub struct SharedState {
    /// Swapped whole on config apply; readers dereference an immutable
    /// snapshot and never observe a partial update.
    pub cfg: ArcSwap<RuntimeConfig>,

    pub latest_state: LatestValue<States>,
    pub latest_remote_cmd: LatestValue<Actions>,
    pub latest_setpoint: LatestValue<Setpoint>,
    pub latest_action_request: LatestValue<Actions>,
    pub system_state: LatestValue<SystemState>,

    /// Monotonic receipt time of the last TCP command (0 = none yet).
    pub last_cmd_rx_mono_s: AtomicF64,

    pub tcp_frames_bad: AtomicU32,
    pub serial_errors: AtomicU32,
    pub start_mono_s: f64,

    /// Set only on mandatory-resource or serial-runtime failure; maps to
    /// exit code 1.
    fatal: AtomicBool,

    pub hw_event_q: SpscOverwrite<EventCmd>,
    pub sys_event_q: SpscOverwrite<EventCmd>,

    pub state_ring: SpscOverwrite<StateSample>,
    pub action_ring: SpscOverwrite<ActionSample>,
    pub event_ring: SpscOverwrite<EventSample>,
    pub sys_event_ring: SpscOverwrite<EventSample>,
}

impl SharedState {
    pub fn new(cfg: RuntimeConfig) -> Self {
        SharedState {
            cfg: ArcSwap::from_pointee(cfg),
            latest_state: LatestValue::new(),
            latest_remote_cmd: LatestValue::new(),
            latest_setpoint: LatestValue::new(),
            latest_action_request: LatestValue::new(),
            system_state: LatestValue::new(),
            last_cmd_rx_mono_s: AtomicF64::new(0.0),
            tcp_frames_bad: AtomicU32::new(0),
            serial_errors: AtomicU32::new(0),
            start_mono_s: clock::monotonic_now(),
            fatal: AtomicBool::new(false),
            hw_event_q: SpscOverwrite::new(EVENT_QUEUE_CAPACITY),
            sys_event_q: SpscOverwrite::new(EVENT_QUEUE_CAPACITY),
            state_ring: SpscOverwrite::new(STATE_RING_CAPACITY),
            action_ring: SpscOverwrite::new(ACTION_RING_CAPACITY),
            event_ring: SpscOverwrite::new(EVENT_RING_CAPACITY),
            sys_event_ring: SpscOverwrite::new(EVENT_RING_CAPACITY),
        }
    }

    /// Current config snapshot.
    pub fn config(&self) -> Arc<RuntimeConfig> {
        self.cfg.load_full()
    }

    /// Publish a new config; readers switch atomically.
    pub fn swap_config(&self, next: RuntimeConfig) {
        self.cfg.store(Arc::new(next));
    }

    /// Stamp command receipt. Written only by the TCP stage, so the value
    /// is monotonically non-decreasing.
    pub fn mark_cmd_rx(&self, mono_s: f64) {
        self.last_cmd_rx_mono_s.store(mono_s, Ordering::Release);
    }

    /// Seconds since the last command, or `None` before the first one.
    pub fn cmd_age_s(&self, now_mono_s: f64) -> Option<f64> {
        let last = self.last_cmd_rx_mono_s.load(Ordering::Acquire);
        if last > 0.0 {
            Some(now_mono_s - last)
        } else {
            None
        }
    }

    /// Whether the command watchdog considers input stale right now.
    pub fn cmd_timed_out(&self, cfg: &RuntimeConfig, now_mono_s: f64) -> bool {
        use crate::config::UsbTimeoutMode;
        if cfg.usb_timeout_mode != UsbTimeoutMode::Enforce {
            return false;
        }
        match self.cmd_age_s(now_mono_s) {
            Some(age) => age > cfg.cmd_timeout_s,
            None => false,
        }
    }

    pub fn mark_fatal(&self) {
        self.fatal.store(true, Ordering::Release);
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }
}
