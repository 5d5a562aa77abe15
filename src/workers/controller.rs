//! Controller worker: decides what actually reaches the hardware.
//!
//! Runs at `ctrl_hz`, reading three snapshots (sensor state, remote
//! command, setpoint) and the system-event queue, then publishes a single
//! `Actions` request for the USB stage. Safety comes first: a disarmed
//! system or a stale command stream forces motors to zero regardless of
//! mode.

use crate::clock;
use crate::config::{ControlMode, RuntimeConfig};
use crate::core::{Actions, EventCmd, EventType, Setpoint, States, SystemState};
use crate::rate::RateLimiter;
use crate::sched;
use crate::workers::{SharedState, StopFlag};
use std::sync::Arc;

/// Sys events handled per tick, at most.
const MAX_SYS_EVENTS_PER_TICK: usize = 32;

pub struct ControllerWorker {
    sh: Arc<SharedState>,
    stop: StopFlag,
}

impl ControllerWorker {
    pub fn new(sh: Arc<SharedState>, stop: StopFlag) -> Self {
        ControllerWorker { sh, stop }
    }

    pub fn run(self) {
        let cfg = self.sh.config();
        if cfg.ctrl_thread_priority > 0 {
            sched::try_set_fifo_priority(cfg.ctrl_thread_priority);
        }

        let mut rate = RateLimiter::new(cfg.ctrl_hz);
        rate.reset();

        let mut warned_timeout = false;

        log::info!("[CTRL] Started");

        while !self.stop.stop_requested() {
            let cfg = self.sh.config();
            rate.set_hz(cfg.ctrl_hz);

            let st = self.sh.latest_state.load_or_default();
            let remote_cmd = self.sh.latest_remote_cmd.load_or_default();
            let setpoint = self.sh.latest_setpoint.load_or_default();
            let mut sys = self.sh.system_state.load_or_default();

            self.sh.sys_event_q.drain(MAX_SYS_EVENTS_PER_TICK, |ev| {
                if handle_sys_event(&cfg, &mut sys, &ev) == SysEventOutcome::Reset {
                    // Conservative reset: clear every latched command.
                    self.sh.latest_remote_cmd.store(Actions::default());
                    self.sh.latest_setpoint.store(Setpoint::default());
                    log::info!("[CTRL] Reset: disarmed, latched commands cleared");
                }
            });

            sys.continuous_flags = remote_cmd.flags;

            let timed_out = self.sh.cmd_timed_out(&cfg, clock::monotonic_now());
            if timed_out && !warned_timeout {
                let age = self
                    .sh
                    .cmd_age_s(clock::monotonic_now())
                    .unwrap_or_default();
                log::warn!(
                    "[CTRL] Command timeout: {:.3}s > {:.3}s, forcing motors to zero",
                    age,
                    cfg.cmd_timeout_s
                );
            }
            warned_timeout = timed_out;

            let out = select_action(&cfg, &sys, timed_out, &remote_cmd, &setpoint, &st);

            self.sh.system_state.store(sys);
            self.sh.latest_action_request.store(out);

            rate.sleep();
        }

        // Final safety measure: whatever the USB stage reads next is zero.
        self.sh.latest_action_request.store(Actions::default());
        log::info!("[CTRL] Stopped");
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SysEventOutcome {
    None,
    Reset,
}

fn bit_matches(configured: i32, bit: u8) -> bool {
    (0..8).contains(&configured) && configured as u8 == bit
}

/// Fold one system event into the run state. Returns whether the caller
/// must also clear latched commands.
pub fn handle_sys_event(
    cfg: &RuntimeConfig,
    sys: &mut SystemState,
    ev: &EventCmd,
) -> SysEventOutcome {
    if ev.kind != EventType::FlagRise {
        return SysEventOutcome::None;
    }

    let bit = ev.data[0];
    if bit_matches(cfg.flag_start_bit, bit) {
        sys.running = true;
        log::info!("[CTRL] Start flag (bit {}), armed", bit);
    }
    if bit_matches(cfg.flag_stop_bit, bit) {
        sys.running = false;
        log::info!("[CTRL] Stop flag (bit {}), disarmed", bit);
    }
    if bit_matches(cfg.flag_reset_bit, bit) {
        sys.running = false;
        return SysEventOutcome::Reset;
    }
    SysEventOutcome::None
}

/// Compute the action request for this tick.
pub fn select_action(
    cfg: &RuntimeConfig,
    sys: &SystemState,
    cmd_timed_out: bool,
    remote_cmd: &Actions,
    setpoint: &Setpoint,
    st: &States,
) -> Actions {
    let mut out = Actions {
        beep_ms: 0,
        flags: sys.continuous_flags,
        ..Actions::default()
    };

    if !sys.running || cmd_timed_out {
        return out;
    }

    match cfg.control_mode {
        ControlMode::PassThroughCmd => {
            out.motors = remote_cmd.motors;
        }
        ControlMode::Autonomous => {
            // Trivial hold-position stage: a real policy plugs in here and
            // reads `st` the same way.
            let _ = st;
            out.motors = Default::default();
        }
        ControlMode::AutonomousWithSetpoint => {
            let _ = (st, setpoint);
            out.motors = Default::default();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MotorCommands;

    fn cfg_with_bits(start: i32, stop: i32, reset: i32) -> RuntimeConfig {
        let mut cfg = RuntimeConfig::default();
        cfg.flag_start_bit = start;
        cfg.flag_stop_bit = stop;
        cfg.flag_reset_bit = reset;
        cfg
    }

    fn rise(bit: u8) -> EventCmd {
        EventCmd {
            kind: EventType::FlagRise,
            seq: 1,
            data: [bit, 0, 0, 0],
            aux_u32: 0,
        }
    }

    #[test]
    fn start_stop_bits_toggle_running() {
        let cfg = cfg_with_bits(0, 1, -1);
        let mut sys = SystemState::default();

        assert_eq!(handle_sys_event(&cfg, &mut sys, &rise(0)), SysEventOutcome::None);
        assert!(sys.running);

        assert_eq!(handle_sys_event(&cfg, &mut sys, &rise(1)), SysEventOutcome::None);
        assert!(!sys.running);
    }

    #[test]
    fn reset_bit_disarms_and_requests_clear() {
        let cfg = cfg_with_bits(-1, -1, 2);
        let mut sys = SystemState {
            running: true,
            ..Default::default()
        };
        assert_eq!(handle_sys_event(&cfg, &mut sys, &rise(2)), SysEventOutcome::Reset);
        assert!(!sys.running);
    }

    #[test]
    fn unmapped_bits_are_ignored() {
        let cfg = cfg_with_bits(-1, -1, -1);
        let mut sys = SystemState::default();
        assert_eq!(handle_sys_event(&cfg, &mut sys, &rise(3)), SysEventOutcome::None);
        assert!(!sys.running);
    }

    #[test]
    fn non_flag_events_do_nothing() {
        let cfg = cfg_with_bits(0, 1, 2);
        let mut sys = SystemState::default();
        let ev = EventCmd {
            kind: EventType::ConfigApplied,
            seq: 1,
            data: [0; 4],
            aux_u32: 0,
        };
        assert_eq!(handle_sys_event(&cfg, &mut sys, &ev), SysEventOutcome::None);
        assert!(!sys.running);
    }

    #[test]
    fn pass_through_copies_motors_and_continuous_flags() {
        let cfg = RuntimeConfig::default();
        let sys = SystemState {
            running: true,
            continuous_flags: 0x10,
        };
        let remote = Actions {
            motors: MotorCommands {
                m1: 50,
                m2: -50,
                m3: 0,
                m4: 0,
            },
            beep_ms: 99, // never continuous
            flags: 0x10,
        };

        let out = select_action(
            &cfg,
            &sys,
            false,
            &remote,
            &Setpoint::default(),
            &States::default(),
        );
        assert_eq!(out.motors.m1, 50);
        assert_eq!(out.motors.m2, -50);
        assert_eq!(out.beep_ms, 0);
        assert_eq!(out.flags, 0x10);
    }

    #[test]
    fn not_running_forces_zero() {
        let cfg = RuntimeConfig::default();
        let sys = SystemState::default();
        let remote = Actions {
            motors: MotorCommands {
                m1: 80,
                m2: 80,
                m3: 80,
                m4: 80,
            },
            ..Default::default()
        };
        let out = select_action(
            &cfg,
            &sys,
            false,
            &remote,
            &Setpoint::default(),
            &States::default(),
        );
        assert_eq!(out.motors, MotorCommands::default());
    }

    #[test]
    fn timeout_forces_zero_even_when_running() {
        let cfg = RuntimeConfig::default();
        let sys = SystemState {
            running: true,
            ..Default::default()
        };
        let remote = Actions {
            motors: MotorCommands {
                m1: 80,
                m2: 0,
                m3: 0,
                m4: 0,
            },
            ..Default::default()
        };
        let out = select_action(
            &cfg,
            &sys,
            true,
            &remote,
            &Setpoint::default(),
            &States::default(),
        );
        assert_eq!(out.motors, MotorCommands::default());
        assert_eq!(out.beep_ms, 0);
    }

    #[test]
    fn autonomous_modes_produce_well_defined_actions() {
        let mut cfg = RuntimeConfig::default();
        let sys = SystemState {
            running: true,
            ..Default::default()
        };
        let remote = Actions {
            motors: MotorCommands {
                m1: 80,
                m2: 0,
                m3: 0,
                m4: 0,
            },
            ..Default::default()
        };

        cfg.control_mode = ControlMode::Autonomous;
        let out = select_action(
            &cfg,
            &sys,
            false,
            &remote,
            &Setpoint::default(),
            &States::default(),
        );
        // Remote command is ignored in autonomous mode.
        assert_eq!(out.motors, MotorCommands::default());

        cfg.control_mode = ControlMode::AutonomousWithSetpoint;
        let out = select_action(
            &cfg,
            &sys,
            false,
            &remote,
            &Setpoint {
                seq: 1,
                sp: [0.5; 4],
                flags: 0,
            },
            &States::default(),
        );
        assert_eq!(out.beep_ms, 0);
    }
}
