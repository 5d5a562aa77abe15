//! Runtime configuration.
//!
//! `RuntimeConfig` is immutable after publication: workers read it through
//! an atomically-swapped shared pointer, and the TCP stage applies in-band
//! CONFIG messages by copy-modify-swap. The CLI populates the initial
//! value; every numeric field coming from the wire is clamped to its
//! allowed window before the swap.

use crate::wire::ConfigPayload;
use clap::{Parser, ValueEnum};

/// What the controller stage feeds the hardware from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ControlMode {
    /// Pass the remote command through unchanged.
    #[value(name = "pass")]
    PassThroughCmd,
    /// Compute motors from sensor state, ignore the remote command.
    #[value(name = "auto")]
    Autonomous,
    /// Autonomous, steered by the latest remote setpoint.
    #[value(name = "setpoint")]
    AutonomousWithSetpoint,
}

impl ControlMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ControlMode::PassThroughCmd),
            1 => Some(ControlMode::Autonomous),
            2 => Some(ControlMode::AutonomousWithSetpoint),
            _ => None,
        }
    }
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlMode::PassThroughCmd => "pass",
            ControlMode::Autonomous => "auto",
            ControlMode::AutonomousWithSetpoint => "setpoint",
        };
        f.write_str(s)
    }
}

/// Whether command staleness forces motors to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UsbTimeoutMode {
    #[value(name = "enforce")]
    Enforce,
    #[value(name = "disable")]
    Disable,
}

impl UsbTimeoutMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(UsbTimeoutMode::Enforce),
            1 => Some(UsbTimeoutMode::Disable),
            _ => None,
        }
    }
}

impl std::fmt::Display for UsbTimeoutMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UsbTimeoutMode::Enforce => "enforce",
            UsbTimeoutMode::Disable => "disable",
        };
        f.write_str(s)
    }
}

/// Immutable-after-publication runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // Rates
    pub usb_hz: f64,
    pub tcp_hz: f64,
    pub ctrl_hz: f64,

    // Networking
    pub bind_ip: String,
    pub state_port: u16,
    pub cmd_port: u16,

    // Serial
    pub serial_dev: String,
    pub serial_baud: u32,

    // Safety
    pub cmd_timeout_s: f64,
    pub usb_timeout_mode: UsbTimeoutMode,

    // Control
    pub control_mode: ControlMode,
    /// SCHED_FIFO priority for the controller thread (1..=99); 0 disables.
    pub ctrl_thread_priority: i16,

    // Logging
    pub binary_log: bool,
    pub log_path: String,
    pub log_rotate_mb: u32,
    pub log_rotate_keep: u32,

    // Flags routing
    pub flag_event_mask: u8,
    pub flag_start_bit: i32,
    pub flag_stop_bit: i32,
    pub flag_reset_bit: i32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            usb_hz: 200.0,
            tcp_hz: 200.0,
            ctrl_hz: 200.0,
            bind_ip: "0.0.0.0".to_string(),
            state_port: 30001,
            cmd_port: 30002,
            serial_dev: "/dev/ttyUSB0".to_string(),
            serial_baud: 115_200,
            cmd_timeout_s: 0.2,
            usb_timeout_mode: UsbTimeoutMode::Enforce,
            control_mode: ControlMode::PassThroughCmd,
            ctrl_thread_priority: 0,
            binary_log: true,
            log_path: "./logs/gateway.bin".to_string(),
            log_rotate_mb: 256,
            log_rotate_keep: 10,
            flag_event_mask: 0x07,
            flag_start_bit: -1,
            flag_stop_bit: -1,
            flag_reset_bit: -1,
        }
    }
}

impl RuntimeConfig {
    /// Derive a new config from an in-band CONFIG message. Unknown keys
    /// leave the config untouched (the caller still reports the apply).
    pub fn apply_key(&self, p: &ConfigPayload) -> RuntimeConfig {
        let mut next = self.clone();
        match p.key {
            1 => next.usb_hz = (p.v_u16 as f64).clamp(1.0, 2000.0),
            2 => next.tcp_hz = (p.v_u16 as f64).clamp(1.0, 2000.0),
            3 => next.ctrl_hz = (p.v_u16 as f64).clamp(1.0, 2000.0),
            4 => next.cmd_timeout_s = (p.v_u16 as f64 / 1000.0).clamp(0.01, 5.0),
            5 => {
                if let Some(mode) = UsbTimeoutMode::from_u8(p.v_u8) {
                    next.usb_timeout_mode = mode;
                }
            }
            6 => next.log_rotate_mb = p.v_u16.clamp(1, 8192) as u32,
            7 => next.log_rotate_keep = p.v_u16.clamp(1, 200) as u32,
            10 => next.flag_event_mask = p.v_u8,
            20 => {
                if let Some(mode) = ControlMode::from_u8(p.v_u8) {
                    next.control_mode = mode;
                }
            }
            30 => next.ctrl_thread_priority = p.v_u16 as i16,
            _ => {}
        }
        next
    }
}

/// Accept `0x`-prefixed hex or plain decimal for the flag mask.
fn parse_u8_maybe_hex(s: &str) -> std::result::Result<u8, String> {
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16)
    } else {
        s.parse::<u8>()
    };
    parsed.map_err(|_| format!("'{}' is not a u8 (decimal or 0x-hex)", s))
}

/// Command-line surface of the gateway daemon.
#[derive(Debug, Parser)]
#[command(name = "setu-io", version, about = "Serial robot board to TCP gateway")]
pub struct Cli {
    /// Serial device of the motor/IMU board
    #[arg(long = "serial", default_value = "/dev/ttyUSB0")]
    pub serial: String,

    #[arg(long = "baud", default_value_t = 115_200)]
    pub baud: u32,

    #[arg(long = "bind_ip", default_value = "0.0.0.0")]
    pub bind_ip: String,

    /// State broadcast listener port
    #[arg(long = "state_port", default_value_t = 30001)]
    pub state_port: u16,

    /// Command ingress listener port
    #[arg(long = "cmd_port", default_value_t = 30002)]
    pub cmd_port: u16,

    #[arg(long = "usb_hz")]
    pub usb_hz: Option<f64>,

    #[arg(long = "tcp_hz")]
    pub tcp_hz: Option<f64>,

    #[arg(long = "ctrl_hz")]
    pub ctrl_hz: Option<f64>,

    /// Sets all three stage rates at once
    #[arg(long = "hz")]
    pub hz: Option<f64>,

    /// Command watchdog window in seconds
    #[arg(long = "cmd_timeout", default_value_t = 0.2)]
    pub cmd_timeout: f64,

    #[arg(long = "usb_timeout_mode", value_enum, default_value_t = UsbTimeoutMode::Enforce)]
    pub usb_timeout_mode: UsbTimeoutMode,

    #[arg(long = "control_mode", value_enum, default_value_t = ControlMode::PassThroughCmd)]
    pub control_mode: ControlMode,

    /// Enable (1) or disable (0) the rotating binary log
    #[arg(long = "binary_log", default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=1))]
    pub binary_log: u8,

    #[arg(long = "log_path", default_value = "./logs/gateway.bin")]
    pub log_path: String,

    /// Flag bits that fire one-shot events instead of passing through
    #[arg(long = "flag_event_mask", value_parser = parse_u8_maybe_hex, default_value = "0x07")]
    pub flag_event_mask: u8,

    /// Flag bit that arms the controller (-1 = unmapped)
    #[arg(long = "flag_start_bit", default_value_t = -1, allow_hyphen_values = true)]
    pub flag_start_bit: i32,

    /// Flag bit that disarms the controller (-1 = unmapped)
    #[arg(long = "flag_stop_bit", default_value_t = -1, allow_hyphen_values = true)]
    pub flag_stop_bit: i32,

    /// Flag bit that disarms and clears latched commands (-1 = unmapped)
    #[arg(long = "flag_reset_bit", default_value_t = -1, allow_hyphen_values = true)]
    pub flag_reset_bit: i32,
}

impl Cli {
    /// Fold the CLI into the initial runtime configuration.
    pub fn into_config(self) -> RuntimeConfig {
        let mut cfg = RuntimeConfig {
            serial_dev: self.serial,
            serial_baud: self.baud,
            bind_ip: self.bind_ip,
            state_port: self.state_port,
            cmd_port: self.cmd_port,
            cmd_timeout_s: self.cmd_timeout,
            usb_timeout_mode: self.usb_timeout_mode,
            control_mode: self.control_mode,
            binary_log: self.binary_log != 0,
            log_path: self.log_path,
            flag_event_mask: self.flag_event_mask,
            flag_start_bit: self.flag_start_bit,
            flag_stop_bit: self.flag_stop_bit,
            flag_reset_bit: self.flag_reset_bit,
            ..RuntimeConfig::default()
        };

        if let Some(hz) = self.hz {
            cfg.usb_hz = hz;
            cfg.tcp_hz = hz;
            cfg.ctrl_hz = hz;
        }
        if let Some(hz) = self.usb_hz {
            cfg.usb_hz = hz;
        }
        if let Some(hz) = self.tcp_hz {
            cfg.tcp_hz = hz;
        }
        if let Some(hz) = self.ctrl_hz {
            cfg.ctrl_hz = hz;
        }
        cfg
    }
}
