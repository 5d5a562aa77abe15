//! Application supervisor.
//!
//! Owns the shared state and the stop flag, installs signal handling,
//! spawns the four worker stages, and joins them in a fixed order once a
//! stop is requested (by a signal or by a worker hitting a fatal error).

use crate::config::RuntimeConfig;
use crate::core::SystemState;
use crate::workers::{
    usb::serial_factory, ControllerWorker, LogWorker, SharedState, StopFlag, TcpWorker, UsbWorker,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Exit code for a clean stop.
pub const EXIT_OK: i32 = 0;
/// Exit code when a mandatory resource failed (serial link, listener).
pub const EXIT_FATAL: i32 = 1;

/// Run the gateway until a stop is requested. Returns the process exit
/// code.
pub fn run(cfg: RuntimeConfig) -> i32 {
    log::info!(
        "Gateway starting: serial={} state={}:{} cmd={}:{}",
        cfg.serial_dev,
        cfg.bind_ip,
        cfg.state_port,
        cfg.bind_ip,
        cfg.cmd_port
    );

    let sh = Arc::new(SharedState::new(cfg.clone()));

    // Default armed; start/stop flag bits re-arm and disarm at runtime.
    sh.system_state.store(SystemState {
        running: true,
        continuous_flags: 0,
    });

    let stop = StopFlag::new();
    install_signal_handler(stop.clone());

    let io_factory = serial_factory(cfg.serial_dev.clone(), cfg.serial_baud);

    let t_usb = spawn_worker("usb-worker", {
        let w = UsbWorker::new(Arc::clone(&sh), stop.clone(), io_factory);
        move || w.run()
    });
    let t_tcp = spawn_worker("tcp-worker", {
        let w = TcpWorker::new(Arc::clone(&sh), stop.clone());
        move || w.run()
    });
    let t_ctrl = spawn_worker("ctrl-worker", {
        let w = ControllerWorker::new(Arc::clone(&sh), stop.clone());
        move || w.run()
    });
    let t_log = spawn_worker("log-worker", {
        let w = LogWorker::new(Arc::clone(&sh), stop.clone());
        move || w.run()
    });

    // Wait for a stop request (signal or fatal worker failure).
    while !stop.stop_requested() {
        thread::sleep(Duration::from_millis(50));
    }
    stop.request_stop();

    log::info!("Stopping workers...");
    for (name, handle) in [
        ("tcp", t_tcp),
        ("ctrl", t_ctrl),
        ("usb", t_usb),
        ("log", t_log),
    ] {
        if let Some(h) = handle {
            if h.join().is_err() {
                log::error!("{} worker panicked", name);
            }
        }
    }

    if sh.is_fatal() {
        log::error!("Shutdown complete (fatal resource failure)");
        EXIT_FATAL
    } else {
        log::info!("Shutdown complete");
        EXIT_OK
    }
}

fn spawn_worker<F>(name: &str, body: F) -> Option<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    match thread::Builder::new().name(name.to_string()).spawn(body) {
        Ok(h) => Some(h),
        Err(e) => {
            log::error!("Failed to spawn {}: {}", name, e);
            None
        }
    }
}

/// SIGINT/SIGTERM flip the cooperative stop flag. Broken pipes never reach
/// a handler: the Rust runtime ignores SIGPIPE, so peer disconnects show
/// up as socket write errors instead.
fn install_signal_handler(stop: StopFlag) {
    let signals = match Signals::new([SIGINT, SIGTERM]) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to register signal handlers: {}", e);
            return;
        }
    };

    let spawned = thread::Builder::new()
        .name("signal-handler".to_string())
        .spawn(move || {
            let mut signals = signals;
            if let Some(sig) = signals.forever().next() {
                log::info!("Received signal {}, initiating shutdown", sig);
                stop.request_stop();
            }
        });

    if let Err(e) = spawned {
        log::warn!("Failed to spawn signal handler thread: {}", e);
    }
}
