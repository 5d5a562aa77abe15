//! USB worker: the only writer to the serial board and the only publisher
//! of fresh sensor snapshots.
//!
//! The serial link is mandatory. Connection is retried with exponential
//! backoff inside a bounded window; running out of attempts (or any write
//! failure after the link was healthy) marks the process fatal and
//! requests a cooperative stop.

use crate::board::{BoardConfig, BoardDriver};
use crate::clock;
use crate::config::RuntimeConfig;
use crate::core::{ActionSample, EventSample, EventType, StateSample};
use crate::error::Result;
use crate::rate::RateLimiter;
use crate::transport::SerialIo;
use crate::workers::{SharedState, StopFlag};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opens a fresh transport for each connection attempt.
pub type IoFactory = Box<dyn Fn() -> Result<Box<dyn SerialIo>> + Send>;

/// Backoff schedule bounds for the initial connect.
const CONNECT_WINDOW: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// One-shot hardware events applied per cycle, at most.
const MAX_HW_EVENTS_PER_CYCLE: usize = 8;

/// Motor-zero writes sent at shutdown, guarding against the last frame
/// being lost on the wire.
const SHUTDOWN_ZERO_BURST: usize = 3;

pub struct UsbWorker {
    sh: Arc<SharedState>,
    stop: StopFlag,
    open_io: IoFactory,
}

impl UsbWorker {
    pub fn new(sh: Arc<SharedState>, stop: StopFlag, open_io: IoFactory) -> Self {
        UsbWorker { sh, stop, open_io }
    }

    pub fn run(self) {
        let Some(mut board) = self.connect_with_backoff() else {
            if !self.stop.stop_requested() {
                log::error!("[USB] Board connection failed within the retry window");
                self.sh.mark_fatal();
            }
            self.stop.request_stop();
            return;
        };

        if let Err(e) = board.start() {
            log::error!("[USB] Failed to start board RX: {}", e);
            self.sh.mark_fatal();
            self.stop.request_stop();
            return;
        }

        // Drop any snapshot left over from a previous session before
        // reports resume.
        board.clear_state();
        if let Err(e) = board.set_auto_report(true, false) {
            log::error!("[USB] Failed to enable auto-report: {}", e);
            self.serial_failure();
            return;
        }

        match board.get_version() {
            Ok(Some(v)) => log::info!("[USB] Board firmware version {:.1}", v),
            Ok(None) => log::warn!("[USB] Board did not answer version query"),
            Err(e) => log::warn!("[USB] Version query failed: {}", e),
        }

        log::info!("[USB] Started");

        let mut rate = RateLimiter::new(self.sh.config().usb_hz);
        rate.reset();

        let mut state_seq: u32 = 0;
        let mut action_seq: u32 = 0;
        let mut timeout_active = false;
        let mut last_timeout_log = Instant::now() - Duration::from_secs(2);

        while !self.stop.stop_requested() {
            let cfg = self.sh.config();
            rate.set_hz(cfg.usb_hz);

            let mut act = self.sh.latest_action_request.load_or_default();
            let sys = self.sh.system_state.load_or_default();

            // Safety gates, in order. Each forces motors to zero and
            // clears the one-shot beep.
            if !sys.running {
                act.motors = Default::default();
                act.beep_ms = 0;
            }

            let now_mono = clock::monotonic_now();
            let timed_out = self.sh.cmd_timed_out(&cfg, now_mono);
            if timed_out {
                act.motors = Default::default();
                act.beep_ms = 0;
            }
            self.log_watchdog_transition(&cfg, timed_out, &mut timeout_active, &mut last_timeout_log);

            if let Err(e) = board.set_motor(act.motors.m1, act.motors.m2, act.motors.m3, act.motors.m4)
            {
                log::error!("[USB] Motor write failed: {}", e);
                self.serial_failure();
                break;
            }

            if !self.apply_hw_events(&board) {
                break;
            }

            // Publish the freshest verified snapshot.
            let st = board.state();
            self.sh.latest_state.store(st);

            state_seq = state_seq.wrapping_add(1);
            self.sh.state_ring.push_overwrite(StateSample {
                ts: clock::now_timestamps(),
                seq: state_seq,
                state: st,
            });

            // The action log keeps continuous state only.
            action_seq = action_seq.wrapping_add(1);
            let mut logged = act;
            logged.beep_ms = 0;
            self.sh.action_ring.push_overwrite(ActionSample {
                ts: clock::now_timestamps(),
                seq: action_seq,
                action: logged,
            });

            rate.sleep();
        }

        // The wheels must not keep spinning if the controller is gone:
        // burst a few zero commands in case the last write is lost.
        for _ in 0..SHUTDOWN_ZERO_BURST {
            let _ = board.set_motor(0, 0, 0, 0);
            std::thread::sleep(Duration::from_millis(10));
        }
        board.stop();
        board.disconnect();

        log::info!(
            "[USB] Stopped (motors zeroed; {} late ticks, {} skipped)",
            rate.late_ticks(),
            rate.skipped_ticks()
        );
    }

    /// Exponential backoff connect inside a bounded window, checking the
    /// stop flag at every wait.
    fn connect_with_backoff(&self) -> Option<BoardDriver> {
        let cfg = self.sh.config();
        let deadline = Instant::now() + CONNECT_WINDOW;
        let mut delay = BACKOFF_INITIAL;

        loop {
            if self.stop.stop_requested() {
                return None;
            }

            match (self.open_io)() {
                Ok(io) => {
                    log::info!(
                        "[USB] Connected to {} @ {} baud",
                        cfg.serial_dev,
                        cfg.serial_baud
                    );
                    return Some(BoardDriver::new(io, BoardConfig::default()));
                }
                Err(e) => {
                    log::warn!("[USB] Connect failed: {} (retrying in {:?})", e, delay);
                }
            }

            if Instant::now() + delay >= deadline {
                return None;
            }
            // Sleep in short slices so a stop request is honored promptly.
            let until = Instant::now() + delay;
            while Instant::now() < until {
                if self.stop.stop_requested() {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            delay = (delay * 2).min(BACKOFF_CAP);
        }
    }

    /// Drain up to a bounded number of one-shot hardware events, applying
    /// each exactly once. Returns false on a fatal serial failure.
    fn apply_hw_events(&self, board: &BoardDriver) -> bool {
        let mut ok = true;
        self.sh.hw_event_q.drain(MAX_HW_EVENTS_PER_CYCLE, |ev| {
            if !ok {
                return;
            }
            if ev.kind == EventType::Beep {
                if let Err(e) = board.set_beep(ev.data[0] as u16) {
                    log::error!("[USB] Beep write failed: {}", e);
                    ok = false;
                    return;
                }
            }
            self.sh.event_ring.push_overwrite(EventSample {
                ts: clock::now_timestamps(),
                event: ev,
            });
        });

        if !ok {
            self.serial_failure();
        }
        ok
    }

    fn log_watchdog_transition(
        &self,
        cfg: &RuntimeConfig,
        timed_out: bool,
        active: &mut bool,
        last_log: &mut Instant,
    ) {
        if timed_out && (!*active || last_log.elapsed() >= Duration::from_secs(1)) {
            let age = self
                .sh
                .cmd_age_s(clock::monotonic_now())
                .unwrap_or_default();
            log::warn!(
                "[USB] Command timeout: {:.3}s > {:.3}s, motors forced to zero",
                age,
                cfg.cmd_timeout_s
            );
            *last_log = Instant::now();
        } else if !timed_out && *active {
            log::info!("[USB] Command traffic resumed");
        }
        *active = timed_out;
    }

    fn serial_failure(&self) {
        self.sh
            .serial_errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.sh.mark_fatal();
        self.stop.request_stop();
    }
}

/// Build the production transport factory from the configured device.
pub fn serial_factory(device: String, baud: u32) -> IoFactory {
    Box::new(move || {
        crate::transport::SerialTransport::open(&device, baud)
            .map(|t| Box::new(t) as Box<dyn SerialIo>)
    })
}
