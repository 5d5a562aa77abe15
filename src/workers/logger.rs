//! Log worker: drains every sample ring into the rotating binary log and
//! reports pipeline health.
//!
//! Disk writes are best effort. A failed write marks the writer broken,
//! records are skipped (counted), and a reopen is attempted at the next
//! health interval; the pipeline itself is never torn down from here.

use crate::binlog::{
    encode_action_sample, encode_event_sample, encode_state_sample, RecordType,
    RotatingBinaryLog,
};
use crate::clock;
use crate::workers::{SharedState, StopFlag};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Polling cadence between drain passes.
const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Records drained per ring per pass, at most.
const BATCH_LIMIT: usize = 1024;
/// Health / retry cadence.
const HEALTH_INTERVAL: Duration = Duration::from_secs(1);

pub struct LogWorker {
    sh: Arc<SharedState>,
    stop: StopFlag,
}

#[derive(Default)]
struct DropWatch {
    state: u64,
    action: u64,
    event: u64,
    sys_event: u64,
    hw_q: u64,
    sys_q: u64,
}

impl LogWorker {
    pub fn new(sh: Arc<SharedState>, stop: StopFlag) -> Self {
        LogWorker { sh, stop }
    }

    pub fn run(self) {
        let cfg = self.sh.config();
        let mut writer: Option<RotatingBinaryLog> = None;

        if cfg.binary_log {
            match RotatingBinaryLog::open(
                &cfg.log_path,
                cfg.log_rotate_mb as u64 * 1024 * 1024,
                cfg.log_rotate_keep,
            ) {
                Ok(w) => {
                    log::info!("[LOG] Binary logging -> {}", cfg.log_path);
                    writer = Some(w);
                }
                Err(e) => {
                    log::warn!("[LOG] Failed to open binary log {}: {}", cfg.log_path, e);
                }
            }
        }

        let mut broken = false;
        let mut skipped: u64 = 0;
        let mut last_health = Instant::now();
        let mut watch = DropWatch::default();

        while !self.stop.stop_requested() {
            let cfg = self.sh.config();
            if let Some(w) = writer.as_mut() {
                w.set_limits(
                    cfg.log_rotate_mb as u64 * 1024 * 1024,
                    cfg.log_rotate_keep,
                );
            }

            self.drain_all(&mut writer, &mut broken, &mut skipped);

            if last_health.elapsed() >= HEALTH_INTERVAL {
                last_health = Instant::now();

                if let Some(w) = writer.as_mut() {
                    if broken {
                        match w.reopen() {
                            Ok(()) => {
                                log::info!(
                                    "[LOG] Binary log reopened after {} skipped records",
                                    skipped
                                );
                                broken = false;
                                skipped = 0;
                            }
                            Err(e) => log::warn!("[LOG] Binary log reopen failed: {}", e),
                        }
                    } else if let Err(e) = w.flush() {
                        log::warn!("[LOG] Flush failed: {}", e);
                        broken = true;
                    }
                }

                self.report_drops(&mut watch);
                self.report_cmd_age(&cfg);
            }

            std::thread::sleep(POLL_INTERVAL);
        }

        // Final drain so shutdown doesn't lose the tail of the rings.
        self.drain_all(&mut writer, &mut broken, &mut skipped);
        if let Some(mut w) = writer {
            w.close();
        }
        log::info!("[LOG] Stopped");
    }

    fn drain_all(
        &self,
        writer: &mut Option<RotatingBinaryLog>,
        broken: &mut bool,
        skipped: &mut u64,
    ) {
        for _ in 0..BATCH_LIMIT {
            let Some(s) = self.sh.state_ring.pop() else { break };
            write_record(
                writer,
                RecordType::State,
                s.ts,
                &encode_state_sample(&s),
                broken,
                skipped,
            );
        }

        for _ in 0..BATCH_LIMIT {
            let Some(a) = self.sh.action_ring.pop() else { break };
            write_record(
                writer,
                RecordType::Cmd,
                a.ts,
                &encode_action_sample(&a),
                broken,
                skipped,
            );
        }

        for _ in 0..BATCH_LIMIT {
            let Some(e) = self.sh.event_ring.pop() else { break };
            write_record(
                writer,
                RecordType::Event,
                e.ts,
                &encode_event_sample(&e),
                broken,
                skipped,
            );
        }

        // System events are logged with the same EVENT record type.
        for _ in 0..BATCH_LIMIT {
            let Some(e) = self.sh.sys_event_ring.pop() else { break };
            write_record(
                writer,
                RecordType::Event,
                e.ts,
                &encode_event_sample(&e),
                broken,
                skipped,
            );
        }
    }

    /// Warn once per interval for every ring whose drop counter moved.
    fn report_drops(&self, watch: &mut DropWatch) {
        let pairs = [
            ("state_ring", self.sh.state_ring.drops(), &mut watch.state),
            ("action_ring", self.sh.action_ring.drops(), &mut watch.action),
            ("event_ring", self.sh.event_ring.drops(), &mut watch.event),
            (
                "sys_event_ring",
                self.sh.sys_event_ring.drops(),
                &mut watch.sys_event,
            ),
            ("hw_event_q", self.sh.hw_event_q.drops(), &mut watch.hw_q),
            ("sys_event_q", self.sh.sys_event_q.drops(), &mut watch.sys_q),
        ];

        for (name, now, last) in pairs {
            if now != *last {
                log::warn!("[LOG] Drops: {}={} (+{})", name, now, now - *last);
                *last = now;
            }
        }
    }

    fn report_cmd_age(&self, cfg: &crate::config::RuntimeConfig) {
        match self.sh.cmd_age_s(clock::monotonic_now()) {
            Some(age) => log::debug!(
                "[LOG] Health: cmd age {:.3}s (timeout {:.3}s)",
                age,
                cfg.cmd_timeout_s
            ),
            None => log::debug!("[LOG] Health: no command received yet"),
        }
    }
}

fn write_record(
    writer: &mut Option<RotatingBinaryLog>,
    ty: RecordType,
    ts: crate::core::Timestamps,
    payload: &[u8],
    broken: &mut bool,
    skipped: &mut u64,
) {
    let Some(w) = writer.as_mut() else { return };
    if *broken {
        *skipped += 1;
        return;
    }
    if let Err(e) = w.write_record(ty, ts, payload) {
        log::warn!("[LOG] Record write failed: {}", e);
        *broken = true;
        *skipped += 1;
    }
}
