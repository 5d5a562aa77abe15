//! TCP worker: state broadcast and command ingress.
//!
//! Two nonblocking listeners. The STATE port accepts any number of
//! subscribers and streams one encoded frame per tick to all of them; the
//! CMD port carries a single active controller — accepting a new command
//! connection closes the previous one.
//!
//! The Rust runtime ignores SIGPIPE process-wide, so a broken subscriber
//! surfaces as a write error on that socket only; it is closed and removed
//! and the pipeline continues.

use crate::clock;
use crate::core::{EventCmd, EventSample, EventType, Setpoint};
use crate::rate::RateLimiter;
use crate::wire::codec::{STATES_PAYLOAD_LEN, STATS_PAYLOAD_LEN};
use crate::wire::frame::{self, Frame, FrameRx, HDR_LEN};
use crate::wire::{encode_states_payload, CmdPayload, ConfigPayload, StatsPayload};
use crate::workers::{SharedState, StopFlag};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub struct TcpWorker {
    sh: Arc<SharedState>,
    stop: StopFlag,
}

/// Per-connection-lifetime tracking for one-shot command semantics.
#[derive(Default)]
pub struct CmdTracker {
    last_cmd_seq: Option<u32>,
    last_cmd_flags: u8,
    last_sp_seq: Option<u32>,
    last_sp_flags: u8,
    stats_seq: u32,
}

/// Bits that flipped 0 → 1 between two flag observations.
pub fn rising_edges(prev: u8, now: u8) -> u8 {
    !prev & now
}

impl TcpWorker {
    pub fn new(sh: Arc<SharedState>, stop: StopFlag) -> Self {
        TcpWorker { sh, stop }
    }

    pub fn run(self) {
        let cfg = self.sh.config();

        let state_srv = match self.bind(&cfg.bind_ip, cfg.state_port, "state") {
            Some(l) => l,
            None => return,
        };
        let cmd_srv = match self.bind(&cfg.bind_ip, cfg.cmd_port, "cmd") {
            Some(l) => l,
            None => return,
        };

        let mut state_clients: Vec<TcpStream> = Vec::new();
        let mut cmd_client: Option<TcpStream> = None;
        let mut frx = FrameRx::new();
        let mut tracker = CmdTracker::default();
        let mut state_seq: u32 = 0;

        let mut rate = RateLimiter::new(cfg.tcp_hz);
        rate.reset();

        while !self.stop.stop_requested() {
            let cfg = self.sh.config();
            rate.set_hz(cfg.tcp_hz);

            self.accept_state_clients(&state_srv, &mut state_clients);
            self.accept_cmd_client(&cmd_srv, &mut cmd_client, &mut frx);

            self.broadcast_state(&mut state_clients, &mut state_seq);

            self.service_cmd_client(&mut cmd_client, &mut frx, &mut tracker);

            rate.sleep();
        }

        log::info!(
            "[TCP] Worker exit ({} subscribers open)",
            state_clients.len()
        );
    }

    fn bind(&self, ip: &str, port: u16, what: &str) -> Option<TcpListener> {
        match TcpListener::bind((ip, port)) {
            Ok(l) => {
                if let Err(e) = l.set_nonblocking(true) {
                    log::error!("[TCP] Failed to set {} listener nonblocking: {}", what, e);
                }
                log::info!("[TCP] {} server listening on {}:{}", what, ip, port);
                Some(l)
            }
            Err(e) => {
                // Both listeners are mandatory resources.
                log::error!("[TCP] Failed to bind {} server on {}:{}: {}", what, ip, port, e);
                self.sh.mark_fatal();
                self.stop.request_stop();
                None
            }
        }
    }

    fn accept_state_clients(&self, srv: &TcpListener, clients: &mut Vec<TcpStream>) {
        loop {
            match srv.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("[TCP] State client {} nonblocking failed: {}", addr, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    clients.push(stream);
                    log::info!("[TCP] State client connected: {} ({})", addr, clients.len());
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("[TCP] State accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn accept_cmd_client(
        &self,
        srv: &TcpListener,
        cmd_client: &mut Option<TcpStream>,
        frx: &mut FrameRx,
    ) {
        loop {
            match srv.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::warn!("[TCP] Cmd client {} nonblocking failed: {}", addr, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    if cmd_client.replace(stream).is_some() {
                        log::info!("[TCP] Cmd client replaced by {}", addr);
                    } else {
                        log::info!("[TCP] Cmd client connected: {}", addr);
                    }
                    // Bytes buffered from the previous controller are stale.
                    frx.clear();
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("[TCP] Cmd accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn service_cmd_client(
        &self,
        cmd_client: &mut Option<TcpStream>,
        frx: &mut FrameRx,
        tracker: &mut CmdTracker,
    ) {
        let Some(stream) = cmd_client.as_mut() else {
            return;
        };

        let mut buf = [0u8; 2048];
        let mut drop_client = false;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::info!("[TCP] Cmd client disconnected");
                    drop_client = true;
                    break;
                }
                Ok(n) => {
                    frx.push_bytes(&buf[..n]);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[TCP] Cmd recv failed: {}", e);
                    drop_client = true;
                    break;
                }
            }
        }

        while let Some(f) = frx.pop() {
            route_frame(&self.sh, tracker, &f, cmd_client.as_mut());
        }

        if drop_client {
            *cmd_client = None;
        }
    }

    fn broadcast_state(&self, clients: &mut Vec<TcpStream>, state_seq: &mut u32) {
        let Some(st) = self.sh.latest_state.load() else {
            return;
        };

        *state_seq = state_seq.wrapping_add(1);
        let t_mono_s = clock::monotonic_now() as f32;

        // One encode per tick; the same frame bytes go to every subscriber.
        let mut out = [0u8; HDR_LEN + STATES_PAYLOAD_LEN];
        out[..HDR_LEN].copy_from_slice(&frame::make_hdr(
            frame::MSG_STATE,
            STATES_PAYLOAD_LEN as u8,
        ));
        out[HDR_LEN..].copy_from_slice(&encode_states_payload(*state_seq, t_mono_s, &st));

        clients.retain_mut(|c| match c.write_all(&out) {
            Ok(()) => true,
            Err(e) => {
                // Slow or gone either way: drop the subscriber, keep going.
                log::info!("[TCP] State client dropped: {}", e);
                false
            }
        });
    }
}

/// Route one decoded frame into the pipeline.
///
/// Separated from the socket loop so the command semantics (seq-gated
/// one-shots, rising edges, config swap) are testable without a network.
pub fn route_frame(
    sh: &SharedState,
    tracker: &mut CmdTracker,
    f: &Frame,
    reply: Option<&mut TcpStream>,
) {
    let now_mono = clock::monotonic_now();

    match f.msg_type {
        frame::MSG_CMD => {
            let cp = match CmdPayload::decode(&f.payload) {
                Ok(p) => p,
                Err(_) => {
                    sh.tcp_frames_bad.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            sh.mark_cmd_rx(now_mono);

            let mask = sh.config().flag_event_mask;

            if tracker.last_cmd_seq != Some(cp.seq) {
                // Beep fires once per distinct sequence number.
                if cp.actions.beep_ms != 0 {
                    sh.hw_event_q.push_overwrite(EventCmd {
                        kind: EventType::Beep,
                        seq: cp.seq,
                        data: [cp.actions.beep_ms, 0, 0, 0],
                        aux_u32: 0,
                    });
                }

                let rises = rising_edges(tracker.last_cmd_flags, cp.actions.flags) & mask;
                emit_flag_rises(sh, cp.seq, rises, cp.actions.flags);

                tracker.last_cmd_seq = Some(cp.seq);
                tracker.last_cmd_flags = cp.actions.flags;
            }

            // Continuous copy: beep is one-shot, event bits are stripped.
            let mut continuous = cp.actions;
            continuous.beep_ms = 0;
            continuous.flags &= !mask;
            sh.latest_remote_cmd.store(continuous);
        }

        frame::MSG_SETPOINT => {
            let sp = match crate::wire::codec::decode_setpoint_payload(&f.payload) {
                Ok(p) => p,
                Err(_) => {
                    sh.tcp_frames_bad.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            sh.mark_cmd_rx(now_mono);

            let mask = sh.config().flag_event_mask;
            if tracker.last_sp_seq != Some(sp.seq) {
                let rises = rising_edges(tracker.last_sp_flags, sp.flags) & mask;
                emit_flag_rises(sh, sp.seq, rises, sp.flags);
                tracker.last_sp_seq = Some(sp.seq);
                tracker.last_sp_flags = sp.flags;
            }

            let stored = Setpoint {
                flags: sp.flags & !mask,
                ..sp
            };
            sh.latest_setpoint.store(stored);
        }

        frame::MSG_CONFIG => {
            let cfgp = match ConfigPayload::decode(&f.payload) {
                Ok(p) => p,
                Err(_) => {
                    sh.tcp_frames_bad.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };
            apply_config(sh, &cfgp);
        }

        frame::MSG_STATS_REQ => {
            tracker.stats_seq = tracker.stats_seq.wrapping_add(1);
            let stats = build_stats(sh, tracker.stats_seq);

            if let Some(stream) = reply {
                let mut out = [0u8; HDR_LEN + STATS_PAYLOAD_LEN];
                out[..HDR_LEN].copy_from_slice(&frame::make_hdr(
                    frame::MSG_STATS_RESP,
                    STATS_PAYLOAD_LEN as u8,
                ));
                out[HDR_LEN..].copy_from_slice(&stats.encode());
                // Best effort: a failed stats reply is not worth the socket.
                if let Err(e) = stream.write_all(&out) {
                    log::debug!("[TCP] Stats reply failed: {}", e);
                }
            }
        }

        _ => {
            // STATE / STATS_RESP arriving at the gateway are wrong-direction.
            sh.tcp_frames_bad.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Push one FLAG_RISE per set bit into the controller queue, mirrored into
/// the logger ring.
fn emit_flag_rises(sh: &SharedState, seq: u32, rises: u8, flags_snapshot: u8) {
    if rises == 0 {
        return;
    }
    for bit in 0..8u8 {
        if rises & (1 << bit) == 0 {
            continue;
        }
        let ev = EventCmd {
            kind: EventType::FlagRise,
            seq,
            data: [bit, flags_snapshot, 0, 0],
            aux_u32: 0,
        };
        sh.sys_event_q.push_overwrite(ev);
        sh.sys_event_ring.push_overwrite(EventSample {
            ts: clock::now_timestamps(),
            event: ev,
        });
    }
}

/// Copy-modify-swap the runtime config and report the apply. Unknown keys
/// still produce a CONFIG_APPLIED event carrying the key.
fn apply_config(sh: &SharedState, cfgp: &ConfigPayload) {
    let next = sh.config().apply_key(cfgp);
    sh.swap_config(next);

    let ev = EventCmd {
        kind: EventType::ConfigApplied,
        seq: cfgp.seq,
        data: [cfgp.key, cfgp.v_u8, 0, 0],
        aux_u32: cfgp.v_u32,
    };
    sh.sys_event_q.push_overwrite(ev);
    sh.sys_event_ring.push_overwrite(EventSample {
        ts: clock::now_timestamps(),
        event: ev,
    });

    log::info!("[TCP] Config applied: key={} seq={}", cfgp.key, cfgp.seq);
}

/// Assemble the diagnostic snapshot answered to STATS_REQ.
pub fn build_stats(sh: &SharedState, seq: u32) -> StatsPayload {
    let cfg = sh.config();
    let uptime_s = clock::monotonic_now() - sh.start_mono_s;

    StatsPayload {
        seq,
        uptime_ms: (uptime_s * 1000.0) as u32,
        usb_hz: cfg.usb_hz as f32,
        tcp_hz: cfg.tcp_hz as f32,
        ctrl_hz: cfg.ctrl_hz as f32,
        drops_state: sh.state_ring.drops() as u32,
        drops_cmd: sh.action_ring.drops() as u32,
        drops_event: sh.event_ring.drops() as u32,
        drops_sys_event: sh.sys_event_ring.drops() as u32,
        tcp_frames_bad: sh.tcp_frames_bad.load(Ordering::Relaxed),
        serial_errors: sh.serial_errors.load(Ordering::Relaxed),
        reserved: 0,
    }
}
