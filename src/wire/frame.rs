//! Framed binary protocol over TCP (stream-safe).
//!
//! Every message is a 3-byte header `[type, ver, len]` followed by `len`
//! payload bytes. The header is deliberately tiny: the command stream runs
//! at a few hundred hertz and the state broadcast reuses one encoded frame
//! for all subscribers.

use crate::wire::codec::{
    CMD_PAYLOAD_LEN, CONFIG_PAYLOAD_LEN, SETPOINT_PAYLOAD_LEN, STATES_PAYLOAD_LEN,
    STATS_PAYLOAD_LEN,
};

/// Protocol version carried in every header.
pub const MSG_VER: u8 = 1;

pub const MSG_STATE: u8 = 1;
pub const MSG_CMD: u8 = 2;
pub const MSG_SETPOINT: u8 = 3;
pub const MSG_CONFIG: u8 = 4;
pub const MSG_STATS_REQ: u8 = 5;
pub const MSG_STATS_RESP: u8 = 6;

/// Header size on the wire.
pub const HDR_LEN: usize = 3;

pub fn is_known_type(t: u8) -> bool {
    (MSG_STATE..=MSG_STATS_RESP).contains(&t)
}

/// Largest payload a given type may carry. Anything above is treated as
/// garbage and resynced over.
fn max_len_for(t: u8) -> usize {
    match t {
        MSG_STATE => STATES_PAYLOAD_LEN,
        MSG_CMD => CMD_PAYLOAD_LEN,
        MSG_SETPOINT => SETPOINT_PAYLOAD_LEN,
        MSG_CONFIG => CONFIG_PAYLOAD_LEN,
        MSG_STATS_REQ => 0,
        MSG_STATS_RESP => STATS_PAYLOAD_LEN,
        _ => 0,
    }
}

/// Types that must not arrive with an empty payload.
fn payload_mandatory(t: u8) -> bool {
    matches!(t, MSG_STATE | MSG_CMD | MSG_SETPOINT | MSG_CONFIG | MSG_STATS_RESP)
}

/// Build a wire header.
pub fn make_hdr(msg_type: u8, payload_len: u8) -> [u8; HDR_LEN] {
    [msg_type, MSG_VER, payload_len]
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

/// Stream decoder for header+payload frames.
///
/// Keeps a read cursor instead of erasing the consumed prefix on every
/// frame, compacting occasionally. A hard buffer cap bounds memory against
/// junk streams. Invalid headers resync by dropping exactly one byte per
/// [`pop`](Self::pop) call, so any valid frame still buffered is recovered.
#[derive(Default)]
pub struct FrameRx {
    buf: Vec<u8>,
    read_pos: usize,
}

impl FrameRx {
    /// Hard cap against peers flooding garbage.
    pub const MAX_BUFFER_BYTES: usize = 64 * 1024;
    /// Compact once the consumed prefix exceeds this and half the buffer.
    const COMPACT_THRESHOLD: usize = 4096;

    pub fn new() -> Self {
        FrameRx::default()
    }

    /// Append received bytes, enforcing the buffer cap. When the cap would
    /// be exceeded the buffer is reset, keeping at most the tail that fits.
    pub fn push_bytes(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if self.available_bytes() + data.len() > Self::MAX_BUFFER_BYTES {
            self.clear();
            let keep = data.len().min(Self::MAX_BUFFER_BYTES);
            self.buf.extend_from_slice(&data[data.len() - keep..]);
            return;
        }

        self.buf.extend_from_slice(data);
    }

    /// Try to extract one complete frame.
    ///
    /// Returns `None` when there is not enough data yet, or after a single
    /// resync step over an invalid header (call again to make progress).
    pub fn pop(&mut self) -> Option<Frame> {
        if self.available_bytes() < HDR_LEN {
            return None;
        }

        let msg_type = self.buf[self.read_pos];
        let ver = self.buf[self.read_pos + 1];
        let len = self.buf[self.read_pos + 2] as usize;

        if ver != MSG_VER || !is_known_type(msg_type) {
            return self.resync();
        }
        if len > max_len_for(msg_type) {
            return self.resync();
        }
        if len == 0 && payload_mandatory(msg_type) {
            return self.resync();
        }

        let total = HDR_LEN + len;
        if self.available_bytes() < total {
            return None;
        }

        let start = self.read_pos + HDR_LEN;
        let payload = self.buf[start..start + len].to_vec();
        self.read_pos += total;
        self.maybe_compact();

        Some(Frame { msg_type, payload })
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.read_pos = 0;
    }

    pub fn available_bytes(&self) -> usize {
        self.buf.len().saturating_sub(self.read_pos)
    }

    /// Drop exactly one byte and report no frame.
    fn resync(&mut self) -> Option<Frame> {
        self.read_pos += 1;
        self.maybe_compact();
        None
    }

    fn maybe_compact(&mut self) {
        if self.read_pos == self.buf.len() {
            self.clear();
            return;
        }
        if self.read_pos >= Self::COMPACT_THRESHOLD && self.read_pos > self.buf.len() / 2 {
            self.buf.drain(..self.read_pos);
            self.read_pos = 0;
        }
    }
}
