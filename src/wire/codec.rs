//! Payload codecs for the gateway TCP protocol.
//!
//! The wire format is little-endian for every multi-byte field; floats are
//! IEEE-754 binary32 transmitted as their LE bit pattern. Each field is
//! written explicitly so clients in any language can decode without knowing
//! host struct packing.

use crate::core::{Actions, Setpoint, States};
use crate::error::{Error, Result};

/// STATE payload: seq + t_mono + IMU(9) + angles(3) + encoders(4) + battery.
pub const STATES_PAYLOAD_LEN: usize = 76;
/// CMD payload: seq + 4 motors + beep + flags.
pub const CMD_PAYLOAD_LEN: usize = 14;
/// SETPOINT payload: seq + 4 floats + flags.
pub const SETPOINT_PAYLOAD_LEN: usize = 21;
/// CONFIG payload: seq + key + u8 + u16 + u32.
pub const CONFIG_PAYLOAD_LEN: usize = 12;
/// STATS_RESP payload: fixed 12-word diagnostic block.
pub const STATS_PAYLOAD_LEN: usize = 48;

// ---- field helpers ----

fn put_u16(out: &mut [u8], off: usize, v: u16) {
    out[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut [u8], off: usize, v: u32) {
    out[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_i16(out: &mut [u8], off: usize, v: i16) {
    out[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_i32(out: &mut [u8], off: usize, v: i32) {
    out[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_f32(out: &mut [u8], off: usize, v: f32) {
    out[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_i16(buf: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_i32(buf: &[u8], off: usize) -> i32 {
    i32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn get_f32(buf: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn check_len(buf: &[u8], expected: usize, what: &str) -> Result<()> {
    if buf.len() != expected {
        return Err(Error::Protocol(format!(
            "{} payload size {} (expected {})",
            what,
            buf.len(),
            expected
        )));
    }
    Ok(())
}

// ---- STATE ----

/// Encode one state broadcast payload.
pub fn encode_states_payload(seq: u32, t_mono_s: f32, st: &States) -> [u8; STATES_PAYLOAD_LEN] {
    let mut out = [0u8; STATES_PAYLOAD_LEN];
    put_u32(&mut out, 0, seq);
    put_f32(&mut out, 4, t_mono_s);

    let mut o = 8;
    for v in [st.imu.acc, st.imu.gyro, st.imu.mag] {
        put_f32(&mut out, o, v.x);
        put_f32(&mut out, o + 4, v.y);
        put_f32(&mut out, o + 8, v.z);
        o += 12;
    }

    put_f32(&mut out, 44, st.ang.roll);
    put_f32(&mut out, 48, st.ang.pitch);
    put_f32(&mut out, 52, st.ang.yaw);

    put_i32(&mut out, 56, st.enc.e1);
    put_i32(&mut out, 60, st.enc.e2);
    put_i32(&mut out, 64, st.enc.e3);
    put_i32(&mut out, 68, st.enc.e4);

    put_f32(&mut out, 72, st.battery_voltage);
    out
}

/// Decode a state broadcast payload into `(seq, t_mono_s, states)`.
pub fn decode_states_payload(buf: &[u8]) -> Result<(u32, f32, States)> {
    check_len(buf, STATES_PAYLOAD_LEN, "STATE")?;
    let seq = get_u32(buf, 0);
    let t_mono_s = get_f32(buf, 4);

    let mut st = States::default();
    let mut o = 8;
    for v in [&mut st.imu.acc, &mut st.imu.gyro, &mut st.imu.mag] {
        v.x = get_f32(buf, o);
        v.y = get_f32(buf, o + 4);
        v.z = get_f32(buf, o + 8);
        o += 12;
    }

    st.ang.roll = get_f32(buf, 44);
    st.ang.pitch = get_f32(buf, 48);
    st.ang.yaw = get_f32(buf, 52);

    st.enc.e1 = get_i32(buf, 56);
    st.enc.e2 = get_i32(buf, 60);
    st.enc.e3 = get_i32(buf, 64);
    st.enc.e4 = get_i32(buf, 68);

    st.battery_voltage = get_f32(buf, 72);
    Ok((seq, t_mono_s, st))
}

// ---- CMD ----

/// Legacy command frame: a full `Actions` plus sequence number.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CmdPayload {
    pub seq: u32,
    pub actions: Actions,
}

impl CmdPayload {
    pub fn encode(&self) -> [u8; CMD_PAYLOAD_LEN] {
        let mut out = [0u8; CMD_PAYLOAD_LEN];
        put_u32(&mut out, 0, self.seq);
        put_i16(&mut out, 4, self.actions.motors.m1);
        put_i16(&mut out, 6, self.actions.motors.m2);
        put_i16(&mut out, 8, self.actions.motors.m3);
        put_i16(&mut out, 10, self.actions.motors.m4);
        out[12] = self.actions.beep_ms;
        out[13] = self.actions.flags;
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, CMD_PAYLOAD_LEN, "CMD")?;
        let mut p = CmdPayload {
            seq: get_u32(buf, 0),
            ..Default::default()
        };
        p.actions.motors.m1 = get_i16(buf, 4);
        p.actions.motors.m2 = get_i16(buf, 6);
        p.actions.motors.m3 = get_i16(buf, 8);
        p.actions.motors.m4 = get_i16(buf, 10);
        p.actions.beep_ms = buf[12];
        p.actions.flags = buf[13];
        Ok(p)
    }
}

// ---- SETPOINT ----

pub fn encode_setpoint_payload(sp: &Setpoint) -> [u8; SETPOINT_PAYLOAD_LEN] {
    let mut out = [0u8; SETPOINT_PAYLOAD_LEN];
    put_u32(&mut out, 0, sp.seq);
    for (i, v) in sp.sp.iter().enumerate() {
        put_f32(&mut out, 4 + i * 4, *v);
    }
    out[20] = sp.flags;
    out
}

pub fn decode_setpoint_payload(buf: &[u8]) -> Result<Setpoint> {
    check_len(buf, SETPOINT_PAYLOAD_LEN, "SETPOINT")?;
    let mut sp = Setpoint {
        seq: get_u32(buf, 0),
        ..Default::default()
    };
    for i in 0..4 {
        sp.sp[i] = get_f32(buf, 4 + i * 4);
    }
    sp.flags = buf[20];
    Ok(sp)
}

// ---- CONFIG ----

/// In-band runtime configuration message. The key selects which field of
/// the three value slots is meaningful; see the key table in `config`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConfigPayload {
    pub seq: u32,
    pub key: u8,
    pub v_u8: u8,
    pub v_u16: u16,
    pub v_u32: u32,
}

impl ConfigPayload {
    pub fn encode(&self) -> [u8; CONFIG_PAYLOAD_LEN] {
        let mut out = [0u8; CONFIG_PAYLOAD_LEN];
        put_u32(&mut out, 0, self.seq);
        out[4] = self.key;
        out[5] = self.v_u8;
        put_u16(&mut out, 6, self.v_u16);
        put_u32(&mut out, 8, self.v_u32);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, CONFIG_PAYLOAD_LEN, "CONFIG")?;
        Ok(ConfigPayload {
            seq: get_u32(buf, 0),
            key: buf[4],
            v_u8: buf[5],
            v_u16: get_u16(buf, 6),
            v_u32: get_u32(buf, 8),
        })
    }
}

// ---- STATS ----

/// Diagnostic snapshot answered on the command socket.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct StatsPayload {
    pub seq: u32,
    pub uptime_ms: u32,
    pub usb_hz: f32,
    pub tcp_hz: f32,
    pub ctrl_hz: f32,
    pub drops_state: u32,
    pub drops_cmd: u32,
    pub drops_event: u32,
    pub drops_sys_event: u32,
    pub tcp_frames_bad: u32,
    pub serial_errors: u32,
    pub reserved: u32,
}

impl StatsPayload {
    pub fn encode(&self) -> [u8; STATS_PAYLOAD_LEN] {
        let mut out = [0u8; STATS_PAYLOAD_LEN];
        put_u32(&mut out, 0, self.seq);
        put_u32(&mut out, 4, self.uptime_ms);
        put_f32(&mut out, 8, self.usb_hz);
        put_f32(&mut out, 12, self.tcp_hz);
        put_f32(&mut out, 16, self.ctrl_hz);
        put_u32(&mut out, 20, self.drops_state);
        put_u32(&mut out, 24, self.drops_cmd);
        put_u32(&mut out, 28, self.drops_event);
        put_u32(&mut out, 32, self.drops_sys_event);
        put_u32(&mut out, 36, self.tcp_frames_bad);
        put_u32(&mut out, 40, self.serial_errors);
        put_u32(&mut out, 44, self.reserved);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, STATS_PAYLOAD_LEN, "STATS")?;
        Ok(StatsPayload {
            seq: get_u32(buf, 0),
            uptime_ms: get_u32(buf, 4),
            usb_hz: get_f32(buf, 8),
            tcp_hz: get_f32(buf, 12),
            ctrl_hz: get_f32(buf, 16),
            drops_state: get_u32(buf, 20),
            drops_cmd: get_u32(buf, 24),
            drops_event: get_u32(buf, 28),
            drops_sys_event: get_u32(buf, 32),
            tcp_frames_bad: get_u32(buf, 36),
            serial_errors: get_u32(buf, 40),
            reserved: get_u32(buf, 44),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MotorCommands, Vec3};

    #[test]
    fn cmd_roundtrip() {
        let p = CmdPayload {
            seq: 42,
            actions: Actions {
                motors: MotorCommands {
                    m1: -10,
                    m2: 20,
                    m3: 30,
                    m4: 40,
                },
                beep_ms: 7,
                flags: 0xA5,
            },
        };
        let buf = p.encode();
        assert_eq!(CmdPayload::decode(&buf).unwrap(), p);
    }

    #[test]
    fn cmd_rejects_wrong_size() {
        assert!(CmdPayload::decode(&[0u8; 12]).is_err());
    }

    #[test]
    fn setpoint_roundtrip() {
        let sp = Setpoint {
            seq: 9,
            sp: [1.5, -2.5, 0.0, 100.25],
            flags: 0x03,
        };
        let buf = encode_setpoint_payload(&sp);
        assert_eq!(decode_setpoint_payload(&buf).unwrap(), sp);
    }

    #[test]
    fn config_roundtrip() {
        let p = ConfigPayload {
            seq: 1,
            key: 4,
            v_u8: 0,
            v_u16: 250,
            v_u32: 0xDEADBEEF,
        };
        assert_eq!(ConfigPayload::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn stats_roundtrip() {
        let p = StatsPayload {
            seq: 3,
            uptime_ms: 123_456,
            usb_hz: 200.0,
            tcp_hz: 150.0,
            ctrl_hz: 100.0,
            drops_state: 1,
            drops_cmd: 2,
            drops_event: 3,
            drops_sys_event: 4,
            tcp_frames_bad: 5,
            serial_errors: 6,
            reserved: 0,
        };
        assert_eq!(StatsPayload::decode(&p.encode()).unwrap(), p);
    }

    #[test]
    fn states_layout_is_fixed() {
        let mut st = States::default();
        st.imu.acc = Vec3 {
            x: 1.0,
            y: 2.0,
            z: 3.0,
        };
        st.ang.yaw = -0.5;
        st.enc.e4 = -123_456;
        st.battery_voltage = 11.7;

        let buf = encode_states_payload(77, 1.25, &st);
        assert_eq!(buf.len(), 76);

        // Spot-check absolute offsets against the published layout.
        assert_eq!(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]), 77);
        assert_eq!(f32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), 1.25);
        assert_eq!(f32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]), 1.0);
        assert_eq!(
            f32::from_le_bytes([buf[52], buf[53], buf[54], buf[55]]),
            -0.5
        );
        assert_eq!(
            i32::from_le_bytes([buf[68], buf[69], buf[70], buf[71]]),
            -123_456
        );
        assert_eq!(
            f32::from_le_bytes([buf[72], buf[73], buf[74], buf[75]]),
            11.7
        );

        let (seq, t, decoded) = decode_states_payload(&buf).unwrap();
        assert_eq!(seq, 77);
        assert_eq!(t, 1.25);
        assert_eq!(decoded, st);
    }
}
