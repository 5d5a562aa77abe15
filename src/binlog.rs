//! Rotating binary record log.
//!
//! File layout:
//!
//! ```text
//! FileHeader   { magic: u32 = 0x47574C42, ver: u16 = 1, reserved: u16 }   8 bytes
//! Record       { type: u8, reserved: u8, payload_len: u16,
//!                epoch_s: f64, mono_s: f64 }                             20 bytes
//!              payload bytes follow verbatim
//! ```
//!
//! All header fields are little-endian. Files are named
//! `<stem>_<YYYYMMDD_HHMMSS>_<index>.<ext>` inside a fixed directory;
//! rotation triggers before a record that would exceed `max_bytes`, so a
//! record is always whole within one file. Retention deletes the oldest
//! matching files beyond `keep_files`, best effort.

use crate::core::{ActionSample, EventSample, StateSample, Timestamps};
use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const LOG_MAGIC: u32 = 0x4757_4C42; // 'BLWG'
pub const LOG_VERSION: u16 = 1;
pub const FILE_HEADER_LEN: u64 = 8;
pub const RECORD_HEADER_LEN: u64 = 20;

/// Record type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    State = 1,
    Cmd = 2,
    Event = 3,
}

/// Size-based rotating writer.
pub struct RotatingBinaryLog {
    dir: PathBuf,
    stem: String,
    ext: String,
    max_bytes: u64,
    keep_files: u32,
    index: u32,
    bytes_written: u64,
    session_tag: String,
    file: Option<BufWriter<File>>,
}

impl RotatingBinaryLog {
    /// Open the log under `base_path` (e.g. `./logs/gateway.bin`). The
    /// directory is created if missing; the first file is opened
    /// immediately.
    pub fn open<P: AsRef<Path>>(base_path: P, max_bytes: u64, keep_files: u32) -> Result<Self> {
        let base = base_path.as_ref();
        let dir = base
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let stem = base
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("gateway")
            .to_string();
        let ext = base
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("bin")
            .to_string();

        fs::create_dir_all(&dir)?;

        let mut log = RotatingBinaryLog {
            dir,
            stem,
            ext,
            max_bytes: max_bytes.max(FILE_HEADER_LEN + RECORD_HEADER_LEN),
            keep_files: keep_files.max(1),
            index: 0,
            bytes_written: 0,
            session_tag: chrono::Local::now().format("%Y%m%d_%H%M%S").to_string(),
            file: None,
        };
        log.open_new_file()?;
        Ok(log)
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Hot-reload rotation limits (CONFIG keys act between records).
    pub fn set_limits(&mut self, max_bytes: u64, keep_files: u32) {
        self.max_bytes = max_bytes.max(FILE_HEADER_LEN + RECORD_HEADER_LEN);
        self.keep_files = keep_files.max(1);
    }

    /// Path of the file currently being written.
    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{:04}.{}",
            self.stem, self.session_tag, self.index, self.ext
        ))
    }

    /// Append one record, rotating first if it would overflow the file.
    pub fn write_record(&mut self, ty: RecordType, ts: Timestamps, payload: &[u8]) -> Result<()> {
        let incoming = RECORD_HEADER_LEN + payload.len() as u64;
        self.rotate_if_needed(incoming)?;

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Other("binary log not open".to_string()))?;

        let mut hdr = [0u8; RECORD_HEADER_LEN as usize];
        hdr[0] = ty as u8;
        hdr[1] = 0;
        hdr[2..4].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        hdr[4..12].copy_from_slice(&ts.epoch_s.to_le_bytes());
        hdr[12..20].copy_from_slice(&ts.mono_s.to_le_bytes());

        file.write_all(&hdr)?;
        file.write_all(payload)?;
        self.bytes_written += incoming;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    /// Drop the current handle and start a fresh file (used to recover
    /// after a disk error).
    pub fn reopen(&mut self) -> Result<()> {
        self.file = None;
        self.index += 1;
        self.open_new_file()
    }

    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }

    fn rotate_if_needed(&mut self, incoming: u64) -> Result<()> {
        if self.file.is_some() && self.bytes_written + incoming <= self.max_bytes {
            return Ok(());
        }
        if self.file.is_some() {
            self.close();
            self.index += 1;
        }
        self.open_new_file()
    }

    fn open_new_file(&mut self) -> Result<()> {
        let path = self.current_path();
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);

        let mut hdr = [0u8; FILE_HEADER_LEN as usize];
        hdr[0..4].copy_from_slice(&LOG_MAGIC.to_le_bytes());
        hdr[4..6].copy_from_slice(&LOG_VERSION.to_le_bytes());
        writer.write_all(&hdr)?;

        self.file = Some(writer);
        self.bytes_written = FILE_HEADER_LEN;
        log::info!("Binary log file: {}", path.display());

        self.prune_old();
        Ok(())
    }

    /// Delete the oldest matching files beyond the retention count. Any
    /// filesystem error here is logged and otherwise ignored.
    fn prune_old(&self) {
        let prefix = format!("{}_", self.stem);
        let suffix = format!(".{}", self.ext);

        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Log retention scan failed: {}", e);
                return;
            }
        };

        let mut matching: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix) && n.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();

        if matching.len() <= self.keep_files as usize {
            return;
        }

        // Session tag + zero-padded index make the name order chronological.
        matching.sort();
        let excess = matching.len() - self.keep_files as usize;
        for path in matching.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("Failed to prune old log {}: {}", path.display(), e);
            } else {
                log::debug!("Pruned old log {}", path.display());
            }
        }
    }
}

impl Drop for RotatingBinaryLog {
    fn drop(&mut self) {
        self.close();
    }
}

// ---- sample payload serialization ----
//
// Log payloads are the in-memory samples written field by field; struct
// packing never reaches the disk format.

pub const STATE_SAMPLE_LEN: usize = 88;
pub const ACTION_SAMPLE_LEN: usize = 30;
pub const EVENT_SAMPLE_LEN: usize = 29;

fn put_ts(out: &mut [u8], ts: Timestamps) {
    out[0..8].copy_from_slice(&ts.epoch_s.to_le_bytes());
    out[8..16].copy_from_slice(&ts.mono_s.to_le_bytes());
}

pub fn encode_state_sample(s: &StateSample) -> [u8; STATE_SAMPLE_LEN] {
    let mut out = [0u8; STATE_SAMPLE_LEN];
    put_ts(&mut out, s.ts);
    out[16..20].copy_from_slice(&s.seq.to_le_bytes());

    let mut o = 20;
    for v in [s.state.imu.acc, s.state.imu.gyro, s.state.imu.mag] {
        out[o..o + 4].copy_from_slice(&v.x.to_le_bytes());
        out[o + 4..o + 8].copy_from_slice(&v.y.to_le_bytes());
        out[o + 8..o + 12].copy_from_slice(&v.z.to_le_bytes());
        o += 12;
    }
    for v in [s.state.ang.roll, s.state.ang.pitch, s.state.ang.yaw] {
        out[o..o + 4].copy_from_slice(&v.to_le_bytes());
        o += 4;
    }
    for v in [s.state.enc.e1, s.state.enc.e2, s.state.enc.e3, s.state.enc.e4] {
        out[o..o + 4].copy_from_slice(&v.to_le_bytes());
        o += 4;
    }
    out[o..o + 4].copy_from_slice(&s.state.battery_voltage.to_le_bytes());
    out
}

pub fn encode_action_sample(s: &ActionSample) -> [u8; ACTION_SAMPLE_LEN] {
    let mut out = [0u8; ACTION_SAMPLE_LEN];
    put_ts(&mut out, s.ts);
    out[16..20].copy_from_slice(&s.seq.to_le_bytes());
    out[20..22].copy_from_slice(&s.action.motors.m1.to_le_bytes());
    out[22..24].copy_from_slice(&s.action.motors.m2.to_le_bytes());
    out[24..26].copy_from_slice(&s.action.motors.m3.to_le_bytes());
    out[26..28].copy_from_slice(&s.action.motors.m4.to_le_bytes());
    out[28] = s.action.beep_ms;
    out[29] = s.action.flags;
    out
}

pub fn encode_event_sample(s: &EventSample) -> [u8; EVENT_SAMPLE_LEN] {
    let mut out = [0u8; EVENT_SAMPLE_LEN];
    put_ts(&mut out, s.ts);
    out[16] = s.event.kind.as_u8();
    out[17..21].copy_from_slice(&s.event.seq.to_le_bytes());
    out[21..25].copy_from_slice(&s.event.data);
    out[25..29].copy_from_slice(&s.event.aux_u32.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Actions, EventCmd, EventType, MotorCommands};

    fn ts(mono: f64) -> Timestamps {
        Timestamps {
            epoch_s: 1.7e9 + mono,
            mono_s: mono,
        }
    }

    fn read_file(path: &Path) -> Vec<u8> {
        fs::read(path).expect("log file readable")
    }

    #[test]
    fn file_header_has_magic_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("gw.bin");
        let mut log = RotatingBinaryLog::open(&base, 1024 * 1024, 3).unwrap();
        log.write_record(RecordType::State, ts(0.5), &[1, 2, 3]).unwrap();
        let path = log.current_path();
        log.close();

        let bytes = read_file(&path);
        assert_eq!(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            LOG_MAGIC
        );
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), LOG_VERSION);
    }

    #[test]
    fn record_layout_is_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RotatingBinaryLog::open(dir.path().join("gw.bin"), 1 << 20, 2).unwrap();
        log.write_record(RecordType::Event, ts(2.0), &[0xAB; 5]).unwrap();
        let path = log.current_path();
        log.close();

        let b = read_file(&path);
        let r = &b[FILE_HEADER_LEN as usize..];
        assert_eq!(r[0], RecordType::Event as u8);
        assert_eq!(r[1], 0);
        assert_eq!(u16::from_le_bytes([r[2], r[3]]), 5);
        let epoch = f64::from_le_bytes(r[4..12].try_into().unwrap());
        let mono = f64::from_le_bytes(r[12..20].try_into().unwrap());
        assert_eq!(mono, 2.0);
        assert_eq!(epoch, 1.7e9 + 2.0);
        assert_eq!(&r[20..25], &[0xAB; 5]);
    }

    #[test]
    fn rotation_respects_max_bytes_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let max_bytes = 256u64;
        let keep = 3u32;
        let mut log = RotatingBinaryLog::open(dir.path().join("gw.bin"), max_bytes, keep).unwrap();

        let payload = [0u8; 64];
        for i in 0..40 {
            log.write_record(RecordType::State, ts(i as f64), &payload)
                .unwrap();
        }
        log.close();

        let files: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .collect();
        assert_eq!(files.len(), keep as usize);

        for f in &files {
            let bytes = read_file(f);
            // every file starts with the magic and stays within the cap
            assert_eq!(
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                LOG_MAGIC
            );
            assert!(bytes.len() as u64 <= max_bytes);
            let name = f.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with("gw_") && name.ends_with(".bin"));
        }
    }

    #[test]
    fn records_are_never_split_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RotatingBinaryLog::open(dir.path().join("gw.bin"), 128, 10).unwrap();

        // Each record is 20 + 64 bytes; two fit in no 128-byte file, so
        // every file holds exactly one whole record.
        for i in 0..4 {
            log.write_record(RecordType::Cmd, ts(i as f64), &[7u8; 64]).unwrap();
        }
        log.close();

        for f in fs::read_dir(dir.path()).unwrap().flatten() {
            let bytes = read_file(&f.path());
            let body = &bytes[FILE_HEADER_LEN as usize..];
            assert_eq!(body.len() as u64, RECORD_HEADER_LEN + 64);
        }
    }

    #[test]
    fn sample_encoders_have_fixed_layout() {
        let st = StateSample {
            ts: ts(1.0),
            seq: 5,
            state: Default::default(),
        };
        assert_eq!(encode_state_sample(&st).len(), STATE_SAMPLE_LEN);

        let act = ActionSample {
            ts: ts(1.0),
            seq: 9,
            action: Actions {
                motors: MotorCommands {
                    m1: -1,
                    m2: 2,
                    m3: -3,
                    m4: 4,
                },
                beep_ms: 0,
                flags: 0x80,
            },
        };
        let buf = encode_action_sample(&act);
        assert_eq!(u32::from_le_bytes(buf[16..20].try_into().unwrap()), 9);
        assert_eq!(i16::from_le_bytes([buf[20], buf[21]]), -1);
        assert_eq!(buf[29], 0x80);

        let ev = EventSample {
            ts: ts(2.0),
            event: EventCmd {
                kind: EventType::FlagRise,
                seq: 3,
                data: [1, 0xA5, 0, 0],
                aux_u32: 0xCAFEBABE,
            },
        };
        let buf = encode_event_sample(&ev);
        assert_eq!(buf[16], 1);
        assert_eq!(u32::from_le_bytes(buf[17..21].try_into().unwrap()), 3);
        assert_eq!(buf[21], 1);
        assert_eq!(
            u32::from_le_bytes(buf[25..29].try_into().unwrap()),
            0xCAFEBABE
        );
    }
}
