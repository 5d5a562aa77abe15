//! Error types for SetuIO
//!
//! # Recovery policy
//!
//! Recoverable errors stay local to the worker that observed them:
//!
//! - **`Protocol`**: a malformed TCP or serial frame. The decoder resyncs
//!   (one byte at a time), a diagnostic counter is bumped, and the stream
//!   keeps flowing.
//! - **`Io` on a network peer**: only that socket is closed and removed;
//!   the pipeline continues.
//! - **Disk errors in the binary log**: the record is skipped and a reopen
//!   is attempted at the next health interval.
//!
//! Only two situations escalate to a process stop:
//!
//! - **`Serial` / `Io` on the board link** after the connection was healthy
//!   (the serial link is mandatory; `serial_errors` is incremented first).
//! - **`Config` / initialization failures** for mandatory resources, which
//!   map to exit code 1 in `main`.

use thiserror::Error;

/// Errors that can occur in SetuIO
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
