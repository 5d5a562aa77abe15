//! Serial transport abstraction.
//!
//! The board driver only needs a small capability set, so the backend is a
//! trait: the real `serialport` implementation in production, a mock for
//! tests and replay. Reads and writes go through separate cloned handles
//! (the RX thread owns one, command senders share the other behind the
//! driver's mutex).

use crate::error::Result;

mod mock;
mod serial;

pub use mock::MockSerial;
pub use serial::SerialTransport;

/// Transport capability set for the board link.
pub trait SerialIo: Send {
    /// Whether the underlying device is still usable.
    fn is_open(&self) -> bool;

    /// Release the device. Further reads/writes fail.
    fn close(&mut self);

    /// Fill `dst` completely.
    ///
    /// Returns `Ok(true)` when filled, `Ok(false)` on a read timeout with
    /// the stream otherwise intact (the caller resynchronizes), and an
    /// error only for hard I/O failures.
    fn read_exact(&mut self, dst: &mut [u8]) -> Result<bool>;

    /// Write the whole buffer or fail.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Second handle onto the same device (full-duplex split).
    fn try_clone(&self) -> Result<Box<dyn SerialIo>>;
}
