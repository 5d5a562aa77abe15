//! Serial transport implementation

use super::SerialIo;
use crate::error::{Error, Result};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;

/// Read timeout. Short enough that the RX thread observes a stop request
/// within one spin, long enough not to busy-poll between board reports.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Consecutive timeouts tolerated mid-frame before the partial read is
/// abandoned and the caller resynchronizes.
const MAX_PARTIAL_TIMEOUTS: u32 = 4;

/// Serial transport for UART communication
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Open a serial port as 8N1 raw with a short read timeout.
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Baud rate (e.g., 115200)
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;

        log::info!("Opened serial port: {} at {} baud", path, baud_rate);

        Ok(SerialTransport { port: Some(port) })
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::Other("serial port closed".to_string()))
    }
}

impl SerialIo for SerialTransport {
    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<bool> {
        let port = self.port_mut()?;
        let mut filled = 0;
        let mut timeouts = 0;

        while filled < dst.len() {
            match port.read(&mut dst[filled..]) {
                Ok(0) => {
                    timeouts += 1;
                    if timeouts > MAX_PARTIAL_TIMEOUTS {
                        return Ok(false);
                    }
                }
                Ok(n) => {
                    filled += n;
                    timeouts = 0;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    if filled == 0 {
                        return Ok(false);
                    }
                    timeouts += 1;
                    if timeouts > MAX_PARTIAL_TIMEOUTS {
                        return Ok(false);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn SerialIo>> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| Error::Other("serial port closed".to_string()))?;
        Ok(Box::new(SerialTransport {
            port: Some(port.try_clone()?),
        }))
    }
}
