//! Mock transport for testing

use super::SerialIo;
use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory serial endpoint shared by all cloned handles.
struct MockInner {
    open: AtomicBool,
    fail_writes: AtomicBool,
    rx: Mutex<VecDeque<u8>>,
    tx: Mutex<Vec<u8>>,
}

/// Mock serial backend for unit and pipeline tests.
///
/// Clones share one endpoint, mirroring `try_clone` on a real port: bytes
/// injected with [`push_rx`](Self::push_rx) are read by any handle, and all
/// writes land in one TX capture.
#[derive(Clone)]
pub struct MockSerial {
    inner: Arc<MockInner>,
}

impl MockSerial {
    pub fn new() -> Self {
        MockSerial {
            inner: Arc::new(MockInner {
                open: AtomicBool::new(true),
                fail_writes: AtomicBool::new(false),
                rx: Mutex::new(VecDeque::new()),
                tx: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Inject bytes to be read by the driver.
    pub fn push_rx(&self, data: &[u8]) {
        if let Ok(mut rx) = self.inner.rx.lock() {
            rx.extend(data.iter().copied());
        }
    }

    /// Take everything the driver wrote so far.
    pub fn take_tx(&self) -> Vec<u8> {
        match self.inner.tx.lock() {
            Ok(mut tx) => std::mem::take(&mut *tx),
            Err(_) => Vec::new(),
        }
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Reopen after a close (lets tests simulate reconnects).
    pub fn reopen(&self) {
        self.inner.open.store(true, Ordering::SeqCst);
    }
}

impl Default for MockSerial {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialIo for MockSerial {
    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.inner.open.store(false, Ordering::SeqCst);
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<bool> {
        if !self.is_open() {
            return Err(Error::Other("mock serial closed".to_string()));
        }
        {
            let mut rx = self
                .inner
                .rx
                .lock()
                .map_err(|_| Error::Other("mock rx poisoned".to_string()))?;
            if rx.len() >= dst.len() {
                for b in dst.iter_mut() {
                    *b = rx.pop_front().unwrap_or(0);
                }
                return Ok(true);
            }
        }
        // Behave like a port read timeout rather than spinning the caller.
        std::thread::sleep(Duration::from_millis(1));
        Ok(false)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Other("mock serial closed".to_string()));
        }
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        let mut tx = self
            .inner
            .tx
            .lock()
            .map_err(|_| Error::Other("mock tx poisoned".to_string()))?;
        tx.extend_from_slice(data);
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn SerialIo>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_endpoint() {
        let mock = MockSerial::new();
        let mut reader = mock.try_clone().unwrap();

        mock.push_rx(&[1, 2, 3]);
        let mut buf = [0u8; 3];
        assert!(reader.read_exact(&mut buf).unwrap());
        assert_eq!(buf, [1, 2, 3]);

        let mut writer = mock.try_clone().unwrap();
        writer.write_all(&[9, 8]).unwrap();
        assert_eq!(mock.take_tx(), vec![9, 8]);
    }

    #[test]
    fn short_reads_report_timeout() {
        let mock = MockSerial::new();
        let mut h = mock.try_clone().unwrap();
        mock.push_rx(&[1]);
        let mut buf = [0u8; 2];
        assert!(!h.read_exact(&mut buf).unwrap());
    }
}
