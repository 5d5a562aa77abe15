//! The four long-lived worker stages and their shared state.

pub mod controller;
pub mod logger;
pub mod shared;
pub mod tcp;
pub mod usb;

pub use controller::ControllerWorker;
pub use logger::LogWorker;
pub use shared::SharedState;
pub use tcp::TcpWorker;
pub use usb::UsbWorker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative stop signal shared by the supervisor and every worker.
///
/// Setting it is advisory: each worker observes it within one tick of its
/// rate plus any bounded I/O timeout.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        StopFlag::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
