//! Fixed-rate loop pacing.
//!
//! `sleep()` follows a monotonic "next tick" schedule. When a loop overruns,
//! the missed periods are skipped and the schedule restarts from now — the
//! stage must never catch up by issuing a burst, because downstream is
//! real hardware.

use std::time::{Duration, Instant};

/// Rate limiter for periodic loops with simple lateness statistics.
pub struct RateLimiter {
    hz: f64,
    next: Instant,
    late_ticks: u64,
    skipped_ticks: u64,
    max_late_s: f64,
}

impl RateLimiter {
    pub fn new(hz: f64) -> Self {
        RateLimiter {
            hz: if hz > 0.0 { hz } else { 1.0 },
            next: Instant::now(),
            late_ticks: 0,
            skipped_ticks: 0,
            max_late_s: 0.0,
        }
    }

    /// Change the rate; takes effect from the next tick (hot reload).
    pub fn set_hz(&mut self, hz: f64) {
        self.hz = if hz > 0.0 { hz } else { 1.0 };
    }

    pub fn hz(&self) -> f64 {
        self.hz
    }

    /// Restart the schedule from now.
    pub fn reset(&mut self) {
        self.next = Instant::now();
    }

    /// Ticks where the loop overran its period.
    pub fn late_ticks(&self) -> u64 {
        self.late_ticks
    }

    /// Total periods skipped due to overruns.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks
    }

    /// Worst observed lateness in seconds.
    pub fn max_late_s(&self) -> f64 {
        self.max_late_s
    }

    /// Sleep until the next tick. On overrun, skip the missed periods and
    /// reschedule from now.
    pub fn sleep(&mut self) {
        let period = Duration::from_secs_f64(1.0 / self.hz);
        self.next += period;

        let now = Instant::now();
        if now > self.next {
            let late = (now - self.next).as_secs_f64();
            if late > self.max_late_s {
                self.max_late_s = late;
            }
            self.late_ticks += 1;
            self.skipped_ticks += (late / period.as_secs_f64()) as u64 + 1;
            self.next = now + period;
        }

        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paces_close_to_requested_rate() {
        let mut rl = RateLimiter::new(200.0);
        rl.reset();
        let start = Instant::now();
        for _ in 0..20 {
            rl.sleep();
        }
        let elapsed = start.elapsed().as_secs_f64();
        // 20 ticks at 200 Hz is 100 ms; allow generous slack for CI.
        assert!(elapsed >= 0.08, "ran too fast: {elapsed}s");
        assert!(elapsed < 0.5, "ran too slow: {elapsed}s");
    }

    #[test]
    fn overruns_skip_instead_of_bursting() {
        let mut rl = RateLimiter::new(1000.0);
        rl.reset();
        // Stall well past several periods.
        std::thread::sleep(Duration::from_millis(20));

        let before = Instant::now();
        rl.sleep();
        let first_sleep = before.elapsed();

        assert!(rl.late_ticks() >= 1);
        assert!(rl.skipped_ticks() >= 10);
        // The recovery tick waits roughly one period, not zero (no burst).
        assert!(first_sleep >= Duration::from_micros(300));
    }

    #[test]
    fn hot_reload_changes_period() {
        let mut rl = RateLimiter::new(10.0);
        rl.set_hz(500.0);
        rl.reset();
        let start = Instant::now();
        for _ in 0..5 {
            rl.sleep();
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn zero_rate_is_coerced() {
        let rl = RateLimiter::new(0.0);
        assert_eq!(rl.hz(), 1.0);
        let mut rl = RateLimiter::new(100.0);
        rl.set_hz(-5.0);
        assert_eq!(rl.hz(), 1.0);
    }
}
