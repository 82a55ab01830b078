//! Per-connection transfer rate accounting.
//!
//! The worker uses the measured rates to drop clients that trickle bytes
//! slower than the configured minimum. Until a warmup period has passed the
//! rate reads as "infinite" so short bursts and connection setup cost do not
//! count against the peer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub(crate) struct Meter {
    started: Instant,
    read: Side,
    write: Side,
}

#[derive(Default)]
struct Side {
    // bytes inside the current observation window
    bytes: AtomicU64,
    // bytes over the connection's whole life
    total: AtomicU64,
    // nanos since `started`; zero means "not yet"
    first: AtomicU64,
    last: AtomicU64,
}

impl Meter {
    pub(crate) fn new() -> Meter {
        Meter {
            started: Instant::now(),
            read: Side::default(),
            write: Side::default(),
        }
    }

    pub(crate) fn record_read(&self, bytes: u64) {
        self.read.record(self.started, bytes);
    }

    pub(crate) fn record_write(&self, bytes: u64) {
        self.write.record(self.started, bytes);
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.read.total.load(Ordering::Relaxed)
    }

    pub(crate) fn bytes_written(&self) -> u64 {
        self.write.total.load(Ordering::Relaxed)
    }

    /// Observed read rate in bytes per second, or `u64::MAX` inside the
    /// warmup window.
    pub(crate) fn read_throughput(&self, warmup: Duration) -> u64 {
        self.read.throughput(warmup)
    }

    pub(crate) fn write_throughput(&self, warmup: Duration) -> u64 {
        self.write.throughput(warmup)
    }

    /// Forgets the observation window, for the pause between keep-alive
    /// requests; idle time must not read as slowness. Lifetime totals are
    /// kept.
    pub(crate) fn reset(&self) {
        self.read.reset();
        self.write.reset();
    }
}

impl Side {
    fn record(&self, started: Instant, bytes: u64) {
        let now = started.elapsed().as_nanos() as u64;
        // +1 so a transfer in the very first nanosecond still registers
        let stamp = now.max(1);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total.fetch_add(bytes, Ordering::Relaxed);
        let _ = self
            .first
            .compare_exchange(0, stamp, Ordering::Relaxed, Ordering::Relaxed);
        self.last.store(stamp, Ordering::Relaxed);
    }

    fn throughput(&self, warmup: Duration) -> u64 {
        let first = self.first.load(Ordering::Relaxed);
        if first == 0 {
            return u64::MAX;
        }
        let last = self.last.load(Ordering::Relaxed);
        let window = Duration::from_nanos(last.saturating_sub(first));
        if window < warmup {
            return u64::MAX;
        }
        let secs = window.as_secs_f64();
        if secs <= 0.0 {
            return u64::MAX;
        }
        (self.bytes.load(Ordering::Relaxed) as f64 / secs) as u64
    }

    fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.first.store(0, Ordering::Relaxed);
        self.last.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn infinite_until_warmup_elapses() {
        let meter = Meter::new();
        meter.record_read(100);
        assert_eq!(meter.read_throughput(Duration::from_secs(60)), u64::MAX);
    }

    #[test]
    fn rate_after_warmup() {
        let meter = Meter::new();
        meter.record_read(10_000);
        thread::sleep(Duration::from_millis(20));
        meter.record_read(10_000);
        let rate = meter.read_throughput(Duration::from_millis(1));
        // 20k bytes over ~20ms is on the order of 1MB/s; just bound it loosely
        assert!(rate > 10_000, "rate={}", rate);
        assert!(rate < 100_000_000, "rate={}", rate);
    }

    #[test]
    fn totals_accumulate() {
        let meter = Meter::new();
        meter.record_read(5);
        meter.record_read(7);
        meter.record_write(3);
        assert_eq!(meter.bytes_read(), 12);
        assert_eq!(meter.bytes_written(), 3);
    }

    #[test]
    fn reset_clears_the_window_but_keeps_totals() {
        let meter = Meter::new();
        meter.record_read(100);
        thread::sleep(Duration::from_millis(5));
        meter.reset();
        assert_eq!(meter.bytes_read(), 100);
        assert_eq!(meter.read_throughput(Duration::from_millis(1)), u64::MAX);
    }
}
