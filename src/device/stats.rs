//! Device statistics
//!
//! Counters are bumped by the worker thread and read from anywhere. The
//! rolling averages live in the worker's own [`AverageWindow`]s; the worker
//! publishes their current values here as `f64` bits so readers never touch
//! the windows.
//!
//! [`AverageWindow`]: crate::statistics::AverageWindow

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::request::OperationKind;
use crate::statistics::Statistic;

/// Statistics for one device.
#[derive(Debug, Default)]
pub struct DeviceStats {
    /// Requests accepted into the queue
    pub requests_queued: AtomicU64,

    /// Requests completed successfully
    pub requests_completed: AtomicU64,

    /// Requests failed
    pub requests_failed: AtomicU64,

    /// Requests cancelled before or during execution
    pub requests_cancelled: AtomicU64,

    /// Total bytes read
    pub bytes_read: AtomicU64,

    /// Total bytes written
    pub bytes_written: AtomicU64,

    /// Executions that were charged a seek
    pub seeks: AtomicU64,

    /// Total execution time (microseconds)
    pub execution_time_us: AtomicU64,

    /// Requests currently waiting in the queue
    pub queue_depth: AtomicU64,

    seek_time_us: AtomicU64,
    read_bytes_per_us: AtomicU64,
    write_bytes_per_us: AtomicU64,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful execution.
    pub fn record_completed(&self, kind: OperationKind, bytes: u64, duration: Duration, seek: bool) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
        match kind {
            OperationKind::Read => self.bytes_read.fetch_add(bytes, Ordering::Relaxed),
            OperationKind::Write => self.bytes_written.fetch_add(bytes, Ordering::Relaxed),
        };
        self.record_execution(duration, seek);
    }

    /// Record a failed execution.
    pub fn record_failed(&self, duration: Duration, seek: bool) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.record_execution(duration, seek);
    }

    pub fn record_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_execution(&self, duration: Duration, seek: bool) {
        self.execution_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        if seek {
            self.seeks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publish the worker's current averages.
    pub(crate) fn publish_averages(&self, seek_time_us: f64, read_bytes_per_us: f64, write_bytes_per_us: f64) {
        self.seek_time_us
            .store(seek_time_us.to_bits(), Ordering::Relaxed);
        self.read_bytes_per_us
            .store(read_bytes_per_us.to_bits(), Ordering::Relaxed);
        self.write_bytes_per_us
            .store(write_bytes_per_us.to_bits(), Ordering::Relaxed);
    }

    /// Average seek time in microseconds.
    pub fn average_seek_time_us(&self) -> f64 {
        f64::from_bits(self.seek_time_us.load(Ordering::Relaxed))
    }

    /// Average read throughput in bytes per microsecond.
    pub fn average_read_throughput(&self) -> f64 {
        f64::from_bits(self.read_bytes_per_us.load(Ordering::Relaxed))
    }

    /// Average write throughput in bytes per microsecond.
    pub fn average_write_throughput(&self) -> f64 {
        f64::from_bits(self.write_bytes_per_us.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> DeviceStatsSnapshot {
        DeviceStatsSnapshot {
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            seeks: self.seeks.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            average_seek_time_us: self.average_seek_time_us(),
            average_read_bytes_per_us: self.average_read_throughput(),
            average_write_bytes_per_us: self.average_write_throughput(),
        }
    }
}

/// Point-in-time copy of [`DeviceStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatsSnapshot {
    pub requests_queued: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub requests_cancelled: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub seeks: u64,
    pub queue_depth: u64,
    pub average_seek_time_us: f64,
    pub average_read_bytes_per_us: f64,
    pub average_write_bytes_per_us: f64,
}

impl DeviceStatsSnapshot {
    /// Append as named statistics owned by `owner`.
    pub fn append_to(&self, owner: &str, out: &mut Vec<Statistic>) {
        let counters = [
            ("requests_queued", self.requests_queued as f64),
            ("requests_completed", self.requests_completed as f64),
            ("requests_failed", self.requests_failed as f64),
            ("requests_cancelled", self.requests_cancelled as f64),
            ("bytes_read", self.bytes_read as f64),
            ("bytes_written", self.bytes_written as f64),
            ("seeks", self.seeks as f64),
            ("queue_depth", self.queue_depth as f64),
            ("average_seek_time_us", self.average_seek_time_us),
            ("average_read_bytes_per_us", self.average_read_bytes_per_us),
            ("average_write_bytes_per_us", self.average_write_bytes_per_us),
        ];
        out.extend(
            counters
                .into_iter()
                .map(|(name, value)| Statistic::new(owner, name, value)),
        );
    }
}
