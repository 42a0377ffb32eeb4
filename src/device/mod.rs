//! Devices
//!
//! The terminal stage of every stream stack. A device owns one transport
//! and one worker thread; all request state transitions and statistics
//! updates for the device happen on that thread.
//!
//! # Architecture
//!
//! ```text
//!  caller threads                         device worker thread
//! ┌──────────────────┐  crossbeam   ┌──────────────────────────────────┐
//! │ prepare_request  │ ───────────► │ intake ─► sweep cancelled        │
//! │   (Queued)       │   channel    │   ─► schedule_requests (batch)   │
//! └──────────────────┘              │   ─► Scheduled ─► Executing      │
//!                                   │   ─► Transport::read / write     │
//!                                   │   ─► update windows ─► complete  │
//!                                   └──────────────────────────────────┘
//! ```
//!
//! # Statistics
//!
//! The worker keeps rolling windows of seek time and read/write throughput
//! and feeds them to the scheduler's cost model. For each execution:
//!
//! - transfer time = duration minus the average seek time (if a seek was
//!   charged), at least 1 µs; throughput sample = bytes / transfer time
//! - seek sample = duration minus the expected transfer time, at least 0
//!
//! Before any sample exists the configured initial values are used.

mod network;
mod scheduler;
mod stats;

pub use network::{NetworkDevice, NetworkDeviceConfig};
pub use scheduler::{select_next, CostModel, HeadPosition, RequestQueue};
pub use stats::{DeviceStats, DeviceStatsSnapshot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, trace, warn};

use crate::error::{Error, FailureKind, Result};
use crate::request::{FileRequest, OperationKind, RequestState};
use crate::stack::StreamStackEntry;
use crate::statistics::{AverageWindow, Statistic};
use crate::transport::Transport;

/// Requests closer than this to the previous operation are not charged a seek
pub const DEFAULT_SEEK_THRESHOLD: u64 = 32 * 1024;

/// Samples kept per statistics window
pub const STATISTICS_WINDOW: usize = 64;

// =============================================================================
// Configuration
// =============================================================================

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device name, used for the worker thread and statistics
    pub name: String,

    /// How long the worker sleeps waiting for work when idle
    pub thread_sleep_time: Duration,

    /// Distance (bytes) within which no seek is charged
    pub seek_threshold: u64,

    /// Requests scheduled per batch
    pub max_scheduled: usize,

    /// Seek time assumed before any sample (µs)
    pub initial_seek_time_us: f64,

    /// Read throughput assumed before any sample (bytes/µs)
    pub initial_read_bytes_per_us: f64,

    /// Write throughput assumed before any sample (bytes/µs)
    pub initial_write_bytes_per_us: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "device".to_string(),
            thread_sleep_time: Duration::from_millis(10),
            seek_threshold: DEFAULT_SEEK_THRESHOLD,
            max_scheduled: 4,
            initial_seek_time_us: 100.0,
            initial_read_bytes_per_us: 100.0,
            initial_write_bytes_per_us: 50.0,
        }
    }
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_thread_sleep_time(mut self, sleep: Duration) -> Self {
        self.thread_sleep_time = sleep;
        self
    }

    pub fn with_seek_threshold(mut self, threshold: u64) -> Self {
        self.seek_threshold = threshold;
        self
    }

    pub fn with_max_scheduled(mut self, max: usize) -> Self {
        self.max_scheduled = max;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("device name must not be empty".into()));
        }
        if self.thread_sleep_time.is_zero() {
            return Err(Error::Config("thread_sleep_time must be > 0".into()));
        }
        if self.max_scheduled == 0 {
            return Err(Error::Config("max_scheduled must be > 0".into()));
        }
        for (name, value) in [
            ("initial_seek_time_us", self.initial_seek_time_us),
            ("initial_read_bytes_per_us", self.initial_read_bytes_per_us),
            ("initial_write_bytes_per_us", self.initial_write_bytes_per_us),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!("{} must be a non-negative number", name)));
            }
        }
        if self.initial_read_bytes_per_us == 0.0 || self.initial_write_bytes_per_us == 0.0 {
            return Err(Error::Config("initial throughput must be > 0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Device
// =============================================================================

enum DeviceMessage {
    Request(FileRequest),
    Shutdown,
}

/// A scheduling domain backed by one transport and one worker thread.
pub struct Device {
    name: String,
    sender: Sender<DeviceMessage>,
    accepting: Arc<AtomicBool>,
    stats: Arc<DeviceStats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Spawn the worker thread and start accepting requests.
    pub fn mount(config: DeviceConfig, transport: impl Transport) -> Result<Self> {
        config.validate()?;

        let (sender, receiver) = channel::unbounded();
        let stats = Arc::new(DeviceStats::new());
        let name = config.name.clone();

        let worker = DeviceWorker::new(config, transport, receiver, Arc::clone(&stats));
        let handle = std::thread::Builder::new()
            .name(format!("streamstack-{}", name))
            .spawn(move || worker.run())?;

        info!(device = %name, "Device mounted");
        Ok(Self {
            name,
            sender,
            accepting: Arc::new(AtomicBool::new(true)),
            stats,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn stats(&self) -> &Arc<DeviceStats> {
        &self.stats
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stop intake, drain queued requests and join the worker thread.
    ///
    /// Requests arriving afterwards fail with `DeviceUnavailable`.
    /// Calling it more than once is harmless.
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        // The worker may already be gone; nothing to signal then.
        let _ = self.sender.send(DeviceMessage::Shutdown);

        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("Device worker panicked");
            }
        }
        info!("Device unmounted");
    }

    fn unavailable(&self) -> FailureKind {
        FailureKind::DeviceUnavailable(self.name.clone())
    }
}

impl StreamStackEntry for Device {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_request(&self, request: FileRequest) {
        if !self.is_accepting() {
            request.fail(self.unavailable());
            return;
        }
        trace!(device = %self.name, id = %request.id(), "Queueing request");
        request.set_state(RequestState::Queued);
        if let Err(channel::SendError(DeviceMessage::Request(request))) =
            self.sender.send(DeviceMessage::Request(request))
        {
            request.fail(self.unavailable());
        }
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        self.stats.snapshot().append_to(&self.name, out);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Worker
// =============================================================================

struct DeviceWorker<T> {
    config: DeviceConfig,
    transport: T,
    receiver: Receiver<DeviceMessage>,
    stats: Arc<DeviceStats>,
    queue: RequestQueue,
    head: HeadPosition,
    draining: bool,
    seek_time: AverageWindow<f64, f64, STATISTICS_WINDOW>,
    read_throughput: AverageWindow<f64, f64, STATISTICS_WINDOW>,
    write_throughput: AverageWindow<f64, f64, STATISTICS_WINDOW>,
}

impl<T: Transport> DeviceWorker<T> {
    fn new(
        config: DeviceConfig,
        transport: T,
        receiver: Receiver<DeviceMessage>,
        stats: Arc<DeviceStats>,
    ) -> Self {
        let worker = Self {
            config,
            transport,
            receiver,
            stats,
            queue: RequestQueue::new(),
            head: HeadPosition::default(),
            draining: false,
            seek_time: AverageWindow::new(),
            read_throughput: AverageWindow::new(),
            write_throughput: AverageWindow::new(),
        };
        worker.publish();
        worker
    }

    fn cost_model(&self) -> CostModel {
        CostModel {
            seek_threshold: self.config.seek_threshold,
            seek_time_us: self.seek_time.average_or(self.config.initial_seek_time_us),
            read_bytes_per_us: self
                .read_throughput
                .average_or(self.config.initial_read_bytes_per_us),
            write_bytes_per_us: self
                .write_throughput
                .average_or(self.config.initial_write_bytes_per_us),
        }
    }

    fn publish(&self) {
        let model = self.cost_model();
        self.stats.publish_averages(
            model.seek_time_us,
            model.read_bytes_per_us,
            model.write_bytes_per_us,
        );
        self.stats
            .queue_depth
            .store(self.queue.len() as u64, Ordering::Relaxed);
    }

    #[instrument(skip(self), fields(device = %self.config.name, transport = self.transport.name()))]
    fn run(mut self) {
        debug!("Device worker started");
        loop {
            if self.queue.is_empty() && !self.draining {
                match self.receiver.recv_timeout(self.config.thread_sleep_time) {
                    Ok(message) => self.accept(message),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => self.draining = true,
                }
            }
            while let Ok(message) = self.receiver.try_recv() {
                self.accept(message);
            }

            for request in self.queue.take_cancelled() {
                self.stats.record_cancelled();
                request.cancel();
            }

            if self.queue.is_empty() {
                if self.draining {
                    break;
                }
                self.publish();
                continue;
            }

            let model = self.cost_model();
            let batch = self
                .queue
                .schedule_requests(&self.head, &model, self.config.max_scheduled);
            self.publish();

            for request in batch {
                if request.is_cancel_requested() {
                    self.stats.record_cancelled();
                    request.cancel();
                    continue;
                }
                self.execute(request);
            }
            self.publish();
        }

        // Anything that slipped in after the final drain.
        while let Ok(message) = self.receiver.try_recv() {
            if let DeviceMessage::Request(request) = message {
                request.fail(FailureKind::DeviceUnavailable(self.config.name.clone()));
            }
        }
        self.publish();
        debug!("Device worker stopped");
    }

    fn accept(&mut self, message: DeviceMessage) {
        match message {
            DeviceMessage::Request(request) if self.draining => {
                request.fail(FailureKind::DeviceUnavailable(self.config.name.clone()));
            }
            DeviceMessage::Request(request) => {
                self.stats.requests_queued.fetch_add(1, Ordering::Relaxed);
                self.queue.push(request);
            }
            DeviceMessage::Shutdown => {
                debug!(queued = self.queue.len(), "Draining device queue");
                self.draining = true;
            }
        }
    }

    fn execute(&mut self, mut request: FileRequest) {
        request.set_state(RequestState::Executing);
        let file = request.file().clone();
        let offset = request.offset();
        let kind = request.kind();
        let seek = self
            .cost_model()
            .requires_seek(&self.head, &file, offset);

        let started = Instant::now();
        let result = match kind {
            OperationKind::Read => match request.read_buffer_mut() {
                Some(buffer) => self.transport.read(&file, offset, &mut buffer[..]),
                None => Ok(0),
            },
            OperationKind::Write => match request.write_data() {
                Some(data) => self.transport.write(&file, offset, data),
                None => Ok(0),
            },
        };
        let duration = started.elapsed();

        match result {
            Ok(transferred) => {
                let transferred = transferred as u64;
                self.head = HeadPosition::new(file, offset + transferred);
                self.record_sample(kind, transferred, duration, seek);
                self.stats
                    .record_completed(kind, transferred, duration, seek);

                if request.is_cancel_requested() {
                    trace!(id = %request.id(), bytes = transferred, "Discarding data of request cancelled while executing");
                    request.succeed_discarding_data(transferred);
                } else {
                    trace!(id = %request.id(), bytes = transferred, ?duration, "Request completed");
                    request.succeed(transferred);
                }
            }
            Err(e) => {
                warn!(id = %request.id(), file = %file, offset, error = %e, "Request failed");
                self.head = HeadPosition::default();
                self.stats.record_failed(duration, seek);
                request.fail(e.into());
            }
        }
    }

    fn record_sample(&mut self, kind: OperationKind, bytes: u64, duration: Duration, seek: bool) {
        let model = self.cost_model();
        let elapsed_us = duration.as_secs_f64() * 1_000_000.0;
        let throughput = match kind {
            OperationKind::Read => model.read_bytes_per_us,
            OperationKind::Write => model.write_bytes_per_us,
        };

        if seek {
            let expected_transfer = bytes as f64 / throughput;
            self.seek_time
                .add_sample((elapsed_us - expected_transfer).max(0.0));
        }

        if bytes > 0 {
            let seek_share = if seek { model.seek_time_us } else { 0.0 };
            let transfer_us = (elapsed_us - seek_share).max(1.0);
            let sample = bytes as f64 / transfer_us;
            match kind {
                OperationKind::Read => self.read_throughput.add_sample(sample),
                OperationKind::Write => self.write_throughput.add_sample(sample),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{IoRequest, RequestStatus};
    use crate::transport::MemoryTransport;

    fn mount(store: &MemoryTransport) -> Device {
        Device::mount(
            DeviceConfig::new("mem").with_thread_sleep_time(Duration::from_millis(1)),
            store.clone(),
        )
        .expect("mount")
    }

    #[test]
    fn test_config_validation() {
        assert!(DeviceConfig::default().validate().is_ok());
        assert!(DeviceConfig::new("").validate().is_err());
        assert!(DeviceConfig::default().with_max_scheduled(0).validate().is_err());
        assert!(DeviceConfig::default()
            .with_thread_sleep_time(Duration::ZERO)
            .validate()
            .is_err());
        let mut config = DeviceConfig::default();
        config.initial_read_bytes_per_us = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_and_write() {
        let store = MemoryTransport::new();
        store.insert("a.bin", b"hello world".to_vec());
        let device = mount(&store);

        let (request, handle) = FileRequest::submit(IoRequest::read("a.bin", 6, 5));
        device.prepare_request(request);
        let completion = handle.wait();
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(&completion.into_result().expect("data")[..], b"world");

        let (request, handle) = FileRequest::submit(IoRequest::write("b.bin", 0, &b"xyz"[..]));
        device.prepare_request(request);
        assert!(handle.wait().is_success());
        assert_eq!(store.contents(&"b.bin".into()), Some(b"xyz".to_vec()));

        let snapshot = device.stats().snapshot();
        assert_eq!(snapshot.requests_completed, 2);
        assert_eq!(snapshot.bytes_read, 5);
        assert_eq!(snapshot.bytes_written, 3);
    }

    #[test]
    fn test_short_read_at_eof() {
        let store = MemoryTransport::new();
        store.insert("a.bin", b"abc".to_vec());
        let device = mount(&store);

        let (request, handle) = FileRequest::submit(IoRequest::read("a.bin", 1, 10));
        device.prepare_request(request);
        let completion = handle.wait();
        assert_eq!(completion.bytes_transferred, 2);
        assert_eq!(&completion.into_result().expect("data")[..], b"bc");
    }

    #[test]
    fn test_transport_error_fails_request() {
        let store = MemoryTransport::new();
        store.inject_failure("connection lost");
        let device = mount(&store);

        let (request, handle) = FileRequest::submit(IoRequest::read("a.bin", 0, 4));
        device.prepare_request(request);
        let completion = handle.wait();
        assert!(matches!(completion.status, RequestStatus::Failed(FailureKind::Transport(_))));
        assert_eq!(device.stats().snapshot().requests_failed, 1);
    }

    #[test]
    fn test_cancelled_before_execution() {
        let store = MemoryTransport::new();
        store.insert("a.bin", vec![0u8; 16]);
        let device = mount(&store);

        let (request, handle) = FileRequest::submit(IoRequest::read("a.bin", 0, 4));
        handle.cancel();
        device.prepare_request(request);
        assert_eq!(handle.wait().status, RequestStatus::Cancelled);
        assert_eq!(store.reads(), 0);
    }

    #[test]
    fn test_cancel_while_executing_completes_without_data() {
        let store = MemoryTransport::new();
        store.insert("a.bin", vec![7u8; 64]);
        store.set_latency(Duration::from_millis(200));
        let device = mount(&store);

        let (request, handle) = FileRequest::submit(IoRequest::read("a.bin", 0, 32));
        device.prepare_request(request);

        let started = Instant::now();
        while handle.state() != RequestState::Executing {
            assert!(started.elapsed() < Duration::from_secs(5), "never executed");
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();

        let completion = handle.wait();
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(completion.bytes_transferred, 32);
        assert!(completion.data.is_none());
        assert_eq!(store.reads(), 1);

        let snapshot = device.stats().snapshot();
        assert_eq!(snapshot.requests_completed, 1);
        assert_eq!(snapshot.requests_cancelled, 0);
    }

    #[test]
    fn test_shutdown_drains_then_rejects() {
        let store = MemoryTransport::new();
        store.insert("a.bin", vec![1u8; 64]);
        store.set_latency(Duration::from_millis(2));
        let device = mount(&store);

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let (request, handle) = FileRequest::submit(IoRequest::read("a.bin", i * 16, 16));
                device.prepare_request(request);
                handle
            })
            .collect();
        device.shutdown();

        for handle in handles {
            assert_eq!(handle.wait().status, RequestStatus::Completed);
        }

        let (request, handle) = FileRequest::submit(IoRequest::read("a.bin", 0, 1));
        device.prepare_request(request);
        assert_eq!(
            handle.wait().status,
            RequestStatus::Failed(FailureKind::DeviceUnavailable("mem".into()))
        );
        assert!(!device.is_accepting());
    }

    #[test]
    fn test_statistics_are_published() {
        let store = MemoryTransport::new();
        store.insert("a.bin", vec![0u8; 4096]);
        let device = mount(&store);
        assert_eq!(device.stats().average_read_throughput(), 100.0);

        let (request, handle) = FileRequest::submit(IoRequest::read("a.bin", 0, 4096));
        device.prepare_request(request);
        handle.wait();
        device.shutdown();

        let mut out = Vec::new();
        device.collect_statistics(&mut out);
        let throughput = crate::statistics::find(&out, "mem", "average_read_bytes_per_us")
            .map(|s| s.value)
            .expect("throughput");
        assert!(throughput > 0.0);
        assert_ne!(throughput, 100.0);
    }
}
