//! Stream Stack
//!
//! An ordered chain of stages a request travels through before it reaches a
//! device. Each stage owns the next one, so dropping the [`Streamer`] tears
//! down the whole chain, devices last.
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────────┐
//! │ Streamer │───▶│ ReadSplitter │───▶│    Device    │───▶ Transport
//! │ (submit) │    │  (split > M) │    │ (schedule +  │
//! └──────────┘    └──────────────┘    │   execute)   │
//!                                     └──────────────┘
//! ```
//!
//! Stages run `prepare_request` on the submitting thread and must not block;
//! all blocking I/O happens on device worker threads.

mod config;
mod read_splitter;

#[cfg(test)]
mod proptest;

pub use config::{ReadSplitterConfig, StackConfig, StageConfig, StorageDeviceConfig};
pub use read_splitter::ReadSplitter;

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::request::{FileId, FileRequest, IoRequest, RequestHandle};
use crate::statistics::Statistic;

/// One stage of a stream stack.
pub trait StreamStackEntry: Send + Sync {
    /// Stage name, used as the owner of its statistics.
    fn name(&self) -> &str;

    /// Take ownership of `request` and either forward it (possibly as
    /// several derived requests) to the next stage, or complete it.
    ///
    /// Every request must eventually reach a terminal state. A request that
    /// has been failed must not be forwarded.
    fn prepare_request(&self, request: FileRequest);

    /// Append this stage's counters, then those of the stages below it.
    fn collect_statistics(&self, out: &mut Vec<Statistic>);
}

impl<T: StreamStackEntry + ?Sized> StreamStackEntry for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn prepare_request(&self, request: FileRequest) {
        (**self).prepare_request(request)
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        (**self).collect_statistics(out)
    }
}

// =============================================================================
// Streamer
// =============================================================================

/// Head of a stream stack and the submission API for callers.
pub struct Streamer {
    head: Box<dyn StreamStackEntry>,
    requests_submitted: AtomicU64,
    requests_rejected: AtomicU64,
}

impl Streamer {
    pub fn new(head: Box<dyn StreamStackEntry>) -> Self {
        Self {
            head,
            requests_submitted: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    /// Assemble the stack described by `config`.
    pub fn from_config(config: &StackConfig) -> Result<Self> {
        Ok(Self::new(config.build()?))
    }

    /// Submit a request.
    ///
    /// Malformed requests are rejected here with
    /// [`Error::RequestValidation`](crate::Error::RequestValidation) and never
    /// enter the stack. Otherwise the returned handle resolves exactly once.
    #[instrument(skip(self), level = "debug")]
    pub fn submit(&self, request: IoRequest) -> Result<RequestHandle> {
        if let Err(e) = request.validate() {
            self.requests_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(error = %e, "Rejected request");
            return Err(e);
        }

        let (request, handle) = FileRequest::submit(request);
        self.requests_submitted.fetch_add(1, Ordering::Relaxed);
        self.head.prepare_request(request);
        Ok(handle)
    }

    /// Submit a read of `length` bytes at `offset`.
    pub fn read(&self, file: impl Into<FileId>, offset: u64, length: u64) -> Result<RequestHandle> {
        self.submit(IoRequest::read(file, offset, length))
    }

    /// Submit a write of `data` at `offset`.
    pub fn write(
        &self,
        file: impl Into<FileId>,
        offset: u64,
        data: impl Into<Bytes>,
    ) -> Result<RequestHandle> {
        self.submit(IoRequest::write(file, offset, data))
    }

    pub fn head(&self) -> &dyn StreamStackEntry {
        &*self.head
    }

    /// Statistics of the streamer and every stage below it.
    pub fn collect_statistics(&self) -> Vec<Statistic> {
        let mut out = vec![
            Statistic::new(
                "streamer",
                "requests_submitted",
                self.requests_submitted.load(Ordering::Relaxed) as f64,
            ),
            Statistic::new(
                "streamer",
                "requests_rejected",
                self.requests_rejected.load(Ordering::Relaxed) as f64,
            ),
        ];
        self.head.collect_statistics(&mut out);
        out
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("head", &self.head.name())
            .field("requests_submitted", &self.requests_submitted)
            .field("requests_rejected", &self.requests_rejected)
            .finish()
    }
}

// =============================================================================
// Test Support
// =============================================================================
