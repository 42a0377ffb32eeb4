//! Read Splitter
//!
//! Breaks reads longer than `max_read_size` into contiguous sub-reads of at
//! most that size. The parent completes once all sub-reads have; see
//! [`FileRequest`] for the aggregation rules.
//!
//! Writes pass through untouched.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::StreamStackEntry;
use crate::error::{Error, FailureKind, Result};
use crate::request::{FileRequest, OperationKind};
use crate::statistics::{AverageWindow, Statistic};

/// Samples kept for the sub-read average
pub const SUB_READ_WINDOW: usize = 64;

/// Stage that splits oversized reads.
pub struct ReadSplitter {
    name: String,
    max_read_size: u64,
    next: Box<dyn StreamStackEntry>,
    average_num_sub_reads: Mutex<AverageWindow<u32, f64, SUB_READ_WINDOW>>,
    requests_split: AtomicU64,
    sub_reads_created: AtomicU64,
}

impl ReadSplitter {
    /// Create a splitter in front of `next`.
    ///
    /// A `max_read_size` of zero is rejected.
    pub fn new(max_read_size: u64, next: Box<dyn StreamStackEntry>) -> Result<Self> {
        if max_read_size == 0 {
            return Err(Error::Config("max_read_size must be > 0".into()));
        }
        Ok(Self {
            name: "read_splitter".to_string(),
            max_read_size,
            next,
            average_num_sub_reads: Mutex::new(AverageWindow::new()),
            requests_split: AtomicU64::new(0),
            sub_reads_created: AtomicU64::new(0),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn max_read_size(&self) -> u64 {
        self.max_read_size
    }

    /// Average number of sub-reads per split request.
    pub fn average_num_sub_reads(&self) -> f64 {
        self.average_num_sub_reads.lock().average()
    }
}

impl std::fmt::Debug for ReadSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSplitter")
            .field("name", &self.name)
            .field("max_read_size", &self.max_read_size)
            .field("next", &self.next.name())
            .field("requests_split", &self.requests_split)
            .finish()
    }
}

impl StreamStackEntry for ReadSplitter {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_request(&self, request: FileRequest) {
        if request.kind() != OperationKind::Read {
            self.next.prepare_request(request);
            return;
        }

        let length = request.length();
        if length == 0 {
            trace!(id = %request.id(), "Zero-length read completed");
            request.succeed(0);
            return;
        }

        if request.end_offset().is_none() {
            warn!(id = %request.id(), offset = request.offset(), length, "Read range overflows");
            let kind = FailureKind::InvalidRange {
                offset: request.offset(),
                length,
            };
            request.fail(kind);
            return;
        }

        if length <= self.max_read_size {
            self.next.prepare_request(request);
            return;
        }

        let id = request.id();
        let children = request.split(self.max_read_size);
        let count = children.len();
        debug!(%id, length, sub_reads = count, "Splitting read");

        self.average_num_sub_reads
            .lock()
            .add_sample(u32::try_from(count).unwrap_or(u32::MAX));
        self.requests_split.fetch_add(1, Ordering::Relaxed);
        self.sub_reads_created
            .fetch_add(count as u64, Ordering::Relaxed);

        for child in children {
            self.next.prepare_request(child);
        }
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        out.push(Statistic::new(
            &self.name,
            "average_num_sub_reads",
            self.average_num_sub_reads(),
        ));
        out.push(Statistic::new(
            &self.name,
            "requests_split",
            self.requests_split.load(Ordering::Relaxed) as f64,
        ));
        out.push(Statistic::new(
            &self.name,
            "sub_reads_created",
            self.sub_reads_created.load(Ordering::Relaxed) as f64,
        ));
        out.push(Statistic::new(
            &self.name,
            "max_read_size",
            self.max_read_size as f64,
        ));
        self.next.collect_statistics(out);
    }
}
