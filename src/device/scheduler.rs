//! Request scheduling
//!
//! Greedy ordering of the requests queued on one device.
//!
//! ```text
//!   queued requests
//!        │
//!        ▼  highest priority class present only
//!   ┌─────────────┐   any deadline?   ┌──────────────────────────┐
//!   │ candidates  │ ────── yes ─────► │ earliest deadline first  │
//!   └─────────────┘                   └──────────────────────────┘
//!        │ no
//!        ▼
//!   lowest estimated cost from the current head position
//!   cost = (seek ? seek_time : 0) + length / throughput
//! ```
//!
//! Ties go to the request nearest the head, then to the oldest. Each pick
//! moves the simulated head to the end of the chosen range, so a batch
//! follows sequential runs.

use std::cmp::Ordering;
use std::time::Instant;

use crate::request::{FileId, FileRequest, OperationKind, RequestState};

/// Where the previous operation on a device left off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadPosition {
    pub file: Option<FileId>,
    pub offset: u64,
}

impl HeadPosition {
    pub fn new(file: FileId, offset: u64) -> Self {
        Self {
            file: Some(file),
            offset,
        }
    }
}

/// Device characteristics the scheduler weighs requests by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostModel {
    /// Distance (bytes) within which repositioning is free
    pub seek_threshold: u64,

    /// Average seek time (µs)
    pub seek_time_us: f64,

    /// Average read throughput (bytes/µs)
    pub read_bytes_per_us: f64,

    /// Average write throughput (bytes/µs)
    pub write_bytes_per_us: f64,
}

impl CostModel {
    /// Whether serving `request` from `head` needs a seek.
    pub fn requires_seek(&self, head: &HeadPosition, file: &FileId, offset: u64) -> bool {
        match &head.file {
            Some(current) if current == file => head.offset.abs_diff(offset) > self.seek_threshold,
            _ => true,
        }
    }

    /// Estimated time (µs) to serve `request` from `head`.
    pub fn estimate_us(&self, head: &HeadPosition, request: &FileRequest) -> f64 {
        let throughput = match request.kind() {
            OperationKind::Read => self.read_bytes_per_us,
            OperationKind::Write => self.write_bytes_per_us,
        };
        let transfer = request.length() as f64 / throughput.max(f64::MIN_POSITIVE);
        if self.requires_seek(head, request.file(), request.offset()) {
            self.seek_time_us + transfer
        } else {
            transfer
        }
    }
}

struct Candidate {
    index: usize,
    deadline: Option<Instant>,
    cost: f64,
    distance: u64,
    created: Instant,
}

impl Candidate {
    fn rank(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.cost.total_cmp(&other.cost))
            .then_with(|| self.distance.cmp(&other.distance))
            .then_with(|| self.created.cmp(&other.created))
    }
}

/// Index of the request to run next, or `None` if `requests` is empty.
pub fn select_next(requests: &[FileRequest], head: &HeadPosition, model: &CostModel) -> Option<usize> {
    let top = requests.iter().map(|r| r.priority()).max()?;
    let deadline_only = requests
        .iter()
        .any(|r| r.priority() == top && r.deadline().is_some());

    requests
        .iter()
        .enumerate()
        .filter(|(_, r)| r.priority() == top && (!deadline_only || r.deadline().is_some()))
        .map(|(index, r)| Candidate {
            index,
            deadline: r.deadline(),
            cost: model.estimate_us(head, r),
            distance: match &head.file {
                Some(file) if file == r.file() => head.offset.abs_diff(r.offset()),
                _ => u64::MAX,
            },
            created: r.created_at(),
        })
        .min_by(|a, b| a.rank(b))
        .map(|candidate| candidate.index)
}

/// Requests accepted by a device and not yet scheduled.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: Vec<FileRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: FileRequest) {
        request.set_state(RequestState::Queued);
        self.pending.push(request);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove every request whose cancellation was requested.
    pub fn take_cancelled(&mut self) -> Vec<FileRequest> {
        let mut cancelled = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].is_cancel_requested() {
                cancelled.push(self.pending.swap_remove(i));
            } else {
                i += 1;
            }
        }
        cancelled
    }

    /// Pick up to `max` requests in execution order, starting from `head`,
    /// and mark them `Scheduled`.
    pub fn schedule_requests(
        &mut self,
        head: &HeadPosition,
        model: &CostModel,
        max: usize,
    ) -> Vec<FileRequest> {
        let mut head = head.clone();
        let mut batch = Vec::with_capacity(max.min(self.pending.len()));

        while batch.len() < max {
            let Some(index) = select_next(&self.pending, &head, model) else {
                break;
            };
            let request = self.pending.swap_remove(index);
            request.set_state(RequestState::Scheduled);
            head = HeadPosition::new(
                request.file().clone(),
                request.offset().saturating_add(request.length()),
            );
            batch.push(request);
        }
        batch
    }
}
