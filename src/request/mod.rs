//! File Requests
//!
//! The unit of work flowing through a stream stack.
//!
//! # Lifecycle
//!
//! ```text
//! IoRequest ──submit──► FileRequest ──► stage ──► ... ──► Device
//!  (caller)     │        (pipeline)       │                  │
//!               ▼                         ▼ split            ▼
//!         RequestHandle ◄──────── SplitAggregator ◄──── Completion
//! ```
//!
//! A caller describes the work with an [`IoRequest`] and submits it to a
//! [`Streamer`](crate::stack::Streamer). The pipeline owns the resulting
//! [`FileRequest`]; consuming it through [`FileRequest::succeed`],
//! [`FileRequest::fail`] or [`FileRequest::cancel`] delivers exactly one
//! [`Completion`] back to the caller's [`RequestHandle`].
//!
//! Offset and length are immutable once a request is in the pipeline. Only
//! the crate-internal `split` (used by the read splitter) may carve a request
//! into children covering disjoint, contiguous sub-ranges.

mod completion;
mod split;

pub use completion::{Completion, CompletionCallback, RequestHandle, RequestStatus};
pub(crate) use completion::{CompletionSink, RequestControl};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{Error, FailureKind, Result};
use split::SplitAggregator;

/// Largest single request accepted at the submission boundary (4 GiB).
pub const MAX_REQUEST_LENGTH: u64 = 4 * 1024 * 1024 * 1024;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Identifiers
// =============================================================================

/// Identity of a file on a device (a path relative to the device root).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Arc<str>);

impl FileId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&String> for FileId {
    fn from(s: &String) -> Self {
        Self::new(s)
    }
}

/// Process-unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// Request Attributes
// =============================================================================

/// Scheduling class. Higher classes are always served first on a device.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Kind of I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Read => write!(f, "read"),
            OperationKind::Write => write!(f, "write"),
        }
    }
}

/// Observable position of a request in its lifecycle.
///
/// `Queued → Scheduled → Executing → {Completed | Failed | Cancelled}` on a
/// device. `Cancelled` is only entered from `Queued` or `Scheduled`; an
/// executing request runs to `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestState {
    Pending = 0,
    Queued = 1,
    Scheduled = 2,
    Executing = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl RequestState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => RequestState::Queued,
            2 => RequestState::Scheduled,
            3 => RequestState::Executing,
            4 => RequestState::Completed,
            5 => RequestState::Failed,
            6 => RequestState::Cancelled,
            _ => RequestState::Pending,
        }
    }

    /// Whether no further transition can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed | RequestState::Cancelled
        )
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestState::Pending => write!(f, "Pending"),
            RequestState::Queued => write!(f, "Queued"),
            RequestState::Scheduled => write!(f, "Scheduled"),
            RequestState::Executing => write!(f, "Executing"),
            RequestState::Completed => write!(f, "Completed"),
            RequestState::Failed => write!(f, "Failed"),
            RequestState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

// =============================================================================
// Caller-side Descriptor
// =============================================================================

enum IoRequestKind {
    Read { length: u64 },
    Write { data: Bytes },
}

/// Describes a read or write before it is submitted.
///
/// ```ignore
/// let handle = streamer.submit(
///     IoRequest::read("levels/intro.pak", 0, 64 * 1024)
///         .with_priority(Priority::High)
///         .with_timeout(Duration::from_millis(50)),
/// )?;
/// ```
pub struct IoRequest {
    file: FileId,
    offset: u64,
    kind: IoRequestKind,
    priority: Priority,
    deadline: Option<Instant>,
    callback: Option<CompletionCallback>,
}

impl IoRequest {
    /// Read `length` bytes starting at `offset`.
    pub fn read(file: impl Into<FileId>, offset: u64, length: u64) -> Self {
        Self {
            file: file.into(),
            offset,
            kind: IoRequestKind::Read { length },
            priority: Priority::default(),
            deadline: None,
            callback: None,
        }
    }

    /// Write `data` starting at `offset`.
    pub fn write(file: impl Into<FileId>, offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            file: file.into(),
            offset,
            kind: IoRequestKind::Write { data: data.into() },
            priority: Priority::default(),
            deadline: None,
            callback: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Ask for the request to be served by `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Invoke `callback` once on the completing thread, before the handle resolves.
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn file(&self) -> &FileId {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn kind(&self) -> OperationKind {
        match self.kind {
            IoRequestKind::Read { .. } => OperationKind::Read,
            IoRequestKind::Write { .. } => OperationKind::Write,
        }
    }

    pub fn length(&self) -> u64 {
        match &self.kind {
            IoRequestKind::Read { length } => *length,
            IoRequestKind::Write { data } => data.len() as u64,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Reject malformed requests before they enter the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.file.is_empty() {
            return Err(Error::RequestValidation("file id must not be empty".into()));
        }
        let length = self.length();
        if self.offset.checked_add(length).is_none() {
            return Err(Error::RequestValidation(format!(
                "offset {} + length {} overflows",
                self.offset, length
            )));
        }
        if length > MAX_REQUEST_LENGTH || usize::try_from(length).is_err() {
            return Err(Error::RequestValidation(format!(
                "length {} exceeds the maximum request length {}",
                length, MAX_REQUEST_LENGTH
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("file", &self.file)
            .field("kind", &self.kind())
            .field("offset", &self.offset)
            .field("length", &self.length())
            .field("priority", &self.priority)
            .field("deadline", &self.deadline)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

// =============================================================================
// Pipeline Request
// =============================================================================

enum Payload {
    Read(BytesMut),
    Write(Bytes),
}

/// A request owned by the pipeline.
///
/// Stages move it down the chain by value. Dropping it without calling one of
/// the completing methods reports `Failed(Abandoned)` to the caller.
pub struct FileRequest {
    id: RequestId,
    file: FileId,
    offset: u64,
    length: u64,
    kind: OperationKind,
    payload: Payload,
    priority: Priority,
    deadline: Option<Instant>,
    control: RequestControl,
    sink: Option<CompletionSink>,
    created: Instant,
}

impl FileRequest {
    /// Turn a validated descriptor into a pipeline request and its handle.
    pub(crate) fn submit(request: IoRequest) -> (Self, RequestHandle) {
        let id = RequestId::next();
        let control = RequestControl::new();
        let (sender, receiver) = oneshot::channel();

        let (kind, length, payload) = match request.kind {
            IoRequestKind::Read { length } => (
                OperationKind::Read,
                length,
                Payload::Read(BytesMut::zeroed(length as usize)),
            ),
            IoRequestKind::Write { data } => {
                (OperationKind::Write, data.len() as u64, Payload::Write(data))
            }
        };

        let file_request = Self {
            id,
            file: request.file,
            offset: request.offset,
            length,
            kind,
            payload,
            priority: request.priority,
            deadline: request.deadline,
            control: control.clone(),
            sink: Some(CompletionSink::Caller {
                sender,
                callback: request.callback,
            }),
            created: Instant::now(),
        };

        let handle = RequestHandle::new(id, kind, control, receiver);
        (file_request, handle)
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn file(&self) -> &FileId {
        &self.file
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// `offset + length`, or `None` if the range overflows.
    pub fn end_offset(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn state(&self) -> RequestState {
        self.control.state()
    }

    /// Whether the caller (or a failing sibling) asked for cancellation.
    pub fn is_cancel_requested(&self) -> bool {
        self.control.is_cancelled()
    }

    pub fn created_at(&self) -> Instant {
        self.created
    }

    /// Time since the request was created.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Destination buffer of a read; `None` for writes.
    ///
    /// Only a device may write into it, while the request is `Executing`.
    pub fn read_buffer_mut(&mut self) -> Option<&mut BytesMut> {
        match &mut self.payload {
            Payload::Read(buffer) => Some(buffer),
            Payload::Write(_) => None,
        }
    }

    /// Source data of a write; `None` for reads.
    pub fn write_data(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Write(data) => Some(data),
            Payload::Read(_) => None,
        }
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.control.set_state(state);
    }

    /// Complete successfully after transferring `bytes_transferred` bytes.
    pub fn succeed(self, bytes_transferred: u64) {
        self.finish(RequestStatus::Completed, bytes_transferred, true);
    }

    /// Complete successfully but hand no data back.
    ///
    /// Used when cancellation was requested while the request was executing.
    pub(crate) fn succeed_discarding_data(self, bytes_transferred: u64) {
        self.finish(RequestStatus::Completed, bytes_transferred, false);
    }

    /// Complete with a failure. The request must not be forwarded afterwards.
    pub fn fail(self, kind: FailureKind) {
        self.finish(RequestStatus::Failed(kind), 0, false);
    }

    /// Complete as cancelled.
    pub fn cancel(self) {
        self.finish(RequestStatus::Cancelled, 0, false);
    }

    fn finish(mut self, status: RequestStatus, bytes_transferred: u64, keep_data: bool) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        self.control.set_state(status.state());

        let data = match &mut self.payload {
            Payload::Read(buffer) if keep_data => Some(std::mem::take(buffer)),
            _ => None,
        };

        sink.deliver(Completion {
            id: self.id,
            kind: self.kind,
            status,
            bytes_transferred,
            data,
            duration: self.created.elapsed(),
        });
    }

    /// Carve the request into children of at most `chunk_len` bytes.
    ///
    /// Children cover `[offset, offset + length)` contiguously, each owning a
    /// disjoint slice of the parent's buffer. The parent completes once all
    /// children have, through a shared aggregator.
    pub(crate) fn split(mut self, chunk_len: u64) -> Vec<FileRequest> {
        debug_assert!(chunk_len > 0);
        let Some(sink) = self.sink.take() else {
            return Vec::new();
        };

        let count = self.length.div_ceil(chunk_len).max(1) as usize;
        let siblings = self.control.child();
        let aggregator = Arc::new(SplitAggregator::new(
            self.id,
            self.kind,
            count,
            sink,
            self.control.clone(),
            siblings.clone(),
            self.created,
        ));
        self.control.set_state(RequestState::Queued);

        let mut payload = std::mem::replace(&mut self.payload, Payload::Read(BytesMut::new()));
        let mut children = Vec::with_capacity(count);
        let mut offset = self.offset;
        let mut remaining = self.length;

        for index in 0..count {
            let len = remaining.min(chunk_len);
            let child_payload = match &mut payload {
                Payload::Read(buffer) => Payload::Read(buffer.split_to(len as usize)),
                Payload::Write(data) => Payload::Write(data.split_to(len as usize)),
            };

            children.push(FileRequest {
                id: RequestId::next(),
                file: self.file.clone(),
                offset,
                length: len,
                kind: self.kind,
                payload: child_payload,
                priority: self.priority,
                deadline: self.deadline,
                control: siblings.child(),
                sink: Some(CompletionSink::Split {
                    aggregator: Arc::clone(&aggregator),
                    index,
                }),
                created: Instant::now(),
            });

            offset += len;
            remaining -= len;
        }

        children
    }
}

impl Drop for FileRequest {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            warn!(id = %self.id, file = %self.file, "request dropped without completion");
            self.control.set_state(RequestState::Failed);
            sink.deliver(Completion {
                id: self.id,
                kind: self.kind,
                status: RequestStatus::Failed(FailureKind::Abandoned),
                bytes_transferred: 0,
                data: None,
                duration: self.created.elapsed(),
            });
        }
    }
}

impl std::fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("id", &self.id)
            .field("file", &self.file)
            .field("kind", &self.kind)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(request: IoRequest) -> (FileRequest, RequestHandle) {
        FileRequest::submit(request)
    }

    #[test]
    fn test_validate_rejects_overflow() {
        let req = IoRequest::read("a.bin", u64::MAX, 2);
        assert!(matches!(req.validate(), Err(Error::RequestValidation(_))));
    }

    #[test]
    fn test_validate_rejects_empty_file() {
        let req = IoRequest::read("", 0, 2);
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized() {
        let req = IoRequest::read("a.bin", 0, MAX_REQUEST_LENGTH + 1);
        assert!(req.validate().is_err());
        assert!(IoRequest::read("a.bin", 0, 1024).validate().is_ok());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_request_state_roundtrip() {
        for state in [
            RequestState::Pending,
            RequestState::Queued,
            RequestState::Scheduled,
            RequestState::Executing,
            RequestState::Completed,
            RequestState::Failed,
            RequestState::Cancelled,
        ] {
            assert_eq!(RequestState::from_u8(state as u8), state);
        }
        assert!(RequestState::Cancelled.is_terminal());
        assert!(!RequestState::Executing.is_terminal());
    }

    #[test]
    fn test_succeed_returns_buffer() {
        let (mut request, handle) = submit(IoRequest::read("a.bin", 0, 4));
        request
            .read_buffer_mut()
            .expect("read buffer")
            .copy_from_slice(b"abcd");
        request.succeed(4);

        let completion = handle.wait();
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(completion.bytes_transferred, 4);
        assert_eq!(&completion.data.expect("data")[..], b"abcd");
    }

    #[test]
    fn test_drop_reports_abandoned() {
        let (request, handle) = submit(IoRequest::read("a.bin", 0, 4));
        drop(request);

        let completion = handle.wait();
        assert_eq!(
            completion.status,
            RequestStatus::Failed(FailureKind::Abandoned)
        );
    }

    #[test]
    fn test_split_covers_range() {
        let (request, handle) = submit(IoRequest::read("a.bin", 100, 10));
        let children = request.split(4);

        let ranges: Vec<(u64, u64)> = children.iter().map(|c| (c.offset(), c.length())).collect();
        assert_eq!(ranges, vec![(100, 4), (104, 4), (108, 2)]);

        for mut child in children {
            let fill = child.offset() as u8;
            let len = child.length();
            child
                .read_buffer_mut()
                .expect("read buffer")
                .iter_mut()
                .for_each(|b| *b = fill);
            child.succeed(len);
        }

        let completion = handle.wait();
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(completion.bytes_transferred, 10);
        let data = completion.data.expect("data");
        assert_eq!(&data[..], &[100, 100, 100, 100, 104, 104, 104, 104, 108, 108]);
    }

    #[test]
    fn test_split_write_slices_data() {
        let (request, _handle) = submit(IoRequest::write("a.bin", 0, &b"0123456789"[..]));
        let children = request.split(6);
        assert_eq!(children.len(), 2);
        assert_eq!(&children[0].write_data().expect("data")[..], b"012345");
        assert_eq!(&children[1].write_data().expect("data")[..], b"6789");
        for child in children {
            let len = child.length();
            child.succeed(len);
        }
    }
}
