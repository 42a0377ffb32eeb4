//! Completion routing and caller handles.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use super::split::SplitAggregator;
use super::{OperationKind, RequestId, RequestState};
use crate::error::{Error, FailureKind, Result};

/// Callback invoked once with the final outcome of a request.
pub type CompletionCallback = Box<dyn FnOnce(&Completion) + Send + 'static>;

// =============================================================================
// Outcome
// =============================================================================

/// Terminal status of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Completed,
    Failed(FailureKind),
    Cancelled,
}

impl RequestStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, RequestStatus::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RequestStatus::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestStatus::Cancelled)
    }

    /// Lifecycle state matching this status.
    pub fn state(&self) -> RequestState {
        match self {
            RequestStatus::Completed => RequestState::Completed,
            RequestStatus::Failed(_) => RequestState::Failed,
            RequestStatus::Cancelled => RequestState::Cancelled,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Completed => write!(f, "Completed"),
            RequestStatus::Failed(kind) => write!(f, "Failed({})", kind),
            RequestStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Final outcome delivered exactly once per submitted request.
#[derive(Debug)]
pub struct Completion {
    /// Request the outcome belongs to
    pub id: RequestId,

    /// Operation type
    pub kind: OperationKind,

    /// Terminal status
    pub status: RequestStatus,

    /// Bytes read or written
    pub bytes_transferred: u64,

    /// Read buffer handed back to the caller (reads only)
    pub data: Option<BytesMut>,

    /// Time from submission to completion
    pub duration: Duration,
}

impl Completion {
    pub(crate) fn abandoned(id: RequestId, kind: OperationKind) -> Self {
        Self {
            id,
            kind,
            status: RequestStatus::Failed(FailureKind::Abandoned),
            bytes_transferred: 0,
            data: None,
            duration: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_completed()
    }

    /// Convert into the transferred bytes, or the failure as an [`Error`].
    ///
    /// Reads yield the first `bytes_transferred` bytes of the buffer (shorter
    /// than requested only at end of file). Writes, and reads whose data was
    /// discarded after a cancel during execution, yield an empty `Bytes`.
    pub fn into_result(self) -> Result<Bytes> {
        match self.status {
            RequestStatus::Completed => {
                let mut data = self.data.unwrap_or_default();
                data.truncate(self.bytes_transferred as usize);
                Ok(data.freeze())
            }
            RequestStatus::Failed(kind) => Err(Error::RequestFailed { id: self.id, kind }),
            RequestStatus::Cancelled => Err(Error::Cancelled { id: self.id }),
        }
    }
}

// =============================================================================
// Shared Control Block
// =============================================================================

#[derive(Debug)]
struct ControlInner {
    state: AtomicU8,
    cancelled: AtomicBool,
    parent: Option<RequestControl>,
}

/// State and cancellation flag shared between a request and its handle.
///
/// Children of a split request link to a sibling group, which links to the
/// parent; cancelling any ancestor cancels the descendants.
#[derive(Debug, Clone)]
pub(crate) struct RequestControl(Arc<ControlInner>);

impl RequestControl {
    pub(crate) fn new() -> Self {
        Self(Arc::new(ControlInner {
            state: AtomicU8::new(RequestState::Pending as u8),
            cancelled: AtomicBool::new(false),
            parent: None,
        }))
    }

    pub(crate) fn child(&self) -> Self {
        Self(Arc::new(ControlInner {
            state: AtomicU8::new(RequestState::Pending as u8),
            cancelled: AtomicBool::new(false),
            parent: Some(self.clone()),
        }))
    }

    pub(crate) fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        let mut current = Some(self);
        while let Some(control) = current {
            if control.0.cancelled.load(Ordering::Acquire) {
                return true;
            }
            current = control.0.parent.as_ref();
        }
        false
    }

    pub(crate) fn state(&self) -> RequestState {
        RequestState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: RequestState) {
        self.0.state.store(state as u8, Ordering::Release);
    }
}

// =============================================================================
// Completion Routing
// =============================================================================

/// Where a request reports its outcome.
pub(crate) enum CompletionSink {
    /// Straight back to the submitting caller
    Caller {
        sender: oneshot::Sender<Completion>,
        callback: Option<CompletionCallback>,
    },

    /// Into the aggregator of a split parent
    Split {
        aggregator: Arc<SplitAggregator>,
        index: usize,
    },
}

impl CompletionSink {
    pub(crate) fn deliver(self, completion: Completion) {
        match self {
            CompletionSink::Caller { sender, callback } => {
                if let Some(callback) = callback {
                    callback(&completion);
                }
                // The caller may have dropped its handle; the outcome is still final.
                let _ = sender.send(completion);
            }
            CompletionSink::Split { aggregator, index } => {
                aggregator.child_completed(index, completion);
            }
        }
    }
}

// =============================================================================
// Caller Handle
// =============================================================================

/// Caller's view of a submitted request.
///
/// Await it from async code, or call [`RequestHandle::wait`] from a plain
/// thread.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    kind: OperationKind,
    control: RequestControl,
    receiver: oneshot::Receiver<Completion>,
}

impl RequestHandle {
    pub(crate) fn new(
        id: RequestId,
        kind: OperationKind,
        control: RequestControl,
        receiver: oneshot::Receiver<Completion>,
    ) -> Self {
        Self {
            id,
            kind,
            control,
            receiver,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Current lifecycle state (may be stale by the time it is read).
    pub fn state(&self) -> RequestState {
        self.control.state()
    }

    /// Request cooperative cancellation.
    ///
    /// Queued or scheduled work is removed before it runs; work already
    /// executing finishes and its result is discarded.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Block the current thread until the request completes.
    ///
    /// Must not be called from within an async runtime; await the handle
    /// instead.
    pub fn wait(self) -> Completion {
        let (id, kind) = (self.id, self.kind);
        self.receiver
            .blocking_recv()
            .unwrap_or_else(|_| Completion::abandoned(id, kind))
    }

    /// Return the completion if it has already arrived.
    pub fn try_wait(&mut self) -> Option<Completion> {
        match self.receiver.try_recv() {
            Ok(completion) => Some(completion),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Completion::abandoned(self.id, self.kind))
            }
        }
    }
}

impl Future for RequestHandle {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(completion)) => Poll::Ready(completion),
            Poll::Ready(Err(_)) => Poll::Ready(Completion::abandoned(this.id, this.kind)),
            Poll::Pending => Poll::Pending,
        }
    }
}
