//! Aggregation of split children back into their parent.
//!
//! The parent completes once every child has reached a terminal state:
//!
//! - any child `Failed` → parent `Failed` with the first failure seen, and
//!   the remaining siblings are asked to cancel
//! - otherwise any child `Cancelled` → parent `Cancelled`
//! - otherwise → parent `Completed`

use std::time::Instant;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::debug;

use super::{Completion, CompletionSink, OperationKind, RequestControl, RequestId, RequestStatus};
use crate::error::FailureKind;

struct SplitState {
    sink: Option<CompletionSink>,
    parts: Vec<Option<BytesMut>>,
    remaining: usize,
    bytes_transferred: u64,
    failure: Option<FailureKind>,
    cancelled: bool,
}

/// Shared by all children of one split request.
pub(crate) struct SplitAggregator {
    parent_id: RequestId,
    kind: OperationKind,
    started: Instant,
    parent_control: RequestControl,
    siblings: RequestControl,
    state: Mutex<SplitState>,
}

impl SplitAggregator {
    pub(crate) fn new(
        parent_id: RequestId,
        kind: OperationKind,
        count: usize,
        sink: CompletionSink,
        parent_control: RequestControl,
        siblings: RequestControl,
        started: Instant,
    ) -> Self {
        Self {
            parent_id,
            kind,
            started,
            parent_control,
            siblings,
            state: Mutex::new(SplitState {
                sink: Some(sink),
                parts: (0..count).map(|_| None).collect(),
                remaining: count,
                bytes_transferred: 0,
                failure: None,
                cancelled: false,
            }),
        }
    }

    /// Record the outcome of child `index`; the last one completes the parent.
    pub(crate) fn child_completed(&self, index: usize, completion: Completion) {
        let finished = {
            let mut state = self.state.lock();
            if let Some(slot) = state.parts.get_mut(index) {
                *slot = completion.data;
            }
            state.bytes_transferred += completion.bytes_transferred;

            match completion.status {
                RequestStatus::Completed => {}
                RequestStatus::Failed(kind) => {
                    if state.failure.is_none() {
                        debug!(
                            parent = %self.parent_id,
                            child = %completion.id,
                            error = %kind,
                            "Split child failed, cancelling siblings"
                        );
                        self.siblings.cancel();
                        state.failure = Some(kind);
                    }
                }
                RequestStatus::Cancelled => state.cancelled = true,
            }

            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining > 0 {
                return;
            }

            let status = match state.failure.take() {
                Some(kind) => RequestStatus::Failed(kind),
                None if state.cancelled => RequestStatus::Cancelled,
                None => RequestStatus::Completed,
            };
            let parts = std::mem::take(&mut state.parts);
            let bytes_transferred = state.bytes_transferred;
            state
                .sink
                .take()
                .map(|sink| (sink, status, parts, bytes_transferred))
        };

        // Deliver outside the lock; the sink may run a caller callback.
        if let Some((sink, status, parts, bytes_transferred)) = finished {
            self.parent_control.set_state(status.state());
            sink.deliver(Completion {
                id: self.parent_id,
                kind: self.kind,
                status,
                bytes_transferred,
                data: join_parts(parts),
                duration: self.started.elapsed(),
            });
        }
    }
}

/// Re-join child buffers in range order; `None` if any part is missing.
fn join_parts(parts: Vec<Option<BytesMut>>) -> Option<BytesMut> {
    let mut parts = parts.into_iter();
    let mut joined = parts.next()??;
    for part in parts {
        joined.unsplit(part?);
    }
    Some(joined)
}
