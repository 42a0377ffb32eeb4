//! Property-Based Tests for Read Splitting
//!
//! # Test Properties
//!
//! 1. **Split Coverage**: sub-reads partition `[offset, offset + L)` with no
//!    gaps or overlaps, each at most `M` bytes
//! 2. **Pass-through Identity**: reads of `L <= M` are forwarded unchanged
//! 3. **All-or-nothing**: the parent completes only if every sub-read does
//! 4. **Data Reassembly**: sub-read buffers are rejoined in range order

#![cfg(test)]

use proptest::prelude::*;

use super::testing::RecordingStage;
use super::{ReadSplitter, StreamStackEntry};
use crate::error::FailureKind;
use crate::request::{FileRequest, IoRequest, RequestStatus};

// =============================================================================
// Property Strategies
// =============================================================================

/// (offset, length, max_read_size) with a split guaranteed.
fn split_strategy() -> impl Strategy<Value = (u64, u64, u64)> {
    (1u64..=512).prop_flat_map(|max| {
        (0u64..1 << 40, (max + 1)..=(max * 16), Just(max))
    })
}

fn splitter(max: u64) -> (ReadSplitter, RecordingStage) {
    let recorder = RecordingStage::default();
    let splitter = ReadSplitter::new(max, Box::new(recorder.clone())).expect("splitter");
    (splitter, recorder)
}

// =============================================================================
// Coverage Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: sub-ranges exactly partition the original range.
    #[test]
    fn prop_split_partitions_range((offset, length, max) in split_strategy()) {
        let (splitter, recorder) = splitter(max);
        let (request, _handle) = FileRequest::submit(IoRequest::read("p.bin", offset, length));
        splitter.prepare_request(request);

        let children = recorder.take();
        prop_assert_eq!(children.len() as u64, length.div_ceil(max));

        let mut expected = offset;
        for child in &children {
            prop_assert_eq!(child.offset(), expected);
            prop_assert!(child.length() > 0);
            prop_assert!(child.length() <= max);
            expected += child.length();
        }
        prop_assert_eq!(expected, offset + length);

        for child in children {
            child.cancel();
        }
    }

    /// Property: small reads are forwarded as-is.
    #[test]
    fn prop_pass_through_identity(offset in 0u64..1 << 40, length in 1u64..=256, extra in 0u64..256) {
        let (splitter, recorder) = splitter(length + extra);
        let (request, _handle) = FileRequest::submit(IoRequest::read("p.bin", offset, length));
        let id = request.id();
        splitter.prepare_request(request);

        let received = recorder.take();
        prop_assert_eq!(received.len(), 1);
        prop_assert_eq!(received[0].id(), id);
        prop_assert_eq!(received[0].offset(), offset);
        prop_assert_eq!(received[0].length(), length);

        for request in received {
            request.cancel();
        }
    }
}

// =============================================================================
// Completion Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: the parent fails iff any sub-read fails.
    #[test]
    fn prop_all_or_nothing(
        (offset, length, max) in split_strategy(),
        failures in prop::collection::vec(any::<bool>(), 16),
    ) {
        let (splitter, recorder) = splitter(max);
        let (request, handle) = FileRequest::submit(IoRequest::read("p.bin", offset, length));
        splitter.prepare_request(request);

        let children = recorder.take();
        let mut any_failed = false;
        for (i, child) in children.into_iter().enumerate() {
            if failures[i % failures.len()] {
                any_failed = true;
                child.fail(FailureKind::Transport("injected".into()));
            } else {
                let len = child.length();
                child.succeed(len);
            }
        }

        let completion = handle.wait();
        if any_failed {
            prop_assert!(
                matches!(completion.status, RequestStatus::Failed(_)),
                "expected failure, got {:?}",
                completion.status
            );
        } else {
            prop_assert_eq!(completion.status, RequestStatus::Completed);
            prop_assert_eq!(completion.bytes_transferred, length);
        }
    }

    /// Property: rejoined data equals what each sub-read wrote.
    #[test]
    fn prop_data_reassembled(length in 2u64..2048, max in 1u64..64) {
        let (splitter, recorder) = splitter(max);
        let (request, handle) = FileRequest::submit(IoRequest::read("p.bin", 0, length));
        splitter.prepare_request(request);

        for mut child in recorder.take() {
            let start = child.offset();
            let len = child.length();
            if let Some(buffer) = child.read_buffer_mut() {
                for (i, byte) in buffer.iter_mut().enumerate() {
                    *byte = ((start + i as u64) % 251) as u8;
                }
            }
            child.succeed(len);
        }

        let data = handle.wait().into_result().expect("data");
        prop_assert_eq!(data.len() as u64, length);
        for (i, byte) in data.iter().enumerate() {
            prop_assert_eq!(*byte, (i % 251) as u8);
        }
    }
}
