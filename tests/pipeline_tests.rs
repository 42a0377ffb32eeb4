//! StreamStack Pipeline Integration Tests
//!
//! Exercises full stacks through the public API:
//! - Read splitting over a device
//! - Completion delivery and cancellation
//! - Local file stacks assembled from configuration

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;

use streamstack::device::{Device, DeviceConfig};
use streamstack::statistics;
use streamstack::transport::MemoryTransport;
use streamstack::{
    Error, FailureKind, FileRequest, IoRequest, ReadSplitter, RequestStatus, StackConfig,
    Statistic, StreamStackEntry, Streamer,
};

const MB: u64 = 1_000_000;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn memory_device(transport: &MemoryTransport) -> Device {
    let config = DeviceConfig::new("memory").with_thread_sleep_time(Duration::from_millis(1));
    Device::mount(config, transport.clone()).expect("mount")
}

fn split_stack(transport: &MemoryTransport, max_read_size: u64) -> Streamer {
    let device = memory_device(transport);
    let splitter = ReadSplitter::new(max_read_size, Box::new(device)).expect("splitter");
    Streamer::new(Box::new(splitter))
}

/// Stage defined outside the crate that counts what passes through.
struct CountingStage {
    next: Box<dyn StreamStackEntry>,
    seen: Arc<AtomicU64>,
}

impl StreamStackEntry for CountingStage {
    fn name(&self) -> &str {
        "counter"
    }

    fn prepare_request(&self, request: FileRequest) {
        self.seen.fetch_add(1, Ordering::Relaxed);
        self.next.prepare_request(request);
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        out.push(Statistic::new(
            "counter",
            "seen",
            self.seen.load(Ordering::Relaxed) as f64,
        ));
        self.next.collect_statistics(out);
    }
}

// =============================================================================
// Read Splitting
// =============================================================================

mod splitting_tests {
    use super::*;

    #[test]
    fn test_ten_megabyte_read_in_one_megabyte_pieces() {
        let transport = MemoryTransport::new();
        transport.insert("movie.bin", pattern(10 * MB as usize));
        let streamer = split_stack(&transport, MB);

        let handle = streamer.read("movie.bin", 0, 10 * MB).expect("submit");
        let completion = handle.wait();

        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(completion.bytes_transferred, 10 * MB);
        let data = completion.into_result().expect("data");
        assert_eq!(&data[..], &pattern(10 * MB as usize)[..]);
        assert_eq!(transport.reads(), 10);

        let stats = streamer.collect_statistics();
        assert_eq!(
            statistics::find(&stats, "read_splitter", "average_num_sub_reads").map(|s| s.value),
            Some(10.0)
        );
        assert_eq!(
            statistics::find(&stats, "memory", "requests_completed").map(|s| s.value),
            Some(10.0)
        );
    }

    #[test]
    fn test_unaligned_split_keeps_byte_order() {
        let transport = MemoryTransport::new();
        transport.insert("a.bin", pattern(100_000));
        let streamer = split_stack(&transport, 4096);

        let data = streamer
            .read("a.bin", 1234, 50_000)
            .expect("submit")
            .wait()
            .into_result()
            .expect("data");
        assert_eq!(&data[..], &pattern(100_000)[1234..51_234]);
    }

    #[test]
    fn test_read_past_end_is_short() {
        let transport = MemoryTransport::new();
        transport.insert("short.bin", pattern(2_500));
        let streamer = split_stack(&transport, 1_000);

        let completion = streamer.read("short.bin", 0, 4_000).expect("submit").wait();
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(completion.bytes_transferred, 2_500);
        let data = completion.into_result().expect("data");
        assert_eq!(&data[..], &pattern(2_500)[..]);
    }

    #[test]
    fn test_zero_length_read_never_reaches_device() {
        let transport = MemoryTransport::new();
        transport.insert("a.bin", pattern(16));
        let streamer = split_stack(&transport, 8);

        let completion = streamer.read("a.bin", 4, 0).expect("submit").wait();
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(completion.bytes_transferred, 0);
        assert_eq!(transport.reads(), 0);
    }

    #[test]
    fn test_zero_max_read_size_rejected() {
        let transport = MemoryTransport::new();
        let result = ReadSplitter::new(0, Box::new(memory_device(&transport)));
        assert_matches!(result, Err(Error::Config(_)));
    }
}

// =============================================================================
// Completion
// =============================================================================

mod completion_tests {
    use super::*;

    #[test]
    fn test_failed_sub_read_fails_whole_request() {
        let transport = MemoryTransport::new();
        transport.insert("a.bin", pattern(64));
        transport.inject_failure("disk on fire");
        let streamer = split_stack(&transport, 16);

        let completion = streamer.read("a.bin", 0, 64).expect("submit").wait();
        assert_matches!(
            completion.status,
            RequestStatus::Failed(FailureKind::Transport(ref msg)) if msg.contains("disk on fire")
        );
        assert_matches!(completion.into_result(), Err(Error::RequestFailed { .. }));
    }

    #[test]
    fn test_missing_file_fails() {
        let transport = MemoryTransport::new();
        let streamer = split_stack(&transport, 16);

        let completion = streamer.read("nope.bin", 0, 8).expect("submit").wait();
        assert_matches!(completion.status, RequestStatus::Failed(FailureKind::Transport(_)));
    }

    #[test]
    fn test_callback_runs_once_for_split_request() {
        let transport = MemoryTransport::new();
        transport.insert("a.bin", pattern(4_096));
        let streamer = split_stack(&transport, 1_024);

        let calls = Arc::new(AtomicUsize::new(0));
        let bytes = Arc::new(AtomicU64::new(0));
        let request = IoRequest::read("a.bin", 0, 4_096).with_callback({
            let calls = Arc::clone(&calls);
            let bytes = Arc::clone(&bytes);
            move |completion| {
                calls.fetch_add(1, Ordering::SeqCst);
                bytes.store(completion.bytes_transferred, Ordering::SeqCst);
            }
        });

        let completion = streamer.submit(request).expect("submit").wait();
        assert!(completion.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bytes.load(Ordering::SeqCst), 4_096);
    }

    #[test]
    fn test_cancel_queued_request() {
        let transport = MemoryTransport::new();
        transport.insert("a.bin", pattern(1_024));
        transport.set_latency(Duration::from_millis(50));
        let streamer = Streamer::new(Box::new(memory_device(&transport)));

        let first = streamer.read("a.bin", 0, 256).expect("submit");
        let second = streamer.read("a.bin", 512, 256).expect("submit");
        second.cancel();

        assert!(first.wait().is_success());
        let completion = second.wait();
        assert_eq!(completion.status, RequestStatus::Cancelled);
        assert_matches!(completion.into_result(), Err(Error::Cancelled { .. }));
    }

    #[test]
    fn test_invalid_requests_rejected_at_submit() {
        let transport = MemoryTransport::new();
        let streamer = split_stack(&transport, 16);

        assert_matches!(streamer.read("", 0, 8), Err(Error::RequestValidation(_)));
        assert_matches!(
            streamer.read("a.bin", u64::MAX - 4, 8),
            Err(Error::RequestValidation(_))
        );

        let stats = streamer.collect_statistics();
        assert_eq!(
            statistics::find(&stats, "streamer", "requests_rejected").map(|s| s.value),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_handle_is_awaitable() {
        let transport = MemoryTransport::new();
        transport.insert("a.bin", pattern(300));
        let streamer = split_stack(&transport, 100);

        let completion = streamer.read("a.bin", 0, 300).expect("submit").await;
        assert_eq!(completion.bytes_transferred, 300);
    }

    #[test]
    fn test_handle_with_block_on() {
        let transport = MemoryTransport::new();
        transport.insert("a.bin", pattern(10));
        let streamer = split_stack(&transport, 4);

        let handle = streamer.write("a.bin", 0, &b"hello"[..]).expect("submit");
        let completion = tokio_test::block_on(handle);
        assert_eq!(completion.status, RequestStatus::Completed);
        assert_eq!(transport.contents(&"a.bin".into()).expect("file")[..5], b"hello"[..]);
    }
}

// =============================================================================
// Custom Stages and Configuration
// =============================================================================

mod stack_tests {
    use super::*;

    #[test]
    fn test_custom_stage_sees_each_sub_read() {
        let transport = MemoryTransport::new();
        transport.insert("a.bin", pattern(1_000));
        let seen = Arc::new(AtomicU64::new(0));
        let counter = CountingStage {
            next: Box::new(memory_device(&transport)),
            seen: Arc::clone(&seen),
        };
        let splitter = ReadSplitter::new(250, Box::new(counter)).expect("splitter");
        let streamer = Streamer::new(Box::new(splitter));

        assert!(streamer.read("a.bin", 0, 1_000).expect("submit").wait().is_success());
        assert_eq!(seen.load(Ordering::Relaxed), 4);

        let owners: Vec<String> = streamer
            .collect_statistics()
            .into_iter()
            .map(|s| s.owner)
            .collect();
        let first = |owner: &str| owners.iter().position(|o| o == owner);
        assert!(first("streamer") < first("read_splitter"));
        assert!(first("read_splitter") < first("counter"));
        assert!(first("counter") < first("memory"));
    }

    #[test]
    fn test_local_stack_from_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("data.bin"), pattern(5_000)).expect("write");

        let yaml = format!(
            r#"
stages:
  - type: read_splitter
    max_read_size: 1024
  - type: storage_device
    name: disk
    root: {}
    writable: true
    thread_sleep_time_ms: 1
"#,
            dir.path().display()
        );
        let config = StackConfig::from_yaml_str(&yaml).expect("config");
        let streamer = Streamer::from_config(&config).expect("stack");

        let data = streamer
            .read("data.bin", 100, 4_000)
            .expect("submit")
            .wait()
            .into_result()
            .expect("data");
        assert_eq!(&data[..], &pattern(5_000)[100..4_100]);

        let written = streamer
            .write("new.bin", 0, &b"streamed"[..])
            .expect("submit")
            .wait();
        assert_eq!(written.bytes_transferred, 8);
        assert_eq!(
            std::fs::read(dir.path().join("new.bin")).expect("read back"),
            b"streamed"
        );

        let stats = streamer.collect_statistics();
        assert_eq!(
            statistics::find(&stats, "disk", "bytes_written").map(|s| s.value),
            Some(8.0)
        );
    }

    #[test]
    fn test_read_only_local_stack_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let streamer = Streamer::from_config(&StackConfig::local(dir.path())).expect("stack");

        let completion = streamer.write("x.bin", 0, &b"x"[..]).expect("submit").wait();
        assert_matches!(completion.status, RequestStatus::Failed(FailureKind::Transport(_)));
    }

    #[test]
    fn test_path_escape_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let streamer = Streamer::from_config(&StackConfig::local(dir.path())).expect("stack");

        let completion = streamer.read("../etc/passwd", 0, 8).expect("submit").wait();
        assert!(completion.status.is_failed());
    }
}
