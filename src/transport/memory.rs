//! In-memory transport
//!
//! Files live in a shared map, so clones of the transport observe the same
//! contents. Latency and failures can be injected to exercise scheduling and
//! error paths without touching a disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{Transport, TransportError, TransportResult};
use crate::request::FileId;

#[derive(Default)]
struct MemoryInner {
    files: RwLock<HashMap<FileId, Vec<u8>>>,
    latency: Mutex<Duration>,
    failure: Mutex<Option<String>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

/// Shared in-memory file store.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&self, file: impl Into<FileId>, contents: impl Into<Vec<u8>>) {
        self.inner.files.write().insert(file.into(), contents.into());
    }

    /// Copy of a file's contents.
    pub fn contents(&self, file: &FileId) -> Option<Vec<u8>> {
        self.inner.files.read().get(file).cloned()
    }

    /// Sleep this long before every operation.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Fail every operation with `message` until cleared.
    pub fn inject_failure(&self, message: impl Into<String>) {
        *self.inner.failure.lock() = Some(message.into());
    }

    pub fn clear_failure(&self) {
        *self.inner.failure.lock() = None;
    }

    /// Reads served so far.
    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    /// Writes served so far.
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    fn before_operation(&self) -> TransportResult<()> {
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        match self.inner.failure.lock().as_ref() {
            Some(message) => Err(TransportError::Backend(message.clone())),
            None => Ok(()),
        }
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn read(&mut self, file: &FileId, offset: u64, buf: &mut [u8]) -> TransportResult<usize> {
        self.before_operation()?;
        self.inner.reads.fetch_add(1, Ordering::Relaxed);

        let files = self.inner.files.read();
        let contents = files
            .get(file)
            .ok_or_else(|| TransportError::NotFound(file.to_string()))?;

        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(contents.len());
        let n = buf.len().min(contents.len() - start);
        buf[..n].copy_from_slice(&contents[start..start + n]);
        Ok(n)
    }

    fn write(&mut self, file: &FileId, offset: u64, data: &[u8]) -> TransportResult<usize> {
        self.before_operation()?;
        self.inner.writes.fetch_add(1, Ordering::Relaxed);

        let start = usize::try_from(offset)
            .map_err(|_| TransportError::Backend(format!("offset {} too large", offset)))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| TransportError::Backend("write range overflows".into()))?;

        let mut files = self.inner.files.write();
        let contents = files.entry(file.clone()).or_default();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn file_size(&mut self, file: &FileId) -> TransportResult<u64> {
        self.before_operation()?;
        self.inner
            .files
            .read()
            .get(file)
            .map(|contents| contents.len() as u64)
            .ok_or_else(|| TransportError::NotFound(file.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_contents() {
        let store = MemoryTransport::new();
        let mut transport = store.clone();
        let file = FileId::from("shared.bin");

        transport.write(&file, 2, b"xy").expect("write");
        assert_eq!(store.contents(&file), Some(vec![0, 0, b'x', b'y']));
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_read_past_end() {
        let store = MemoryTransport::new();
        store.insert("a", b"abc".to_vec());
        let mut transport = store.clone();

        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&FileId::from("a"), 1, &mut buf).expect("read"), 2);
        assert_eq!(transport.read(&FileId::from("a"), 10, &mut buf).expect("read"), 0);
    }

    #[test]
    fn test_injected_failure() {
        let store = MemoryTransport::new();
        store.insert("a", b"abc".to_vec());
        let mut transport = store.clone();

        store.inject_failure("disk on fire");
        let mut buf = [0u8; 1];
        assert!(matches!(
            transport.read(&FileId::from("a"), 0, &mut buf),
            Err(TransportError::Backend(msg)) if msg == "disk on fire"
        ));

        store.clear_failure();
        assert!(transport.read(&FileId::from("a"), 0, &mut buf).is_ok());
    }
}
