//! Transports
//!
//! The blocking I/O backends a [`Device`](crate::device::Device) executes
//! requests against. A transport is owned by exactly one device worker
//! thread, so its methods take `&mut self` and may block.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    Device thread                     │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ Transport
//!      ┌─────────────────┬───┴─────────────┬────────────────────┐
//!      ▼                 ▼                 ▼                    ▼
//! LocalFileTransport  MemoryTransport  TcpTransport  BlockCacheTransport<T>
//!  (rooted dir)       (tests, faults)  (FileServer)   (LRU in front of T)
//! ```

mod block_cache;
mod local;
mod memory;
mod tcp;

pub use block_cache::{BlockCacheConfig, BlockCacheStats, BlockCacheTransport};
pub use local::{LocalFileConfig, LocalFileTransport};
pub use memory::MemoryTransport;
pub use tcp::{FileServer, TcpTransport, TcpTransportConfig};

use thiserror::Error;

use crate::request::FileId;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Failures raised by a transport while executing a request
#[derive(Error, Debug)]
pub enum TransportError {
    /// File does not exist on the backend
    #[error("file not found: {0}")]
    NotFound(String),

    /// File id escapes the transport root or is otherwise unusable
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Backend does not accept writes
    #[error("transport is read-only")]
    ReadOnly,

    /// Local I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote connection failed or was lost mid-request
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Remote peer sent a malformed or unexpected frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Injected or backend-reported failure
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Blocking byte-range access to files identified by [`FileId`].
pub trait Transport: Send + 'static {
    /// Short name used in logs and statistics.
    fn name(&self) -> &str;

    /// Read into `buf` starting at `offset`.
    ///
    /// Returns the number of bytes read; fewer than `buf.len()` only when the
    /// range extends past the end of the file.
    fn read(&mut self, file: &FileId, offset: u64, buf: &mut [u8]) -> TransportResult<usize>;

    /// Write all of `data` at `offset`, extending the file if needed.
    fn write(&mut self, file: &FileId, offset: u64, data: &[u8]) -> TransportResult<usize>;

    /// Current size of `file` in bytes.
    fn file_size(&mut self, file: &FileId) -> TransportResult<u64>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&mut self, file: &FileId, offset: u64, buf: &mut [u8]) -> TransportResult<usize> {
        (**self).read(file, offset, buf)
    }

    fn write(&mut self, file: &FileId, offset: u64, data: &[u8]) -> TransportResult<usize> {
        (**self).write(file, offset, data)
    }

    fn file_size(&mut self, file: &FileId) -> TransportResult<u64> {
        (**self).file_size(file)
    }
}
