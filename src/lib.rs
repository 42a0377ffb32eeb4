//! StreamStack - Layered Asynchronous File Streaming
//!
//! Requests for byte ranges of files enter at the head of a stack of stages,
//! are transformed on the way down (oversized reads are split into bounded
//! sub-reads) and are executed by a device that orders pending work to
//! minimise seeks. Completion is reported back asynchronously, exactly once
//! per submitted request.
//!
//! # Architecture
//!
//! ```text
//!   caller ──submit──► Streamer ──► ReadSplitter ──► Device ──► Transport
//!     ▲                                                │   (local, TCP,
//!     └────────────── RequestHandle ◄── Completion ◄───┘    block cache)
//! ```
//!
//! # Modules
//!
//! - [`device`] - Worker-thread devices with seek-aware scheduling
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus text export of stack statistics
//! - [`request`] - File requests, completions and handles
//! - [`stack`] - Stage trait, read splitter and stack assembly
//! - [`statistics`] - Rolling averages and named statistics
//! - [`transport`] - Byte-range backends used by devices
//!
//! # Example
//!
//! ```no_run
//! use streamstack::{StackConfig, Streamer};
//!
//! # fn main() -> streamstack::Result<()> {
//! let streamer = Streamer::from_config(&StackConfig::local("/srv/assets"))?;
//! let data = streamer.read("movie.bin", 0, 10 * 1024 * 1024)?.wait().into_result()?;
//! println!("read {} bytes", data.len());
//! # Ok(())
//! # }
//! ```

pub mod device;
pub mod error;
pub mod metrics;
pub mod request;
pub mod stack;
pub mod statistics;
pub mod transport;

// Re-export commonly used types
pub use device::{Device, DeviceConfig, NetworkDevice, NetworkDeviceConfig};
pub use error::{Error, FailureKind, Result};
pub use request::{
    Completion, FileId, FileRequest, IoRequest, OperationKind, Priority, RequestHandle, RequestId,
    RequestState, RequestStatus,
};
pub use stack::{ReadSplitter, StackConfig, StreamStackEntry, Streamer};
pub use statistics::{AverageWindow, Statistic};
