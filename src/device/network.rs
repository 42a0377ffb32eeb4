//! Network device
//!
//! A [`Device`] whose transport is a remote [`FileServer`] reached over TCP,
//! with a block cache in front so repeated small reads stay local.
//!
//! [`FileServer`]: crate::transport::FileServer

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Device, DeviceConfig, DeviceStats};
use crate::error::{Error, Result};
use crate::request::FileRequest;
use crate::stack::StreamStackEntry;
use crate::statistics::Statistic;
use crate::transport::{
    BlockCacheConfig, BlockCacheStats, BlockCacheTransport, TcpTransport, TcpTransportConfig,
};

/// Network device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDeviceConfig {
    /// Device name
    pub name: String,

    /// File server address (`host:port`)
    pub address: String,

    /// Size of one cache block in bytes
    pub cache_block_size: usize,

    /// Number of cached blocks (0 disables the cache)
    pub num_cache_blocks: usize,

    /// Idle sleep of the worker thread
    pub thread_sleep_time_ms: u64,

    /// TCP connect timeout
    pub connect_timeout_ms: u64,

    /// Per-operation socket timeout
    pub io_timeout_ms: u64,
}

impl Default for NetworkDeviceConfig {
    fn default() -> Self {
        let cache = BlockCacheConfig::default();
        Self {
            name: "network".to_string(),
            address: "127.0.0.1:7450".to_string(),
            cache_block_size: cache.block_size,
            num_cache_blocks: cache.num_blocks,
            thread_sleep_time_ms: 10,
            connect_timeout_ms: 5_000,
            io_timeout_ms: 30_000,
        }
    }
}

impl NetworkDeviceConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_cache(mut self, block_size: usize, num_blocks: usize) -> Self {
        self.cache_block_size = block_size;
        self.num_cache_blocks = num_blocks;
        self
    }

    fn device_config(&self) -> DeviceConfig {
        DeviceConfig::new(self.name.clone())
            .with_thread_sleep_time(Duration::from_millis(self.thread_sleep_time_ms))
    }

    fn transport_config(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            address: self.address.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            ..Default::default()
        }
    }

    fn cache_config(&self) -> BlockCacheConfig {
        BlockCacheConfig {
            block_size: self.cache_block_size,
            num_blocks: self.num_cache_blocks,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache_block_size == 0 {
            return Err(Error::Config("cache_block_size must be > 0".into()));
        }
        if self.thread_sleep_time_ms == 0 {
            return Err(Error::Config("thread_sleep_time_ms must be > 0".into()));
        }
        self.device_config().validate()?;
        self.transport_config().validate()?;
        self.cache_config().validate()
    }
}

/// Device serving files from a remote file server.
pub struct NetworkDevice {
    device: Device,
    cache_stats: Arc<BlockCacheStats>,
}

impl NetworkDevice {
    /// Mount the device. The connection is opened lazily by the first request.
    pub fn mount(config: NetworkDeviceConfig) -> Result<Self> {
        config.validate()?;

        let tcp = TcpTransport::new(config.transport_config())?;
        let transport = BlockCacheTransport::new(tcp, config.cache_config())?;
        let cache_stats = transport.stats();
        let device = Device::mount(config.device_config(), transport)?;

        info!(
            device = %config.name,
            address = %config.address,
            block_size = config.cache_block_size,
            blocks = config.num_cache_blocks,
            "Network device mounted"
        );
        Ok(Self {
            device,
            cache_stats,
        })
    }

    pub fn stats(&self) -> &Arc<DeviceStats> {
        self.device.stats()
    }

    pub fn cache_stats(&self) -> &Arc<BlockCacheStats> {
        &self.cache_stats
    }

    /// See [`Device::shutdown`].
    pub fn shutdown(&self) {
        self.device.shutdown();
    }
}

impl StreamStackEntry for NetworkDevice {
    fn name(&self) -> &str {
        self.device.name()
    }

    fn prepare_request(&self, request: FileRequest) {
        self.device.prepare_request(request);
    }

    fn collect_statistics(&self, out: &mut Vec<Statistic>) {
        self.device.collect_statistics(out);
        let owner = self.device.name();
        out.push(Statistic::new(owner, "cache_hits", self.cache_stats.hits() as f64));
        out.push(Statistic::new(owner, "cache_misses", self.cache_stats.misses() as f64));
        out.push(Statistic::new(
            owner,
            "cache_evictions",
            self.cache_stats.evictions() as f64,
        ));
        out.push(Statistic::new(
            owner,
            "cache_hit_ratio",
            self.cache_stats.hit_ratio(),
        ));
    }
}
