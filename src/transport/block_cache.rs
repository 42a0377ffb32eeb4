//! Block cache transport
//!
//! Fixed-size block cache in front of another (typically remote) transport.
//!
//! # Design
//!
//! - Reads are served block by block; a miss fetches the whole block from
//!   the inner transport
//! - Least recently used blocks are evicted once `num_blocks` are held
//! - Writes go straight through and invalidate every block they touch
//! - `num_blocks == 0` disables caching entirely

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{Transport, TransportResult};
use crate::error::{Error, Result};
use crate::request::FileId;

/// Default cache block size (64 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default number of cached blocks
pub const DEFAULT_NUM_BLOCKS: usize = 64;

/// Block cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    /// Size of one cached block in bytes
    pub block_size: usize,

    /// Maximum number of blocks held (0 disables the cache)
    pub num_blocks: usize,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            num_blocks: DEFAULT_NUM_BLOCKS,
        }
    }
}

impl BlockCacheConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("cache_block_size must be > 0".into()));
        }
        Ok(())
    }
}

/// Cache counters, shared with whoever reports them.
#[derive(Debug, Default)]
pub struct BlockCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl BlockCacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Hit ratio in `[0, 1]`, zero before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

type BlockKey = (FileId, u64);

struct CachedBlock {
    data: Vec<u8>,
    last_used: u64,
}

/// Caching wrapper around another transport.
pub struct BlockCacheTransport<T> {
    inner: T,
    config: BlockCacheConfig,
    blocks: HashMap<BlockKey, CachedBlock>,
    /// last_used tick → key, oldest first
    recency: BTreeMap<u64, BlockKey>,
    tick: u64,
    stats: Arc<BlockCacheStats>,
}

impl<T: Transport> BlockCacheTransport<T> {
    pub fn new(inner: T, config: BlockCacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            config,
            blocks: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            stats: Arc::new(BlockCacheStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<BlockCacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Number of blocks currently cached.
    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn enabled(&self) -> bool {
        self.config.num_blocks > 0
    }

    /// Copy of block `index`, fetched from the inner transport on a miss.
    fn block(&mut self, file: &FileId, index: u64) -> TransportResult<&[u8]> {
        self.tick += 1;
        let tick = self.tick;
        let key = (file.clone(), index);

        if let Some(block) = self.blocks.get_mut(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.recency.remove(&block.last_used);
            block.last_used = tick;
            self.recency.insert(tick, key.clone());
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let mut data = vec![0u8; self.config.block_size];
            let n = self
                .inner
                .read(file, index * self.config.block_size as u64, &mut data)?;
            data.truncate(n);

            while self.blocks.len() >= self.config.num_blocks {
                let Some((_, oldest)) = self.recency.pop_first() else {
                    break;
                };
                trace!(file = %oldest.0, block = oldest.1, "Evicting cached block");
                self.blocks.remove(&oldest);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
            self.recency.insert(tick, key.clone());
            self.blocks.insert(
                key.clone(),
                CachedBlock {
                    data,
                    last_used: tick,
                },
            );
        }

        Ok(self
            .blocks
            .get(&key)
            .map(|block| block.data.as_slice())
            .unwrap_or_default())
    }

    fn invalidate(&mut self, file: &FileId, offset: u64, len: usize) {
        if len == 0 {
            return;
        }
        let block_size = self.config.block_size as u64;
        let first = offset / block_size;
        let last = (offset + len as u64 - 1) / block_size;
        for index in first..=last {
            if let Some(block) = self.blocks.remove(&(file.clone(), index)) {
                self.recency.remove(&block.last_used);
                self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<T: Transport> Transport for BlockCacheTransport<T> {
    fn name(&self) -> &str {
        "block_cache"
    }

    fn read(&mut self, file: &FileId, offset: u64, buf: &mut [u8]) -> TransportResult<usize> {
        if !self.enabled() {
            return self.inner.read(file, offset, buf);
        }

        let block_size = self.config.block_size as u64;
        let mut filled = 0;
        while filled < buf.len() {
            let position = offset + filled as u64;
            let index = position / block_size;
            let within = (position % block_size) as usize;

            let block = self.block(file, index)?;
            if within >= block.len() {
                break;
            }
            let n = (block.len() - within).min(buf.len() - filled);
            buf[filled..filled + n].copy_from_slice(&block[within..within + n]);
            filled += n;

            // A short block marks end of file.
            if block.len() < block_size as usize {
                break;
            }
        }
        Ok(filled)
    }

    fn write(&mut self, file: &FileId, offset: u64, data: &[u8]) -> TransportResult<usize> {
        let written = self.inner.write(file, offset, data)?;
        if self.enabled() {
            self.invalidate(file, offset, data.len());
            // Blocks past the old end of file may have been cached short.
            let block_size = self.config.block_size as u64;
            let end_index = (offset + data.len() as u64) / block_size;
            let stale: Vec<BlockKey> = self
                .blocks
                .iter()
                .filter(|((id, index), block)| {
                    id == file && *index < end_index && block.data.len() < self.config.block_size
                })
                .map(|(key, _)| key.clone())
                .collect();
            for key in stale {
                if let Some(block) = self.blocks.remove(&key) {
                    self.recency.remove(&block.last_used);
                    self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(written)
    }

    fn file_size(&mut self, file: &FileId) -> TransportResult<u64> {
        self.inner.file_size(file)
    }
}
