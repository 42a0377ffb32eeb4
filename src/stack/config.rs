//! Stack assembly configuration
//!
//! A stack is declared as an ordered list of stages, head first, ending in
//! exactly one device:
//!
//! ```yaml
//! stages:
//!   - type: read_splitter
//!     max_read_size: 1048576
//!   - type: storage_device
//!     name: assets
//!     root: /srv/assets
//!     max_open_files: 32
//! ```
//!
//! Configuration is static: it is read once at assembly and never changes
//! while requests are in flight.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ReadSplitter, StreamStackEntry};
use crate::device::{Device, DeviceConfig, NetworkDevice, NetworkDeviceConfig, DEFAULT_SEEK_THRESHOLD};
use crate::error::{Error, Result};
use crate::transport::{LocalFileConfig, LocalFileTransport};

/// Default maximum read size for a splitter (1 MiB)
pub const DEFAULT_MAX_READ_SIZE: u64 = 1024 * 1024;

/// Read splitter stage parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSplitterConfig {
    pub name: String,
    pub max_read_size: u64,
}

impl Default for ReadSplitterConfig {
    fn default() -> Self {
        Self {
            name: "read_splitter".to_string(),
            max_read_size: DEFAULT_MAX_READ_SIZE,
        }
    }
}

/// Local storage device parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageDeviceConfig {
    pub name: String,
    pub root: PathBuf,
    pub max_open_files: usize,
    pub writable: bool,
    pub thread_sleep_time_ms: u64,
    pub seek_threshold: u64,
    pub max_scheduled: usize,
}

impl Default for StorageDeviceConfig {
    fn default() -> Self {
        let local = LocalFileConfig::default();
        let device = DeviceConfig::default();
        Self {
            name: "storage".to_string(),
            root: local.root,
            max_open_files: local.max_open_files,
            writable: local.writable,
            thread_sleep_time_ms: device.thread_sleep_time.as_millis() as u64,
            seek_threshold: DEFAULT_SEEK_THRESHOLD,
            max_scheduled: device.max_scheduled,
        }
    }
}

impl StorageDeviceConfig {
    fn device_config(&self) -> DeviceConfig {
        DeviceConfig::new(self.name.clone())
            .with_thread_sleep_time(Duration::from_millis(self.thread_sleep_time_ms))
            .with_seek_threshold(self.seek_threshold)
            .with_max_scheduled(self.max_scheduled)
    }

    fn local_config(&self) -> LocalFileConfig {
        LocalFileConfig::new(self.root.clone())
            .with_max_open_files(self.max_open_files)
            .with_writable(self.writable)
    }
}

/// One stage of a stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageConfig {
    ReadSplitter(ReadSplitterConfig),
    StorageDevice(StorageDeviceConfig),
    NetworkDevice(NetworkDeviceConfig),
}

impl StageConfig {
    fn is_device(&self) -> bool {
        !matches!(self, StageConfig::ReadSplitter(_))
    }

    fn name(&self) -> &str {
        match self {
            StageConfig::ReadSplitter(c) => &c.name,
            StageConfig::StorageDevice(c) => &c.name,
            StageConfig::NetworkDevice(c) => &c.name,
        }
    }
}

/// Whole-stack configuration, head first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    pub stages: Vec<StageConfig>,
}

impl StackConfig {
    /// Splitter in front of a read-only local device rooted at `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            stages: vec![
                StageConfig::ReadSplitter(ReadSplitterConfig::default()),
                StageConfig::StorageDevice(StorageDeviceConfig {
                    root: root.into(),
                    ..Default::default()
                }),
            ],
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let Some(last) = self.stages.last() else {
            return Err(Error::Config("stack must have at least one stage".into()));
        };
        if !last.is_device() {
            return Err(Error::Config(format!(
                "last stage '{}' must be a device",
                last.name()
            )));
        }
        let devices = self.stages.iter().filter(|s| s.is_device()).count();
        if devices != 1 {
            return Err(Error::Config(format!(
                "stack must contain exactly one device, found {}",
                devices
            )));
        }
        for stage in &self.stages {
            if stage.name().is_empty() {
                return Err(Error::Config("stage name must not be empty".into()));
            }
            match stage {
                StageConfig::ReadSplitter(c) if c.max_read_size == 0 => {
                    return Err(Error::Config(format!(
                        "{}: max_read_size must be > 0",
                        c.name
                    )));
                }
                StageConfig::StorageDevice(c) => {
                    c.device_config().validate()?;
                    c.local_config().validate()?;
                }
                StageConfig::NetworkDevice(c) => c.validate()?,
                StageConfig::ReadSplitter(_) => {}
            }
        }
        Ok(())
    }

    /// Mount the device and wrap it in each stage, tail first.
    pub fn build(&self) -> Result<Box<dyn StreamStackEntry>> {
        self.validate()?;

        let mut stages = self.stages.iter().rev();
        let mut head: Box<dyn StreamStackEntry> = match stages.next() {
            Some(StageConfig::StorageDevice(c)) => {
                let transport = LocalFileTransport::new(c.local_config())?;
                Box::new(Device::mount(c.device_config(), transport)?)
            }
            Some(StageConfig::NetworkDevice(c)) => Box::new(NetworkDevice::mount(c.clone())?),
            _ => return Err(Error::Config("last stage must be a device".into())),
        };

        for stage in stages {
            head = match stage {
                StageConfig::ReadSplitter(c) => {
                    Box::new(ReadSplitter::new(c.max_read_size, head)?.with_name(c.name.clone()))
                }
                _ => return Err(Error::Config("only the last stage may be a device".into())),
            };
        }

        info!(stages = self.stages.len(), head = head.name(), "Stream stack assembled");
        Ok(head)
    }
}
