//! Local file transport
//!
//! Serves files below a root directory. Open handles are kept in a small
//! least-recently-used set so repeated requests against the same file do not
//! reopen it, while the number of descriptors held stays bounded.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Transport, TransportError, TransportResult};
use crate::error::{Error, Result};
use crate::request::FileId;

/// Default number of file handles kept open
pub const DEFAULT_MAX_OPEN_FILES: usize = 32;

/// Local file transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalFileConfig {
    /// Directory that file ids are resolved against
    pub root: PathBuf,

    /// Maximum number of simultaneously open handles
    pub max_open_files: usize,

    /// Allow write requests (files are created on first write)
    pub writable: bool,
}

impl Default for LocalFileConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            max_open_files: DEFAULT_MAX_OPEN_FILES,
            writable: false,
        }
    }
}

impl LocalFileConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files;
        self
    }

    pub fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_open_files == 0 {
            return Err(Error::Config("max_open_files must be > 0".into()));
        }
        if !self.root.is_dir() {
            return Err(Error::Config(format!(
                "root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }
}

struct OpenFile {
    id: FileId,
    file: File,
}

/// Transport over a local directory tree.
pub struct LocalFileTransport {
    config: LocalFileConfig,
    /// Most recently used last
    open: Vec<OpenFile>,
}

impl LocalFileTransport {
    pub fn new(config: LocalFileConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            open: Vec::with_capacity(config.max_open_files),
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    /// Number of file handles currently held.
    pub fn open_files(&self) -> usize {
        self.open.len()
    }

    fn resolve(&self, file: &FileId) -> TransportResult<PathBuf> {
        let relative = Path::new(file.as_str());
        let mut path = self.config.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(TransportError::InvalidPath(file.to_string())),
            }
        }
        if path == self.config.root {
            return Err(TransportError::InvalidPath(file.to_string()));
        }
        Ok(path)
    }

    fn handle(&mut self, file: &FileId, create: bool) -> TransportResult<&mut File> {
        if let Some(pos) = self.open.iter().position(|open| &open.id == file) {
            let entry = self.open.remove(pos);
            self.open.push(entry);
        } else {
            let path = self.resolve(file)?;
            let opened = OpenOptions::new()
                .read(true)
                .write(self.config.writable)
                .create(create && self.config.writable)
                .open(&path)
                .map_err(|e| match e.kind() {
                    ErrorKind::NotFound => TransportError::NotFound(file.to_string()),
                    _ => TransportError::Io(e),
                })?;

            if self.open.len() >= self.config.max_open_files {
                let evicted = self.open.remove(0);
                trace!(file = %evicted.id, "Closing least recently used file");
            }
            debug!(file = %file, path = %path.display(), "Opened file");
            self.open.push(OpenFile {
                id: file.clone(),
                file: opened,
            });
        }

        match self.open.last_mut() {
            Some(entry) => Ok(&mut entry.file),
            None => Err(TransportError::Backend("open file set is empty".into())),
        }
    }
}

impl Transport for LocalFileTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn read(&mut self, file: &FileId, offset: u64, buf: &mut [u8]) -> TransportResult<usize> {
        let handle = self.handle(file, false)?;
        handle.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            match handle.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    fn write(&mut self, file: &FileId, offset: u64, data: &[u8]) -> TransportResult<usize> {
        if !self.config.writable {
            return Err(TransportError::ReadOnly);
        }
        let handle = self.handle(file, true)?;
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(data)?;
        Ok(data.len())
    }

    fn file_size(&mut self, file: &FileId) -> TransportResult<u64> {
        let handle = self.handle(file, false)?;
        Ok(handle.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(dir: &tempfile::TempDir) -> LocalFileTransport {
        LocalFileTransport::new(
            LocalFileConfig::new(dir.path())
                .with_max_open_files(2)
                .with_writable(true),
        )
        .expect("transport")
    }

    #[test]
    fn test_config_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(LocalFileConfig::new(dir.path()).validate().is_ok());
        assert!(LocalFileConfig::new(dir.path())
            .with_max_open_files(0)
            .validate()
            .is_err());
        assert!(LocalFileConfig::new(dir.path().join("missing"))
            .validate()
            .is_err());
    }

    #[test]
    fn test_read_short_at_eof() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("data.bin"), b"hello world").expect("write");
        let mut transport = transport(&dir);

        let mut buf = [0u8; 8];
        let n = transport
            .read(&FileId::from("data.bin"), 6, &mut buf)
            .expect("read");
        assert_eq!(n, 5);
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut transport = transport(&dir);
        let file = FileId::from("nested.bin");

        transport.write(&file, 4, b"abcd").expect("write");
        assert_eq!(transport.file_size(&file).expect("size"), 8);

        let mut buf = [0xffu8; 8];
        assert_eq!(transport.read(&file, 0, &mut buf).expect("read"), 8);
        assert_eq!(&buf, b"\0\0\0\0abcd");
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut transport = transport(&dir);
        let mut buf = [0u8; 1];
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", "."] {
            assert!(matches!(
                transport.read(&FileId::from(bad), 0, &mut buf),
                Err(TransportError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut transport = transport(&dir);
        let mut buf = [0u8; 1];
        assert!(matches!(
            transport.read(&FileId::from("nope.bin"), 0, &mut buf),
            Err(TransportError::NotFound(_))
        ));
    }

    #[test]
    fn test_open_handles_are_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), name).expect("write");
        }
        let mut transport = transport(&dir);
        let mut buf = [0u8; 1];
        for name in ["a", "b", "c", "a"] {
            transport
                .read(&FileId::from(name), 0, &mut buf)
                .expect("read");
            assert_eq!(buf[0], name.as_bytes()[0]);
        }
        assert_eq!(transport.open_files(), 2);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut transport =
            LocalFileTransport::new(LocalFileConfig::new(dir.path())).expect("transport");
        assert!(matches!(
            transport.write(&FileId::from("x"), 0, b"x"),
            Err(TransportError::ReadOnly)
        ));
    }
}
