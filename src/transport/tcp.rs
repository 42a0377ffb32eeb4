//! TCP file transport
//!
//! A minimal length-prefixed protocol between a [`TcpTransport`] client,
//! driven synchronously from a device thread, and a [`FileServer`] running
//! on the tokio runtime in front of any other transport.
//!
//! # Wire format (big-endian)
//!
//! ```text
//! request:  op:u8 | path_len:u16 | path | offset:u64 | length:u32 | [payload]
//! response: status:u8 | value:u64 | payload_len:u32 | payload
//! ```
//!
//! `op` is 1 = read, 2 = write (payload of `length` bytes follows), 3 = size.
//! On success `value` is the bytes transferred (or the file size) and a read
//! carries its data as payload. On failure the payload is a UTF-8 message.

use std::future::Future;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument, warn};

use super::{Transport, TransportError, TransportResult};
use crate::error::{Error, Result};
use crate::request::FileId;

const OP_READ: u8 = 1;
const OP_WRITE: u8 = 2;
const OP_SIZE: u8 = 3;

const STATUS_OK: u8 = 0;
const STATUS_NOT_FOUND: u8 = 1;
const STATUS_INVALID_PATH: u8 = 2;
const STATUS_READ_ONLY: u8 = 3;
const STATUS_ERROR: u8 = 4;

const RESPONSE_HEADER_LEN: usize = 1 + 8 + 4;

/// Largest payload accepted in either direction
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

// =============================================================================
// Client
// =============================================================================

/// TCP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpTransportConfig {
    /// Server address (`host:port`)
    pub address: String,

    /// Connect timeout
    pub connect_timeout: Duration,

    /// Per-operation read/write timeout
    pub io_timeout: Duration,

    /// Largest payload carried by one frame. Longer reads and writes are
    /// sent as consecutive frames.
    pub max_frame_payload: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7450".to_string(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            max_frame_payload: MAX_FRAME_PAYLOAD,
        }
    }
}

impl TcpTransportConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::Config("address must not be empty".into()));
        }
        if self.connect_timeout.is_zero() || self.io_timeout.is_zero() {
            return Err(Error::Config("timeouts must be > 0".into()));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_FRAME_PAYLOAD {
            return Err(Error::Config(format!(
                "max_frame_payload must be in 1..={}",
                MAX_FRAME_PAYLOAD
            )));
        }
        Ok(())
    }
}

/// Client side of the file protocol.
///
/// Connects lazily on first use. Any transport failure drops the connection;
/// the next operation reconnects. Failed operations are not retried.
pub struct TcpTransport {
    config: TcpTransportConfig,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stream: None,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn connect(&self) -> TransportResult<TcpStream> {
        let addrs = self
            .config
            .address
            .to_socket_addrs()
            .map_err(|e| TransportError::ConnectionLost(format!("{}: {}", self.config.address, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.config.io_timeout))?;
                    stream.set_write_timeout(Some(self.config.io_timeout))?;
                    stream.set_nodelay(true)?;
                    debug!(address = %addr, "Connected to file server");
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(TransportError::ConnectionLost(match last_error {
            Some(e) => format!("{}: {}", self.config.address, e),
            None => format!("{}: no addresses resolved", self.config.address),
        }))
    }

    /// Send one request and wait for its response.
    fn call(
        &mut self,
        op: u8,
        file: &FileId,
        offset: u64,
        length: usize,
        payload: &[u8],
    ) -> TransportResult<(u64, Bytes)> {
        let frame = encode_request(op, file, offset, length, payload)?;

        if self.stream.is_none() {
            self.stream = Some(self.connect()?);
        }
        let result = match self.stream.as_mut() {
            Some(stream) => exchange(stream, &frame),
            None => Err(TransportError::ConnectionLost("not connected".into())),
        };

        if let Err(e) = &result {
            if matches!(
                e,
                TransportError::ConnectionLost(_) | TransportError::Io(_) | TransportError::Protocol(_)
            ) {
                warn!(address = %self.config.address, error = %e, "Dropping file server connection");
                self.stream = None;
            }
        }
        result
    }

    /// One read frame into `buf`, which fits the frame limit.
    fn read_frame(&mut self, file: &FileId, offset: u64, buf: &mut [u8]) -> TransportResult<usize> {
        let (value, data) = self.call(OP_READ, file, offset, buf.len(), &[])?;
        if data.len() > buf.len() || value as usize != data.len() {
            self.stream = None;
            return Err(TransportError::Protocol(format!(
                "read of {} bytes answered with {} (value {})",
                buf.len(),
                data.len(),
                value
            )));
        }
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

fn encode_request(
    op: u8,
    file: &FileId,
    offset: u64,
    length: usize,
    payload: &[u8],
) -> TransportResult<BytesMut> {
    let path = file.as_str().as_bytes();
    let path_len = u16::try_from(path.len())
        .map_err(|_| TransportError::InvalidPath(file.to_string()))?;
    if length > MAX_FRAME_PAYLOAD {
        return Err(TransportError::Protocol(format!(
            "length {} exceeds frame limit {}",
            length, MAX_FRAME_PAYLOAD
        )));
    }

    let mut frame = BytesMut::with_capacity(1 + 2 + path.len() + 8 + 4 + payload.len());
    frame.put_u8(op);
    frame.put_u16(path_len);
    frame.put_slice(path);
    frame.put_u64(offset);
    frame.put_u32(length as u32);
    frame.put_slice(payload);
    Ok(frame)
}

fn exchange(stream: &mut TcpStream, frame: &[u8]) -> TransportResult<(u64, Bytes)> {
    stream.write_all(frame).map_err(connection_error)?;

    let mut header = [0u8; RESPONSE_HEADER_LEN];
    stream.read_exact(&mut header).map_err(connection_error)?;
    let mut header = &header[..];
    let status = header.get_u8();
    let value = header.get_u64();
    let payload_len = header.get_u32() as usize;
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(TransportError::Protocol(format!(
            "response payload {} exceeds frame limit",
            payload_len
        )));
    }

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).map_err(connection_error)?;

    if status == STATUS_OK {
        return Ok((value, Bytes::from(payload)));
    }
    let message = String::from_utf8_lossy(&payload).into_owned();
    Err(match status {
        STATUS_NOT_FOUND => TransportError::NotFound(message),
        STATUS_INVALID_PATH => TransportError::InvalidPath(message),
        STATUS_READ_ONLY => TransportError::ReadOnly,
        STATUS_ERROR => TransportError::Backend(message),
        other => TransportError::Protocol(format!("unknown status {}", other)),
    })
}

fn connection_error(e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::TimedOut
        | ErrorKind::WouldBlock => TransportError::ConnectionLost(e.to_string()),
        _ => TransportError::Io(e),
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &str {
        "tcp"
    }

    fn read(&mut self, file: &FileId, offset: u64, buf: &mut [u8]) -> TransportResult<usize> {
        let max = self.config.max_frame_payload;
        let mut total = 0;
        for chunk in buf.chunks_mut(max) {
            let wanted = chunk.len();
            let n = self.read_frame(file, offset.saturating_add(total as u64), chunk)?;
            total += n;
            // Short frame: end of file
            if n < wanted {
                break;
            }
        }
        Ok(total)
    }

    fn write(&mut self, file: &FileId, offset: u64, data: &[u8]) -> TransportResult<usize> {
        if data.is_empty() {
            let (value, _) = self.call(OP_WRITE, file, offset, 0, data)?;
            return Ok(value as usize);
        }

        let max = self.config.max_frame_payload;
        let mut total = 0;
        for chunk in data.chunks(max) {
            let (value, _) = self.call(
                OP_WRITE,
                file,
                offset.saturating_add(total as u64),
                chunk.len(),
                chunk,
            )?;
            let n = value as usize;
            total += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(total)
    }

    fn file_size(&mut self, file: &FileId) -> TransportResult<u64> {
        let (value, _) = self.call(OP_SIZE, file, 0, 0, &[])?;
        Ok(value)
    }
}

// =============================================================================
// Server
// =============================================================================

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

/// Serves another transport over TCP.
///
/// Each connection is handled on its own task; transport calls run on the
/// blocking pool and are serialized through one lock.
pub struct FileServer {
    listener: TcpListener,
    transport: SharedTransport,
}

impl FileServer {
    /// Bind the listening socket.
    pub async fn bind(addr: impl tokio::net::ToSocketAddrs, transport: impl Transport) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let transport: Box<dyn Transport> = Box::new(transport);
        Ok(Self {
            listener,
            transport: Arc::new(Mutex::new(transport)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(futures::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    #[instrument(skip_all, fields(addr = ?self.listener.local_addr().ok()))]
    pub async fn serve_with_shutdown(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("File server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("File server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted?;
                    let transport = Arc::clone(&self.transport);
                    tokio::spawn(async move {
                        debug!(%peer, "Client connected");
                        match handle_connection(socket, transport).await {
                            Ok(()) => debug!(%peer, "Client disconnected"),
                            Err(e) => warn!(%peer, error = %e, "Client connection failed"),
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    mut socket: tokio::net::TcpStream,
    transport: SharedTransport,
) -> Result<()> {
    socket.set_nodelay(true)?;
    loop {
        let op = match socket.read_u8().await {
            Ok(op) => op,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let path_len = socket.read_u16().await? as usize;
        let mut path = vec![0u8; path_len];
        socket.read_exact(&mut path).await?;
        let offset = socket.read_u64().await?;
        let length = socket.read_u32().await? as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(Error::Transport(TransportError::Protocol(format!(
                "request length {} exceeds frame limit",
                length
            ))));
        }

        let payload = if op == OP_WRITE {
            let mut payload = vec![0u8; length];
            socket.read_exact(&mut payload).await?;
            payload
        } else {
            Vec::new()
        };

        let file = FileId::from(String::from_utf8_lossy(&path).into_owned());
        let transport = Arc::clone(&transport);
        let outcome = tokio::task::spawn_blocking(move || {
            execute(&mut **transport.lock(), op, &file, offset, length, &payload)
        })
        .await
        .map_err(|e| Error::Internal(format!("file server task failed: {}", e)))?;

        socket.write_all(&encode_response(outcome)).await?;
    }
}

fn execute(
    transport: &mut dyn Transport,
    op: u8,
    file: &FileId,
    offset: u64,
    length: usize,
    payload: &[u8],
) -> TransportResult<(u64, Bytes)> {
    match op {
        OP_READ => {
            let mut buf = vec![0u8; length];
            let n = transport.read(file, offset, &mut buf)?;
            buf.truncate(n);
            Ok((n as u64, Bytes::from(buf)))
        }
        OP_WRITE => {
            let n = transport.write(file, offset, payload)?;
            Ok((n as u64, Bytes::new()))
        }
        OP_SIZE => Ok((transport.file_size(file)?, Bytes::new())),
        other => Err(TransportError::Protocol(format!("unknown op {}", other))),
    }
}

fn encode_response(outcome: TransportResult<(u64, Bytes)>) -> BytesMut {
    let (status, value, payload) = match outcome {
        Ok((value, payload)) => (STATUS_OK, value, payload),
        Err(e) => {
            let status = match &e {
                TransportError::NotFound(_) => STATUS_NOT_FOUND,
                TransportError::InvalidPath(_) => STATUS_INVALID_PATH,
                TransportError::ReadOnly => STATUS_READ_ONLY,
                _ => STATUS_ERROR,
            };
            let message = match e {
                TransportError::NotFound(m) | TransportError::InvalidPath(m) => m,
                other => other.to_string(),
            };
            (status, 0, Bytes::from(message))
        }
    };

    let mut frame = BytesMut::with_capacity(RESPONSE_HEADER_LEN + payload.len());
    frame.put_u8(status);
    frame.put_u64(value);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    frame
}
