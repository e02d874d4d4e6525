//! Byte-stream connections and incremental frame reading.
//!
//! # Overview
//!
//! A [`Connection`] is a bidirectional byte stream that can be shared between
//! the thread writing requests and the thread reading responses; every method
//! takes `&self`. [`TcpConnection`] is the only production implementation and
//! [`TcpConnector`] creates them.
//!
//! [`FrameReader`] sits on the read half. TCP hands out bytes in whatever pieces
//! it likes, so the reader keeps a `BytesMut` accumulation buffer and asks its
//! codec for a frame after every read. Server-side readers start without a codec
//! and pick one by asking the [`ProtocolRegistry`] to detect the first bytes.
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{Buf, BytesMut};
use log::{debug, trace};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    message::Message,
    naming::Endpoint,
    protocol::{Decoded, Detection, FrameError, MAX_BODY_LEN, Protocol, ProtocolRegistry},
};

const READ_CHUNK: usize = 8 * 1024;
/// Slack on top of the body limit for the largest built-in header.
const HEADER_ALLOWANCE: usize = 64;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("connection closed mid-frame with {buffered} bytes buffered")]
    UnexpectedEof { buffered: usize },
}

pub trait Connection: Send + Sync {
    fn write_all(&self, buf: &[u8]) -> io::Result<()>;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn close(&self);

    /// Not yet closed locally.
    fn is_open(&self) -> bool;

    /// No read or write has failed and the peer has not hung up.
    fn is_active(&self) -> bool;

    fn peer(&self) -> SocketAddr;
}

pub trait Connector: Send + Sync {
    type Conn: Connection;

    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> io::Result<Self::Conn>;
}

#[derive(Debug)]
pub struct TcpConnection {
    reader: TcpStream,
    writer: Mutex<TcpStream>,
    peer: SocketAddr,
    open: AtomicBool,
    active: AtomicBool,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: stream,
            writer: Mutex::new(writer),
            peer,
            open: AtomicBool::new(true),
            active: AtomicBool::new(true),
        })
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Connection for TcpConnection {
    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        let res = writer.write_all(buf).and_then(|_| writer.flush());
        if res.is_err() {
            self.deactivate();
        }
        res
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let res = (&self.reader).read(buf);
        match res {
            Ok(0) => self.deactivate(),
            Err(ref e) if e.kind() != io::ErrorKind::Interrupted => self.deactivate(),
            _ => {}
        }
        res
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("closing connection to {}", self.peer);
            self.deactivate();
            let _ = self.reader.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    fn connect(&self, endpoint: &Endpoint, timeout: Duration) -> io::Result<TcpConnection> {
        let mut last_err = None;
        for addr in (endpoint.host.as_str(), endpoint.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return TcpConnection::new(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{endpoint} resolved to no addresses"),
            )
        }))
    }
}

/// [`Read`] over a shared connection.
pub struct ConnectionReader<C: Connection>(pub Arc<C>);

impl<C: Connection> Read for ConnectionReader<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

pub struct FrameReader<R: Read> {
    source: R,
    buf: BytesMut,
    codec: Option<Arc<dyn Protocol>>,
    registry: Option<Arc<ProtocolRegistry>>,
    max_frame: usize,
}

impl<R: Read> FrameReader<R> {
    /// Reader bound to a single codec.
    pub fn new(source: R, codec: Arc<dyn Protocol>) -> Self {
        Self {
            source,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec: Some(codec),
            registry: None,
            max_frame: MAX_BODY_LEN,
        }
    }

    /// Reader that detects its codec from the first bytes of the stream.
    pub fn detecting(source: R, registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            source,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec: None,
            registry: Some(registry),
            max_frame: MAX_BODY_LEN,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn protocol(&self) -> Option<&Arc<dyn Protocol>> {
        self.codec.as_ref()
    }

    /// Next message on the stream; `Ok(None)` on a clean end of stream.
    pub fn next_message(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            if let Some(message) = self.try_decode()? {
                return Ok(Some(message));
            }

            if self.buf.len() > self.max_frame + HEADER_ALLOWANCE {
                return Err(FrameError::TooLarge {
                    protocol: self.codec.as_ref().map_or("unknown", |c| c.name()),
                    len: self.buf.len(),
                    max: self.max_frame,
                }
                .into());
            }

            if self.fill()? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::UnexpectedEof {
                    buffered: self.buf.len(),
                });
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            let codec = match self.codec.clone() {
                Some(codec) => codec,
                None => match self.detect()? {
                    Some(codec) => codec,
                    None => return Ok(None),
                },
            };

            match codec.decode(&self.buf)? {
                Decoded::Frame { message, consumed } => {
                    trace!("[{}] decoded {consumed} byte frame", codec.name());
                    self.buf.advance(consumed);
                    return Ok(Some(message));
                }
                Decoded::Skipped { consumed } => {
                    trace!("[{}] skipped {consumed} byte frame", codec.name());
                    self.buf.advance(consumed);
                }
                Decoded::Insufficient => return Ok(None),
            }
        }
    }

    fn detect(&mut self) -> Result<Option<Arc<dyn Protocol>>, FrameError> {
        let Some(registry) = &self.registry else {
            return Err(FrameError::Unrecognized);
        };
        match registry.detect(&self.buf) {
            Detection::Match(codec) => {
                debug!("detected protocol {} ({})", codec.id(), codec.name());
                self.codec = Some(Arc::clone(&codec));
                Ok(Some(codec))
            }
            Detection::NeedMore => Ok(None),
            Detection::NoMatch => Err(FrameError::Unrecognized),
        }
    }

    fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.source.read(&mut chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
