use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
    thread,
};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::PushHandlers;
use crate::{
    error::RpcError,
    message::{Message, Response},
    naming::Endpoint,
    protocol::Protocol,
    store::FutureStore,
    transport::{Connection, ConnectionReader, FrameReader, TcpConnection, TransportError},
};

/// A pooled client connection and the reader thread that completes its calls.
///
/// The pool hands a connection to one caller at a time and the lease lives in
/// the pending call, so at most one call is in flight per channel. When the
/// connection breaks, that call fails with a connection error.
pub struct Channel {
    conn: Arc<TcpConnection>,
    endpoint: String,
    inflight: Arc<Mutex<Option<u64>>>,
}

impl Channel {
    pub(crate) fn open(
        conn: TcpConnection,
        endpoint: &Endpoint,
        codec: Arc<dyn Protocol>,
        store: Weak<FutureStore>,
        pushes: Arc<PushHandlers>,
    ) -> io::Result<Self> {
        let conn = Arc::new(conn);
        let inflight = Arc::new(Mutex::new(None));
        let endpoint = endpoint.to_string();

        let reader = Reader {
            conn: Arc::clone(&conn),
            endpoint: endpoint.clone(),
            inflight: Arc::clone(&inflight),
            store,
            pushes,
        };
        thread::Builder::new()
            .name(format!("relay-io-{endpoint}"))
            .spawn(move || reader.run(codec))?;

        debug!("opened channel to {endpoint}");
        Ok(Self {
            conn,
            endpoint,
            inflight,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn begin(&self, log_id: u64) {
        *self.inflight.lock() = Some(log_id);
    }

    pub(crate) fn end(&self, log_id: u64) {
        let mut inflight = self.inflight.lock();
        if *inflight == Some(log_id) {
            *inflight = None;
        }
    }
}

impl Connection for Channel {
    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.conn.write_all(buf)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.read(buf)
    }

    fn close(&self) {
        self.conn.close();
    }

    fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    fn is_active(&self) -> bool {
        self.conn.is_active()
    }

    fn peer(&self) -> SocketAddr {
        self.conn.peer()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // unblocks the reader thread
        self.conn.close();
    }
}

struct Reader {
    conn: Arc<TcpConnection>,
    endpoint: String,
    inflight: Arc<Mutex<Option<u64>>>,
    store: Weak<FutureStore>,
    pushes: Arc<PushHandlers>,
}

impl Reader {
    fn run(self, codec: Arc<dyn Protocol>) {
        let mut frames = FrameReader::new(ConnectionReader(Arc::clone(&self.conn)), codec);
        let reason = loop {
            match frames.next_message() {
                Ok(Some(Message::Response(response))) => self.complete(response),
                Ok(Some(Message::Push(push))) => self.pushes.dispatch(push),
                Ok(Some(Message::Request(request))) => {
                    warn!(
                        "{}: ignoring request {} sent by the server",
                        self.endpoint, request.log_id
                    );
                }
                Ok(None) => break "closed by peer".to_string(),
                Err(TransportError::Io(e)) if !self.conn.is_open() => {
                    trace!("{}: reader stopped after close: {e}", self.endpoint);
                    break "connection closed".to_string();
                }
                Err(e) => {
                    warn!("broken connection to {}: {e}", self.endpoint);
                    break e.to_string();
                }
            }
        };

        self.conn.close();
        let orphan = self.inflight.lock().take();
        if let Some(id) = orphan {
            if let Some(call) = self.store.upgrade().and_then(|store| store.take(id)) {
                call.fail(RpcError::connection(&self.endpoint, reason));
            }
        }
        debug!("reader for {} exiting", self.endpoint);
    }

    fn complete(&self, response: Response) {
        let id = response.log_id;
        {
            let mut inflight = self.inflight.lock();
            if *inflight == Some(id) {
                *inflight = None;
            }
        }
        match self.store.upgrade().and_then(|store| store.take(id)) {
            Some(call) => {
                trace!("{}: response for call {id}", self.endpoint);
                call.complete(response);
            }
            None => debug!("{}: dropping response for unknown call {id}", self.endpoint),
        }
    }
}
