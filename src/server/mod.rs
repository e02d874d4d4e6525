//! The serving side.
//!
//! # Overview
//!
//! [`RpcServer`] binds a listener and spawns one I/O thread per accepted
//! connection. That thread detects the wire protocol from the first bytes the
//! client sends, then keeps decoding frames with that codec only. Every request
//! is handed to the worker [`ThreadPool`], which runs the interceptor chain and
//! the handler and writes the response back on the same connection. Responses
//! carry the request's correlation id and may leave in any order.
//!
//! Connections that speak the push protocol can also receive server-initiated
//! messages through [`ServerHandle::push`]; the protocol of a connection is
//! known once its first request arrived.
//!
//! # Key Components
//!
//! - [`ServiceRegistry`]: handlers by service and method.
//! - [`ServerHandle`]: address, push, shutdown.
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::{
    config::ServerConfig,
    error::RpcError,
    interceptor::{Interceptor, InterceptorChain},
    message::{Message, Push, Request, Response},
    naming::{Endpoint, FailbackNamingService, NamingService},
    protocol::{self, Protocol, ProtocolRegistry},
    runtime::Runtime,
    transport::{Connection, ConnectionReader, FrameReader, TcpConnection},
};

mod service;
mod workers;

pub use service::{Handler, RemoteError, ServiceRegistry};
pub use workers::ThreadPool;

pub struct RpcServer;

impl RpcServer {
    pub fn builder(addr: impl Into<String>) -> RpcServerBuilder {
        RpcServerBuilder {
            addr: addr.into(),
            config: ServerConfig::default(),
            services: ServiceRegistry::new(),
            interceptors: InterceptorChain::new(),
            advertise: None,
        }
    }
}

pub struct RpcServerBuilder {
    addr: String,
    config: ServerConfig,
    services: ServiceRegistry,
    interceptors: InterceptorChain,
    advertise: Option<String>,
}

impl RpcServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    pub fn register<H>(mut self, service: &str, method: &str, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        self.services.register(service, method, handler);
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Registers every service with the naming backend at `url` once started,
    /// and unregisters on shutdown.
    pub fn advertise(mut self, url: impl Into<String>) -> Self {
        self.advertise = Some(url.into());
        self
    }

    pub fn start(self, runtime: &Runtime) -> Result<ServerHandle, RpcError> {
        let listener = TcpListener::bind(&self.addr)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            services: self.services,
            interceptors: self.interceptors,
            protocols: runtime.protocols(),
            max_frame: self.config.max_frame,
            workers: ThreadPool::new(self.config.workers)?,
            connections: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });

        info!(
            "listening at {local_addr} with {} workers",
            shared.workers.size()
        );
        let acceptor = Arc::clone(&shared);
        let accept = thread::Builder::new()
            .name("relay-accept".into())
            .spawn(move || accept_loop(acceptor, listener))?;

        let mut handle = ServerHandle {
            shared,
            local_addr,
            accept: Mutex::new(Some(accept)),
            advertised: None,
        };
        if let Some(url) = self.advertise {
            handle.advertise(runtime, &url)?;
        }
        Ok(handle)
    }
}

/// Per-connection bookkeeping visible to [`ServerHandle::push`].
struct ConnState {
    conn: Arc<TcpConnection>,
    protocol: Mutex<Option<Arc<dyn Protocol>>>,
}

struct ServerShared {
    services: ServiceRegistry,
    interceptors: InterceptorChain,
    protocols: Arc<ProtocolRegistry>,
    max_frame: usize,
    workers: ThreadPool,
    connections: Mutex<HashMap<u64, Arc<ConnState>>>,
    next_conn: AtomicU64,
    running: AtomicBool,
}

fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener) {
    for stream in listener.incoming() {
        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        match stream {
            Ok(stream) => {
                let id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
                let serving = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name(format!("relay-conn-{id}"))
                    .spawn(move || serve(serving, id, stream));
                if let Err(e) = spawned {
                    warn!("could not spawn connection thread: {e}");
                }
            }
            Err(e) => warn!("broken connection: {e:?}"),
        }
    }
    debug!("accept loop exiting");
}

fn serve(shared: Arc<ServerShared>, id: u64, stream: TcpStream) {
    let conn = match TcpConnection::new(stream) {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            warn!("broken connection: {e}");
            return;
        }
    };
    let peer = conn.peer();
    let state = Arc::new(ConnState {
        conn: Arc::clone(&conn),
        protocol: Mutex::new(None),
    });
    shared.connections.lock().insert(id, Arc::clone(&state));
    debug!("accepted connection {id} from {peer}");

    let mut frames = FrameReader::detecting(
        ConnectionReader(Arc::clone(&conn)),
        Arc::clone(&shared.protocols),
    )
    .with_max_frame(shared.max_frame);

    loop {
        match frames.next_message() {
            Ok(Some(Message::Request(request))) => {
                let Some(codec) = frames.protocol().cloned() else {
                    continue;
                };
                state.protocol.lock().get_or_insert_with(|| Arc::clone(&codec));

                let worker_shared = Arc::clone(&shared);
                let worker_conn = Arc::clone(&conn);
                let queued = shared.workers.execute(move || {
                    respond(&worker_shared, &worker_conn, &codec, request)
                });
                if !queued {
                    break;
                }
            }
            Ok(Some(other)) => {
                debug!("{peer}: ignoring non-request frame {}", other.log_id());
            }
            Ok(None) => break,
            Err(e) => {
                if shared.running.load(Ordering::Acquire) {
                    warn!("broken connection from {peer}: {e}");
                }
                break;
            }
        }
    }

    conn.close();
    shared.connections.lock().remove(&id);
    debug!("connection {id} from {peer} closed");
}

fn respond(
    shared: &ServerShared,
    conn: &TcpConnection,
    codec: &Arc<dyn Protocol>,
    request: Request,
) {
    let log_id = request.log_id;
    trace!(
        "request {log_id} for {}.{} via {}",
        request.service,
        request.method,
        codec.name()
    );

    let result = shared
        .interceptors
        .execute(request, |request| shared.services.invoke(&request));
    let mut response = match result {
        Ok(response) => response,
        Err(RpcError::Remote { status, message }) => {
            Response::error(log_id, status, message)
        }
        Err(e) => Response::error(log_id, e.status(), e.to_string()),
    };
    response.log_id = log_id;
    response.protocol = codec.id();

    let frame = match codec.encode_response(&response) {
        Ok(frame) => frame,
        Err(e) => {
            let err = RpcError::encoding(e);
            warn!("encoding response {log_id} failed: {err}");
            let fallback = Response::error(log_id, err.status(), err.to_string());
            match codec.encode_response(&fallback) {
                Ok(frame) => frame,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = conn.write_all(&frame) {
        debug!("writing response {log_id} to {} failed: {e}", conn.peer());
    }
}

/// Prefer an address peers can dial over the wildcard we bound to.
fn reachable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port())
        }
        _ => addr,
    }
}

/// A running server. Dropping it shuts the server down.
pub struct ServerHandle {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    accept: Mutex<Option<JoinHandle<()>>>,
    advertised: Option<(Arc<FailbackNamingService>, Endpoint)>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn advertise(&mut self, runtime: &Runtime, url: &str) -> Result<(), RpcError> {
        let naming = runtime.naming().connect(url, &runtime.timer()?)?;
        let addr = reachable(self.local_addr);
        let endpoint = Endpoint::new(addr.ip().to_string(), addr.port());
        for service in self.shared.services.services() {
            naming.register(service, &endpoint)?;
        }
        info!("advertised {endpoint} at {url}");
        self.advertised = Some((naming, endpoint));
        Ok(())
    }

    /// Open client connections.
    pub fn connections(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Sends a one-way message to every client connected with the push
    /// protocol; returns how many received it.
    pub fn push(
        &self,
        service: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<usize, RpcError> {
        let push = Push::new(service, method, payload);
        let targets: Vec<(Arc<TcpConnection>, Arc<dyn Protocol>)> = self
            .shared
            .connections
            .lock()
            .values()
            .filter_map(|state| {
                let codec = state.protocol.lock().clone()?;
                (codec.id() == protocol::PUSH).then(|| (Arc::clone(&state.conn), codec))
            })
            .collect();
        let Some((_, codec)) = targets.first() else {
            return Ok(0);
        };
        let frame = codec.encode_push(&push).map_err(RpcError::encoding)?;

        let mut delivered = 0;
        for (conn, _) in &targets {
            match conn.write_all(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("push to {} failed: {e}", conn.peer()),
            }
        }
        trace!("pushed {service}.{method} to {delivered} connections");
        Ok(delivered)
    }

    /// Stops accepting, closes every connection and withdraws advertised services.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("shutting down server at {}", self.local_addr);

        if let Some((naming, endpoint)) = &self.advertised {
            for service in self.shared.services.services() {
                if let Err(e) = naming.unregister(service, endpoint) {
                    warn!("unregistering {service} failed: {e}");
                }
            }
        }

        // wake the accept loop so it sees the flag
        let _ = TcpStream::connect(reachable(self.local_addr));
        if let Some(accept) = self.accept.lock().take() {
            if accept.join().is_err() {
                warn!("accept thread panicked");
            }
        }

        let connections: Vec<_> = self
            .shared
            .connections
            .lock()
            .values()
            .cloned()
            .collect();
        for state in connections {
            state.conn.close();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
