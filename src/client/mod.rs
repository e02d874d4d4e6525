//! The calling side.
//!
//! # Overview
//!
//! [`RpcClient`] turns a [`MethodDescriptor`] and a payload into a request,
//! runs it through the interceptor chain, picks a healthy endpoint with the
//! configured load balancer, borrows a pooled [`Channel`] to it and writes the
//! encoded frame. The call then waits in the [`FutureStore`] until the channel's
//! reader thread completes it, the timer expires it, or the caller cancels it.
//!
//! A call moves through these steps:
//!
//! 1. admitted by the interceptors (a rejection ends it here);
//! 2. stored, which assigns its correlation id, and encoded once;
//! 3. endpoint selected, connection borrowed, frame written;
//! 4. deadline armed on the shared timer;
//! 5. completed, failed, timed out or cancelled, which returns the connection.
//!
//! Connection failures in step 3 mark the endpoint and try another one, up to
//! `max_attempts`. Anything else fails the call at once.
//!
//! # Key Components
//!
//! - [`RpcClientBuilder`]: naming URL, configuration and interceptors.
//! - [`CallOptions`]: per-call timeout, hash key and attachments.
//! - [`RpcFuture`]: the caller's handle on an outstanding call.
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    balance::{CallContext, LoadBalancer},
    config::ClientConfig,
    error::RpcError,
    interceptor::{Interceptor, InterceptorChain},
    message::{Attachments, MethodDescriptor, Push, Request},
    naming::{
        Endpoint, FailbackNamingService, Listener, NamingEvent, NamingService, ServiceDirectory,
    },
    pool::PoolSet,
    protocol::Protocol,
    runtime::Runtime,
    store::{CallResult, Completion, FutureStore, PendingCall},
    timer::Timer,
    transport::{Connection, Connector, TcpConnector},
};

mod channel;
mod future;

pub use channel::Channel;
pub use future::RpcFuture;

pub type PushHandler = Arc<dyn Fn(Push) + Send + Sync>;

/// Push handlers by service name.
#[derive(Default)]
pub(crate) struct PushHandlers {
    handlers: RwLock<HashMap<String, PushHandler>>,
}

impl PushHandlers {
    fn set(&self, service: &str, handler: PushHandler) {
        self.handlers.write().insert(service.to_string(), handler);
    }

    pub(crate) fn dispatch(&self, push: Push) {
        let handler = self.handlers.read().get(&push.service).cloned();
        match handler {
            Some(handler) => handler(push),
            None => debug!("no handler for push {}.{}", push.service, push.method),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub hash_key: Option<u64>,
    pub attachments: Attachments,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Routes calls with equal keys to the same endpoint under consistent hashing.
    pub fn hash_key(mut self, key: u64) -> Self {
        self.hash_key = Some(key);
        self
    }

    pub fn attachment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attachments.insert(key.into(), value.into());
        self
    }
}

pub struct RpcClientBuilder {
    naming_url: String,
    config: ClientConfig,
    interceptors: InterceptorChain,
}

impl RpcClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self, runtime: &Runtime) -> Result<RpcClient, RpcError> {
        let timer = runtime.timer()?;
        let codec = runtime.protocols().resolve(self.config.protocol)?;
        let naming = runtime.naming().connect(&self.naming_url, &timer)?;

        let store = Arc::new(FutureStore::new(self.config.store_capacity));
        let pushes = Arc::new(PushHandlers::default());
        let pools = {
            let store = Arc::downgrade(&store);
            let pushes = Arc::clone(&pushes);
            let codec = Arc::clone(&codec);
            let connect_timeout = self.config.pool.connect_timeout;
            let factory = move |endpoint: &Endpoint| -> io::Result<Channel> {
                let conn = TcpConnector.connect(endpoint, connect_timeout)?;
                Channel::open(
                    conn,
                    endpoint,
                    Arc::clone(&codec),
                    store.clone(),
                    Arc::clone(&pushes),
                )
            };
            Arc::new(PoolSet::new(self.config.pool.clone(), Arc::new(factory)))
        };

        let reaper = Arc::downgrade(&pools);
        timer.schedule_every(self.config.pool.reap_interval, move || {
            let Some(pools) = reaper.upgrade() else {
                return false;
            };
            let reaped = pools.reap_idle(Instant::now());
            if reaped > 0 {
                debug!("reaped {reaped} idle connections");
            }
            true
        });

        info!(
            "client ready: naming {}, protocol {}, load balance {}",
            self.naming_url,
            codec.name(),
            self.config.load_balance
        );
        Ok(RpcClient {
            inner: Arc::new(ClientInner {
                balancer: self.config.load_balance.build(),
                config: self.config,
                interceptors: self.interceptors,
                naming,
                codec,
                store,
                pools,
                pushes,
                timer,
                subscriptions: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct Subscription {
    directory: Arc<ServiceDirectory>,
    listener: Listener,
}

struct ClientInner {
    config: ClientConfig,
    interceptors: InterceptorChain,
    naming: Arc<FailbackNamingService>,
    codec: Arc<dyn Protocol>,
    balancer: Box<dyn LoadBalancer>,
    store: Arc<FutureStore>,
    pools: Arc<PoolSet<Channel>>,
    pushes: Arc<PushHandlers>,
    timer: Arc<Timer>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    closed: AtomicBool,
}

/// Cheap to clone; clones share connections and pending calls.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn builder(naming_url: impl Into<String>) -> RpcClientBuilder {
        RpcClientBuilder {
            naming_url: naming_url.into(),
            config: ClientConfig::default(),
            interceptors: InterceptorChain::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Calls still waiting for a result.
    pub fn pending(&self) -> usize {
        self.inner.store.len()
    }

    /// Current endpoint snapshot for `service`, subscribing on first use.
    pub fn endpoints(&self, service: &str) -> Result<Vec<Endpoint>, RpcError> {
        Ok(self.inner.directory(service)?.endpoints().to_vec())
    }

    /// Sends the call and blocks until it finishes.
    pub fn invoke(
        &self,
        method: &MethodDescriptor,
        payload: Vec<u8>,
        options: CallOptions,
    ) -> CallResult {
        self.invoke_async(method, payload, options)?.wait()
    }

    /// Sends the call and returns once it is on the wire.
    ///
    /// Interceptor rejections and failures before the request was written are
    /// returned as errors; everything later is reported through the future.
    pub fn invoke_async(
        &self,
        method: &MethodDescriptor,
        payload: Vec<u8>,
        options: CallOptions,
    ) -> Result<RpcFuture, RpcError> {
        let serialization = self.inner.config.serialization;
        let completion = Completion::new();
        let (id, deadline) = self.inner.start(method, payload, options, |call| {
            call.with_completion(Arc::clone(&completion))
        })?;

        match id {
            Some(id) => Ok(RpcFuture::new(
                id,
                completion,
                &self.inner.store,
                deadline,
                serialization,
            )),
            None => match completion.try_take() {
                Some((_, Err(err))) => Err(err),
                Some((_, result)) => Ok(RpcFuture::ready(0, result, serialization)),
                None => Err(RpcError::Cancelled { log_id: 0 }),
            },
        }
    }

    /// Sends the call; `callback` runs exactly once with its outcome, on an I/O
    /// or timer thread, or on this thread if the call fails before sending.
    pub fn invoke_with_callback<F>(
        &self,
        method: &MethodDescriptor,
        payload: Vec<u8>,
        options: CallOptions,
        callback: F,
    ) -> Result<(), RpcError>
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        self.inner.start(method, payload, options, |call| {
            call.with_callback(Box::new(callback))
        })?;
        Ok(())
    }

    /// Serializes `request`, calls and decodes the response.
    pub fn call<Req, Resp>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let serialization = self.inner.config.serialization;
        let payload = serialization.serialize(request)?;
        let response = self.invoke(method, payload, options)?;
        Ok(serialization.deserialize(&response.payload)?)
    }

    /// Serializes `request` and sends it; collect with [`RpcFuture::wait_as`].
    pub fn call_async<Req>(
        &self,
        method: &MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> Result<RpcFuture, RpcError>
    where
        Req: Serialize + ?Sized,
    {
        let payload = self.inner.config.serialization.serialize(request)?;
        self.invoke_async(method, payload, options)
    }

    /// Routes server pushes for `service` to `handler`, replacing any earlier one.
    pub fn on_push<F>(&self, service: &str, handler: F)
    where
        F: Fn(Push) + Send + Sync + 'static,
    {
        self.inner.pushes.set(service, Arc::new(handler));
    }

    /// Unsubscribes, fails outstanding calls and closes every connection.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions: Vec<_> = self.inner.subscriptions.write().drain().collect();
        for (service, subscription) in subscriptions {
            if let Err(e) = self.inner.naming.unsubscribe(&service, &subscription.listener) {
                warn!("unsubscribing from {service} failed: {e}");
            }
        }
        for call in self.inner.store.drain() {
            call.cancel();
        }
        self.inner.pools.close_all();
        self.inner.naming.close();
        info!("client shut down");
    }
}

impl ClientInner {
    fn directory(&self, service: &str) -> Result<Arc<ServiceDirectory>, RpcError> {
        if let Some(subscription) = self.subscriptions.read().get(service) {
            return Ok(Arc::clone(&subscription.directory));
        }

        let mut subscriptions = self.subscriptions.write();
        if let Some(subscription) = subscriptions.get(service) {
            return Ok(Arc::clone(&subscription.directory));
        }

        let directory = Arc::new(ServiceDirectory::new(
            service,
            self.config.failure_threshold,
            self.config.isolation,
        ));
        let listener: Listener = {
            let directory = Arc::clone(&directory);
            let pools = Arc::downgrade(&self.pools);
            Arc::new(move |event: &NamingEvent| {
                directory.apply(event);
                if let Some(pools) = pools.upgrade() {
                    for endpoint in &event.removed {
                        pools.remove(endpoint);
                    }
                }
            })
        };
        self.naming.subscribe(service, Arc::clone(&listener))?;
        if directory.is_empty() {
            match self.naming.lookup(service) {
                Ok(endpoints) => directory.replace(endpoints),
                Err(e) => warn!("lookup of {service} failed: {e}"),
            }
        }

        debug!(
            "subscribed to {service}: {} endpoints",
            directory.endpoints().len()
        );
        subscriptions.insert(
            service.to_string(),
            Subscription {
                directory: Arc::clone(&directory),
                listener,
            },
        );
        Ok(directory)
    }

    /// Admits, stores and sends one call.
    ///
    /// `Ok(None)` means the call already finished (failed) and its continuation
    /// has been told; `Err` means it never got past the interceptors.
    fn start<F>(
        &self,
        method: &MethodDescriptor,
        payload: Vec<u8>,
        options: CallOptions,
        continuation: F,
    ) -> Result<(Option<u64>, Instant), RpcError>
    where
        F: FnOnce(PendingCall) -> PendingCall,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Cancelled { log_id: 0 });
        }

        let timeout = options.timeout.unwrap_or(self.config.timeout);
        let mut request = Request::new(method.service.as_str(), method.method.as_str(), payload)
            .with_timeout(timeout);
        request.protocol = self.codec.id();
        request.attachments = options.attachments;

        let admitted = self.interceptors.admit(&mut request)?;
        let call = continuation(
            PendingCall::new(request.header(), timeout)
                .with_finisher(Box::new(move |result: &mut CallResult| admitted.finish(result))),
        );
        let deadline = call.deadline();

        let ctx = CallContext {
            service: request.service.clone(),
            method: request.method.clone(),
            hash_key: options.hash_key,
        };
        Ok((self.dispatch(request, call, &ctx), deadline))
    }

    fn dispatch(&self, mut request: Request, call: PendingCall, ctx: &CallContext) -> Option<u64> {
        let deadline = call.deadline();
        // a full store fails the call itself
        let id = self.store.put(call).ok()?;
        request.log_id = id;

        let frame = match self.codec.encode_request(&request) {
            Ok(frame) => frame,
            Err(e) => {
                self.fail(id, RpcError::encoding(e));
                return None;
            }
        };
        drop(request);

        let directory = match self.directory(&ctx.service) {
            Ok(directory) => directory,
            Err(e) => {
                self.fail(id, e);
                return None;
            }
        };

        let mut tried: Vec<Endpoint> = Vec::new();
        let mut last_err = None;
        for attempt in 0..self.config.max_attempts {
            let candidates: Vec<Endpoint> = directory
                .healthy()
                .into_iter()
                .filter(|e| !tried.contains(e))
                .collect();
            let Some(idx) = self.balancer.select(&candidates, ctx) else {
                break;
            };
            let endpoint = candidates[idx].clone();
            tried.push(endpoint.clone());

            match self.send(id, &endpoint, &frame) {
                Ok(true) => {
                    directory.report_success(&endpoint);
                    self.arm_deadline(id, deadline);
                    trace!("call {id} sent to {endpoint} on attempt {}", attempt + 1);
                    return Some(id);
                }
                // finished while we were sending
                Ok(false) => return None,
                Err(e) if e.is_retryable() => {
                    directory.report_failure(&endpoint);
                    warn!("call {id} attempt {} to {endpoint} failed: {e}", attempt + 1);
                    last_err = Some(e);
                }
                Err(e) => {
                    self.fail(id, e);
                    return None;
                }
            }
        }

        let err = last_err.unwrap_or_else(|| RpcError::NoProvider {
            service: ctx.service.clone(),
        });
        self.fail(id, err);
        None
    }

    /// `Ok(false)` if the call left the store before the lease could be attached.
    fn send(&self, id: u64, endpoint: &Endpoint, frame: &[u8]) -> Result<bool, RpcError> {
        let mut lease = self.pools.borrow(endpoint)?;
        let channel = Arc::clone(lease.conn());
        if !self.store.update(id, |call| call.set_endpoint(endpoint.to_string())) {
            return Ok(false);
        }

        channel.begin(id);
        if let Err(e) = channel.write_all(frame) {
            channel.end(id);
            lease.invalidate();
            return Err(RpcError::connection(endpoint, e));
        }

        // If the response already won the race, the lease drops right here.
        self.store
            .update(id, move |call| call.attach_lease(Box::new(lease)));
        Ok(true)
    }

    fn arm_deadline(&self, id: u64, deadline: Instant) {
        let store = Arc::downgrade(&self.store);
        let handle = self
            .timer
            .schedule(deadline.saturating_duration_since(Instant::now()), move || {
                if let Some(call) = store.upgrade().and_then(|store| store.take(id)) {
                    debug!("call {id} timed out");
                    call.time_out();
                }
            });
        let timer = handle.clone();
        if !self.store.update(id, move |call| call.attach_timer(timer)) {
            handle.cancel();
        }
    }

    fn fail(&self, id: u64, err: RpcError) {
        if let Some(call) = self.store.take(id) {
            debug!("call {id} failed: {err}");
            call.fail(err);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.pools.close_all();
        self.naming.close();
    }
}
