//! Cross-cutting policy around every call.
//!
//! # Overview
//!
//! An [`InterceptorChain`] is an ordered list walked with an index cursor, so
//! its stack depth does not grow with its length. [`InterceptorChain::admit`]
//! asks every interceptor's `pre_check` in order; the first one to say no ends
//! the call with [`RpcError::RateLimited`] and nothing after it runs, the send
//! included. Admitted calls then run every `before` hook, and the returned
//! [`Admitted`] runs the `after` hooks in reverse order once the outcome is
//! known, failures included.
//!
//! The client wraps outgoing calls in a chain; the server wraps handler
//! dispatch in another one.
use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, trace};
use parking_lot::Mutex;
use rand::Rng;

use crate::{error::RpcError, message::Request, store::CallResult};

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `false` rejects the call.
    fn pre_check(&self, _request: &Request) -> bool {
        true
    }

    fn before(&self, _request: &mut Request) {}

    fn after(&self, _request: &Request, _result: &mut CallResult) {}
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn admit(&self, request: &mut Request) -> Result<Admitted, RpcError> {
        let mut cursor = 0;
        while let Some(interceptor) = self.interceptors.get(cursor) {
            if !interceptor.pre_check(request) {
                debug!(
                    "{}.{} rejected by `{}`",
                    request.service,
                    request.method,
                    interceptor.name()
                );
                return Err(RpcError::RateLimited {
                    interceptor: interceptor.name().to_string(),
                });
            }
            cursor += 1;
        }

        for interceptor in &self.interceptors {
            interceptor.before(request);
        }
        Ok(Admitted {
            chain: self.clone(),
            request: request.header(),
        })
    }

    /// Admits `request`, runs `terminal` and the `after` hooks around its outcome.
    pub fn execute<F>(&self, mut request: Request, terminal: F) -> CallResult
    where
        F: FnOnce(Request) -> CallResult,
    {
        let admitted = self.admit(&mut request)?;
        let mut result = terminal(request);
        admitted.finish(&mut result);
        result
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A call that passed every pre-check and still owes its `after` hooks.
pub struct Admitted {
    chain: InterceptorChain,
    request: Request,
}

impl Admitted {
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn finish(&self, result: &mut CallResult) {
        let mut cursor = self.chain.interceptors.len();
        while cursor > 0 {
            cursor -= 1;
            self.chain.interceptors[cursor].after(&self.request, result);
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    hits: VecDeque<Instant>,
}

impl Window {
    fn expire(&mut self, now: Instant, period: Duration) {
        while self
            .hits
            .front()
            .is_some_and(|hit| now.duration_since(*hit) >= period)
        {
            self.hits.pop_front();
        }
    }

    fn try_acquire(&mut self, now: Instant, limit: usize, period: Duration) -> bool {
        self.expire(now, period);
        if self.hits.len() >= limit {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

/// Per-service windows; idle ones are dropped at most once per period.
#[derive(Debug)]
struct ServiceWindows {
    windows: HashMap<String, Window>,
    swept: Instant,
}

impl ServiceWindows {
    fn try_acquire(
        &mut self,
        service: &str,
        now: Instant,
        limit: usize,
        period: Duration,
    ) -> bool {
        if now.duration_since(self.swept) >= period {
            self.windows.retain(|_, window| {
                window.expire(now, period);
                !window.hits.is_empty()
            });
            self.swept = now;
        }
        match self.windows.get_mut(service) {
            Some(window) => window.try_acquire(now, limit, period),
            None => self
                .windows
                .entry(service.to_string())
                .or_default()
                .try_acquire(now, limit, period),
        }
    }
}

/// Sliding-window limiter: at most `limit` calls per `window`.
///
/// With [`per_service`](Self::per_service) every service gets its own window;
/// otherwise all calls share one.
#[derive(Debug)]
pub struct RateLimitInterceptor {
    limit: usize,
    window: Duration,
    per_service: bool,
    global: Mutex<Window>,
    services: Mutex<ServiceWindows>,
}

impl RateLimitInterceptor {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            per_service: false,
            global: Mutex::new(Window::default()),
            services: Mutex::new(ServiceWindows {
                windows: HashMap::new(),
                swept: Instant::now(),
            }),
        }
    }

    pub fn per_service(mut self) -> Self {
        self.per_service = true;
        self
    }
}

impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn pre_check(&self, request: &Request) -> bool {
        let now = Instant::now();
        if self.per_service {
            self.services
                .lock()
                .try_acquire(&request.service, now, self.limit, self.window)
        } else {
            self.global
                .lock()
                .try_acquire(now, self.limit, self.window)
        }
    }
}

pub const TRACE_ID: &str = "trace-id";
pub const SPAN_ID: &str = "span-id";

/// Stamps trace attachments and logs each call's latency and outcome.
#[derive(Debug, Default)]
pub struct TraceInterceptor {
    started: Mutex<HashMap<String, Instant>>,
}

impl TraceInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Interceptor for TraceInterceptor {
    fn name(&self) -> &'static str {
        "trace"
    }

    fn before(&self, request: &mut Request) {
        let mut rng = rand::rng();
        request
            .attachments
            .entry(TRACE_ID.to_string())
            .or_insert_with(|| format!("{:016x}", rng.random::<u64>()));
        let span = format!("{:016x}", rng.random::<u64>());
        request.attachments.insert(SPAN_ID.to_string(), span.clone());
        self.started.lock().insert(span, Instant::now());
    }

    fn after(&self, request: &Request, result: &mut CallResult) {
        let elapsed = request
            .attachments
            .get(SPAN_ID)
            .and_then(|span| self.started.lock().remove(span))
            .map(|start| start.elapsed());
        let trace_id = request.attachments.get(TRACE_ID).map_or("-", String::as_str);
        match result {
            Ok(_) => debug!(
                "[{trace_id}] {}.{} ok in {elapsed:?}",
                request.service, request.method
            ),
            Err(e) => debug!(
                "[{trace_id}] {}.{} failed in {elapsed:?}: {e}",
                request.service, request.method
            ),
        }
        trace!("[{trace_id}] attachments {:?}", request.attachments);
    }
}
