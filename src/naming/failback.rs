use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use super::{Endpoint, Listener, NamingError, NamingEvent, NamingService, NamingUrl};
use crate::timer::Timer;

/// Backoff for failed naming operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
    pub limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            limit: 10,
        }
    }
}

impl RetryPolicy {
    /// Reads `retry_ms` and `retry_limit` from the URL.
    pub fn from_url(url: &NamingUrl) -> Result<Self, NamingError> {
        let default = Self::default();
        Ok(Self {
            base: url.duration_ms("retry_ms", default.base)?,
            limit: url.param_or("retry_limit", default.limit)?,
            ..default
        })
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Clone)]
enum Op {
    Register(Endpoint),
    Unregister(Endpoint),
    Subscribe(Listener),
    Unsubscribe(Listener),
}

impl Op {
    fn kind(&self) -> &'static str {
        match self {
            Op::Register(_) => "register",
            Op::Unregister(_) => "unregister",
            Op::Subscribe(_) => "subscribe",
            Op::Unsubscribe(_) => "unsubscribe",
        }
    }

    /// Operations on the same target supersede each other.
    fn target(&self) -> String {
        match self {
            Op::Register(e) | Op::Unregister(e) => e.to_string(),
            Op::Subscribe(l) | Op::Unsubscribe(l) => format!("listener@{:p}", Arc::as_ptr(l)),
        }
    }
}

type OpKey = (String, String);

struct Shared<N: ?Sized> {
    backend: Arc<N>,
    timer: Weak<Timer>,
    policy: RetryPolicy,
    pending: Mutex<HashMap<OpKey, u64>>,
    generation: AtomicU64,
    cache: RwLock<HashMap<String, Vec<Endpoint>>>,
    available: AtomicBool,
    closed: AtomicBool,
}

impl<N> Shared<N>
where
    N: ?Sized + NamingService + 'static,
{
    fn apply(&self, service: &str, op: &Op) -> Result<(), NamingError> {
        match op {
            Op::Register(e) => self.backend.register(service, e),
            Op::Unregister(e) => self.backend.unregister(service, e),
            Op::Subscribe(l) => self.backend.subscribe(service, Arc::clone(l)),
            Op::Unsubscribe(l) => self.backend.unsubscribe(service, l),
        }
    }

    fn is_current(&self, key: &OpKey, generation: u64) -> bool {
        self.pending.lock().get(key) == Some(&generation)
    }

    fn settle(&self, key: &OpKey, generation: u64) {
        let mut pending = self.pending.lock();
        if pending.get(key) == Some(&generation) {
            pending.remove(key);
        }
    }

    fn submit(self: &Arc<Self>, service: &str, op: Op) {
        let key = (service.to_string(), op.target());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(key.clone(), generation);

        match self.apply(service, &op) {
            Ok(()) => {
                self.available.store(true, Ordering::Release);
                self.settle(&key, generation);
            }
            Err(e) => {
                self.available.store(false, Ordering::Release);
                warn!(
                    "naming {} of {} for {service} failed, will retry: {e}",
                    op.kind(),
                    key.1
                );
                if let Op::Subscribe(listener) = &op {
                    self.replay_cached(service, listener);
                }
                self.schedule_retry(key, op, generation, 0);
            }
        }
    }

    fn replay_cached(&self, service: &str, listener: &Listener) {
        let cached = self.cache.read().get(service).cloned();
        if let Some(added) = cached.filter(|list| !list.is_empty()) {
            debug!("serving cached endpoints for {service} to new subscriber");
            listener.notify(&NamingEvent {
                service: service.to_string(),
                added,
                removed: Vec::new(),
            });
        }
    }

    fn schedule_retry(self: &Arc<Self>, key: OpKey, op: Op, generation: u64, attempt: u32) {
        if attempt >= self.policy.limit {
            error!(
                "giving up naming {} of {} for {} after {attempt} retries",
                op.kind(),
                key.1,
                key.0
            );
            self.settle(&key, generation);
            return;
        }
        let Some(timer) = self.timer.upgrade() else {
            warn!("timer gone, dropping naming {} for {}", op.kind(), key.0);
            self.settle(&key, generation);
            return;
        };

        let shared = Arc::clone(self);
        timer.schedule(self.policy.delay(attempt), move || {
            shared.retry(key, op, generation, attempt)
        });
    }

    fn retry(self: &Arc<Self>, key: OpKey, op: Op, generation: u64, attempt: u32) {
        if self.closed.load(Ordering::Acquire) || !self.is_current(&key, generation) {
            debug!("naming {} of {} superseded", op.kind(), key.1);
            return;
        }
        match self.apply(&key.0, &op) {
            Ok(()) => {
                self.available.store(true, Ordering::Release);
                info!(
                    "naming {} of {} for {} succeeded on retry {}",
                    op.kind(),
                    key.1,
                    key.0,
                    attempt + 1
                );
                self.settle(&key, generation);
            }
            Err(e) => {
                self.available.store(false, Ordering::Release);
                warn!("naming {} retry {} failed: {e}", op.kind(), attempt + 1);
                self.schedule_retry(key, op, generation, attempt + 1);
            }
        }
    }
}

/// Keeps a naming backend's failures away from callers.
///
/// Mutations that fail are retried on the timer with exponential backoff; a
/// newer operation on the same service and target cancels an older retry.
/// `lookup` falls back to the last snapshot the backend returned.
pub struct FailbackNamingService<N: ?Sized + NamingService = dyn NamingService> {
    shared: Arc<Shared<N>>,
}

impl<N> FailbackNamingService<N>
where
    N: ?Sized + NamingService + 'static,
{
    pub fn new(backend: Arc<N>, timer: &Arc<Timer>, policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                timer: Arc::downgrade(timer),
                policy,
                pending: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
                cache: RwLock::new(HashMap::new()),
                available: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<N> {
        &self.shared.backend
    }

    pub fn policy(&self) -> RetryPolicy {
        self.shared.policy
    }

    /// Outcome of the most recent backend call.
    pub fn is_backend_available(&self) -> bool {
        self.shared.available.load(Ordering::Acquire)
    }

    /// Operations still waiting for a retry.
    pub fn pending_retries(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

impl<N> NamingService for FailbackNamingService<N>
where
    N: ?Sized + NamingService + 'static,
{
    fn name(&self) -> &'static str {
        self.shared.backend.name()
    }

    fn register(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError> {
        self.shared.submit(service, Op::Register(endpoint.clone()));
        Ok(())
    }

    fn unregister(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError> {
        self.shared.submit(service, Op::Unregister(endpoint.clone()));
        Ok(())
    }

    fn subscribe(&self, service: &str, listener: Listener) -> Result<(), NamingError> {
        self.shared.submit(service, Op::Subscribe(listener));
        Ok(())
    }

    fn unsubscribe(&self, service: &str, listener: &Listener) -> Result<(), NamingError> {
        self.shared
            .submit(service, Op::Unsubscribe(Arc::clone(listener)));
        Ok(())
    }

    fn lookup(&self, service: &str) -> Result<Vec<Endpoint>, NamingError> {
        match self.shared.backend.lookup(service) {
            Ok(endpoints) => {
                self.shared.available.store(true, Ordering::Release);
                self.shared
                    .cache
                    .write()
                    .insert(service.to_string(), endpoints.clone());
                Ok(endpoints)
            }
            Err(e) => {
                self.shared.available.store(false, Ordering::Release);
                match self.shared.cache.read().get(service) {
                    Some(cached) => {
                        warn!("naming lookup for {service} failed, using cached snapshot: {e}");
                        Ok(cached.clone())
                    }
                    None => Err(e),
                }
            }
        }
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.pending.lock().clear();
            self.shared.backend.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicU32,
        thread,
        time::Instant,
    };

    use super::*;
    use crate::naming::ListNamingService;

    /// Fails the next `failures` calls, then delegates.
    struct Flaky {
        inner: ListNamingService,
        failures: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                inner: ListNamingService::new(Vec::new()),
                failures: AtomicU32::new(failures),
            })
        }

        fn check(&self) -> Result<(), NamingError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(NamingError::Backend {
                    backend: "flaky",
                    reason: "down".into(),
                });
            }
            Ok(())
        }
    }

    impl NamingService for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn register(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError> {
            self.check()?;
            self.inner.register(service, endpoint)
        }

        fn unregister(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError> {
            self.check()?;
            self.inner.unregister(service, endpoint)
        }

        fn subscribe(&self, service: &str, listener: Listener) -> Result<(), NamingError> {
            self.check()?;
            self.inner.subscribe(service, listener)
        }

        fn unsubscribe(&self, service: &str, listener: &Listener) -> Result<(), NamingError> {
            self.check()?;
            self.inner.unsubscribe(service, listener)
        }

        fn lookup(&self, service: &str) -> Result<Vec<Endpoint>, NamingError> {
            self.check()?;
            self.inner.lookup(service)
        }
    }

    fn timer() -> Arc<Timer> {
        Arc::new(Timer::new(Duration::from_millis(1), 64).unwrap())
    }

    fn fast(limit: u32) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(5),
            max: Duration::from_millis(20),
            limit,
        }
    }

    fn eventually(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(64), Duration::from_secs(30));

        let url = NamingUrl::parse("list://h:1?retry_ms=50&retry_limit=2").unwrap();
        let policy = RetryPolicy::from_url(&url).unwrap();
        assert_eq!(policy.base, Duration::from_millis(50));
        assert_eq!(policy.limit, 2);
    }

    #[test]
    fn failed_register_is_retried() {
        let timer = timer();
        let backend = Flaky::new(2);
        let naming = FailbackNamingService::new(Arc::clone(&backend), &timer, fast(10));

        naming.register("svc", &Endpoint::new("a", 1)).unwrap();
        assert!(!naming.is_backend_available());

        assert!(eventually(|| backend.inner.lookup("svc").unwrap().len() == 1));
        assert!(eventually(|| naming.pending_retries() == 0));
        assert!(naming.is_backend_available());
    }

    #[test]
    fn retry_budget_is_bounded() {
        let timer = timer();
        let backend = Flaky::new(u32::MAX);
        let naming = FailbackNamingService::new(Arc::clone(&backend), &timer, fast(2));

        naming.register("svc", &Endpoint::new("a", 1)).unwrap();
        assert!(eventually(|| naming.pending_retries() == 0));
        // one initial call plus two retries
        assert_eq!(backend.failures.load(Ordering::SeqCst), u32::MAX - 3);
    }

    #[test]
    fn newer_operation_supersedes_retry() {
        let timer = timer();
        let backend = Flaky::new(1);
        let naming = FailbackNamingService::new(
            Arc::clone(&backend),
            &timer,
            RetryPolicy {
                base: Duration::from_millis(50),
                ..fast(5)
            },
        );

        let endpoint = Endpoint::new("a", 1);
        naming.register("svc", &endpoint).unwrap();
        naming.unregister("svc", &endpoint).unwrap();
        assert_eq!(naming.pending_retries(), 0);

        thread::sleep(Duration::from_millis(150));
        assert!(backend.inner.lookup("svc").unwrap().is_empty());
    }

    #[test]
    fn lookup_serves_last_known_good() {
        let timer = timer();
        let backend = Flaky::new(0);
        backend.inner.register("svc", &Endpoint::new("a", 1)).unwrap();
        let naming = FailbackNamingService::new(Arc::clone(&backend), &timer, fast(1));

        assert_eq!(naming.lookup("svc").unwrap().len(), 1);
        backend.failures.store(1, Ordering::SeqCst);
        assert_eq!(naming.lookup("svc").unwrap().len(), 1);
        assert!(!naming.is_backend_available());

        backend.failures.store(1, Ordering::SeqCst);
        assert!(naming.lookup("other").is_err());
    }

    #[test]
    fn failed_subscribe_replays_cache_then_recovers() {
        let timer = timer();
        let backend = Flaky::new(0);
        backend.inner.register("svc", &Endpoint::new("a", 1)).unwrap();
        let naming = FailbackNamingService::new(Arc::clone(&backend), &timer, fast(5));
        naming.lookup("svc").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener =
            Arc::new(move |event: &NamingEvent| sink.lock().push(event.added.len()));

        backend.failures.store(1, Ordering::SeqCst);
        naming.subscribe("svc", listener).unwrap();
        assert_eq!(*seen.lock(), vec![1]);

        // the retried subscription delivers the live snapshot
        assert!(eventually(|| seen.lock().len() == 2));
    }
}
