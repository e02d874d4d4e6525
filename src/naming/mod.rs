//! Service discovery.
//!
//! # Overview
//!
//! A naming backend maps a logical service name to the endpoints currently
//! serving it. The client never talks to a backend directly: the
//! [`NamingRegistry`] builds one from a URL (`list://`, `file://`, ...) and wraps
//! it in a [`FailbackNamingService`] so transient backend failures are retried
//! in the background instead of failing calls. Subscription notifications feed
//! a per-service [`ServiceDirectory`], whose snapshot is what load balancers
//! pick from.
//!
//! Subscribing delivers the current endpoint set as the `added` half of the
//! first [`NamingEvent`], so a fresh subscriber never has to race a lookup.
//!
//! # Key Components
//!
//! - [`NamingService`]: register / unregister / subscribe / unsubscribe / lookup.
//! - [`ListNamingService`]: fixed in-memory list, mutable through `register`.
//! - [`FileNamingService`]: one file per service, polled for changes.
//! - [`NamingUrl`]: the parsed backend address and its parameters.
use std::{
    collections::{BTreeMap, HashMap},
    fmt, io,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use log::{debug, info};
use parking_lot::RwLock;
use thiserror::Error;

use crate::timer::Timer;

mod directory;
mod failback;
mod file;
mod list;
mod url;

pub use directory::ServiceDirectory;
pub use failback::{FailbackNamingService, RetryPolicy};
pub use file::FileNamingService;
pub use list::ListNamingService;
pub use url::NamingUrl;

#[derive(Debug, Error)]
pub enum NamingError {
    #[error("invalid naming url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("no naming backend registered for scheme `{0}`")]
    UnknownScheme(String),
    #[error("invalid endpoint `{input}`: {reason}")]
    InvalidEndpoint { input: String, reason: String },
    #[error("naming backend `{backend}` failed: {reason}")]
    Backend {
        backend: &'static str,
        reason: String,
    },
    #[error("naming io error: {0}")]
    Io(#[from] io::Error),
}

/// One addressable server instance. Identity is `(host, port)`.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub tags: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parses `host:port` optionally followed by whitespace and a weight.
impl FromStr for Endpoint {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| NamingError::InvalidEndpoint {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = s.split_whitespace();
        let addr = parts.next().ok_or_else(|| invalid("empty"))?;
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;

        let mut endpoint = Endpoint::new(host.trim_matches(['[', ']']), port);
        if let Some(weight) = parts.next() {
            endpoint.weight = weight.parse().map_err(|_| invalid("bad weight"))?;
        }
        if parts.next().is_some() {
            return Err(invalid("trailing characters"));
        }
        Ok(endpoint)
    }
}

/// A change to the endpoints of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamingEvent {
    pub service: String,
    pub added: Vec<Endpoint>,
    pub removed: Vec<Endpoint>,
}

impl NamingEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Difference between two snapshots of the same service.
    pub fn diff(service: &str, before: &[Endpoint], after: &[Endpoint]) -> Self {
        Self {
            service: service.to_string(),
            added: after
                .iter()
                .filter(|e| !before.contains(e))
                .cloned()
                .collect(),
            removed: before
                .iter()
                .filter(|e| !after.contains(e))
                .cloned()
                .collect(),
        }
    }
}

pub trait NotifyListener: Send + Sync {
    fn notify(&self, event: &NamingEvent);
}

impl<F> NotifyListener for F
where
    F: Fn(&NamingEvent) + Send + Sync,
{
    fn notify(&self, event: &NamingEvent) {
        self(event)
    }
}

pub type Listener = Arc<dyn NotifyListener>;

pub(crate) fn same_listener(a: &Listener, b: &Listener) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub trait NamingService: Send + Sync {
    fn name(&self) -> &'static str;

    fn register(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError>;

    fn unregister(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError>;

    /// Delivers the current endpoints to `listener`, then every later change.
    fn subscribe(&self, service: &str, listener: Listener) -> Result<(), NamingError>;

    fn unsubscribe(&self, service: &str, listener: &Listener) -> Result<(), NamingError>;

    fn lookup(&self, service: &str) -> Result<Vec<Endpoint>, NamingError>;

    /// Stops background work.
    fn close(&self) {}
}

/// Listener bookkeeping shared by the backends.
#[derive(Default)]
pub(crate) struct Subscribers {
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
}

impl Subscribers {
    pub fn add(&self, service: &str, listener: Listener) {
        self.listeners
            .write()
            .entry(service.to_string())
            .or_default()
            .push(listener);
    }

    pub fn remove(&self, service: &str, listener: &Listener) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(service) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| !same_listener(l, listener));
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(service);
        }
        removed
    }

    pub fn services(&self) -> Vec<String> {
        self.listeners.read().keys().cloned().collect()
    }

    pub fn notify(&self, event: &NamingEvent) {
        if event.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .get(&event.service)
            .cloned()
            .unwrap_or_default();
        debug!(
            "naming change for {}: +{} -{}",
            event.service,
            event.added.len(),
            event.removed.len()
        );
        for listener in listeners {
            listener.notify(event);
        }
    }
}

/// Builds a backend for one URL scheme.
pub trait NamingFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// Higher wins when two factories claim the same scheme.
    fn priority(&self) -> i32 {
        0
    }

    fn create(&self, url: &NamingUrl) -> Result<Arc<dyn NamingService>, NamingError>;
}

struct Registered {
    priority: i32,
    factory: Arc<dyn NamingFactory>,
}

/// Naming backends keyed by URL scheme.
#[derive(Default)]
pub struct NamingRegistry {
    factories: RwLock<HashMap<&'static str, Registered>>,
}

impl NamingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(list::ListFactory));
        registry.register(Arc::new(file::FileFactory));
        registry
    }

    /// Returns `true` when the factory was installed.
    pub fn register(&self, factory: Arc<dyn NamingFactory>) -> bool {
        let mut factories = self.factories.write();
        if let Some(existing) = factories.get(factory.scheme()) {
            if existing.priority >= factory.priority() {
                return false;
            }
        }
        info!(
            "registered naming backend `{}` with priority {}",
            factory.scheme(),
            factory.priority()
        );
        factories.insert(
            factory.scheme(),
            Registered {
                priority: factory.priority(),
                factory,
            },
        );
        true
    }

    pub fn schemes(&self) -> Vec<&'static str> {
        let mut schemes: Vec<_> = self.factories.read().keys().copied().collect();
        schemes.sort_unstable();
        schemes
    }

    /// Builds the bare backend for `url`.
    pub fn create(&self, url: &str) -> Result<Arc<dyn NamingService>, NamingError> {
        let url = NamingUrl::parse(url)?;
        let factory = self
            .factories
            .read()
            .get(url.scheme.as_str())
            .map(|r| Arc::clone(&r.factory))
            .ok_or_else(|| NamingError::UnknownScheme(url.scheme.clone()))?;
        factory.create(&url)
    }

    /// Builds the backend for `url` behind a failback decorator retrying on `timer`.
    pub fn connect(
        &self,
        url: &str,
        timer: &Arc<Timer>,
    ) -> Result<Arc<FailbackNamingService>, NamingError> {
        let parsed = NamingUrl::parse(url)?;
        let policy = RetryPolicy::from_url(&parsed)?;
        let backend = self.create(url)?;
        Ok(Arc::new(FailbackNamingService::new(backend, timer, policy)))
    }
}

impl fmt::Debug for NamingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamingRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn endpoint_identity_ignores_weight_and_tags() {
        let a = Endpoint::new("10.0.0.1", 8000).with_weight(5);
        let b = Endpoint::new("10.0.0.1", 8000).with_tag("zone", "b");
        assert_eq!(a, b);
        assert_ne!(a, Endpoint::new("10.0.0.1", 8001));
    }

    #[test]
    fn endpoint_parsing() {
        let e: Endpoint = "127.0.0.1:8000".parse().unwrap();
        assert_eq!((e.host.as_str(), e.port, e.weight), ("127.0.0.1", 8000, 1));

        let e: Endpoint = "db.local:9 4".parse().unwrap();
        assert_eq!(e.weight, 4);

        let e: Endpoint = "[::1]:80".parse().unwrap();
        assert_eq!(e.host, "::1");

        assert!("nope".parse::<Endpoint>().is_err());
        assert!("h:99999".parse::<Endpoint>().is_err());
        assert!("h:1 x".parse::<Endpoint>().is_err());
    }

    #[test]
    fn diff_snapshots() {
        let a = Endpoint::new("a", 1);
        let b = Endpoint::new("b", 1);
        let c = Endpoint::new("c", 1);
        let event = NamingEvent::diff("svc", &[a.clone(), b.clone()], &[b, c.clone()]);
        assert_eq!(event.added, vec![c]);
        assert_eq!(event.removed, vec![a]);
    }

    #[test]
    fn subscribers_identity() {
        let subscribers = Subscribers::default();
        let seen = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |_: &NamingEvent| *counter.lock().unwrap() += 1);
        let other: Listener = Arc::new(|_: &NamingEvent| {});

        subscribers.add("svc", Arc::clone(&listener));
        let event = NamingEvent {
            service: "svc".into(),
            added: vec![Endpoint::new("a", 1)],
            removed: Vec::new(),
        };
        subscribers.notify(&event);
        assert!(!subscribers.remove("svc", &other));
        assert!(subscribers.remove("svc", &listener));
        subscribers.notify(&event);

        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(subscribers.services().is_empty());
    }

    #[test]
    fn registry_schemes() {
        let registry = NamingRegistry::with_defaults();
        assert_eq!(registry.schemes(), vec!["file", "list"]);
        assert!(matches!(
            registry.create("zk://127.0.0.1:2181"),
            Err(NamingError::UnknownScheme(s)) if s == "zk"
        ));
    }
}
