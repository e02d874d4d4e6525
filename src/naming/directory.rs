use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use log::{info, warn};
use parking_lot::Mutex;

use super::{Endpoint, NamingEvent, NotifyListener};

#[derive(Debug, Default, Clone, Copy)]
struct Health {
    failures: u32,
    isolated_until: Option<Instant>,
}

/// The endpoints of one service as seen by its subscription.
///
/// Readers get a lock-free snapshot; naming events swap in a new one.
/// Endpoints that fail `failure_threshold` times in a row are left out of
/// [`healthy`](Self::healthy) for the isolation period.
pub struct ServiceDirectory {
    service: String,
    endpoints: ArcSwap<Vec<Endpoint>>,
    health: Mutex<HashMap<Endpoint, Health>>,
    failure_threshold: u32,
    isolation: Duration,
}

impl ServiceDirectory {
    pub fn new(service: impl Into<String>, failure_threshold: u32, isolation: Duration) -> Self {
        Self {
            service: service.into(),
            endpoints: ArcSwap::from_pointee(Vec::new()),
            health: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            isolation,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn endpoints(&self) -> Arc<Vec<Endpoint>> {
        self.endpoints.load_full()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.load().is_empty()
    }

    /// Endpoints not currently isolated.
    pub fn healthy(&self) -> Vec<Endpoint> {
        let endpoints = self.endpoints.load();
        let now = Instant::now();
        let health = self.health.lock();
        endpoints
            .iter()
            .filter(|e| {
                health
                    .get(*e)
                    .and_then(|h| h.isolated_until)
                    .is_none_or(|until| until <= now)
            })
            .cloned()
            .collect()
    }

    pub fn is_isolated(&self, endpoint: &Endpoint) -> bool {
        self.health
            .lock()
            .get(endpoint)
            .and_then(|h| h.isolated_until)
            .is_some_and(|until| until > Instant::now())
    }

    /// Replaces the whole snapshot, e.g. from a lookup.
    pub fn replace(&self, endpoints: Vec<Endpoint>) {
        let before = self.endpoints.swap(Arc::new(endpoints));
        let after = self.endpoints.load();
        self.forget(&NamingEvent::diff(&self.service, &before, &after).removed);
    }

    pub fn apply(&self, event: &NamingEvent) {
        if event.service != self.service || event.is_empty() {
            return;
        }
        self.endpoints.rcu(|current| {
            let mut next: Vec<Endpoint> = current
                .iter()
                .filter(|e| !event.removed.contains(e))
                .cloned()
                .collect();
            for endpoint in &event.added {
                match next.iter_mut().find(|e| *e == endpoint) {
                    Some(existing) => *existing = endpoint.clone(),
                    None => next.push(endpoint.clone()),
                }
            }
            next
        });
        self.forget(&event.removed);
        info!(
            "{}: {} endpoints after +{} -{}",
            self.service,
            self.endpoints.load().len(),
            event.added.len(),
            event.removed.len()
        );
    }

    fn forget(&self, removed: &[Endpoint]) {
        if removed.is_empty() {
            return;
        }
        let mut health = self.health.lock();
        for endpoint in removed {
            health.remove(endpoint);
        }
    }

    /// Returns `true` when this failure isolated the endpoint.
    pub fn report_failure(&self, endpoint: &Endpoint) -> bool {
        let mut health = self.health.lock();
        let entry = health.entry(endpoint.clone()).or_default();
        entry.failures += 1;
        if entry.failures < self.failure_threshold {
            return false;
        }
        entry.failures = 0;
        entry.isolated_until = Some(Instant::now() + self.isolation);
        warn!(
            "{}: isolating {endpoint} for {:?}",
            self.service, self.isolation
        );
        true
    }

    pub fn report_success(&self, endpoint: &Endpoint) {
        let mut health = self.health.lock();
        if let Some(entry) = health.get_mut(endpoint) {
            if entry.failures > 0 || entry.isolated_until.is_some() {
                *entry = Health::default();
            }
        }
    }
}

impl NotifyListener for ServiceDirectory {
    fn notify(&self, event: &NamingEvent) {
        self.apply(event);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::naming::{ListNamingService, Listener, NamingService};

    fn event(added: &[Endpoint], removed: &[Endpoint]) -> NamingEvent {
        NamingEvent {
            service: "svc".into(),
            added: added.to_vec(),
            removed: removed.to_vec(),
        }
    }

    #[test]
    fn applies_events() {
        let directory = ServiceDirectory::new("svc", 3, Duration::from_secs(5));
        let a = Endpoint::new("a", 1);
        let b = Endpoint::new("b", 1);

        directory.apply(&event(&[a.clone(), b.clone()], &[]));
        directory.apply(&event(&[a.clone().with_weight(4)], &[b.clone()]));

        let endpoints = directory.endpoints();
        assert_eq!(*endpoints, vec![a]);
        assert_eq!(endpoints[0].weight, 4);

        directory.apply(&NamingEvent {
            service: "other".into(),
            added: vec![b],
            removed: Vec::new(),
        });
        assert_eq!(directory.endpoints().len(), 1);
    }

    #[test]
    fn isolates_after_consecutive_failures() {
        let directory = ServiceDirectory::new("svc", 2, Duration::from_millis(50));
        let a = Endpoint::new("a", 1);
        let b = Endpoint::new("b", 1);
        directory.replace(vec![a.clone(), b.clone()]);

        assert!(!directory.report_failure(&a));
        directory.report_success(&a);
        assert!(!directory.report_failure(&a));
        assert!(directory.report_failure(&a));
        assert!(directory.is_isolated(&a));
        assert_eq!(directory.healthy(), vec![b]);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(directory.healthy().len(), 2);
    }

    #[test]
    fn removal_forgets_health() {
        let directory = ServiceDirectory::new("svc", 1, Duration::from_secs(60));
        let a = Endpoint::new("a", 1);
        directory.replace(vec![a.clone()]);
        directory.report_failure(&a);
        assert!(directory.healthy().is_empty());

        directory.apply(&event(&[], &[a.clone()]));
        directory.apply(&event(&[a.clone()], &[]));
        assert_eq!(directory.healthy(), vec![a]);
    }

    #[test]
    fn follows_a_subscription() {
        let naming = ListNamingService::new(vec![Endpoint::new("a", 1)]);
        let directory = Arc::new(ServiceDirectory::new("svc", 3, Duration::from_secs(5)));
        let listener: Listener = directory.clone();
        naming.subscribe("svc", listener).unwrap();
        assert_eq!(directory.endpoints().len(), 1);

        naming.register("svc", &Endpoint::new("b", 1)).unwrap();
        naming.unregister("svc", &Endpoint::new("a", 1)).unwrap();
        assert_eq!(*directory.endpoints(), vec![Endpoint::new("b", 1)]);
    }
}
