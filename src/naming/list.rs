use std::{collections::HashMap, sync::Arc};

use log::debug;
use parking_lot::RwLock;

use super::{
    Endpoint, Listener, NamingError, NamingEvent, NamingFactory, NamingService, NamingUrl,
    Subscribers,
};

/// In-memory backend: `list://host:port,host:port`.
///
/// Every service starts out with the endpoints from the URL; `register` and
/// `unregister` change one service's list and notify its subscribers at once.
#[derive(Default)]
pub struct ListNamingService {
    seed: Vec<Endpoint>,
    services: RwLock<HashMap<String, Vec<Endpoint>>>,
    subscribers: Subscribers,
}

impl ListNamingService {
    pub fn new(seed: Vec<Endpoint>) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    fn snapshot(&self, service: &str) -> Vec<Endpoint> {
        self.services
            .read()
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.seed.clone())
    }

    fn modify<F>(&self, service: &str, f: F)
    where
        F: FnOnce(&mut Vec<Endpoint>),
    {
        let event = {
            let mut services = self.services.write();
            let list = services
                .entry(service.to_string())
                .or_insert_with(|| self.seed.clone());
            let before = list.clone();
            f(list);
            NamingEvent::diff(service, &before, list)
        };
        self.subscribers.notify(&event);
    }
}

impl NamingService for ListNamingService {
    fn name(&self) -> &'static str {
        "list"
    }

    fn register(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError> {
        debug!("list naming: register {endpoint} for {service}");
        self.modify(service, |list| {
            match list.iter_mut().find(|e| *e == endpoint) {
                Some(existing) => *existing = endpoint.clone(),
                None => list.push(endpoint.clone()),
            }
        });
        Ok(())
    }

    fn unregister(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError> {
        debug!("list naming: unregister {endpoint} for {service}");
        self.modify(service, |list| list.retain(|e| e != endpoint));
        Ok(())
    }

    fn subscribe(&self, service: &str, listener: Listener) -> Result<(), NamingError> {
        let initial = NamingEvent {
            service: service.to_string(),
            added: self.snapshot(service),
            removed: Vec::new(),
        };
        self.subscribers.add(service, Arc::clone(&listener));
        if !initial.is_empty() {
            listener.notify(&initial);
        }
        Ok(())
    }

    fn unsubscribe(&self, service: &str, listener: &Listener) -> Result<(), NamingError> {
        self.subscribers.remove(service, listener);
        Ok(())
    }

    fn lookup(&self, service: &str) -> Result<Vec<Endpoint>, NamingError> {
        Ok(self.snapshot(service))
    }
}

pub(crate) struct ListFactory;

impl NamingFactory for ListFactory {
    fn scheme(&self) -> &'static str {
        "list"
    }

    fn create(&self, url: &NamingUrl) -> Result<Arc<dyn NamingService>, NamingError> {
        Ok(Arc::new(ListNamingService::new(url.hosts()?)))
    }
}
