use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use super::{
    Endpoint, Listener, NamingError, NamingEvent, NamingFactory, NamingService, NamingUrl,
    Subscribers,
};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

struct FileShared {
    dir: PathBuf,
    interval: Duration,
    subscribers: Subscribers,
    snapshots: Mutex<HashMap<String, Vec<Endpoint>>>,
    // serializes snapshot refreshes with subscription changes
    sync: Mutex<()>,
    writes: Mutex<()>,
    stopped: Mutex<bool>,
    wakeup: Condvar,
}

impl FileShared {
    fn path(&self, service: &str) -> Result<PathBuf, NamingError> {
        let valid = !service.is_empty()
            && !service.starts_with('.')
            && !service.contains(['/', '\\']);
        if !valid {
            return Err(NamingError::Backend {
                backend: "file",
                reason: format!("`{service}` is not a usable file name"),
            });
        }
        Ok(self.dir.join(service))
    }

    fn read(&self, service: &str) -> Result<Vec<Endpoint>, NamingError> {
        let path = self.path(service)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut endpoints: Vec<Endpoint> = Vec::new();
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<Endpoint>() {
                Ok(endpoint) if !endpoints.contains(&endpoint) => endpoints.push(endpoint),
                Ok(_) => {}
                Err(e) => warn!("{}: skipping line: {e}", path.display()),
            }
        }
        Ok(endpoints)
    }

    fn write(&self, service: &str, endpoints: &[Endpoint]) -> Result<(), NamingError> {
        let path = self.path(service)?;
        let tmp = self.dir.join(format!(".{service}.tmp"));
        {
            let mut file = fs::File::create(&tmp)?;
            for endpoint in endpoints {
                writeln!(file, "{endpoint} {}", endpoint.weight)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn modify<F>(&self, service: &str, f: F) -> Result<(), NamingError>
    where
        F: FnOnce(&mut Vec<Endpoint>),
    {
        {
            let _guard = self.writes.lock();
            let mut endpoints = self.read(service)?;
            f(&mut endpoints);
            self.write(service, &endpoints)?;
        }
        let _sync = self.sync.lock();
        self.refresh(service)?;
        Ok(())
    }

    /// Re-reads one service, notifying its subscribers of any difference.
    /// Callers hold `sync`.
    fn refresh(&self, service: &str) -> Result<Vec<Endpoint>, NamingError> {
        let current = self.read(service)?;
        let before = self
            .snapshots
            .lock()
            .insert(service.to_string(), current.clone())
            .unwrap_or_default();
        self.subscribers
            .notify(&NamingEvent::diff(service, &before, &current));
        Ok(current)
    }

    fn poll(&self) {
        loop {
            {
                let mut stopped = self.stopped.lock();
                if !*stopped {
                    self.wakeup.wait_for(&mut stopped, self.interval);
                }
                if *stopped {
                    break;
                }
            }

            for service in self.subscribers.services() {
                let _sync = self.sync.lock();
                if let Err(e) = self.refresh(&service) {
                    warn!("polling {service} in {} failed: {e}", self.dir.display());
                }
            }
        }
        debug!("file naming poller for {} exiting", self.dir.display());
    }
}

/// Directory backend: `file:///path/to/dir?interval_ms=N`.
///
/// Each service is one file holding `host:port [weight]` lines. A poller
/// thread re-reads subscribed services every interval, so edits made by other
/// processes reach subscribers within one interval.
pub struct FileNamingService {
    shared: Arc<FileShared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl FileNamingService {
    pub fn new(dir: impl AsRef<Path>, interval: Duration) -> Result<Self, NamingError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let shared = Arc::new(FileShared {
            dir,
            interval: interval.max(Duration::from_millis(1)),
            subscribers: Subscribers::default(),
            snapshots: Mutex::new(HashMap::new()),
            sync: Mutex::new(()),
            writes: Mutex::new(()),
            stopped: Mutex::new(false),
            wakeup: Condvar::new(),
        });
        let runner = Arc::clone(&shared);
        let poller = thread::Builder::new()
            .name("relay-naming-file".into())
            .spawn(move || runner.poll())?;

        info!(
            "file naming at {} polling every {:?}",
            shared.dir.display(),
            shared.interval
        );
        Ok(Self {
            shared,
            poller: Mutex::new(Some(poller)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }
}

impl NamingService for FileNamingService {
    fn name(&self) -> &'static str {
        "file"
    }

    fn register(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError> {
        self.shared.modify(service, |list| {
            match list.iter_mut().find(|e| *e == endpoint) {
                Some(existing) => *existing = endpoint.clone(),
                None => list.push(endpoint.clone()),
            }
        })
    }

    fn unregister(&self, service: &str, endpoint: &Endpoint) -> Result<(), NamingError> {
        self.shared
            .modify(service, |list| list.retain(|e| e != endpoint))
    }

    fn subscribe(&self, service: &str, listener: Listener) -> Result<(), NamingError> {
        let _sync = self.shared.sync.lock();
        let current = self.shared.refresh(service)?;
        self.shared.subscribers.add(service, Arc::clone(&listener));
        if !current.is_empty() {
            listener.notify(&NamingEvent {
                service: service.to_string(),
                added: current,
                removed: Vec::new(),
            });
        }
        Ok(())
    }

    fn unsubscribe(&self, service: &str, listener: &Listener) -> Result<(), NamingError> {
        let _sync = self.shared.sync.lock();
        self.shared.subscribers.remove(service, listener);
        if !self.shared.subscribers.services().iter().any(|s| s == service) {
            self.shared.snapshots.lock().remove(service);
        }
        Ok(())
    }

    fn lookup(&self, service: &str) -> Result<Vec<Endpoint>, NamingError> {
        self.shared.read(service)
    }

    fn close(&self) {
        *self.shared.stopped.lock() = true;
        self.shared.wakeup.notify_all();
        if let Some(poller) = self.poller.lock().take() {
            if poller.thread().id() != thread::current().id() && poller.join().is_err() {
                warn!("file naming poller panicked");
            }
        }
    }
}

impl Drop for FileNamingService {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct FileFactory;

impl NamingFactory for FileFactory {
    fn scheme(&self) -> &'static str {
        "file"
    }

    fn create(&self, url: &NamingUrl) -> Result<Arc<dyn NamingService>, NamingError> {
        let dir = format!("{}{}", url.authority, url.path);
        if dir.is_empty() {
            return Err(NamingError::InvalidUrl {
                url: url.raw.clone(),
                reason: "missing directory".into(),
            });
        }
        let interval = url.duration_ms("interval_ms", DEFAULT_INTERVAL)?;
        Ok(Arc::new(FileNamingService::new(dir, interval)?))
    }
}
