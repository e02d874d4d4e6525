//! Pooled connections per endpoint.
//!
//! # Overview
//!
//! A [`ConnectionPool`] owns every connection to one endpoint. Callers
//! [`borrow`](ConnectionPool::borrow) a connection and get a [`Lease`] back; the
//! connection is theirs alone until the lease is dropped, at which point it is
//! revalidated and either parked as idle or destroyed.
//!
//! The pool never holds its lock while connecting: a slot is reserved under the
//! lock, the connection is created outside it, and a failed attempt gives the
//! slot back and wakes a waiter.
//!
//! # Key Components
//!
//! - [`PoolConfig`](crate::config::PoolConfig): bounds, waits and idle timeouts.
//! - [`Lease`]: RAII guard; [`Lease::invalidate`] makes the drop destroy the
//!   connection instead of returning it.
//! - [`PoolSet`]: one pool per endpoint, created on demand.
use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info};
use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;

use crate::{config::PoolConfig, naming::Endpoint, transport::Connection};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool for {endpoint} exhausted (waited {waited:?})")]
    Exhausted {
        endpoint: String,
        waited: Option<Duration>,
    },
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("connection pool for {endpoint} is closed")]
    Closed { endpoint: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Borrowed,
    Invalid,
}

/// Opens new connections for a pool.
pub trait ConnectionFactory<C>: Send + Sync {
    fn create(&self, endpoint: &Endpoint) -> io::Result<C>;
}

impl<C, F> ConnectionFactory<C> for F
where
    F: Fn(&Endpoint) -> io::Result<C> + Send + Sync,
{
    fn create(&self, endpoint: &Endpoint) -> io::Result<C> {
        self(endpoint)
    }
}

#[derive(Debug)]
pub struct PooledConnection<C> {
    id: u64,
    endpoint: Endpoint,
    conn: Arc<C>,
    state: ConnectionState,
    last_used: Instant,
}

impl<C: Connection> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn conn(&self) -> &Arc<C> {
        &self.conn
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn is_valid(&self) -> bool {
        self.state != ConnectionState::Invalid && self.conn.is_open() && self.conn.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub borrowed: usize,
    /// Idle, borrowed and currently connecting.
    pub total: usize,
}

struct PoolState<C> {
    /// Most recently returned last.
    idle: Vec<PooledConnection<C>>,
    borrowed: usize,
    total: usize,
    closed: bool,
}

struct PoolInner<C> {
    endpoint: Endpoint,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<C>>,
    state: Mutex<PoolState<C>>,
    available: Condvar,
    next_id: AtomicU64,
}

impl<C: Connection> PoolInner<C> {
    fn give_back(&self, mut pooled: PooledConnection<C>) {
        let mut state = self.state.lock();
        state.borrowed -= 1;
        if state.closed || !pooled.is_valid() {
            state.total -= 1;
            drop(state);
            debug!("destroying connection {} to {}", pooled.id, self.endpoint);
            pooled.conn.close();
        } else {
            pooled.state = ConnectionState::Idle;
            pooled.last_used = Instant::now();
            state.idle.push(pooled);
        }
        self.available.notify_one();
    }
}

pub struct ConnectionPool<C: Connection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection + 'static> ConnectionPool<C> {
    pub fn new(
        endpoint: Endpoint,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                endpoint,
                config,
                factory,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    borrowed: 0,
                    total: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Hands out an exclusive connection.
    ///
    /// Reuses the most recently returned valid idle connection, opens a new one
    /// while below `max_active`, and otherwise waits up to `max_wait` for one to
    /// come back.
    pub fn borrow(&self) -> Result<Lease<C>, PoolError> {
        let inner = &self.inner;
        let max_wait = inner.config.max_wait;
        let deadline = max_wait.map(|wait| Instant::now() + wait);
        let mut state = inner.state.lock();

        loop {
            if state.closed {
                return Err(PoolError::Closed {
                    endpoint: inner.endpoint.to_string(),
                });
            }

            while let Some(mut pooled) = state.idle.pop() {
                if pooled.is_valid() {
                    pooled.state = ConnectionState::Borrowed;
                    state.borrowed += 1;
                    return Ok(Lease::new(Arc::clone(inner), pooled));
                }
                state.total -= 1;
                debug!("dropping stale idle connection {} to {}", pooled.id, inner.endpoint);
                pooled.conn.close();
            }

            if state.total < inner.config.max_active {
                state.total += 1;
                drop(state);
                return self.open();
            }

            let Some(deadline) = deadline else {
                return Err(PoolError::Exhausted {
                    endpoint: inner.endpoint.to_string(),
                    waited: None,
                });
            };
            if Instant::now() >= deadline {
                return Err(PoolError::Exhausted {
                    endpoint: inner.endpoint.to_string(),
                    waited: max_wait,
                });
            }
            inner.available.wait_until(&mut state, deadline);
        }
    }

    /// Opens a connection into a slot already reserved in `total`.
    fn open(&self) -> Result<Lease<C>, PoolError> {
        let inner = &self.inner;
        match inner.factory.create(&inner.endpoint) {
            Ok(conn) => {
                let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                info!("opened connection {id} to {}", inner.endpoint);
                let pooled = PooledConnection {
                    id,
                    endpoint: inner.endpoint.clone(),
                    conn: Arc::new(conn),
                    state: ConnectionState::Borrowed,
                    last_used: Instant::now(),
                };
                inner.state.lock().borrowed += 1;
                Ok(Lease::new(Arc::clone(inner), pooled))
            }
            Err(source) => {
                inner.state.lock().total -= 1;
                inner.available.notify_one();
                Err(PoolError::Connect {
                    endpoint: inner.endpoint.to_string(),
                    source,
                })
            }
        }
    }

    /// Returns a borrowed connection; invalid ones are destroyed.
    pub fn give_back(&self, lease: Lease<C>) {
        drop(lease);
    }

    /// Closes a borrowed connection and frees its slot.
    pub fn destroy(&self, mut lease: Lease<C>) {
        lease.invalidate();
        drop(lease);
    }

    pub fn validate(&self, pooled: &PooledConnection<C>) -> bool {
        pooled.is_valid()
    }

    /// Destroys idle connections unused for longer than `idle_timeout`, keeping
    /// at least `min_idle`. Returns how many were destroyed.
    pub fn reap_idle(&self, now: Instant) -> usize {
        let inner = &self.inner;
        let mut reaped = Vec::new();
        {
            let mut state = inner.state.lock();
            let mut keep = Vec::with_capacity(state.idle.len());
            // Oldest first.
            let idle = std::mem::take(&mut state.idle);
            let mut remaining = idle.len();
            for pooled in idle {
                let expired = now.saturating_duration_since(pooled.last_used) > inner.config.idle_timeout;
                if !pooled.is_valid() || (expired && remaining > inner.config.min_idle) {
                    remaining -= 1;
                    reaped.push(pooled);
                } else {
                    keep.push(pooled);
                }
            }
            state.idle = keep;
            state.total -= reaped.len();
        }

        for pooled in &reaped {
            pooled.conn.close();
        }
        if !reaped.is_empty() {
            info!("reaped {} idle connections to {}", reaped.len(), inner.endpoint);
            inner.available.notify_all();
        }
        reaped.len()
    }

    /// Closes idle connections and refuses further borrows. Borrowed
    /// connections are destroyed as their leases drop.
    pub fn close(&self) {
        let idle = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.total -= idle.len();
            idle
        };
        for pooled in idle {
            pooled.conn.close();
        }
        self.inner.available.notify_all();
        info!("closed connection pool for {}", self.inner.endpoint);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            borrowed: state.borrowed,
            total: state.total,
        }
    }
}

/// Exclusive use of one pooled connection.
pub struct Lease<C: Connection> {
    pool: Arc<PoolInner<C>>,
    pooled: Option<PooledConnection<C>>,
}

impl<C: Connection> Lease<C> {
    fn new(pool: Arc<PoolInner<C>>, pooled: PooledConnection<C>) -> Self {
        Self {
            pool,
            pooled: Some(pooled),
        }
    }

    pub fn conn(&self) -> &Arc<C> {
        &self.pooled().conn
    }

    pub fn id(&self) -> u64 {
        self.pooled().id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.pooled().endpoint
    }

    /// Destroy the connection instead of returning it when this lease drops.
    pub fn invalidate(&mut self) {
        if let Some(pooled) = self.pooled.as_mut() {
            pooled.state = ConnectionState::Invalid;
        }
    }

    fn pooled(&self) -> &PooledConnection<C> {
        match &self.pooled {
            Some(pooled) => pooled,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<C: Connection> Drop for Lease<C> {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            self.pool.give_back(pooled);
        }
    }
}

/// One pool per endpoint.
pub struct PoolSet<C: Connection> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<C>>,
    pools: RwLock<HashMap<Endpoint, ConnectionPool<C>>>,
}

impl<C: Connection + 'static> PoolSet<C> {
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory<C>>) -> Self {
        Self {
            config,
            factory,
            pools: RwLock::new(HashMap::new()),
        }
    }

    pub fn pool(&self, endpoint: &Endpoint) -> ConnectionPool<C> {
        if let Some(pool) = self.pools.read().get(endpoint) {
            return pool.clone();
        }
        self.pools
            .write()
            .entry(endpoint.clone())
            .or_insert_with(|| {
                ConnectionPool::new(endpoint.clone(), self.config.clone(), Arc::clone(&self.factory))
            })
            .clone()
    }

    pub fn borrow(&self, endpoint: &Endpoint) -> Result<Lease<C>, PoolError> {
        self.pool(endpoint).borrow()
    }

    /// Closes and forgets the pool of an endpoint that went away.
    pub fn remove(&self, endpoint: &Endpoint) {
        if let Some(pool) = self.pools.write().remove(endpoint) {
            pool.close();
        }
    }

    pub fn reap_idle(&self, now: Instant) -> usize {
        let pools: Vec<_> = self.pools.read().values().cloned().collect();
        pools.iter().map(|pool| pool.reap_idle(now)).sum()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.pools.read().keys().cloned().collect()
    }

    pub fn close_all(&self) {
        let pools: Vec<_> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close();
        }
    }
}
