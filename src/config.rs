//! Client, pool, server and runtime configuration.
//!
//! Every struct starts from [`Default`], can be tweaked with builder-style
//! setters, and can pick up overrides from `RELAY_*` environment variables via
//! `from_env`. An override that does not parse is a [`ConfigError`] rather than
//! a silent fallback to the default.
use std::{env, num::NonZeroUsize, str::FromStr, thread, time::Duration};

use thiserror::Error;

use crate::{
    balance::LoadBalanceKind,
    codec::Serialization,
    protocol::{self, ProtocolId},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown serialization `{0}`")]
    UnknownSerialization(String),
    #[error("unknown load balancer `{0}`")]
    UnknownLoadBalance(String),
    #[error("invalid value `{value}` for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

fn env_override<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_override::<u64>(key)?.map(Duration::from_millis))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_active: usize,
    pub min_idle: usize,
    /// How long `borrow` blocks when the pool is at `max_active`; `None` fails fast.
    pub max_wait: Option<Duration>,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 8,
            min_idle: 0,
            max_wait: Some(Duration::from_secs(1)),
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active.max(1);
        self
    }

    pub fn min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_override::<usize>("RELAY_POOL_MAX_ACTIVE")? {
            config = config.max_active(v);
        }
        if let Some(v) = env_override("RELAY_POOL_MIN_IDLE")? {
            config.min_idle = v;
        }
        if let Some(v) = env_override::<u64>("RELAY_POOL_MAX_WAIT_MS")? {
            config.max_wait = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = env_millis("RELAY_POOL_IDLE_TIMEOUT_MS")? {
            config.idle_timeout = v;
        }
        if let Some(v) = env_millis("RELAY_POOL_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = v;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub protocol: ProtocolId,
    pub load_balance: LoadBalanceKind,
    pub serialization: Serialization,
    pub timeout: Duration,
    pub max_attempts: usize,
    pub store_capacity: usize,
    pub pool: PoolConfig,
    /// Consecutive connection failures before an endpoint is isolated.
    pub failure_threshold: u32,
    pub isolation: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol: protocol::STANDARD,
            load_balance: LoadBalanceKind::RoundRobin,
            serialization: Serialization::Json,
            timeout: Duration::from_secs(3),
            max_attempts: 3,
            store_capacity: 65_536,
            pool: PoolConfig::default(),
            failure_threshold: 3,
            isolation: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn protocol(mut self, protocol: ProtocolId) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn load_balance(mut self, kind: LoadBalanceKind) -> Self {
        self.load_balance = kind;
        self
    }

    pub fn serialization(mut self, serialization: Serialization) -> Self {
        self.serialization = serialization;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = capacity.max(1);
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn isolation(mut self, isolation: Duration) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            pool: PoolConfig::from_env()?,
            ..Self::default()
        };
        if let Some(v) = env_override("RELAY_PROTOCOL")? {
            config.protocol = v;
        }
        if let Some(v) = env_override("RELAY_LOAD_BALANCE")? {
            config.load_balance = v;
        }
        if let Some(v) = env_override("RELAY_SERIALIZATION")? {
            config.serialization = v;
        }
        if let Some(v) = env_millis("RELAY_TIMEOUT_MS")? {
            config.timeout = v;
        }
        if let Some(v) = env_override::<usize>("RELAY_MAX_ATTEMPTS")? {
            config = config.max_attempts(v);
        }
        if let Some(v) = env_override::<usize>("RELAY_STORE_CAPACITY")? {
            config = config.store_capacity(v);
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub workers: usize,
    /// Largest frame body the server accepts.
    pub max_frame: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            max_frame: protocol::MAX_BODY_LEN,
        }
    }
}

impl ServerConfig {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.min(protocol::MAX_BODY_LEN);
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_override::<usize>("RELAY_SERVER_WORKERS")? {
            config = config.workers(v);
        }
        if let Some(v) = env_override::<usize>("RELAY_SERVER_MAX_FRAME")? {
            config = config.max_frame(v);
        }
        Ok(config)
    }
}

/// Shared timer settings for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub tick: Duration,
    pub wheel_slots: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            wheel_slots: 512,
        }
    }
}

impl RuntimeConfig {
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    pub fn wheel_slots(mut self, slots: usize) -> Self {
        self.wheel_slots = slots.max(1);
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_millis("RELAY_TIMER_TICK_MS")? {
            config = config.tick(v);
        }
        if let Some(v) = env_override::<usize>("RELAY_TIMER_SLOTS")? {
            config = config.wheel_slots(v);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.protocol, protocol::STANDARD);
        assert_eq!(config.timeout, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.store_capacity, 65_536);
        assert_eq!(config.pool.max_active, 8);
        assert_eq!(config.pool.max_wait, Some(Duration::from_secs(1)));

        let runtime = RuntimeConfig::default();
        assert_eq!(runtime.tick, Duration::from_millis(10));
        assert_eq!(runtime.wheel_slots, 512);
    }

    #[test]
    fn setters_clamp_to_sane_values() {
        let config = ClientConfig::default()
            .max_attempts(0)
            .store_capacity(0)
            .pool(PoolConfig::default().max_active(0));
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.store_capacity, 1);
        assert_eq!(config.pool.max_active, 1);
    }

    #[test]
    fn env_overrides() {
        // Test-unique variable names; the process environment is shared.
        unsafe {
            env::set_var("RELAY_TEST_GOOD", "250");
            env::set_var("RELAY_TEST_BAD", "soon");
        }

        assert_eq!(
            env_millis("RELAY_TEST_GOOD").unwrap(),
            Some(Duration::from_millis(250))
        );
        assert!(matches!(
            env_millis("RELAY_TEST_BAD"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(env_millis("RELAY_TEST_MISSING").unwrap(), None);
    }
}
