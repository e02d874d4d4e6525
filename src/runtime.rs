//! Process-wide services.
//!
//! A [`Runtime`] owns the things every client and server in a process should
//! share: one timer thread, one protocol registry and one naming registry.
//! Each service is created lazily on first use and exactly once. Programs that
//! want isolation (tests, mostly) build their own `Runtime`; everyone else uses
//! [`Runtime::shared`].
use std::sync::{Arc, OnceLock};

use log::info;

use crate::{
    config::RuntimeConfig, error::RpcError, naming::NamingRegistry, protocol::ProtocolRegistry,
    timer::Timer,
};

#[derive(Debug, Default)]
pub struct Runtime {
    config: RuntimeConfig,
    timer: OnceLock<Arc<Timer>>,
    protocols: OnceLock<Arc<ProtocolRegistry>>,
    naming: OnceLock<Arc<NamingRegistry>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn shared() -> &'static Runtime {
        static SHARED: OnceLock<Runtime> = OnceLock::new();
        SHARED.get_or_init(Runtime::default)
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config
    }

    pub fn timer(&self) -> Result<Arc<Timer>, RpcError> {
        if let Some(timer) = self.timer.get() {
            return Ok(Arc::clone(timer));
        }
        let timer = Arc::new(Timer::new(self.config.tick, self.config.wheel_slots)?);
        // A racing initializer may win; the spare timer stops when dropped.
        let timer = self.timer.get_or_init(|| {
            info!(
                "started timer: tick {:?}, {} slots",
                self.config.tick, self.config.wheel_slots
            );
            timer
        });
        Ok(Arc::clone(timer))
    }

    pub fn protocols(&self) -> Arc<ProtocolRegistry> {
        Arc::clone(
            self.protocols
                .get_or_init(|| Arc::new(ProtocolRegistry::with_defaults())),
        )
    }

    pub fn naming(&self) -> Arc<NamingRegistry> {
        Arc::clone(
            self.naming
                .get_or_init(|| Arc::new(NamingRegistry::with_defaults())),
        )
    }

    /// Stops the timer thread if it was started.
    pub fn shutdown(&self) {
        if let Some(timer) = self.timer.get() {
            timer.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol;

    #[test]
    fn services_are_created_once() {
        let runtime = Runtime::new(RuntimeConfig::default().tick(Duration::from_millis(2)));
        let a = runtime.timer().unwrap();
        let b = runtime.timer().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.tick(), Duration::from_millis(2));

        assert!(Arc::ptr_eq(&runtime.protocols(), &runtime.protocols()));
        assert!(Arc::ptr_eq(&runtime.naming(), &runtime.naming()));
        runtime.shutdown();
    }

    #[test]
    fn defaults_are_registered() {
        let runtime = Runtime::default();
        assert_eq!(
            runtime.protocols().ids(),
            vec![
                protocol::STANDARD,
                protocol::NSHEAD_JSON,
                protocol::NSHEAD_PROTO,
                protocol::PUSH,
                protocol::DUBBO
            ]
        );
        assert_eq!(runtime.naming().schemes(), vec!["file", "list"]);
    }

    #[test]
    fn shared_is_a_singleton() {
        assert!(std::ptr::eq(Runtime::shared(), Runtime::shared()));
    }
}
