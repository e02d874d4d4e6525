use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use log::debug;
use serde::de::DeserializeOwned;

use crate::{
    codec::Serialization,
    error::RpcError,
    store::{CallResult, Completion, FutureStore},
};

/// How long a waiter lingers past the deadline for the timer to fire.
const DEADLINE_GRACE: Duration = Duration::from_millis(50);

/// Handle to an outstanding call.
///
/// The outcome can be collected once, either by [`wait`](Self::wait) or by a
/// successful [`wait_timeout`](Self::wait_timeout).
#[derive(Debug)]
pub struct RpcFuture {
    log_id: u64,
    completion: Arc<Completion>,
    store: Weak<FutureStore>,
    deadline: Instant,
    serialization: Serialization,
    ready: Option<CallResult>,
}

impl RpcFuture {
    pub(crate) fn new(
        log_id: u64,
        completion: Arc<Completion>,
        store: &Arc<FutureStore>,
        deadline: Instant,
        serialization: Serialization,
    ) -> Self {
        Self {
            log_id,
            completion,
            store: Arc::downgrade(store),
            deadline,
            serialization,
            ready: None,
        }
    }

    /// A future whose outcome is already known.
    pub(crate) fn ready(log_id: u64, result: CallResult, serialization: Serialization) -> Self {
        Self {
            log_id,
            completion: Completion::new(),
            store: Weak::new(),
            deadline: Instant::now(),
            serialization,
            ready: Some(result),
        }
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.ready.is_some() || self.completion.is_done()
    }

    /// Blocks until the call finishes or its deadline passes.
    pub fn wait(mut self) -> CallResult {
        if let Some(result) = self.ready.take() {
            return result;
        }
        match self.completion.wait_until(self.deadline + DEADLINE_GRACE) {
            Some((_, result)) => result,
            None => self.expire(),
        }
    }

    /// Waits at most `timeout`; `None` if the call is still running.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<CallResult> {
        if let Some(result) = self.ready.take() {
            return Some(result);
        }
        self.completion
            .wait_until(Instant::now() + timeout)
            .map(|(_, result)| result)
    }

    /// Waits and decodes the response payload with the client's serialization.
    pub fn wait_as<T: DeserializeOwned>(self) -> Result<T, RpcError> {
        let serialization = self.serialization;
        let response = self.wait()?;
        Ok(serialization.deserialize(&response.payload)?)
    }

    /// Returns `true` if the call was still outstanding and is now cancelled.
    pub fn cancel(&self) -> bool {
        match self.store.upgrade().and_then(|store| store.take(self.log_id)) {
            Some(call) => {
                debug!("cancelling call {}", self.log_id);
                call.cancel();
                true
            }
            None => false,
        }
    }

    // The timer missed the deadline; finish the call here.
    fn expire(&self) -> CallResult {
        if let Some(call) = self.store.upgrade().and_then(|store| store.take(self.log_id)) {
            call.time_out();
        }
        match self.completion.wait_until(Instant::now() + DEADLINE_GRACE) {
            Some((_, result)) => result,
            None => Err(RpcError::Timeout {
                log_id: self.log_id,
                elapsed: self.deadline.elapsed(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::{
        message::{Request, Response},
        store::PendingCall,
    };

    fn pending(store: &Arc<FutureStore>, timeout: Duration) -> RpcFuture {
        let completion = Completion::new();
        let call = PendingCall::new(Request::new("svc", "m", Vec::new()), timeout)
            .with_completion(Arc::clone(&completion));
        let deadline = call.deadline();
        let id = store.put(call).unwrap();
        RpcFuture::new(id, completion, store, deadline, Serialization::Json)
    }

    #[test]
    fn completes_from_another_thread() {
        let store = Arc::new(FutureStore::new(8));
        let future = pending(&store, Duration::from_secs(5));
        let id = future.log_id();

        let completer = Arc::clone(&store);
        thread::spawn(move || {
            let call = completer.take(id).unwrap();
            call.complete(Response::ok(id, b"\"hi\"".to_vec()));
        });

        assert_eq!(future.wait_as::<String>().unwrap(), "hi");
        assert!(store.is_empty());
    }

    #[test]
    fn expires_without_a_timer() {
        let store = Arc::new(FutureStore::new(8));
        let future = pending(&store, Duration::from_millis(10));
        let id = future.log_id();
        assert!(matches!(future.wait(), Err(RpcError::Timeout { log_id, .. }) if log_id == id));
        assert!(store.take(id).is_none());
    }

    #[test]
    fn cancel_is_once() {
        let store = Arc::new(FutureStore::new(8));
        let future = pending(&store, Duration::from_secs(5));
        assert!(future.cancel());
        assert!(!future.cancel());
        assert!(future.is_done());
        assert!(matches!(future.wait(), Err(RpcError::Cancelled { .. })));
    }

    #[test]
    fn wait_timeout_leaves_call_running() {
        let store = Arc::new(FutureStore::new(8));
        let mut future = pending(&store, Duration::from_secs(5));
        assert!(future.wait_timeout(Duration::from_millis(5)).is_none());
        assert_eq!(store.len(), 1);

        let ready = RpcFuture::ready(0, Err(RpcError::NoProvider { service: "svc".into() }), Serialization::Json);
        assert!(ready.is_done());
        assert!(matches!(ready.wait(), Err(RpcError::NoProvider { .. })));
    }
}
