//! Correlation of outstanding calls with their results.
//!
//! # Overview
//!
//! Every call that is waiting for a response lives in the [`FutureStore`] as a
//! [`PendingCall`], keyed by its correlation id (`log_id`). The reader thread
//! that decodes a response, the timer that enforces the deadline and the caller
//! that cancels all race for the same entry; whoever wins [`FutureStore::take`]
//! owns the call and is the only one allowed to finish it.
//!
//! The store is a fixed table of `N` slots. Ids come from a monotonically
//! increasing sequence: an id lives in slot `id % N` and `id / N` is its
//! generation. `take` only succeeds when the occupant's full id matches, so a
//! late response for a call that timed out can never complete whichever call
//! later reused the slot.
//!
//! # Key Components
//!
//! - [`PendingCall`]: the call's continuation (waiter, callback, completion
//!   hooks), its deadline timer and the connection lease it holds.
//! - [`Completion`]: the rendezvous a blocked caller waits on.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::{
    error::RpcError,
    message::{Request, Response},
    timer::TimerHandle,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("future store is full ({capacity} calls outstanding)")]
    Full { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

pub type CallResult = Result<Response, RpcError>;

/// Invoked exactly once with the call's outcome.
pub type Callback = Box<dyn FnOnce(CallResult) + Send + 'static>;

/// Runs before the outcome is published and may rewrite it.
pub type Finisher = Box<dyn FnOnce(&mut CallResult) + Send + 'static>;

/// One-shot slot a caller can block on.
#[derive(Debug, Default)]
pub struct Completion {
    outcome: Mutex<Option<(CallState, CallResult)>>,
    ready: Condvar,
    done: std::sync::atomic::AtomicBool,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn publish(&self, state: CallState, result: CallResult) {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() && !self.done.load(Ordering::Acquire) {
            *outcome = Some((state, result));
            self.done.store(true, Ordering::Release);
            self.ready.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Blocks until the outcome is published or `deadline` passes.
    pub fn wait_until(&self, deadline: Instant) -> Option<(CallState, CallResult)> {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.ready.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.take()
    }

    pub fn try_take(&self) -> Option<(CallState, CallResult)> {
        self.outcome.lock().take()
    }
}

pub struct PendingCall {
    log_id: u64,
    request: Request,
    created: Instant,
    deadline: Instant,
    endpoint: Option<String>,
    completion: Option<Arc<Completion>>,
    callback: Option<Callback>,
    finisher: Option<Finisher>,
    timer: Option<TimerHandle>,
    lease: Option<Box<dyn Send>>,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("log_id", &self.log_id)
            .field("service", &self.request.service)
            .field("method", &self.request.method)
            .field("endpoint", &self.endpoint)
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl PendingCall {
    /// `request` is kept for completion hooks; pass its header, not the payload.
    pub fn new(request: Request, timeout: Duration) -> Self {
        let created = Instant::now();
        Self {
            log_id: 0,
            request,
            created,
            deadline: created + timeout,
            endpoint: None,
            completion: None,
            callback: None,
            finisher: None,
            timer: None,
            lease: None,
        }
    }

    pub fn with_completion(mut self, completion: Arc<Completion>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_finisher(mut self, finisher: Finisher) -> Self {
        self.finisher = Some(finisher);
        self
    }

    pub fn log_id(&self) -> u64 {
        self.log_id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.endpoint = Some(endpoint.into());
    }

    pub fn attach_timer(&mut self, timer: TimerHandle) {
        if let Some(previous) = self.timer.replace(timer) {
            previous.cancel();
        }
    }

    /// Hands the connection lease to the call; it is released when the call ends.
    pub fn attach_lease(&mut self, lease: Box<dyn Send>) {
        self.lease = Some(lease);
    }

    pub fn complete(self, response: Response) {
        if response.is_ok() {
            self.finish(CallState::Completed, Ok(response));
        } else {
            let err = RpcError::Remote {
                status: response.status,
                message: response.error.unwrap_or_default(),
            };
            self.finish(CallState::Failed, Err(err));
        }
    }

    pub fn fail(self, err: RpcError) {
        self.finish(CallState::Failed, Err(err));
    }

    pub fn time_out(self) {
        let err = RpcError::Timeout {
            log_id: self.log_id,
            elapsed: self.created.elapsed(),
        };
        self.finish(CallState::TimedOut, Err(err));
    }

    pub fn cancel(self) {
        let err = RpcError::Cancelled {
            log_id: self.log_id,
        };
        self.finish(CallState::Cancelled, Err(err));
    }

    /// Detaches the call from its timer and connection without publishing
    /// anything, so it can be stored again for another attempt.
    pub fn abandon(mut self) -> Self {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        drop(self.lease.take());
        self.endpoint = None;
        self
    }

    fn finish(mut self, state: CallState, mut result: CallResult) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        if let Some(finisher) = self.finisher.take() {
            finisher(&mut result);
        }
        drop(self.lease.take());

        trace!("call {} finished as {state:?}", self.log_id);
        if let Some(callback) = self.callback.take() {
            callback(result);
        } else if let Some(completion) = self.completion.take() {
            completion.publish(state, result);
        }
    }
}

/// Read-only view of a stored call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub log_id: u64,
    pub state: CallState,
    pub service: String,
    pub method: String,
    pub endpoint: Option<String>,
    pub created: Instant,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct FutureStore {
    slots: Box<[Mutex<Option<PendingCall>>]>,
    sequence: AtomicU64,
    len: AtomicUsize,
}

impl FutureStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            // Zero is the id of uncorrelated frames.
            sequence: AtomicU64::new(1),
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, id: u64) -> &Mutex<Option<PendingCall>> {
        &self.slots[(id % self.slots.len() as u64) as usize]
    }

    pub fn generation(&self, id: u64) -> u64 {
        id / self.slots.len() as u64
    }

    /// Stores `call` under a fresh id.
    ///
    /// Tries `capacity` fresh ids, then sweeps the table once, since ids drawn
    /// concurrently by other callers may have hidden a free slot. When both come
    /// up empty the store is full: the call is failed with [`StoreError::Full`]
    /// so its waiter or callback still hears about it.
    pub fn put(&self, call: PendingCall) -> Result<u64, StoreError> {
        let call = match self.claim_next(call) {
            Ok(id) => return Ok(id),
            Err(call) => call,
        };
        let call = match self.sweep(call) {
            Ok(id) => return Ok(id),
            Err(call) => call,
        };

        let err = StoreError::Full {
            capacity: self.capacity(),
        };
        debug!("{err}");
        call.fail(err.clone().into());
        Err(err)
    }

    fn claim_next(&self, call: PendingCall) -> Result<u64, PendingCall> {
        for _ in 0..self.slots.len() {
            let id = self.sequence.fetch_add(1, Ordering::Relaxed);
            let mut slot = self.slot(id).lock();
            if slot.is_none() {
                return Ok(self.occupy(&mut slot, call, id));
            }
        }
        Err(call)
    }

    fn sweep(&self, call: PendingCall) -> Result<u64, PendingCall> {
        let n = self.slots.len() as u64;
        for (index, slot) in (0u64..).zip(self.slots.iter()) {
            let mut slot = slot.lock();
            if slot.is_some() {
                continue;
            }
            // reserves one never-issued id per residue
            let base = self.sequence.fetch_add(n, Ordering::Relaxed);
            let id = base + (index + n - base % n) % n;
            return Ok(self.occupy(&mut slot, call, id));
        }
        Err(call)
    }

    fn occupy(&self, slot: &mut Option<PendingCall>, mut call: PendingCall, id: u64) -> u64 {
        call.log_id = id;
        call.request.log_id = id;
        *slot = Some(call);
        self.len.fetch_add(1, Ordering::AcqRel);
        trace!("stored call {id} (generation {})", self.generation(id));
        id
    }

    pub fn get(&self, id: u64) -> Option<PendingSnapshot> {
        let slot = self.slot(id).lock();
        slot.as_ref()
            .filter(|call| call.log_id == id)
            .map(|call| PendingSnapshot {
                log_id: call.log_id,
                state: CallState::Pending,
                service: call.request.service.clone(),
                method: call.request.method.clone(),
                endpoint: call.endpoint.clone(),
                created: call.created,
                deadline: call.deadline,
            })
    }

    /// Mutates a stored call in place; `false` if `id` is no longer stored.
    pub fn update<F>(&self, id: u64, f: F) -> bool
    where
        F: FnOnce(&mut PendingCall),
    {
        let mut slot = self.slot(id).lock();
        match slot.as_mut().filter(|call| call.log_id == id) {
            Some(call) => {
                f(call);
                true
            }
            None => false,
        }
    }

    /// Removes and returns the call stored under exactly `id`.
    pub fn take(&self, id: u64) -> Option<PendingCall> {
        let mut slot = self.slot(id).lock();
        if slot.as_ref().is_some_and(|call| call.log_id == id) {
            self.len.fetch_sub(1, Ordering::AcqRel);
            slot.take()
        } else {
            None
        }
    }

    /// Removes every stored call.
    pub fn drain(&self) -> Vec<PendingCall> {
        self.slots
            .iter()
            .filter_map(|slot| slot.lock().take())
            .inspect(|_| {
                self.len.fetch_sub(1, Ordering::AcqRel);
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::mpsc, thread};

    use super::*;
    use crate::message::Status;

    fn call() -> PendingCall {
        PendingCall::new(Request::new("echo", "Echo", Vec::new()), Duration::from_secs(1))
    }

    #[test]
    fn ids_map_to_slots_and_generations() {
        let store = FutureStore::new(4);
        let ids: Vec<u64> = (0..3).map(|_| store.put(call()).unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(store.generation(ids[0]), 0);
        assert_eq!(store.len(), 3);

        let snapshot = store.get(2).unwrap();
        assert_eq!(snapshot.state, CallState::Pending);
        assert_eq!(snapshot.service, "echo");
    }

    #[test]
    fn full_store_fails_the_call() {
        let store = FutureStore::new(2);
        store.put(call()).unwrap();
        store.put(call()).unwrap();

        let completion = Completion::new();
        let err = store
            .put(call().with_completion(Arc::clone(&completion)))
            .unwrap_err();
        assert_eq!(err, StoreError::Full { capacity: 2 });
        assert_eq!(store.len(), 2);

        let (state, result) = completion.try_take().unwrap();
        assert_eq!(state, CallState::Failed);
        assert!(matches!(result, Err(RpcError::Store(StoreError::Full { .. }))));
    }

    #[test]
    fn freed_slot_is_reused_with_new_generation() {
        let store = FutureStore::new(2);
        let first = store.put(call()).unwrap();
        let second = store.put(call()).unwrap();
        assert!(store.take(first).is_some());

        let third = store.put(call()).unwrap();
        assert_eq!(third % 2, first % 2);
        assert_eq!(store.generation(third), store.generation(first) + 1);

        // The stale id shares the slot but must not see the new occupant.
        assert!(store.get(first).is_none());
        assert!(store.take(first).is_none());
        assert!(store.take(third).is_some());
        assert!(store.take(second).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn take_is_idempotent() {
        let store = FutureStore::new(8);
        let id = store.put(call()).unwrap();
        assert_eq!(store.take(id).unwrap().log_id(), id);
        assert!(store.take(id).is_none());
        assert!(!store.update(id, |_| {}));
    }

    #[test]
    fn put_skips_occupied_slots() {
        let store = FutureStore::new(3);
        let a = store.put(call()).unwrap();
        let b = store.put(call()).unwrap();
        let c = store.put(call()).unwrap();
        store.take(b).unwrap();

        // Sequence moves on to a's and c's slots before landing on b's.
        let d = store.put(call()).unwrap();
        assert_eq!(d % 3, b % 3);
        assert!(store.get(a).is_some() && store.get(c).is_some());
    }

    #[test]
    fn sweep_claims_a_free_slot_with_a_fresh_id() {
        let store = FutureStore::new(4);
        let ids: Vec<u64> = (0..4).map(|_| store.put(call()).unwrap()).collect();
        store.take(ids[2]).unwrap();

        let swept = store.sweep(call()).ok().unwrap();
        assert_eq!(swept % 4, ids[2] % 4);
        assert!(swept > ids[3]);
        assert!(store.sweep(call()).is_err());

        // the reserved block is never handed out again
        store.take(swept).unwrap();
        let next = store.put(call()).unwrap();
        assert_ne!(next, swept);
        assert_eq!(next % 4, swept % 4);
    }

    #[test]
    fn outcomes_reach_waiters_and_callbacks() {
        let completion = Completion::new();
        let mut ok = Response::ok(1, b"pong".to_vec());
        ok.status = Status::Ok;
        call()
            .with_completion(Arc::clone(&completion))
            .complete(ok);
        let (state, result) = completion.try_take().unwrap();
        assert_eq!(state, CallState::Completed);
        assert_eq!(result.unwrap().payload, b"pong");

        let (tx, rx) = mpsc::channel();
        call()
            .with_callback(Box::new(move |result| tx.send(result).unwrap()))
            .complete(Response::error(1, Status::ApplicationError, "boom"));
        assert!(matches!(
            rx.recv().unwrap(),
            Err(RpcError::Remote {
                status: Status::ApplicationError,
                ..
            })
        ));
    }

    #[test]
    fn finisher_runs_before_publish_and_lease_is_released() {
        struct Guard(mpsc::Sender<&'static str>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.send("lease").unwrap();
            }
        }

        let (tx, rx) = mpsc::channel();
        let hook_tx = tx.clone();
        let cb_tx = tx.clone();
        let mut pending = call()
            .with_finisher(Box::new(move |result| {
                hook_tx.send("hook").unwrap();
                *result = Err(RpcError::Cancelled { log_id: 0 });
            }))
            .with_callback(Box::new(move |result| {
                assert!(matches!(result, Err(RpcError::Cancelled { .. })));
                cb_tx.send("callback").unwrap();
            }));
        pending.attach_lease(Box::new(Guard(tx)));
        pending.complete(Response::ok(1, Vec::new()));

        let order: Vec<_> = rx.try_iter().collect();
        assert_eq!(order, vec!["hook", "lease", "callback"]);
    }

    #[test]
    fn timeouts_and_cancellations() {
        let completion = Completion::new();
        call().with_completion(Arc::clone(&completion)).time_out();
        let (state, result) = completion.try_take().unwrap();
        assert_eq!(state, CallState::TimedOut);
        assert!(matches!(result, Err(RpcError::Timeout { .. })));

        let completion = Completion::new();
        call().with_completion(Arc::clone(&completion)).cancel();
        assert!(completion.is_done());
        assert_eq!(completion.try_take().unwrap().0, CallState::Cancelled);
    }

    #[test]
    fn wait_until_times_out_without_outcome() {
        let completion = Completion::new();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(completion.wait_until(deadline).is_none());
        assert!(!completion.is_done());
    }

    #[test]
    fn concurrent_put_and_take() {
        let store = Arc::new(FutureStore::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    for _ in 0..500 {
                        let id = store.put(call()).unwrap();
                        seen.push(id);
                        assert_eq!(store.take(id).unwrap().log_id(), id);
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "id {id} handed out twice");
            }
        }
        assert!(store.is_empty());
    }
}
