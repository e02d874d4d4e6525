//! Shared coarse-grained scheduler.
//!
//! One [`Timer`] per runtime drives every call deadline, idle-connection sweep
//! and naming retry. Tasks live in a [`TimingWheel`]: insertion is O(1) and each
//! tick only looks at the slots that elapsed since the previous one.
//!
//! Tasks run on the timer thread and should be short; anything heavier belongs
//! on a worker.
use std::{
    collections::{HashMap, VecDeque},
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    pub id: u64,
    /// Expiration timestamp in microseconds since the wheel's epoch.
    pub expires_at: u64,
}

/// Hashed timing wheel.
///
/// Time is divided into `num_slots` slots of `slot_duration_us` each. Entries
/// further out than one revolution are parked in the last slot and re-filed
/// when it is drained.
#[derive(Debug)]
pub struct TimingWheel {
    slots: Vec<VecDeque<TimerEntry>>,
    num_slots: usize,
    slot_duration_us: u64,
    current_slot: usize,
    /// Start of the current slot; always a whole number of slots past the epoch.
    current_ts: u64,
    wheel_duration_us: u64,
}

impl TimingWheel {
    pub fn new(num_slots: usize, slot_duration_us: u64) -> Self {
        let num_slots = num_slots.max(1);
        let slot_duration_us = slot_duration_us.max(1);
        Self {
            slots: (0..num_slots).map(|_| VecDeque::new()).collect(),
            num_slots,
            slot_duration_us,
            current_slot: 0,
            current_ts: 0,
            wheel_duration_us: num_slots as u64 * slot_duration_us,
        }
    }

    /// Files an entry; returns the slot it landed in, or `None` if it is already due.
    pub fn insert(&mut self, entry: TimerEntry) -> Option<usize> {
        if entry.expires_at <= self.current_ts {
            return None;
        }

        let delta = entry.expires_at - self.current_ts;
        let slot = if delta >= self.wheel_duration_us {
            (self.current_slot + self.num_slots - 1) % self.num_slots
        } else {
            (self.current_slot + (delta / self.slot_duration_us) as usize) % self.num_slots
        };
        self.slots[slot].push_back(entry);
        Some(slot)
    }

    /// Advances to `ts`, pushing every entry that expired on the way into `out`.
    pub fn advance_into(&mut self, ts: u64, out: &mut Vec<TimerEntry>) {
        if ts <= self.current_ts {
            return;
        }

        let elapsed_slots = (ts - self.current_ts) / self.slot_duration_us;
        let to_drain = (elapsed_slots as usize).min(self.num_slots);
        let mut refile = Vec::new();

        for _ in 0..to_drain {
            while let Some(entry) = self.slots[self.current_slot].pop_front() {
                if entry.expires_at <= ts {
                    out.push(entry);
                } else {
                    refile.push(entry);
                }
            }
            self.current_slot = (self.current_slot + 1) % self.num_slots;
        }

        // Whole slots only, so the wheel never drifts from the clock.
        self.current_ts += elapsed_slots * self.slot_duration_us;
        if elapsed_slots as usize > self.num_slots {
            self.current_slot = ((self.current_ts / self.slot_duration_us) as usize) % self.num_slots;
        }

        for entry in refile {
            if self.insert(entry).is_none() {
                out.push(entry);
            }
        }
    }

    pub fn advance(&mut self, ts: u64) -> Vec<TimerEntry> {
        let mut expired = Vec::new();
        self.advance_into(ts, &mut expired);
        expired
    }

    pub fn cancel(&mut self, id: u64) -> bool {
        for slot in &mut self.slots {
            if let Some(pos) = slot.iter().position(|e| e.id == id) {
                slot.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_empty())
    }

    pub fn current_ts(&self) -> u64 {
        self.current_ts
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct TimerState {
    wheel: TimingWheel,
    tasks: HashMap<u64, Task>,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wakeup: Condvar,
    epoch: Instant,
    tick: Duration,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl TimerInner {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn schedule(self: &Arc<Self>, after: Duration, task: Task) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let due = self.now_us() + after.as_micros() as u64;
        let expires_at = due.max(state.wheel.current_ts() + 1);
        state.wheel.insert(TimerEntry { id, expires_at });
        state.tasks.insert(id, task);

        TimerHandle {
            id,
            timer: Arc::downgrade(self),
        }
    }

    fn cancel(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        if state.tasks.remove(&id).is_some() {
            state.wheel.cancel(id);
            true
        } else {
            false
        }
    }

    fn run(self: Arc<Self>) {
        let mut expired = Vec::new();
        while self.running.load(Ordering::Acquire) {
            let due: Vec<Task> = {
                let mut state = self.state.lock();
                self.wakeup.wait_for(&mut state, self.tick);
                if !self.running.load(Ordering::Acquire) {
                    break;
                }

                expired.clear();
                let now = self.now_us();
                state.wheel.advance_into(now, &mut expired);
                expired
                    .iter()
                    .filter_map(|entry| state.tasks.remove(&entry.id))
                    .collect()
            };

            for task in due {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    warn!("timer task panicked");
                }
            }
        }
        debug!("timer thread exiting");
    }
}

/// Cancels a scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    id: u64,
    timer: Weak<TimerInner>,
}

impl TimerHandle {
    /// Returns `true` if the task had not run yet and now never will.
    pub fn cancel(&self) -> bool {
        self.timer
            .upgrade()
            .is_some_and(|timer| timer.cancel(self.id))
    }
}

impl std::fmt::Debug for TimerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("tick", &self.tick).finish()
    }
}

pub struct Timer {
    inner: Arc<TimerInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub fn new(tick: Duration, slots: usize) -> io::Result<Self> {
        let tick = tick.max(Duration::from_millis(1));
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                wheel: TimingWheel::new(slots, tick.as_micros() as u64),
                tasks: HashMap::new(),
            }),
            wakeup: Condvar::new(),
            epoch: Instant::now(),
            tick,
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });

        let runner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("relay-timer".into())
            .spawn(move || runner.run())?;

        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Runs `task` once, no earlier than `after` from now.
    pub fn schedule<F>(&self, after: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.schedule(after, Box::new(task))
    }

    /// Runs `task` every `period` until it returns `false` or the timer stops.
    pub fn schedule_every<F>(&self, period: Duration, task: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        fn arm<F>(timer: &Arc<TimerInner>, period: Duration, mut task: F)
        where
            F: FnMut() -> bool + Send + 'static,
        {
            let weak = Arc::downgrade(timer);
            timer.schedule(
                period,
                Box::new(move || {
                    if task() {
                        if let Some(timer) = weak.upgrade() {
                            arm(&timer, period, task);
                        }
                    }
                }),
            );
        }
        arm(&self.inner, period, task);
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }

    pub fn tick(&self) -> Duration {
        self.inner.tick
    }

    /// Stops the thread; tasks that have not run are dropped.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_all();
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        self.inner.state.lock().tasks.clear();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.inner, f)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn wheel_expires_in_order() {
        let mut wheel = TimingWheel::new(8, 100);
        wheel.insert(TimerEntry {
            id: 1,
            expires_at: 250,
        });
        wheel.insert(TimerEntry {
            id: 2,
            expires_at: 120,
        });

        assert!(wheel.advance(99).is_empty());
        let ids: Vec<u64> = wheel.advance(200).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2]);
        let ids: Vec<u64> = wheel.advance(300).iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn wheel_handles_entries_beyond_one_revolution() {
        let mut wheel = TimingWheel::new(4, 10);
        wheel.insert(TimerEntry {
            id: 7,
            expires_at: 95,
        });

        assert!(wheel.advance(40).is_empty());
        assert!(wheel.advance(80).is_empty());
        assert_eq!(wheel.active_count(), 1);
        assert_eq!(wheel.advance(100)[0].id, 7);
    }

    #[test]
    fn wheel_does_not_drift() {
        let mut wheel = TimingWheel::new(16, 10);
        wheel.advance(15);
        assert_eq!(wheel.current_ts(), 10);
        wheel.advance(27);
        assert_eq!(wheel.current_ts(), 20);
    }

    #[test]
    fn wheel_entry_due_within_current_slot() {
        let mut wheel = TimingWheel::new(4, 100);
        wheel.insert(TimerEntry {
            id: 1,
            expires_at: 180,
        });
        assert!(wheel.advance(150).is_empty());
        assert_eq!(wheel.advance(200)[0].id, 1);
    }

    #[test]
    fn wheel_cancel() {
        let mut wheel = TimingWheel::new(4, 10);
        wheel.insert(TimerEntry {
            id: 3,
            expires_at: 15,
        });
        assert!(wheel.cancel(3));
        assert!(!wheel.cancel(3));
        assert!(wheel.advance(100).is_empty());
    }

    #[test]
    fn timer_runs_tasks() {
        let timer = Timer::new(Duration::from_millis(1), 64).unwrap();
        let (tx, rx) = mpsc::channel();
        timer.schedule(Duration::from_millis(5), move || tx.send("fired").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "fired");
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let timer = Timer::new(Duration::from_millis(1), 64).unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let handle = timer.schedule(Duration::from_millis(20), move || tx.send(()).unwrap());
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn repeating_task_stops_when_asked() {
        let timer = Timer::new(Duration::from_millis(1), 64).unwrap();
        let (tx, rx) = mpsc::channel();
        let mut runs = 0;
        timer.schedule_every(Duration::from_millis(2), move || {
            runs += 1;
            tx.send(runs).unwrap();
            runs < 3
        });

        for expected in 1..=3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), expected);
        }
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let timer = Timer::new(Duration::from_millis(1), 64).unwrap();
        timer.schedule(Duration::from_secs(60), || {});
        assert_eq!(timer.pending(), 1);
        timer.shutdown();
        assert_eq!(timer.pending(), 0);
    }
}
