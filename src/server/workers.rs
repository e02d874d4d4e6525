use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, mpsc},
    thread,
};

use log::{debug, warn};
use parking_lot::Mutex;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads pulling jobs off one queue.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        for i in 0..size {
            workers.push(Worker::new(i, Arc::clone(&receiver))?);
        }

        Ok(Self {
            workers,
            sender: Some(sender),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues `f`; returns `false` once the pool is shutting down.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        if sender.send(Box::new(f)).is_err() {
            warn!("worker pool is gone, dropping job");
            return false;
        }
        true
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);
            if worker.thread.thread().id() == thread::current().id() {
                continue;
            }
            if worker.thread.join().is_err() {
                warn!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("relay-worker-{id}"))
            .spawn(move || {
                loop {
                    let msg = receiver.lock().recv();
                    match msg {
                        Ok(job) => {
                            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                                warn!("worker {id}: job panicked");
                            }
                        }
                        Err(_) => {
                            debug!("worker {id} disconnected");
                            break;
                        }
                    }
                }
            })?;

        Ok(Self { id, thread })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Barrier,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn runs_every_job_before_drop_returns() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(4).unwrap();
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                assert!(pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn jobs_run_concurrently() {
        let pool = ThreadPool::new(3).unwrap();
        let barrier = Arc::new(Barrier::new(4));
        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            pool.execute(move || {
                barrier.wait();
            });
        }
        barrier.wait();
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let pool = ThreadPool::new(1).unwrap();
        pool.execute(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        pool.execute(move || tx.send(7).unwrap());
        assert_eq!(rx.recv().unwrap(), 7);
    }
}
