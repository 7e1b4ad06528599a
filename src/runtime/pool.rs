//! Elastic thread pool
//!
//! Threads are spawned on demand when no worker is idle, up to `max`.
//! Jobs wait in a bounded queue; a full queue rejects the job.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

struct Counters {
    idle: AtomicUsize,
    threads: AtomicUsize,
}

pub(crate) struct ThreadPool {
    name: &'static str,
    max: usize,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    counters: Arc<Counters>,
}

impl ThreadPool {
    pub fn new(name: &'static str, max: usize, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            name,
            max: max.max(1),
            tx,
            rx,
            counters: Arc::new(Counters {
                idle: AtomicUsize::new(0),
                threads: AtomicUsize::new(0),
            }),
        }
    }

    /// Queue a job, growing the pool if every worker is busy.
    ///
    /// The job is handed back when it cannot be queued.
    pub fn execute(&self, job: Job) -> Result<(), Job> {
        if self.counters.idle.load(Ordering::Acquire) == 0 {
            self.grow();
        }
        if self.counters.threads.load(Ordering::Acquire) == 0 {
            return Err(job);
        }
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                log::warn!("{} pool queue full", self.name);
                Err(job)
            }
        }
    }

    pub fn threads(&self) -> usize {
        self.counters.threads.load(Ordering::Acquire)
    }

    fn grow(&self) {
        let reserved = self
            .counters
            .threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            });
        let Ok(index) = reserved else {
            return;
        };

        let rx = self.rx.clone();
        let counters = Arc::clone(&self.counters);
        let spawned = thread::Builder::new()
            .name(format!("osport-{}-{}", self.name, index))
            .spawn(move || worker_loop(rx, counters));
        match spawned {
            Ok(_) => log::debug!("{} pool grew to {} threads", self.name, index + 1),
            Err(err) => {
                self.counters.threads.fetch_sub(1, Ordering::AcqRel);
                log::warn!("{} pool could not spawn a thread: {}", self.name, err);
            }
        }
    }
}

fn worker_loop(rx: Receiver<Job>, counters: Arc<Counters>) {
    loop {
        counters.idle.fetch_add(1, Ordering::AcqRel);
        let job = rx.recv();
        counters.idle.fetch_sub(1, Ordering::AcqRel);
        match job {
            Ok(job) => job(),
            // every sender dropped: the pool is gone
            Err(_) => break,
        }
    }
    counters.threads.fetch_sub(1, Ordering::AcqRel);
}
