//! Blocking calls run off the dispatch thread
//!
//! A [`WorkItem`] runs its blocking call on a pool thread, is parked in the
//! side table, and its status is posted as a synthetic completion. Decoding
//! then happens on the dispatch thread like any native completion.

use super::completion::{Delivery, Descriptor, Poster};
use super::pool::ThreadPool;
use super::Runtime;
use crate::config::WorkerConfig;
use crate::error::{code, ErrorPair, OsResult};

/// A blocking call with a dispatch-thread decode step.
pub trait WorkItem: Send + 'static {
    /// Run the blocking call on a pool thread and return its status
    /// (0 for success, otherwise an errno).
    fn work(&mut self) -> u32;

    /// Turn the status into a caller-visible outcome. Runs on the dispatch
    /// thread and consumes the item.
    fn decode(self: Box<Self>, rt: &Runtime, status: u32) -> Delivery;
}

pub(crate) fn complete_work(rt: &Runtime, _count: u32, descriptor: Descriptor, status: u32) -> Delivery {
    match rt.engine().side_table().take::<Box<dyn WorkItem>>(descriptor) {
        Some(item) => item.decode(rt, status),
        None => {
            log::warn!("work completion for unknown descriptor {}", descriptor.0);
            Delivery::none()
        }
    }
}

/// Pool executing work items.
pub struct WorkerPool {
    pool: ThreadPool,
    poster: Poster,
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig, poster: Poster) -> Self {
        Self {
            pool: ThreadPool::new("worker", config.max_threads, config.queue_capacity),
            poster,
        }
    }

    /// Queue an item. On exhaustion the item is dropped and
    /// `("schedule_work", EAGAIN)` is returned.
    pub fn schedule(&self, item: Box<dyn WorkItem>) -> OsResult<()> {
        let poster = self.poster.clone();
        let job = Box::new(move || {
            let mut item = item;
            let status = item.work();
            let descriptor = poster.register(item);
            poster.post(0, complete_work, descriptor, status);
        });
        self.pool.execute(job).map_err(|_rejected| {
            log::warn!("work item rejected: worker pool exhausted");
            ErrorPair::new("schedule_work", code::EXHAUSTED)
        })
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }
}
