//! The shared completion queue
//!
//! Every producer (the I/O driver, the worker pool, process wait threads)
//! posts `Completion` packets into one queue owned by the
//! [`CompletionEngine`]. A packet carries a decoder key and a [`Descriptor`]
//! naming the per-operation record parked in the [`SideTable`]; the dispatch
//! step hands both to the key, which takes the record back out, releases it
//! and produces a [`Delivery`] for the caller.

use super::Runtime;
use crate::error::fatal;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use slab::Slab;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identity of a parked operation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub usize);

/// Decoder invoked on the dispatch thread with `(count, descriptor, error)`.
pub type IoComplete = fn(&Runtime, u32, Descriptor, u32) -> Delivery;

/// One finished operation, owned by exactly one fetch.
pub struct Completion {
    pub count: u32,
    pub key: IoComplete,
    pub descriptor: Descriptor,
    pub error: u32,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("count", &self.count)
            .field("key", &(self.key as usize as *const ()))
            .field("descriptor", &self.descriptor)
            .field("error", &self.error)
            .finish()
    }
}

/// Arena of operation records awaiting their completion.
///
/// Records are recovered by descriptor and concrete type, never by address
/// arithmetic on the descriptor.
#[derive(Default)]
pub struct SideTable {
    records: Mutex<Slab<Box<dyn Any + Send>>>,
}

impl SideTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a record until its completion is dispatched.
    pub fn register<T: Any + Send>(&self, record: T) -> Descriptor {
        Descriptor(self.records.lock().insert(Box::new(record)))
    }

    /// Take back a parked record of type `T`.
    ///
    /// A descriptor naming a record of another type is left in place.
    pub fn take<T: Any>(&self, descriptor: Descriptor) -> Option<T> {
        let mut records = self.records.lock();
        match records.get(descriptor.0) {
            Some(record) if record.is::<T>() => {}
            Some(_) => {
                log::warn!("descriptor {} holds a different record type", descriptor.0);
                return None;
            }
            None => return None,
        }
        let record = records.remove(descriptor.0);
        record.downcast::<T>().ok().map(|boxed| *boxed)
    }

    /// Number of records still waiting for a completion.
    pub fn outstanding(&self) -> usize {
        self.records.lock().len()
    }
}

/// Producer side of the completion queue.
///
/// Cheap to clone; handed to every thread that finishes operations.
#[derive(Clone)]
pub struct Poster {
    tx: Sender<Completion>,
    table: Arc<SideTable>,
}

impl Poster {
    pub fn post(&self, count: u32, key: IoComplete, descriptor: Descriptor, error: u32) {
        let completion = Completion {
            count,
            key,
            descriptor,
            error,
        };
        log::trace!("post {:?}", completion);
        if self.tx.send(completion).is_err() {
            log::debug!("completion for descriptor {} dropped: engine gone", descriptor.0);
        }
    }

    pub fn side_table(&self) -> &SideTable {
        &self.table
    }

    pub fn register<T: Any + Send>(&self, record: T) -> Descriptor {
        self.table.register(record)
    }
}

/// The single shared completion queue.
///
/// Holds at most one fetched-but-undispatched packet: `is_ready` caches a
/// packet it finds so that the next fetch does not wait for the queue.
pub struct CompletionEngine {
    poster: Poster,
    rx: Receiver<Completion>,
    ready: Mutex<Option<Completion>>,
}

impl CompletionEngine {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            poster: Poster {
                tx,
                table: Arc::new(SideTable::new()),
            },
            rx,
            ready: Mutex::new(None),
        }
    }

    pub fn poster(&self) -> Poster {
        self.poster.clone()
    }

    pub fn side_table(&self) -> &SideTable {
        self.poster.side_table()
    }

    /// Inject a completion.
    pub fn post(&self, count: u32, key: IoComplete, descriptor: Descriptor) {
        self.poster.post(count, key, descriptor, 0);
    }

    /// Inject a failed completion.
    pub fn post_error(&self, key: IoComplete, descriptor: Descriptor, error: u32) {
        self.poster.post(0, key, descriptor, error);
    }

    /// Non-blocking check for a ready completion. Never blocks.
    pub fn is_ready(&self) -> bool {
        let mut ready = self.ready.lock();
        if ready.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(completion) => {
                *ready = Some(completion);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => fatal("is_ready", "completion queue disconnected"),
        }
    }

    /// Take the next completion without waiting.
    pub fn try_fetch(&self) -> Option<Completion> {
        if let Some(completion) = self.ready.lock().take() {
            return Some(completion);
        }
        match self.rx.try_recv() {
            Ok(completion) => Some(completion),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => fatal("try_fetch", "completion queue disconnected"),
        }
    }

    /// Wait up to `timeout` for the next completion.
    ///
    /// A timeout is not an error; a disconnected queue is fatal.
    pub fn fetch(&self, timeout: Duration) -> Option<Completion> {
        if let Some(completion) = self.ready.lock().take() {
            return Some(completion);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => fatal("fetch", "completion queue disconnected"),
        }
    }

    /// Completions queued and not yet fetched, including a cached one.
    pub fn pending(&self) -> usize {
        self.rx.len() + usize::from(self.ready.lock().is_some())
    }
}

impl Default for CompletionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded, caller-visible outcome bound to its callback.
///
/// Produced by a decoder on the dispatch thread and run there by
/// [`Delivery::deliver`].
#[must_use = "a delivery does nothing until delivered"]
pub struct Delivery(Option<Box<dyn FnOnce()>>);

impl Delivery {
    pub fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A completion with nothing to report.
    pub fn none() -> Self {
        Self(None)
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    /// Invoke the bound callback.
    pub fn deliver(self) {
        if let Some(f) = self.0 {
            f();
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() { "Delivery(..)" } else { "Delivery(none)" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn noop(_: &Runtime, _: u32, _: Descriptor, _: u32) -> Delivery {
        Delivery::none()
    }

    #[test]
    fn test_side_table_typed_take() {
        let table = SideTable::new();
        let d = table.register(String::from("record"));
        assert_eq!(table.outstanding(), 1);
        assert_eq!(table.take::<u32>(d), None);
        assert_eq!(table.outstanding(), 1);
        assert_eq!(table.take::<String>(d).as_deref(), Some("record"));
        assert_eq!(table.take::<String>(d), None);
        assert_eq!(table.outstanding(), 0);
    }

    #[test]
    fn test_is_ready_caches() {
        let engine = CompletionEngine::new();
        assert!(!engine.is_ready());
        engine.post(7, noop, Descriptor(3));
        assert!(engine.is_ready());
        assert!(engine.is_ready());
        assert_eq!(engine.pending(), 1);

        let c = engine.fetch(Duration::from_secs(5)).unwrap();
        assert_eq!(c.count, 7);
        assert_eq!(c.descriptor, Descriptor(3));
        assert!(engine.try_fetch().is_none());
    }

    #[test]
    fn test_fetch_zero_timeout_returns_promptly() {
        let engine = CompletionEngine::new();
        let start = Instant::now();
        assert!(engine.fetch(Duration::ZERO).is_none());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_post_error_carries_code() {
        let engine = CompletionEngine::new();
        engine.post_error(noop, Descriptor(0), 42);
        let c = engine.try_fetch().unwrap();
        assert_eq!(c.error, 42);
        assert_eq!(c.count, 0);
    }

    #[test]
    fn test_delivery_runs_once() {
        let hits = std::rc::Rc::new(std::cell::Cell::new(0));
        let h = hits.clone();
        let delivery = Delivery::new(move || h.set(h.get() + 1));
        assert!(!delivery.is_none());
        delivery.deliver();
        assert_eq!(hits.get(), 1);
        Delivery::none().deliver();
    }
}
