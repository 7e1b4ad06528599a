//! Completion runtime
//!
//! The [`Runtime`] owns the shared completion queue, the I/O driver, the
//! worker pool and one handle table per resource kind.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       OSPORT RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  CompletionEngine: shared completion queue + side table         │
//! │  Driver: reactor thread and lanes for native operations         │
//! │  WorkerPool: blocking calls posted back as synthetic completions│
//! │  HandleTables: ports, processes, listeners, hashes, watchers    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let rt = Runtime::new();
//! let file = rt.open_file(path, FileAccess::Read, Disposition::OpenExisting)?;
//! let buffer = IoBuffer::new(4096);
//! rt.read_port(file, buffer.clone(), 0, 4096, Some(0), Box::new(|r| println!("{:?}", r)))?;
//!
//! // Dispatch on this thread
//! while rt.run_once(Duration::from_millis(100)) {}
//! ```

pub mod completion;
pub mod driver;
pub mod overlapped;
mod pool;
pub mod work;

pub use completion::{Completion, CompletionEngine, Delivery, Descriptor, IoComplete, Poster, SideTable};
pub use overlapped::{IoBuffer, IoCallback, IoResult, OverlappedRequest};
pub use work::{WorkItem, WorkerPool};

use crate::config::OsportConfig;
use crate::error::{fatal, OsResult};
use crate::handle_table::{HandleKind, HandleTable};
use crate::hash::HashEntry;
use crate::port::tcp::TcpListenerEntry;
use crate::port::Port;
use crate::watcher::process::ProcessEntry;
use crate::watcher::WatcherEntry;
use driver::Driver;
use std::sync::Arc;
use std::time::Duration;

/// The dispatch engine and every live resource.
pub struct Runtime {
    config: OsportConfig,
    engine: CompletionEngine,
    driver: Driver,
    workers: WorkerPool,
    pub(crate) ports: HandleTable<Arc<Port>>,
    pub(crate) processes: HandleTable<Arc<ProcessEntry>>,
    pub(crate) listeners: HandleTable<Arc<TcpListenerEntry>>,
    pub(crate) hashes: HandleTable<Arc<HashEntry>>,
    pub(crate) watchers: HandleTable<Arc<WatcherEntry>>,
}

impl Runtime {
    /// Create a runtime with default settings.
    pub fn new() -> Self {
        Self::with_config(OsportConfig::default())
    }

    /// Create a runtime. Failing to create the completion machinery
    /// terminates the process.
    pub fn with_config(config: OsportConfig) -> Self {
        ignore_sigpipe();
        let engine = CompletionEngine::new();
        let driver = match Driver::start(&config, engine.poster()) {
            Ok(driver) => driver,
            Err(err) => fatal("create_completion_port", err),
        };
        let workers = WorkerPool::new(&config.workers, engine.poster());
        log::debug!(
            "runtime started: {} workers max, {} lanes max",
            config.workers.max_threads,
            config.driver.lane_threads
        );
        Self {
            config,
            engine,
            driver,
            workers,
            ports: HandleTable::new(HandleKind::PORT),
            processes: HandleTable::new(HandleKind::PROCESS),
            listeners: HandleTable::new(HandleKind::LISTENER),
            hashes: HandleTable::new(HandleKind::HASH),
            watchers: HandleTable::new(HandleKind::WATCHER),
        }
    }

    pub fn config(&self) -> &OsportConfig {
        &self.config
    }

    pub fn engine(&self) -> &CompletionEngine {
        &self.engine
    }

    pub(crate) fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Run a blocking call off the dispatch thread.
    pub fn schedule_work(&self, item: Box<dyn WorkItem>) -> OsResult<()> {
        self.workers.schedule(item)
    }

    /// Whether a completion is ready. Never blocks.
    pub fn is_ready(&self) -> bool {
        self.engine.is_ready()
    }

    /// Decode a fetched completion through its key.
    pub fn dispatch(&self, completion: Completion) -> Delivery {
        (completion.key)(self, completion.count, completion.descriptor, completion.error)
    }

    /// Fetch and decode the next completion, waiting up to `timeout`.
    pub fn get_completion(&self, timeout: Duration) -> Option<Delivery> {
        self.engine.fetch(timeout).map(|c| self.dispatch(c))
    }

    /// Fetch and decode the next completion without waiting.
    pub fn poll(&self) -> Option<Delivery> {
        self.engine.try_fetch().map(|c| self.dispatch(c))
    }

    /// Dispatch and deliver one completion. Returns `false` on timeout.
    pub fn run_once(&self, timeout: Duration) -> bool {
        match self.get_completion(timeout) {
            Some(delivery) => {
                delivery.deliver();
                true
            }
            None => false,
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

fn ignore_sigpipe() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // writes to a closed pipe must surface as EPIPE completions
    if let Err(err) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
        log::warn!("cannot ignore SIGPIPE: {}", err);
    }
}
