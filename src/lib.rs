//! osport - completion-based native I/O for a host runtime
//!
//! Heterogeneous OS operations (files, named pipes, the console, TCP
//! sockets, USB bulk pipes, child-process stdio, directory changes and
//! process exits) all finish through one shared completion queue. A host
//! runtime pumps that queue from a single dispatch step and receives every
//! result through the callback it supplied when the operation was armed.
//!
//! # Features
//!
//! - **One completion queue**: native I/O, worker-pool calls and process
//!   exits arrive as the same `(count, key, descriptor, error)` packets
//! - **Handle tables**: small integer handles per resource kind, never
//!   naming two live resources at once
//! - **Capability ports**: a closed set of devices behind read, write, size
//!   and peer-address traits
//! - **Watchers**: self-resubmitting directory watchers and one-shot
//!   process-exit watchers with cooperative close
//!
//! # Example
//!
//! ```no_run
//! use osport::{Disposition, FileAccess, IoBuffer, Runtime};
//! use std::path::Path;
//! use std::time::Duration;
//!
//! let rt = Runtime::new();
//! let file = rt
//!     .open_file(Path::new("data.bin"), FileAccess::Read, Disposition::OpenExisting)
//!     .unwrap();
//! let buffer = IoBuffer::new(4096);
//! rt.read_port(file, buffer.clone(), 0, 4096, Some(0), Box::new(|result| {
//!     println!("read {} bytes (error {})", result.count, result.error);
//! }))
//! .unwrap();
//! rt.run_once(Duration::from_secs(1));
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  ┌────────────┐  ┌──────────────┐
//! │ I/O driver │  │ WorkerPool │  │ wait threads │
//! └─────┬──────┘  └─────┬──────┘  └──────┬───────┘
//!       │ post          │ post           │ post
//!       ▼               ▼                ▼
//! ┌──────────────────────────────────────────────┐
//! │ CompletionEngine (queue + side table)        │
//! └─────────────────────┬────────────────────────┘
//!                       │ fetch / dispatch
//!                       ▼
//! ┌──────────────────────────────────────────────┐
//! │ decode (key) ──► Delivery ──► caller callback│
//! └──────────────────────────────────────────────┘
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

#[cfg(not(target_os = "linux"))]
compile_error!("osport drives epoll, inotify and usbdevfs and only builds on Linux");

pub mod config;
pub mod error;
pub mod fs_ops;
pub mod handle_table;
pub mod hash;
pub mod info;
pub mod logging;
pub mod port;
pub mod runtime;
pub mod watcher;

// Re-export commonly used types
pub use config::{ConfigError, OsportConfig};
pub use error::{code, error_string, ErrorPair, OsResult};
pub use handle_table::{Handle, HandleKind, HandleTable};
pub use hash::HashAlgorithm;
pub use info::HandleCounts;
pub use port::{ConnectCallback, Disposition, FileAccess};
pub use runtime::{
    Completion, CompletionEngine, Delivery, Descriptor, IoBuffer, IoCallback, IoResult, Runtime,
    WorkItem,
};
pub use watcher::{
    Change, ChangeAction, ChangeCallback, ProcessCallback, ProcessExit, WatchState, WatchedProcess,
};
