//! Watchers: standing subscriptions to repeated or eventual OS events
//!
//! A watcher core (buffer, callback, decode state) has exactly one owner at
//! a time: the operation currently outstanding on its behalf. The handle
//! table keeps only a [`WatcherEntry`] with the shared state cell and the
//! cancel token, so closing a watcher never frees memory an in-flight
//! operation still uses. Whoever decodes the final completion frees it.
//!
//! ```text
//!   Armed ──fired──► Armed ──fired──► ...
//!     │                                  (process watchers: fired ─► Closed)
//!     └──close──► Closing ──completion──► Closed
//! ```

pub mod directory;
pub mod process;

pub use directory::{Change, ChangeAction, ChangeCallback};
pub use process::{ProcessCallback, ProcessExit, WatchedProcess};

use crate::runtime::driver::StreamSource;
use parking_lot::Mutex;

/// Lifecycle of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// An OS wait is outstanding and will be resubmitted after it fires.
    Armed,
    /// The handle is gone; the outstanding wait has not completed yet.
    Closing,
    /// The final completion has been decoded.
    Closed,
}

/// Table record of a live watcher.
pub struct WatcherEntry {
    state: Mutex<WatchState>,
    source: StreamSource,
}

impl WatcherEntry {
    pub(crate) fn new(source: StreamSource) -> Self {
        Self {
            state: Mutex::new(WatchState::Armed),
            source,
        }
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock()
    }

    pub(crate) fn source(&self) -> &StreamSource {
        &self.source
    }

    /// Move `Armed` to `Closing`. Returns false if already past `Armed`.
    pub(crate) fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        if *state != WatchState::Armed {
            return false;
        }
        *state = WatchState::Closing;
        true
    }

    /// Enter `Closed`, returning the state it left.
    pub(crate) fn finish(&self) -> WatchState {
        std::mem::replace(&mut *self.state.lock(), WatchState::Closed)
    }
}

impl std::fmt::Debug for WatcherEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherEntry")
            .field("state", &self.state())
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::child::pipe;

    #[test]
    fn test_state_transitions() {
        let (read, _write) = pipe().unwrap();
        let entry = WatcherEntry::new(StreamSource::new(read).unwrap());
        assert_eq!(entry.state(), WatchState::Armed);
        assert!(entry.begin_close());
        assert!(!entry.begin_close());
        assert_eq!(entry.state(), WatchState::Closing);
        assert_eq!(entry.finish(), WatchState::Closing);
        assert_eq!(entry.finish(), WatchState::Closed);
    }
}
