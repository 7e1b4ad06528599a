//! Per-operation request records
//!
//! An [`OverlappedRequest`] pins a buffer and a callback for the duration
//! of one native operation. Arming parks it in the side table; the
//! completion takes it back out exactly once.

use super::completion::{CompletionEngine, Delivery, Descriptor};
use super::Runtime;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Byte buffer shared between a caller and in-flight operations.
///
/// Cloning shares the storage; an operation keeps its clone until its
/// completion is decoded, so the bytes outlive the caller's reference.
#[derive(Clone, Default)]
pub struct IoBuffer(Arc<Mutex<Vec<u8>>>);

impl IoBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(bytes)))
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock()
    }

    /// Copy of `len` bytes starting at `start`, clamped to the buffer.
    pub fn copy_range(&self, start: usize, len: usize) -> Vec<u8> {
        let bytes = self.0.lock();
        let start = start.min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        bytes[start..end].to_vec()
    }

    /// Copy of exactly `start..start + len`, or `None` when out of range.
    pub fn take_range(&self, start: usize, len: usize) -> Option<Vec<u8>> {
        let bytes = self.0.lock();
        let end = start.checked_add(len)?;
        bytes.get(start..end).map(<[u8]>::to_vec)
    }

    /// Copy `data` in at `start`. Returns false when it does not fit.
    pub fn fill(&self, start: usize, data: &[u8]) -> bool {
        let mut bytes = self.0.lock();
        let Some(slot) = start
            .checked_add(data.len())
            .and_then(|end| bytes.get_mut(start..end))
        else {
            return false;
        };
        slot.copy_from_slice(data);
        true
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Number of clones currently pinning the storage.
    pub fn pins(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IoBuffer({} bytes)", self.len())
    }
}

/// Decoded outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoResult {
    pub count: u32,
    pub error: u32,
}

impl IoResult {
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

/// Completion callback for a single transfer.
pub type IoCallback = Box<dyn FnOnce(IoResult) + Send>;

/// Buffer and callback pinned across one native operation.
pub struct OverlappedRequest {
    buffer: IoBuffer,
    callback: IoCallback,
}

impl OverlappedRequest {
    pub fn new(buffer: IoBuffer, callback: IoCallback) -> Self {
        Self { buffer, callback }
    }

    pub fn buffer(&self) -> &IoBuffer {
        &self.buffer
    }

    /// Park the request until its completion arrives.
    pub fn arm(self, engine: &CompletionEngine) -> Descriptor {
        let descriptor = engine.side_table().register(self);
        log::trace!("armed request {}", descriptor.0);
        descriptor
    }

    /// Drop a request whose operation never reached the driver.
    pub(crate) fn disarm(engine: &CompletionEngine, descriptor: Descriptor) {
        if engine.side_table().take::<OverlappedRequest>(descriptor).is_none() {
            log::warn!("disarm of unknown request {}", descriptor.0);
        }
    }
}

/// Decoder for native transfers carrying an [`OverlappedRequest`].
pub fn complete_overlapped(rt: &Runtime, count: u32, descriptor: Descriptor, error: u32) -> Delivery {
    let Some(request) = rt.engine().side_table().take::<OverlappedRequest>(descriptor) else {
        log::warn!("completion for unknown request {}", descriptor.0);
        return Delivery::none();
    };
    log::trace!("request {} complete: count={} error={}", descriptor.0, count, error);
    let OverlappedRequest { buffer, callback } = request;
    drop(buffer);
    Delivery::new(move || callback(IoResult { count, error }))
}
