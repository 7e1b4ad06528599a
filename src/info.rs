//! Host and runtime information

use crate::error::{ErrorPair, OsResult};
use crate::runtime::Runtime;
use rand::RngCore;
use std::fmt;

pub use crate::error::error_string;

/// Milliseconds on the monotonic clock.
pub fn tick_count() -> u64 {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid pointer
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    now.tv_sec as u64 * 1000 + now.tv_nsec as u64 / 1_000_000
}

pub fn computer_name() -> OsResult<String> {
    let mut name = [0u8; 256];
    if unsafe { libc::gethostname(name.as_mut_ptr().cast(), name.len()) } < 0 {
        return Err(ErrorPair::last_os_error("computer_name"));
    }
    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
    Ok(String::from_utf8_lossy(&name[..end]).into_owned())
}

/// A random (version 4) GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

pub fn create_guid() -> Guid {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Guid(bytes)
}

/// Live handles per resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleCounts {
    pub ports: usize,
    pub processes: usize,
    pub listeners: usize,
    pub hashes: usize,
    pub watchers: usize,
    /// Operation records waiting for a completion.
    pub outstanding: usize,
}

impl Runtime {
    pub fn handle_counts(&self) -> HandleCounts {
        HandleCounts {
            ports: self.ports.len(),
            processes: self.processes.len(),
            listeners: self.listeners.len(),
            hashes: self.hashes.len(),
            watchers: self.watchers.len(),
            outstanding: self.engine().side_table().outstanding(),
        }
    }
}
