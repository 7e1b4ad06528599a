//! Uniform error pairs
//!
//! Every non-fatal failure in osport is an `(origin, code)` pair: `origin`
//! names the operation that failed and `code` is an errno value, so callers
//! can branch on both without parsing messages.

use std::fmt;
use std::io;
use thiserror::Error;

/// Named error codes used by the core.
pub mod code {
    /// Unknown or erased handle.
    pub const INVALID_HANDLE: u32 = libc::EBADF as u32;
    /// Malformed offset, length, position or argument list.
    pub const BAD_ARGUMENTS: u32 = libc::EINVAL as u32;
    /// Operation not supported by this device.
    pub const ACCESS_DENIED: u32 = libc::EACCES as u32;
    /// Resource has an exclusive operation in flight.
    pub const BUSY: u32 = libc::EBUSY as u32;
    /// Operation was cancelled by a close.
    pub const CANCELLED: u32 = libc::ECANCELED as u32;
    /// No worker capacity left to schedule the operation.
    pub const EXHAUSTED: u32 = libc::EAGAIN as u32;
    /// Pipe has no client connected yet.
    pub const NOT_CONNECTED: u32 = libc::ENOTCONN as u32;
    /// Target already exists.
    pub const ALREADY_EXISTS: u32 = libc::EEXIST as u32;
    /// Generic I/O failure.
    pub const IO: u32 = libc::EIO as u32;
    /// The I/O driver has stopped.
    pub const SHUT_DOWN: u32 = libc::ESHUTDOWN as u32;
    /// The kernel dropped change records; the watcher can no longer be trusted.
    pub const CHANGES_LOST: u32 = libc::ENOBUFS as u32;
}

/// A non-fatal failure: which operation failed and the errno it failed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("{origin}: {} (code {code})", describe(.code))]
pub struct ErrorPair {
    pub origin: &'static str,
    pub code: u32,
}

impl ErrorPair {
    pub fn new(origin: &'static str, code: u32) -> Self {
        Self { origin, code }
    }

    /// Build a pair from an I/O error, keeping its errno when it has one.
    pub fn from_io(origin: &'static str, err: &io::Error) -> Self {
        Self::new(origin, os_code(err))
    }

    /// Build a pair from the calling thread's current errno.
    pub fn last_os_error(origin: &'static str) -> Self {
        Self::from_io(origin, &io::Error::last_os_error())
    }

    pub fn invalid_handle(origin: &'static str) -> Self {
        Self::new(origin, code::INVALID_HANDLE)
    }

    pub fn bad_arguments(origin: &'static str) -> Self {
        Self::new(origin, code::BAD_ARGUMENTS)
    }

    pub fn access_denied(origin: &'static str) -> Self {
        Self::new(origin, code::ACCESS_DENIED)
    }

    pub fn busy(origin: &'static str) -> Self {
        Self::new(origin, code::BUSY)
    }

    pub fn not_connected(origin: &'static str) -> Self {
        Self::new(origin, code::NOT_CONNECTED)
    }
}

/// Result type for osport operations.
pub type OsResult<T> = Result<T, ErrorPair>;

/// Errno carried by an I/O error.
///
/// Errors synthesized by the standard library have no errno; those are
/// mapped from their kind, falling back to `EIO`.
pub fn os_code(err: &io::Error) -> u32 {
    if let Some(raw) = err.raw_os_error() {
        return raw as u32;
    }
    let raw = match err.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::ConnectionRefused => libc::ECONNREFUSED,
        io::ErrorKind::NotConnected => libc::ENOTCONN,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        _ => libc::EIO,
    };
    raw as u32
}

/// Human readable description of an error code.
pub fn error_string(code: u32) -> String {
    io::Error::from_raw_os_error(code as i32).to_string()
}

fn describe(code: &u32) -> String {
    error_string(*code)
}

/// Report a broken dispatch mechanism and terminate the process.
pub(crate) fn fatal(who: &str, err: impl fmt::Display) -> ! {
    log::error!("{}: {}", who, err);
    eprintln!("osport: fatal: {}: {}", who, err);
    std::process::exit(1)
}
