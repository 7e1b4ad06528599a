//! Child-process stdio pipes
//!
//! Half-duplex: the parent reads the child's merged stdout/stderr and
//! writes its stdin. Each end implements only its own direction.

use super::{stream_read, stream_write, Readable, Transfer, Writable};
use crate::error::OsResult;
use crate::runtime::driver::StreamSource;
use crate::runtime::overlapped::IoCallback;
use crate::runtime::Runtime;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

/// Parent's read end of the child's output.
pub struct ChildReader {
    source: StreamSource,
}

/// Parent's write end of the child's input.
pub struct ChildWriter {
    source: StreamSource,
}

impl ChildReader {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            source: StreamSource::new(fd)?,
        })
    }

    pub(super) fn release(&self, rt: &Runtime) {
        rt.driver().cancel(&self.source);
    }
}

impl ChildWriter {
    pub(crate) fn new(fd: OwnedFd) -> io::Result<Self> {
        Ok(Self {
            source: StreamSource::new(fd)?,
        })
    }

    pub(super) fn release(&self, rt: &Runtime) {
        rt.driver().cancel(&self.source);
    }
}

impl Readable for ChildReader {
    fn read(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        stream_read(rt, &self.source, transfer, callback)
    }
}

impl Writable for ChildWriter {
    fn write(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        stream_write(rt, &self.source, transfer, callback)
    }
}

/// Anonymous pipe as `(read end, write end)`, both close-on-exec.
pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}
