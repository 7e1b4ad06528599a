//! Random-access files
//!
//! Transfers run as positional `pread`/`pwrite` on driver lanes, so any
//! number may be outstanding against one file at distinct offsets.

use super::{HasSize, Port, Readable, Transfer, Writable};
use crate::error::{ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::runtime::driver::Direction;
use crate::runtime::overlapped::{complete_overlapped, IoCallback, OverlappedRequest};
use crate::runtime::Runtime;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Requested access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    ReadWrite,
}

/// What to do when the file does or does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Fail if it exists.
    CreateNew,
    /// Create or truncate.
    CreateAlways,
    /// Fail if missing.
    OpenExisting,
    /// Create if missing.
    OpenAlways,
    /// Truncate; fail if missing.
    TruncateExisting,
}

pub struct FilePort {
    file: Arc<File>,
    path: PathBuf,
}

impl FilePort {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn transfer(&self, rt: &Runtime, direction: Direction, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        let origin = match direction {
            Direction::Read => "read_port",
            Direction::Write => "write_port",
        };
        let offset = transfer.position.ok_or(ErrorPair::bad_arguments(origin))?;
        let descriptor = OverlappedRequest::new(transfer.buffer.clone(), callback).arm(rt.engine());
        rt.driver()
            .submit_positional(
                Arc::clone(&self.file),
                direction,
                transfer.buffer,
                transfer.start,
                transfer.len,
                offset,
                complete_overlapped,
                descriptor,
            )
            .map_err(|err| {
                OverlappedRequest::disarm(rt.engine(), descriptor);
                err
            })
    }
}

impl Readable for FilePort {
    fn read(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        self.transfer(rt, Direction::Read, transfer, callback)
    }
}

impl Writable for FilePort {
    fn write(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        self.transfer(rt, Direction::Write, transfer, callback)
    }
}

impl HasSize for FilePort {
    fn size(&self) -> OsResult<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| ErrorPair::from_io("port_size", &e))
    }
}

impl Runtime {
    /// Open a file port.
    pub fn open_file(&self, path: &Path, access: FileAccess, disposition: Disposition) -> OsResult<Handle> {
        let read_only = access == FileAccess::Read;
        if read_only && matches!(disposition, Disposition::CreateAlways | Disposition::TruncateExisting) {
            return Err(ErrorPair::bad_arguments("open_file"));
        }
        let mut options = OpenOptions::new();
        options
            .read(matches!(access, FileAccess::Read | FileAccess::ReadWrite))
            .write(matches!(access, FileAccess::Write | FileAccess::ReadWrite));
        match disposition {
            // std refuses to create without write access; the flags do not
            Disposition::CreateNew if read_only => {
                options.custom_flags(libc::O_CREAT | libc::O_EXCL);
            }
            Disposition::OpenAlways if read_only => {
                options.custom_flags(libc::O_CREAT);
            }
            Disposition::CreateNew => {
                options.create_new(true);
            }
            Disposition::CreateAlways => {
                options.create(true).truncate(true);
            }
            Disposition::OpenExisting => {}
            Disposition::OpenAlways => {
                options.create(true);
            }
            Disposition::TruncateExisting => {
                options.truncate(true);
            }
        }
        let file = options
            .open(path)
            .map_err(|e| ErrorPair::from_io("open_file", &e))?;
        Ok(self.install_port(Port::File(FilePort {
            file: Arc::new(file),
            path: path.to_path_buf(),
        })))
    }
}
