//! Path-level filesystem operations
//!
//! These complete synchronously except `find_files`, which lists a
//! directory on a worker.

use crate::error::{os_code, ErrorPair, OsResult};
use crate::runtime::completion::Delivery;
use crate::runtime::work::WorkItem;
use crate::runtime::Runtime;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

fn c_path(origin: &'static str, path: &Path) -> OsResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| ErrorPair::bad_arguments(origin))
}

pub fn delete_file(path: &Path) -> OsResult<()> {
    std::fs::remove_file(path).map_err(|e| ErrorPair::from_io("delete_file", &e))
}

/// Rename `from` to `to`. Without `replace` an existing `to` is an
/// `EEXIST` failure.
pub fn move_file(from: &Path, to: &Path, replace: bool) -> OsResult<()> {
    const ORIGIN: &str = "move_file";
    if replace {
        return std::fs::rename(from, to).map_err(|e| ErrorPair::from_io(ORIGIN, &e));
    }
    let from = c_path(ORIGIN, from)?;
    let to = c_path(ORIGIN, to)?;
    let rc = unsafe {
        libc::renameat2(
            libc::AT_FDCWD,
            from.as_ptr(),
            libc::AT_FDCWD,
            to.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if rc < 0 {
        return Err(ErrorPair::last_os_error(ORIGIN));
    }
    Ok(())
}

pub fn create_directory(path: &Path) -> OsResult<()> {
    std::fs::create_dir(path).map_err(|e| ErrorPair::from_io("create_directory", &e))
}

/// Remove an empty directory.
pub fn remove_directory(path: &Path) -> OsResult<()> {
    std::fs::remove_dir(path).map_err(|e| ErrorPair::from_io("remove_directory", &e))
}

pub fn create_hard_link(from: &Path, to: &Path) -> OsResult<()> {
    std::fs::hard_link(from, to).map_err(|e| ErrorPair::from_io("create_hard_link", &e))
}

/// Space on the filesystem holding a path, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    /// Available to unprivileged callers.
    pub available: u64,
    pub total: u64,
    pub free: u64,
}

pub fn disk_free_space(path: &Path) -> OsResult<DiskSpace> {
    const ORIGIN: &str = "disk_free_space";
    let path = c_path(ORIGIN, path)?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut stats) } < 0 {
        return Err(ErrorPair::last_os_error(ORIGIN));
    }
    let unit = stats.f_frsize as u64;
    Ok(DiskSpace {
        available: stats.f_bavail as u64 * unit,
        total: stats.f_blocks as u64 * unit,
        free: stats.f_bfree as u64 * unit,
    })
}

pub fn executable_path() -> OsResult<PathBuf> {
    std::env::current_exe().map_err(|e| ErrorPair::from_io("executable_path", &e))
}

/// Absolute form of `path` with `.` and `..` resolved lexically.
///
/// Symlinks are not followed and the path need not exist.
pub fn full_path(path: &Path) -> OsResult<PathBuf> {
    let base = if path.is_absolute() {
        PathBuf::new()
    } else {
        std::env::current_dir().map_err(|e| ErrorPair::from_io("full_path", &e))?
    };
    let mut full = base;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::CurDir => {}
            Component::RootDir => full.push("/"),
            Component::ParentDir => {
                full.pop();
            }
            Component::Normal(part) => full.push(part),
        }
    }
    Ok(full)
}

/// One directory entry reported by `find_files`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFile {
    pub name: String,
    pub is_dir: bool,
    pub len: u64,
}

pub type FindCallback = Box<dyn FnOnce(OsResult<Vec<FoundFile>>) + Send>;

struct FindFiles {
    dir: PathBuf,
    found: Vec<FoundFile>,
    callback: FindCallback,
}

impl FindFiles {
    fn list(&mut self) -> io::Result<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            self.found.push(FoundFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                len: metadata.len(),
            });
        }
        self.found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }
}

impl WorkItem for FindFiles {
    fn work(&mut self) -> u32 {
        match self.list() {
            Ok(()) => 0,
            Err(err) => os_code(&err),
        }
    }

    fn decode(self: Box<Self>, _rt: &Runtime, status: u32) -> Delivery {
        let FindFiles { found, callback, .. } = *self;
        let result = match status {
            0 => Ok(found),
            code => Err(ErrorPair::new("find_files", code)),
        };
        Delivery::new(move || callback(result))
    }
}

impl Runtime {
    /// List `dir` on a worker, sorted by name. A missing directory lists
    /// as empty.
    pub fn find_files(&self, dir: &Path, callback: FindCallback) -> OsResult<()> {
        self.schedule_work(Box::new(FindFiles {
            dir: dir.to_path_buf(),
            found: Vec::new(),
            callback,
        }))
    }
}
