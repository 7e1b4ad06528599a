//! Directory-change watcher over inotify
//!
//! The watcher reads the inotify descriptor through the reactor. Each read
//! completion is decoded into [`Change`] records, the next read is queued,
//! and only then is the callback invoked, so successive batches reach the
//! callback strictly in order.

use super::{WatchState, WatcherEntry};
use crate::error::{code, ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::runtime::completion::{Delivery, Descriptor};
use crate::runtime::driver::{StreamOp, StreamSource};
use crate::runtime::overlapped::IoBuffer;
use crate::runtime::Runtime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Size of `struct inotify_event` without its name.
const EVENT_HEADER: usize = 16;

const WATCH_MASK: u32 = libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_MODIFY
    | libc::IN_ATTRIB
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO;

/// What happened to a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Added,
    Removed,
    Modified,
    RenamedOld,
    RenamedNew,
}

impl ChangeAction {
    /// Numeric action code reported to callers.
    pub fn code(self) -> u32 {
        match self {
            ChangeAction::Added => 1,
            ChangeAction::Removed => 2,
            ChangeAction::Modified => 3,
            ChangeAction::RenamedOld => 4,
            ChangeAction::RenamedNew => 5,
        }
    }

    fn from_mask(mask: u32) -> Option<Self> {
        if mask & libc::IN_CREATE != 0 {
            Some(ChangeAction::Added)
        } else if mask & libc::IN_DELETE != 0 {
            Some(ChangeAction::Removed)
        } else if mask & libc::IN_MOVED_FROM != 0 {
            Some(ChangeAction::RenamedOld)
        } else if mask & libc::IN_MOVED_TO != 0 {
            Some(ChangeAction::RenamedNew)
        } else if mask & (libc::IN_MODIFY | libc::IN_ATTRIB) != 0 {
            Some(ChangeAction::Modified)
        } else {
            None
        }
    }
}

/// One change, named relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub action: ChangeAction,
    pub name: String,
}

/// Invoked once per batch of changes, and once with `Err(code)` when the
/// watcher ends.
pub type ChangeCallback = Box<dyn FnMut(Result<Vec<Change>, u32>) + Send>;

type SharedCallback = Arc<Mutex<ChangeCallback>>;

/// A raw `inotify_event` record.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawEvent {
    wd: i32,
    mask: u32,
    name: Option<String>,
}

/// Split a read buffer into event records, in the order the kernel wrote
/// them. A truncated trailing record is dropped.
fn parse_records(bytes: &[u8]) -> Vec<RawEvent> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset + EVENT_HEADER <= bytes.len() {
        let field = |at: usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[offset + at..offset + at + 4]);
            word
        };
        let wd = i32::from_ne_bytes(field(0));
        let mask = u32::from_ne_bytes(field(4));
        let len = u32::from_ne_bytes(field(12)) as usize;
        let name_start = offset + EVENT_HEADER;
        let Some(name_bytes) = bytes.get(name_start..name_start + len) else {
            log::warn!("truncated inotify record at offset {}", offset);
            break;
        };
        let trimmed = match name_bytes.iter().position(|&b| b == 0) {
            Some(nul) => &name_bytes[..nul],
            None => name_bytes,
        };
        let name = (!trimmed.is_empty()).then(|| String::from_utf8_lossy(trimmed).into_owned());
        events.push(RawEvent { wd, mask, name });
        offset = name_start + len;
    }
    events
}

/// The set of directories under one inotify descriptor.
struct WatchTree {
    fd: RawFd,
    root: PathBuf,
    subtree: bool,
    /// Watch descriptor to directory, relative to `root`.
    dirs: HashMap<i32, PathBuf>,
}

impl WatchTree {
    fn add(&mut self, relative: PathBuf) -> std::io::Result<()> {
        let full = self.root.join(&relative);
        let path = CString::new(full.as_os_str().as_bytes())
            .map_err(|_| std::io::Error::from_raw_os_error(libc::EINVAL))?;
        let wd = unsafe { libc::inotify_add_watch(self.fd, path.as_ptr(), WATCH_MASK | libc::IN_ONLYDIR) };
        if wd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        log::trace!("inotify wd {} watches {}", wd, full.display());
        self.dirs.insert(wd, relative.clone());

        if self.subtree {
            for entry in std::fs::read_dir(&full)?.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    let child = relative.join(entry.file_name());
                    if let Err(err) = self.add(child) {
                        log::debug!("cannot watch {}: {}", entry.path().display(), err);
                    }
                }
            }
        }
        Ok(())
    }

    /// Changes in kernel order. Stops at a queue overflow, since nothing
    /// after it describes the directory faithfully.
    fn decode(&mut self, events: Vec<RawEvent>) -> Batch {
        let mut changes = Vec::with_capacity(events.len());
        for event in events {
            if event.mask & libc::IN_Q_OVERFLOW != 0 || event.wd < 0 {
                log::warn!("inotify queue overflowed under {}", self.root.display());
                return Batch {
                    changes,
                    overflowed: true,
                };
            }
            if event.mask & libc::IN_IGNORED != 0 {
                self.dirs.remove(&event.wd);
                continue;
            }
            let (Some(dir), Some(name)) = (self.dirs.get(&event.wd), event.name) else {
                continue;
            };
            let relative = dir.join(&name);
            let Some(action) = ChangeAction::from_mask(event.mask) else {
                continue;
            };
            let new_dir = event.mask & libc::IN_ISDIR != 0
                && matches!(action, ChangeAction::Added | ChangeAction::RenamedNew);
            if self.subtree && new_dir {
                if let Err(err) = self.add(relative.clone()) {
                    log::debug!("cannot watch new directory {}: {}", relative.display(), err);
                }
            }
            changes.push(Change {
                action,
                name: relative.to_string_lossy().into_owned(),
            });
        }
        Batch {
            changes,
            overflowed: false,
        }
    }
}

/// Decoded result of one read.
#[derive(Debug, PartialEq, Eq)]
struct Batch {
    changes: Vec<Change>,
    overflowed: bool,
}

/// Owned by the outstanding read.
struct DirectoryCore {
    handle: Handle,
    entry: Arc<WatcherEntry>,
    buffer: IoBuffer,
    tree: WatchTree,
    callback: SharedCallback,
}

impl DirectoryCore {
    /// Queue the next read. On failure the watcher is retired; the error
    /// comes back with the delivery that reports it.
    fn arm(self, rt: &Runtime) -> Result<(), (u32, Delivery)> {
        let source = self.entry.source().clone();
        let op = StreamOp::Read {
            buffer: self.buffer.clone(),
            start: 0,
            len: self.buffer.len(),
        };
        let descriptor = rt.engine().side_table().register(self);
        log::trace!("directory watcher armed as {}", descriptor.0);
        match rt.driver().submit(&source, op, complete_directory_read, descriptor) {
            Ok(()) => Ok(()),
            Err(err) => match rt.engine().side_table().take::<DirectoryCore>(descriptor) {
                Some(core) => Err((err.code, core.finish(rt, err.code))),
                None => Err((err.code, Delivery::none())),
            },
        }
    }

    /// Retire the watcher and report its terminal error.
    fn finish(self, rt: &Runtime, error: u32) -> Delivery {
        let DirectoryCore {
            handle,
            entry,
            callback,
            ..
        } = self;
        let previous = entry.finish();
        rt.watchers.remove_if(handle, |live| Arc::ptr_eq(live, &entry));
        rt.driver().cancel(entry.source());
        let error = if previous == WatchState::Closing {
            code::CANCELLED
        } else {
            error
        };
        log::debug!("directory watcher {} closed: error={}", handle, error);
        Delivery::new(move || (*callback.lock())(Err(error)))
    }
}

fn complete_directory_read(rt: &Runtime, count: u32, descriptor: Descriptor, error: u32) -> Delivery {
    let Some(mut core) = rt.engine().side_table().take::<DirectoryCore>(descriptor) else {
        log::warn!("directory read for unknown descriptor {}", descriptor.0);
        return Delivery::none();
    };
    if error != 0 {
        return core.finish(rt, error);
    }
    if core.entry.state() != WatchState::Armed {
        return core.finish(rt, code::CANCELLED);
    }

    let bytes = core.buffer.copy_range(0, count as usize);
    let Batch { changes, overflowed } = core.tree.decode(parse_records(&bytes));
    log::trace!("directory watcher {}: {} changes", core.handle, changes.len());
    let callback = Arc::clone(&core.callback);

    let after = if overflowed {
        Some(core.finish(rt, code::CHANGES_LOST))
    } else {
        core.arm(rt).err().map(|(_, failure)| failure)
    };
    if changes.is_empty() {
        return after.unwrap_or_else(Delivery::none);
    }
    Delivery::new(move || {
        (*callback.lock())(Ok(changes));
        if let Some(after) = after {
            after.deliver();
        }
    })
}

impl Runtime {
    /// Watch `path` for changes, including every subdirectory when
    /// `subtree` is set.
    ///
    /// `callback` receives each batch of changes, oldest first, and
    /// `Err(ECANCELED)` exactly once after the watcher is closed. If the
    /// kernel drops records the watcher ends with `Err(ENOBUFS)` instead.
    pub fn watch_directory(&self, path: &Path, subtree: bool, callback: ChangeCallback) -> OsResult<Handle> {
        const ORIGIN: &str = "watch_directory";
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(ErrorPair::last_os_error(ORIGIN));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut tree = WatchTree {
            fd: raw,
            root: path.to_path_buf(),
            subtree,
            dirs: HashMap::new(),
        };
        tree.add(PathBuf::new()).map_err(|e| ErrorPair::from_io(ORIGIN, &e))?;

        let source = StreamSource::new(fd).map_err(|e| ErrorPair::from_io(ORIGIN, &e))?;
        let entry = Arc::new(WatcherEntry::new(source));
        let handle = self.watchers.allocate(Arc::clone(&entry));
        let core = DirectoryCore {
            handle,
            entry,
            buffer: IoBuffer::new(self.config().watcher.buffer_size),
            tree,
            callback: Arc::new(Mutex::new(callback)),
        };
        if let Err((error, delivery)) = core.arm(self) {
            drop(delivery);
            return Err(ErrorPair::new(ORIGIN, error));
        }
        log::debug!("watching {} as watcher {} (subtree={})", path.display(), handle, subtree);
        Ok(handle)
    }

    /// Invalidate the handle and cancel the outstanding read.
    ///
    /// The callback learns of the close through the cancelled read.
    pub fn close_directory_watcher(&self, watcher: Handle) -> OsResult<()> {
        let entry = self
            .watchers
            .deallocate(watcher)
            .ok_or(ErrorPair::invalid_handle("close_directory_watcher"))?;
        if entry.begin_close() {
            self.driver().cancel(entry.source());
        }
        log::debug!("closing directory watcher {}", watcher);
        Ok(())
    }

    /// State of a live watcher, or `None` once its handle is gone.
    pub fn watcher_state(&self, watcher: Handle) -> Option<WatchState> {
        self.watchers.with(watcher, |entry| entry.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(wd: i32, mask: u32, name: &str, padded: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&wd.to_ne_bytes());
        bytes.extend_from_slice(&mask.to_ne_bytes());
        bytes.extend_from_slice(&0u32.to_ne_bytes());
        bytes.extend_from_slice(&(padded as u32).to_ne_bytes());
        let mut name = name.as_bytes().to_vec();
        name.resize(padded, 0);
        bytes.extend_from_slice(&name);
        bytes
    }

    #[test]
    fn test_parse_records_in_kernel_order() {
        let mut bytes = record(1, libc::IN_CREATE, "a.txt", 16);
        bytes.extend(record(1, libc::IN_MODIFY, "a.txt", 16));
        bytes.extend(record(1, libc::IN_DELETE, "b", 4));
        let events = parse_records(&bytes);
        let names: Vec<_> = events.iter().map(|e| e.name.clone().unwrap()).collect();
        assert_eq!(names, ["a.txt", "a.txt", "b"]);
        assert_eq!(events[1].mask, libc::IN_MODIFY);
    }

    #[test]
    fn test_parse_records_without_name() {
        let events = parse_records(&record(3, libc::IN_IGNORED, "", 0));
        assert_eq!(
            events,
            vec![RawEvent {
                wd: 3,
                mask: libc::IN_IGNORED,
                name: None
            }]
        );
    }

    #[test]
    fn test_parse_records_drops_truncated_tail() {
        let mut bytes = record(1, libc::IN_CREATE, "kept", 8);
        let tail = record(1, libc::IN_CREATE, "lost", 8);
        bytes.extend_from_slice(&tail[..EVENT_HEADER + 2]);
        assert_eq!(parse_records(&bytes).len(), 1);
    }

    #[test]
    fn test_action_codes() {
        assert_eq!(ChangeAction::from_mask(libc::IN_CREATE), Some(ChangeAction::Added));
        assert_eq!(ChangeAction::from_mask(libc::IN_ATTRIB), Some(ChangeAction::Modified));
        assert_eq!(ChangeAction::from_mask(libc::IN_MOVED_TO), Some(ChangeAction::RenamedNew));
        assert_eq!(ChangeAction::from_mask(libc::IN_OPEN), None);
        let codes: Vec<_> = [
            ChangeAction::Added,
            ChangeAction::Removed,
            ChangeAction::Modified,
            ChangeAction::RenamedOld,
            ChangeAction::RenamedNew,
        ]
        .iter()
        .map(|a| a.code())
        .collect();
        assert_eq!(codes, [1, 2, 3, 4, 5]);
    }

    fn tree() -> WatchTree {
        WatchTree {
            fd: -1,
            root: PathBuf::from("/nonexistent"),
            subtree: false,
            dirs: HashMap::from([(1, PathBuf::new()), (2, PathBuf::from("sub"))]),
        }
    }

    fn event(wd: i32, mask: u32, name: Option<&str>) -> RawEvent {
        RawEvent {
            wd,
            mask,
            name: name.map(String::from),
        }
    }

    #[test]
    fn test_decode_names_relative_to_root() {
        let mut tree = tree();
        let batch = tree.decode(vec![
            event(2, libc::IN_CREATE, Some("x")),
            event(1, libc::IN_DELETE, Some("y")),
            event(2, libc::IN_IGNORED, None),
        ]);
        assert_eq!(
            batch,
            Batch {
                changes: vec![
                    Change {
                        action: ChangeAction::Added,
                        name: "sub/x".into()
                    },
                    Change {
                        action: ChangeAction::Removed,
                        name: "y".into()
                    },
                ],
                overflowed: false,
            }
        );
        assert!(!tree.dirs.contains_key(&2));
    }

    #[test]
    fn test_decode_stops_at_overflow() {
        let mut tree = tree();
        let batch = tree.decode(vec![
            event(2, libc::IN_CREATE, Some("x")),
            event(-1, libc::IN_Q_OVERFLOW, None),
            event(1, libc::IN_DELETE, Some("y")),
        ]);
        assert!(batch.overflowed);
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].name, "sub/x");
    }

    fn forward_to(tx: crossbeam_channel::Sender<Result<Vec<Change>, u32>>) -> SharedCallback {
        let callback: ChangeCallback = Box::new(move |batch| tx.send(batch).unwrap());
        Arc::new(Mutex::new(callback))
    }

    #[test]
    fn test_overflow_ends_watcher_with_changes_lost() {
        let rt = Runtime::new();
        let (read_end, _write_end) = crate::port::child::pipe().unwrap();
        let entry = Arc::new(WatcherEntry::new(StreamSource::new(read_end).unwrap()));
        let handle = rt.watchers.allocate(Arc::clone(&entry));

        let mut bytes = record(1, libc::IN_CREATE, "before", 8);
        bytes.extend(record(-1, libc::IN_Q_OVERFLOW, "", 0));
        let count = bytes.len() as u32;
        let (tx, rx) = crossbeam_channel::unbounded();
        let core = DirectoryCore {
            handle,
            entry,
            buffer: IoBuffer::from_vec(bytes),
            tree: tree(),
            callback: forward_to(tx),
        };
        let descriptor = rt.engine().side_table().register(core);

        complete_directory_read(&rt, count, descriptor, 0).deliver();
        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                Ok(vec![Change {
                    action: ChangeAction::Added,
                    name: "before".into()
                }]),
                Err(code::CHANGES_LOST),
            ]
        );
        assert_eq!(rt.watcher_state(handle), None);
        assert_eq!(rt.engine().side_table().outstanding(), 0);
    }

    #[test]
    fn test_overflow_alone_is_still_reported() {
        let rt = Runtime::new();
        let (read_end, _write_end) = crate::port::child::pipe().unwrap();
        let entry = Arc::new(WatcherEntry::new(StreamSource::new(read_end).unwrap()));
        let handle = rt.watchers.allocate(Arc::clone(&entry));

        let bytes = record(-1, libc::IN_Q_OVERFLOW, "", 0);
        let count = bytes.len() as u32;
        let (tx, rx) = crossbeam_channel::unbounded();
        let core = DirectoryCore {
            handle,
            entry,
            buffer: IoBuffer::from_vec(bytes),
            tree: tree(),
            callback: forward_to(tx),
        };
        let descriptor = rt.engine().side_table().register(core);

        complete_directory_read(&rt, count, descriptor, 0).deliver();
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![Err(code::CHANGES_LOST)]);
        assert_eq!(rt.close_directory_watcher(handle).unwrap_err().code, code::INVALID_HANDLE);
    }

    #[test]
    fn test_first_arm_failure_reports_driver_error() {
        let dir = tempfile::tempdir().unwrap();
        let rt = Runtime::new();
        rt.driver().shutdown();
        let err = rt
            .watch_directory(dir.path(), false, Box::new(|_| panic!("callback after failed watch")))
            .unwrap_err();
        assert_eq!(err, ErrorPair::new("watch_directory", code::SHUT_DOWN));
        assert_eq!(rt.handle_counts().watchers, 0);
        assert_eq!(rt.engine().side_table().outstanding(), 0);
    }
}
