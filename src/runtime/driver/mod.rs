//! The I/O driver
//!
//! Native overlapped operations are carried out here and finished by
//! posting into the completion queue:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          I/O DRIVER                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Reactor thread: epoll readiness, nonblocking read/write/accept  │
//! │                  on pipes, sockets and inotify descriptors       │
//! │  Lanes: pread/pwrite on files                                    │
//! │  Device lanes: blocking USB transfers with a bounded timeout     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each stream source keeps FIFO read and write queues. A completion's
//! error field is the errno of the failed call, or 0. Cancelling a source
//! completes everything still queued on it with `ECANCELED`.

pub mod event_loop;

use self::event_loop::{Event, EventLoop, Interest, Token, Waker};
use super::completion::{Descriptor, IoComplete, Poster};
use super::overlapped::IoBuffer;
use super::pool::ThreadPool;
use crate::config::OsportConfig;
use crate::error::{code, fatal, os_code, ErrorPair, OsResult};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Global source counter for unique identification
static SOURCE_COUNTER: AtomicU64 = AtomicU64::new(1);

const WAKER_TOKEN: Token = Token(0);

/// Identity of a stream source. Unlike descriptors these are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

struct SourceShared {
    id: SourceId,
    fd: OwnedFd,
    cancelled: AtomicBool,
}

/// A nonblocking descriptor driven by the reactor.
///
/// Clones share the descriptor; it is closed when the last clone (including
/// the ones held by queued operations) is dropped.
#[derive(Clone)]
pub struct StreamSource(Arc<SourceShared>);

impl StreamSource {
    /// Take ownership of `fd` and switch it to nonblocking mode.
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(Arc::new(SourceShared {
            id: SourceId(SOURCE_COUNTER.fetch_add(1, Ordering::Relaxed)),
            fd,
            cancelled: AtomicBool::new(false),
        })))
    }

    pub fn id(&self) -> SourceId {
        self.0.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Acquire)
    }
}

impl AsFd for StreamSource {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for StreamSource {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("id", &self.0.id)
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}

/// Receives the descriptor produced by an accept.
pub type AcceptSlot = Arc<Mutex<Option<OwnedFd>>>;

/// An operation on a stream source.
pub enum StreamOp {
    Read { buffer: IoBuffer, start: usize, len: usize },
    Write { buffer: IoBuffer, start: usize, len: usize, done: usize },
    Accept { slot: AcceptSlot },
}

impl StreamOp {
    pub fn write(buffer: IoBuffer, start: usize, len: usize) -> Self {
        StreamOp::Write {
            buffer,
            start,
            len,
            done: 0,
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, StreamOp::Write { .. })
    }
}

/// Direction of a positional transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

struct Pending {
    op: StreamOp,
    key: IoComplete,
    descriptor: Descriptor,
}

enum Command {
    Submit(StreamSource, Pending),
    Cancel(StreamSource),
    Shutdown,
}

pub struct Driver {
    commands: Sender<Command>,
    waker: Arc<Waker>,
    lanes: ThreadPool,
    devices: ThreadPool,
    poster: Poster,
    reactor: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    /// Create the epoll instance and start the reactor thread.
    pub fn start(config: &OsportConfig, poster: Poster) -> io::Result<Self> {
        let mut event_loop = EventLoop::new(config.driver.max_events)?;
        let waker = Arc::new(Waker::new()?);
        event_loop.register(waker.as_raw_fd(), WAKER_TOKEN, Interest::READABLE)?;

        let (tx, rx) = unbounded();
        let reactor = Reactor {
            event_loop,
            waker: Arc::clone(&waker),
            commands: rx,
            sources: HashMap::new(),
            poster: poster.clone(),
        };
        let handle = thread::Builder::new()
            .name("osport-reactor".into())
            .spawn(move || reactor.run())?;

        Ok(Self {
            commands: tx,
            waker,
            lanes: ThreadPool::new(
                "lane",
                config.driver.lane_threads,
                config.workers.queue_capacity,
            ),
            devices: ThreadPool::new(
                "device",
                config.driver.device_threads,
                config.workers.queue_capacity,
            ),
            poster,
            reactor: Mutex::new(Some(handle)),
        })
    }

    /// Queue an operation on a stream source.
    pub fn submit(
        &self,
        source: &StreamSource,
        op: StreamOp,
        key: IoComplete,
        descriptor: Descriptor,
    ) -> OsResult<()> {
        let pending = Pending {
            op,
            key,
            descriptor,
        };
        self.commands
            .send(Command::Submit(source.clone(), pending))
            .map_err(|_| ErrorPair::new("submit", code::SHUT_DOWN))?;
        self.waker.wake();
        Ok(())
    }

    /// Complete every queued operation on `source` with `ECANCELED` and
    /// stop watching it. Later submissions are cancelled immediately.
    pub fn cancel(&self, source: &StreamSource) {
        source.0.cancelled.store(true, Ordering::Release);
        if self.commands.send(Command::Cancel(source.clone())).is_ok() {
            self.waker.wake();
        }
    }

    /// Run a positional file transfer on a lane.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_positional(
        &self,
        file: Arc<File>,
        direction: Direction,
        buffer: IoBuffer,
        start: usize,
        len: usize,
        offset: u64,
        key: IoComplete,
        descriptor: Descriptor,
    ) -> OsResult<()> {
        self.submit_blocking(
            move || transfer_at(&file, direction, &buffer, start, len, offset),
            key,
            descriptor,
        )
    }

    /// Run a blocking transfer returning `(count, error)` on a lane.
    pub fn submit_blocking<F>(&self, transfer: F, key: IoComplete, descriptor: Descriptor) -> OsResult<()>
    where
        F: FnOnce() -> (u32, u32) + Send + 'static,
    {
        run_on(&self.lanes, &self.poster, transfer, key, descriptor)
    }

    /// Run a device transfer on the device lanes. Stalled devices never
    /// hold a file lane.
    pub fn submit_device<F>(&self, transfer: F, key: IoComplete, descriptor: Descriptor) -> OsResult<()>
    where
        F: FnOnce() -> (u32, u32) + Send + 'static,
    {
        run_on(&self.devices, &self.poster, transfer, key, descriptor)
    }
}

fn run_on<F>(pool: &ThreadPool, poster: &Poster, transfer: F, key: IoComplete, descriptor: Descriptor) -> OsResult<()>
where
    F: FnOnce() -> (u32, u32) + Send + 'static,
{
    let poster = poster.clone();
    pool.execute(Box::new(move || {
        let (count, error) = transfer();
        poster.post(count, key, descriptor, error);
    }))
    .map_err(|_rejected| ErrorPair::new("submit", code::EXHAUSTED))
}

impl Driver {
    /// Stop the reactor thread. Later stream submissions fail.
    pub(crate) fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).is_ok() {
            self.waker.wake();
        }
        if let Some(handle) = self.reactor.lock().take() {
            if handle.join().is_err() {
                log::error!("reactor thread panicked");
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn transfer_at(
    file: &File,
    direction: Direction,
    buffer: &IoBuffer,
    start: usize,
    len: usize,
    offset: u64,
) -> (u32, u32) {
    // the shared buffer is only locked to copy, never across the syscall
    let Some(mut scratch) = buffer.take_range(start, len) else {
        return (0, code::BAD_ARGUMENTS);
    };
    let count = loop {
        let result = match direction {
            Direction::Read => file.read_at(&mut scratch, offset),
            Direction::Write => file.write_at(&scratch, offset),
        };
        match result {
            Ok(n) => break n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return (0, os_code(&err)),
        }
    };
    if direction == Direction::Read && !buffer.fill(start, &scratch[..count]) {
        return (0, code::BAD_ARGUMENTS);
    }
    (count as u32, 0)
}

enum Attempt {
    Done(u32),
    WouldBlock,
    Failed(u32),
}

fn errno_attempt() -> Option<Attempt> {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
    match errno {
        libc::EINTR => None,
        e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => Some(Attempt::WouldBlock),
        e => Some(Attempt::Failed(e as u32)),
    }
}

/// Make as much progress on `op` as the descriptor allows right now.
fn attempt(fd: RawFd, op: &mut StreamOp) -> Attempt {
    match op {
        StreamOp::Read { buffer, start, len } => {
            let mut bytes = buffer.lock();
            let Some(slice) = start.checked_add(*len).and_then(|end| bytes.get_mut(*start..end)) else {
                return Attempt::Failed(code::BAD_ARGUMENTS);
            };
            loop {
                let n = unsafe { libc::read(fd, slice.as_mut_ptr().cast(), slice.len()) };
                if n >= 0 {
                    return Attempt::Done(n as u32);
                }
                if let Some(outcome) = errno_attempt() {
                    return outcome;
                }
            }
        }
        StreamOp::Write {
            buffer,
            start,
            len,
            done,
        } => {
            let bytes = buffer.lock();
            loop {
                let Some(slice) = start
                    .checked_add(*len)
                    .and_then(|end| bytes.get(*start + *done..end))
                else {
                    return Attempt::Failed(code::BAD_ARGUMENTS);
                };
                if slice.is_empty() {
                    return Attempt::Done(*done as u32);
                }
                let n = unsafe { libc::write(fd, slice.as_ptr().cast(), slice.len()) };
                if n > 0 {
                    *done += n as usize;
                    continue;
                }
                if n == 0 {
                    return Attempt::Done(*done as u32);
                }
                if let Some(outcome) = errno_attempt() {
                    return outcome;
                }
            }
        }
        StreamOp::Accept { slot } => loop {
            let accepted = unsafe {
                libc::accept4(fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_CLOEXEC)
            };
            if accepted >= 0 {
                *slot.lock() = Some(unsafe { OwnedFd::from_raw_fd(accepted) });
                return Attempt::Done(0);
            }
            if let Some(outcome) = errno_attempt() {
                return outcome;
            }
        },
    }
}

struct SourceState {
    source: StreamSource,
    reads: VecDeque<Pending>,
    writes: VecDeque<Pending>,
}

struct Reactor {
    event_loop: EventLoop,
    waker: Arc<Waker>,
    commands: Receiver<Command>,
    sources: HashMap<u64, SourceState>,
    poster: Poster,
}

impl Reactor {
    fn run(mut self) {
        log::debug!("reactor started");
        let mut events: Vec<Event> = Vec::new();
        loop {
            events.clear();
            if let Err(err) = self.event_loop.poll(&mut events, None) {
                fatal("epoll_wait", err);
            }
            for event in &events {
                if event.token == WAKER_TOKEN {
                    self.waker.drain();
                    if let Err(err) =
                        self.event_loop
                            .arm(self.waker.as_raw_fd(), WAKER_TOKEN, Interest::READABLE)
                    {
                        fatal("epoll_ctl", err);
                    }
                } else {
                    self.progress(event.token.0);
                }
            }
            if !self.drain_commands() {
                break;
            }
        }
        self.shutdown();
        log::debug!("reactor stopped");
    }

    /// Apply queued commands. Returns `false` once shutdown is requested.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Submit(source, pending)) => self.submit(source, pending),
                Ok(Command::Cancel(source)) => self.cancel(&source),
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn submit(&mut self, source: StreamSource, pending: Pending) {
        if source.is_cancelled() {
            self.poster
                .post(0, pending.key, pending.descriptor, code::CANCELLED);
            return;
        }
        let id = source.id().0;
        let state = self.sources.entry(id).or_insert_with(|| SourceState {
            source,
            reads: VecDeque::new(),
            writes: VecDeque::new(),
        });
        if pending.op.is_write() {
            state.writes.push_back(pending);
        } else {
            state.reads.push_back(pending);
        }
        self.progress(id);
    }

    fn progress(&mut self, id: u64) {
        let Some(state) = self.sources.get_mut(&id) else {
            return;
        };
        let fd = state.source.as_raw_fd();
        run_queue(fd, &mut state.reads, &self.poster);
        run_queue(fd, &mut state.writes, &self.poster);

        let mut interest = Interest::NONE;
        if !state.reads.is_empty() {
            interest |= Interest::READABLE;
        }
        if !state.writes.is_empty() {
            interest |= Interest::WRITABLE;
        }
        if interest.is_empty() {
            return;
        }
        if let Err(err) = self.event_loop.arm(fd, Token(id), interest) {
            log::warn!("cannot watch source {}: {}", id, err);
            let errno = os_code(&err);
            for pending in state.reads.drain(..).chain(state.writes.drain(..)) {
                self.poster.post(0, pending.key, pending.descriptor, errno);
            }
        }
    }

    fn cancel(&mut self, source: &StreamSource) {
        let Some(mut state) = self.sources.remove(&source.id().0) else {
            return;
        };
        // ENOENT when the source was never armed
        let _ = self.event_loop.deregister(state.source.as_raw_fd());
        let cancelled = state.reads.len() + state.writes.len();
        for pending in state.reads.drain(..).chain(state.writes.drain(..)) {
            self.poster
                .post(0, pending.key, pending.descriptor, code::CANCELLED);
        }
        log::debug!(
            "source {} cancelled with {} operations outstanding",
            source.id().0,
            cancelled
        );
    }

    fn shutdown(&mut self) {
        let ids: Vec<u64> = self.sources.keys().copied().collect();
        for id in ids {
            if let Some(state) = self.sources.get(&id) {
                let source = state.source.clone();
                self.cancel(&source);
            }
        }
    }
}

fn run_queue(fd: RawFd, queue: &mut VecDeque<Pending>, poster: &Poster) {
    while let Some(front) = queue.front_mut() {
        let (count, error) = match attempt(fd, &mut front.op) {
            Attempt::WouldBlock => break,
            Attempt::Done(count) => (count, 0),
            Attempt::Failed(errno) => (0, errno),
        };
        if let Some(finished) = queue.pop_front() {
            poster.post(count, finished.key, finished.descriptor, error);
        }
    }
}
