//! epoll readiness loop
//!
//! Registrations are level-triggered and one-shot: an event disables its
//! descriptor until the driver re-arms it with the interest its queued
//! operations still need.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Unique token identifying a registered source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

/// Interest flags for I/O events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(pub u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b0001);
    pub const WRITABLE: Interest = Interest(0b0010);
    pub const ERROR: Interest = Interest(0b0100);
    pub const HUP: Interest = Interest(0b1000);

    pub fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    pub fn is_hup(&self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A readiness event
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub interest: Interest,
}

pub struct EventLoop {
    epoll: OwnedFd,
    events: Vec<libc::epoll_event>,
}

impl EventLoop {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    /// Arm a descriptor, adding it if epoll does not know it yet.
    pub fn arm(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
            }
            other => other,
        }
    }

    /// Add a descriptor, modifying it if already registered.
    pub fn register(&mut self, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest) {
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => {
                self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
            }
            other => other,
        }
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        let result = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Wait for events. An interrupted wait reports zero events.
    pub fn poll(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);

        let count = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                timeout_ms,
            )
        };

        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for raw in &self.events[..count as usize] {
            events.push(Event {
                token: Token(raw.u64),
                interest: epoll_to_interest(raw.events),
            });
        }
        Ok(count as usize)
    }

    fn ctl(&mut self, op: libc::c_int, fd: RawFd, token: Token, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token.0,
        };
        let result = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if result < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Eventfd used to interrupt a blocked poll.
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn wake(&self) {
        let one: u64 = 1;
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if written < 0 {
            // EAGAIN means the counter is saturated and a wake is pending anyway
            log::trace!("waker write: {}", io::Error::last_os_error());
        }
    }

    pub fn drain(&self) {
        let mut value: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut value as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = libc::EPOLLONESHOT as u32;
    if interest.is_readable() {
        events |= libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    events
}

fn epoll_to_interest(events: u32) -> Interest {
    let mut interest = Interest::NONE;
    if events & (libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32) != 0 {
        interest |= Interest::READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        interest |= Interest::WRITABLE;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        interest |= Interest::ERROR;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        interest |= Interest::HUP;
    }
    interest
}
