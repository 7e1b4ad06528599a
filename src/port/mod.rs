//! Ports: one stable handle per device
//!
//! Device capabilities are separate traits. The closed [`Port`] enum hands
//! out only the capabilities its variant implements, so a console has no
//! writer and a child's stdout has no writer either; asking for one is an
//! access-denied error.
//!
//! | Device              | Read                 | Write                |
//! |---------------------|----------------------|----------------------|
//! | File                | lane, explicit offset| lane, explicit offset|
//! | Pipe                | reactor              | reactor              |
//! | Console             | work item            | -                    |
//! | TCP socket          | reactor              | reactor              |
//! | USB bulk pipe       | lane (ioctl)         | lane (ioctl)         |
//! | Child stdout        | reactor              | -                    |
//! | Child stdin         | -                    | reactor              |

pub mod child;
pub mod console;
pub mod file;
pub mod pipe;
pub mod tcp;
pub mod usb;

pub use child::{ChildReader, ChildWriter};
pub use console::ConsolePort;
pub use file::{Disposition, FileAccess, FilePort};
pub use pipe::PipePort;
pub use tcp::{ConnectCallback, TcpListenerEntry, TcpPort};
pub use usb::{usb_device_names, UsbPort};

use crate::error::{ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::runtime::driver::{StreamOp, StreamSource};
use crate::runtime::overlapped::{complete_overlapped, IoBuffer, IoCallback, OverlappedRequest};
use crate::runtime::Runtime;
use std::net::SocketAddr;
use std::sync::Arc;

/// A validated transfer request.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub buffer: IoBuffer,
    pub start: usize,
    pub len: usize,
    pub position: Option<u64>,
}

pub trait Readable {
    fn read(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()>;
}

pub trait Writable {
    fn write(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()>;
}

pub trait HasSize {
    fn size(&self) -> OsResult<u64>;
}

pub trait HasPeer {
    fn peer_address(&self) -> OsResult<SocketAddr>;
}

/// Every device osport can open.
pub enum Port {
    File(FilePort),
    Pipe(PipePort),
    Console(ConsolePort),
    Tcp(TcpPort),
    Usb(UsbPort),
    ProcessStdout(ChildReader),
    ProcessStdin(ChildWriter),
}

impl Port {
    pub fn name(&self) -> &'static str {
        match self {
            Port::File(_) => "file",
            Port::Pipe(_) => "pipe",
            Port::Console(_) => "console",
            Port::Tcp(_) => "tcp",
            Port::Usb(_) => "usb",
            Port::ProcessStdout(_) => "process-stdout",
            Port::ProcessStdin(_) => "process-stdin",
        }
    }

    pub fn readable(&self) -> Option<&dyn Readable> {
        match self {
            Port::File(p) => Some(p),
            Port::Pipe(p) => Some(p),
            Port::Console(p) => Some(p),
            Port::Tcp(p) => Some(p),
            Port::Usb(p) => Some(p),
            Port::ProcessStdout(p) => Some(p),
            Port::ProcessStdin(_) => None,
        }
    }

    pub fn writable(&self) -> Option<&dyn Writable> {
        match self {
            Port::File(p) => Some(p),
            Port::Pipe(p) => Some(p),
            Port::Tcp(p) => Some(p),
            Port::Usb(p) => Some(p),
            Port::ProcessStdin(p) => Some(p),
            Port::Console(_) | Port::ProcessStdout(_) => None,
        }
    }

    pub fn sized(&self) -> Option<&dyn HasSize> {
        match self {
            Port::File(p) => Some(p),
            _ => None,
        }
    }

    pub fn peer(&self) -> Option<&dyn HasPeer> {
        match self {
            Port::Tcp(p) => Some(p),
            _ => None,
        }
    }

    /// Whether transfers take an explicit position.
    pub fn is_random_access(&self) -> bool {
        matches!(self, Port::File(_))
    }

    /// Give up ownership of the device. Queued transfers complete with
    /// `ECANCELED`; lane transfers finish normally.
    fn release(&self, rt: &Runtime) {
        match self {
            Port::File(_) | Port::Console(_) => {}
            Port::Pipe(p) => p.release(rt),
            Port::Tcp(p) => p.release(rt),
            Port::Usb(p) => p.release(),
            Port::ProcessStdout(p) => p.release(rt),
            Port::ProcessStdin(p) => p.release(rt),
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Port({})", self.name())
    }
}

fn check_range(origin: &'static str, buffer: &IoBuffer, start: usize, len: usize) -> OsResult<()> {
    if len == 0 || len > u32::MAX as usize {
        return Err(ErrorPair::bad_arguments(origin));
    }
    match start.checked_add(len) {
        Some(end) if end <= buffer.len() => Ok(()),
        _ => Err(ErrorPair::bad_arguments(origin)),
    }
}

fn check_position(origin: &'static str, port: &Port, position: Option<u64>) -> OsResult<()> {
    if port.is_random_access() != position.is_some() {
        return Err(ErrorPair::bad_arguments(origin));
    }
    Ok(())
}

/// Arm a request and queue it on the reactor.
pub(crate) fn submit_stream(
    rt: &Runtime,
    source: &StreamSource,
    op: StreamOp,
    buffer: IoBuffer,
    callback: IoCallback,
) -> OsResult<()> {
    let descriptor = OverlappedRequest::new(buffer, callback).arm(rt.engine());
    rt.driver()
        .submit(source, op, complete_overlapped, descriptor)
        .map_err(|err| {
            OverlappedRequest::disarm(rt.engine(), descriptor);
            err
        })
}

pub(crate) fn stream_read(rt: &Runtime, source: &StreamSource, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
    let op = StreamOp::Read {
        buffer: transfer.buffer.clone(),
        start: transfer.start,
        len: transfer.len,
    };
    submit_stream(rt, source, op, transfer.buffer, callback)
}

pub(crate) fn stream_write(rt: &Runtime, source: &StreamSource, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
    let op = StreamOp::write(transfer.buffer.clone(), transfer.start, transfer.len);
    submit_stream(rt, source, op, transfer.buffer, callback)
}

impl Runtime {
    pub(crate) fn install_port(&self, port: Port) -> Handle {
        let name = port.name();
        let handle = self.ports.allocate(Arc::new(port));
        log::debug!("opened {} port {}", name, handle);
        handle
    }

    /// Start reading `len` bytes into `buffer[start..]`.
    ///
    /// `Ok(())` means pending: `callback` runs once from the dispatch step.
    /// Files require a `position`; stream devices reject one.
    pub fn read_port(
        &self,
        port: Handle,
        buffer: IoBuffer,
        start: usize,
        len: usize,
        position: Option<u64>,
        callback: IoCallback,
    ) -> OsResult<()> {
        const ORIGIN: &str = "read_port";
        let entry = self
            .ports
            .lookup(port)
            .ok_or(ErrorPair::invalid_handle(ORIGIN))?;
        check_range(ORIGIN, &buffer, start, len)?;
        let device = entry.readable().ok_or(ErrorPair::access_denied(ORIGIN))?;
        check_position(ORIGIN, &entry, position)?;
        log::trace!("read {} bytes from {} port {}", len, entry.name(), port);
        device.read(
            self,
            Transfer {
                buffer,
                start,
                len,
                position,
            },
            callback,
        )
    }

    /// Start writing `buffer[start..start + len]`.
    pub fn write_port(
        &self,
        port: Handle,
        buffer: IoBuffer,
        start: usize,
        len: usize,
        position: Option<u64>,
        callback: IoCallback,
    ) -> OsResult<()> {
        const ORIGIN: &str = "write_port";
        let entry = self
            .ports
            .lookup(port)
            .ok_or(ErrorPair::invalid_handle(ORIGIN))?;
        check_range(ORIGIN, &buffer, start, len)?;
        let device = entry.writable().ok_or(ErrorPair::access_denied(ORIGIN))?;
        check_position(ORIGIN, &entry, position)?;
        log::trace!("write {} bytes to {} port {}", len, entry.name(), port);
        device.write(
            self,
            Transfer {
                buffer,
                start,
                len,
                position,
            },
            callback,
        )
    }

    /// Erase the handle and release the device.
    pub fn close_port(&self, port: Handle) -> OsResult<()> {
        let entry = self
            .ports
            .deallocate(port)
            .ok_or(ErrorPair::invalid_handle("close_port"))?;
        entry.release(self);
        log::debug!("closed {} port {}", entry.name(), port);
        Ok(())
    }

    pub fn port_size(&self, port: Handle) -> OsResult<u64> {
        let entry = self
            .ports
            .lookup(port)
            .ok_or(ErrorPair::invalid_handle("port_size"))?;
        entry
            .sized()
            .ok_or(ErrorPair::access_denied("port_size"))?
            .size()
    }

    pub fn port_peer_address(&self, port: Handle) -> OsResult<SocketAddr> {
        let entry = self
            .ports
            .lookup(port)
            .ok_or(ErrorPair::invalid_handle("port_peer_address"))?;
        entry
            .peer()
            .ok_or(ErrorPair::access_denied("port_peer_address"))?
            .peer_address()
    }

    /// Name of the device behind a handle.
    pub fn port_kind(&self, port: Handle) -> Option<&'static str> {
        self.ports.with(port, |entry| entry.name())
    }
}
