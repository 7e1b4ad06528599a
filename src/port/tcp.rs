//! TCP sockets
//!
//! Established connections are reactor-driven stream ports. Connect and
//! accept have no native overlapped form and run as work items.

use super::{stream_read, stream_write, HasPeer, Port, Readable, Transfer, Writable};
use crate::error::{code, os_code, ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::runtime::completion::Delivery;
use crate::runtime::driver::StreamSource;
use crate::runtime::overlapped::IoCallback;
use crate::runtime::work::WorkItem;
use crate::runtime::Runtime;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Receives the port handle of a new connection.
pub type ConnectCallback = Box<dyn FnOnce(OsResult<Handle>) + Send>;

const LISTEN_BACKLOG: i32 = 128;

pub struct TcpPort {
    source: StreamSource,
}

impl TcpPort {
    pub(super) fn release(&self, rt: &Runtime) {
        if let Err(err) = SockRef::from(&self.source).shutdown(Shutdown::Write) {
            log::debug!("tcp shutdown: {}", err);
        }
        rt.driver().cancel(&self.source);
    }
}

impl Readable for TcpPort {
    fn read(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        stream_read(rt, &self.source, transfer, callback)
    }
}

impl Writable for TcpPort {
    fn write(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        stream_write(rt, &self.source, transfer, callback)
    }
}

impl HasPeer for TcpPort {
    fn peer_address(&self) -> OsResult<SocketAddr> {
        SockRef::from(&self.source)
            .peer_addr()
            .map_err(|e| ErrorPair::from_io("port_peer_address", &e))?
            .as_socket()
            .ok_or(ErrorPair::bad_arguments("port_peer_address"))
    }
}

/// A listening socket.
pub struct TcpListenerEntry {
    socket: Socket,
}

impl TcpListenerEntry {
    pub fn local_port(&self) -> OsResult<u16> {
        self.socket
            .local_addr()
            .map_err(|e| ErrorPair::from_io("listener_port", &e))?
            .as_socket()
            .map(|addr| addr.port())
            .ok_or(ErrorPair::bad_arguments("listener_port"))
    }
}

fn install_stream(rt: &Runtime, origin: &'static str, fd: OwnedFd) -> OsResult<Handle> {
    let source = StreamSource::new(fd).map_err(|e| ErrorPair::from_io(origin, &e))?;
    Ok(rt.install_port(Port::Tcp(TcpPort { source })))
}

struct TcpConnect {
    node: String,
    port: u16,
    stream: Option<TcpStream>,
    callback: ConnectCallback,
}

impl WorkItem for TcpConnect {
    fn work(&mut self) -> u32 {
        let addrs = match (self.node.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(err) => return os_code(&err),
        };
        let mut last = code::IO;
        for addr in addrs {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    self.stream = Some(stream);
                    return 0;
                }
                Err(err) => last = os_code(&err),
            }
        }
        last
    }

    fn decode(self: Box<Self>, rt: &Runtime, status: u32) -> Delivery {
        let TcpConnect { stream, callback, .. } = *self;
        let result = match (status, stream) {
            (0, Some(stream)) => install_stream(rt, "connect_tcp", OwnedFd::from(stream)),
            (0, None) => Err(ErrorPair::new("connect_tcp", code::IO)),
            (status, _) => Err(ErrorPair::new("connect_tcp", status)),
        };
        Delivery::new(move || callback(result))
    }
}

struct TcpAccept {
    socket: Socket,
    accepted: Option<Socket>,
    callback: ConnectCallback,
}

impl WorkItem for TcpAccept {
    fn work(&mut self) -> u32 {
        loop {
            match self.socket.accept() {
                Ok((socket, _peer)) => {
                    self.accepted = Some(socket);
                    return 0;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return os_code(&err),
            }
        }
    }

    fn decode(self: Box<Self>, rt: &Runtime, status: u32) -> Delivery {
        let TcpAccept { accepted, callback, .. } = *self;
        let result = match (status, accepted) {
            (0, Some(socket)) => install_stream(rt, "accept_tcp", OwnedFd::from(socket)),
            (0, None) => Err(ErrorPair::new("accept_tcp", code::IO)),
            (status, _) => Err(ErrorPair::new("accept_tcp", status)),
        };
        Delivery::new(move || callback(result))
    }
}

fn bind_listener(port: u16) -> io::Result<Socket> {
    let dual_stack = || -> io::Result<Socket> {
        let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_only_v6(false)?;
        socket.set_reuse_address(true)?;
        socket.bind(&SockAddr::from(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))))?;
        Ok(socket)
    };
    let socket = match dual_stack() {
        Ok(socket) => socket,
        Err(err) => {
            log::debug!("dual-stack listener unavailable ({}), using IPv4", err);
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket.bind(&SockAddr::from(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))))?;
            socket
        }
    };
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket)
}

impl Runtime {
    /// Resolve `node`:`service` and connect on a worker.
    pub fn connect_tcp(&self, node: &str, service: &str, callback: ConnectCallback) -> OsResult<()> {
        let port = service
            .parse::<u16>()
            .map_err(|_| ErrorPair::bad_arguments("connect_tcp"))?;
        self.schedule_work(Box::new(TcpConnect {
            node: node.to_string(),
            port,
            stream: None,
            callback,
        }))
    }

    /// Listen on `port` (0 picks a free one) on all interfaces.
    pub fn listen_tcp(&self, port: u16) -> OsResult<Handle> {
        let socket = bind_listener(port).map_err(|e| ErrorPair::from_io("listen_tcp", &e))?;
        let handle = self.listeners.allocate(Arc::new(TcpListenerEntry { socket }));
        log::debug!("listening with listener {}", handle);
        Ok(handle)
    }

    /// Accept one connection on a worker.
    pub fn accept_tcp(&self, listener: Handle, callback: ConnectCallback) -> OsResult<()> {
        let entry = self
            .listeners
            .lookup(listener)
            .ok_or(ErrorPair::invalid_handle("accept_tcp"))?;
        let socket = entry
            .socket
            .try_clone()
            .map_err(|e| ErrorPair::from_io("accept_tcp", &e))?;
        self.schedule_work(Box::new(TcpAccept {
            socket,
            accepted: None,
            callback,
        }))
    }

    /// Close a listener. Pending accepts fail.
    pub fn close_tcp_listener(&self, listener: Handle) -> OsResult<()> {
        let entry = self
            .listeners
            .deallocate(listener)
            .ok_or(ErrorPair::invalid_handle("close_tcp_listener"))?;
        // wakes accepts blocked on duplicates of this socket
        if let Err(err) = entry.socket.shutdown(Shutdown::Both) {
            log::debug!("listener shutdown: {}", err);
        }
        Ok(())
    }

    pub fn listener_port(&self, listener: Handle) -> OsResult<u16> {
        self.listeners
            .lookup(listener)
            .ok_or(ErrorPair::invalid_handle("listener_port"))?
            .local_port()
    }
}
