//! Named pipes
//!
//! A named pipe is a unix-domain stream socket bound at a filesystem path.
//! The server side starts out listening; its first connection arrives as a
//! native accept completion and turns the port into a duplex stream.

use super::{stream_read, stream_write, Port, Readable, Transfer, Writable};
use crate::error::{code, os_code, ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::runtime::completion::{Delivery, Descriptor};
use crate::runtime::driver::{AcceptSlot, StreamOp, StreamSource};
use crate::runtime::overlapped::{IoCallback, IoResult};
use crate::runtime::Runtime;
use parking_lot::Mutex;
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

enum PipeState {
    Listening(StreamSource),
    Connected(StreamSource),
    Closed,
}

pub struct PipePort {
    state: Mutex<PipeState>,
    /// Bound path, removed again on close. Clients have none.
    path: Option<PathBuf>,
}

impl PipePort {
    pub fn is_connected(&self) -> bool {
        matches!(*self.state.lock(), PipeState::Connected(_))
    }

    fn stream(&self, origin: &'static str) -> OsResult<StreamSource> {
        match &*self.state.lock() {
            PipeState::Connected(source) => Ok(source.clone()),
            PipeState::Listening(_) => Err(ErrorPair::not_connected(origin)),
            PipeState::Closed => Err(ErrorPair::invalid_handle(origin)),
        }
    }

    fn connect(&self, rt: &Runtime, stream: StreamSource) -> OsResult<()> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, PipeState::Closed) {
            PipeState::Listening(listener) => {
                rt.driver().cancel(&listener);
                *state = PipeState::Connected(stream);
                Ok(())
            }
            other => {
                *state = other;
                Err(ErrorPair::new("connect_pipe", code::CANCELLED))
            }
        }
    }

    pub(super) fn release(&self, rt: &Runtime) {
        match std::mem::replace(&mut *self.state.lock(), PipeState::Closed) {
            PipeState::Listening(source) | PipeState::Connected(source) => rt.driver().cancel(&source),
            PipeState::Closed => {}
        }
        if let Some(path) = &self.path {
            if let Err(err) = std::fs::remove_file(path) {
                log::debug!("pipe {} not removed: {}", path.display(), err);
            }
        }
    }
}

impl Readable for PipePort {
    fn read(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        let source = self.stream("read_port")?;
        stream_read(rt, &source, transfer, callback)
    }
}

impl Writable for PipePort {
    fn write(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        let source = self.stream("write_port")?;
        stream_write(rt, &source, transfer, callback)
    }
}

/// Parked while a server pipe waits for its client.
struct PipeConnect {
    port: Handle,
    slot: AcceptSlot,
    callback: IoCallback,
}

fn complete_pipe_connect(rt: &Runtime, _count: u32, descriptor: Descriptor, error: u32) -> Delivery {
    let Some(PipeConnect { port, slot, callback }) = rt.engine().side_table().take::<PipeConnect>(descriptor) else {
        log::warn!("pipe connection for unknown descriptor {}", descriptor.0);
        return Delivery::none();
    };
    let error = if error != 0 {
        error
    } else {
        match install_client(rt, port, slot.lock().take()) {
            Ok(()) => 0,
            Err(err) => err.code,
        }
    };
    log::debug!("pipe port {} connect finished: error={}", port, error);
    Delivery::new(move || callback(IoResult { count: 0, error }))
}

fn install_client(rt: &Runtime, port: Handle, accepted: Option<OwnedFd>) -> OsResult<()> {
    let fd = accepted.ok_or(ErrorPair::new("connect_pipe", code::IO))?;
    // a port closed while listening drops the connection
    let entry = rt
        .ports
        .lookup(port)
        .ok_or(ErrorPair::new("connect_pipe", code::CANCELLED))?;
    let Port::Pipe(pipe) = &*entry else {
        return Err(ErrorPair::invalid_handle("connect_pipe"));
    };
    let stream = StreamSource::new(fd).map_err(|e| ErrorPair::new("connect_pipe", os_code(&e)))?;
    pipe.connect(rt, stream)
}

impl Runtime {
    /// Create the server end of a named pipe at `path`.
    ///
    /// `callback` fires once a client connects; reads and writes before
    /// then fail with `ENOTCONN`.
    pub fn create_server_pipe(&self, path: &Path, callback: IoCallback) -> OsResult<Handle> {
        const ORIGIN: &str = "create_server_pipe";
        let listener = UnixListener::bind(path).map_err(|e| ErrorPair::from_io(ORIGIN, &e))?;
        let source = StreamSource::new(OwnedFd::from(listener)).map_err(|e| ErrorPair::from_io(ORIGIN, &e))?;
        let handle = self.install_port(Port::Pipe(PipePort {
            state: Mutex::new(PipeState::Listening(source.clone())),
            path: Some(path.to_path_buf()),
        }));

        let slot = AcceptSlot::default();
        let descriptor = self.engine().side_table().register(PipeConnect {
            port: handle,
            slot: slot.clone(),
            callback,
        });
        if let Err(err) = self
            .driver()
            .submit(&source, StreamOp::Accept { slot }, complete_pipe_connect, descriptor)
        {
            let _ = self.engine().side_table().take::<PipeConnect>(descriptor);
            let _ = self.close_port(handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Connect to an existing named pipe.
    pub fn create_client_pipe(&self, path: &Path) -> OsResult<Handle> {
        const ORIGIN: &str = "create_client_pipe";
        let stream = UnixStream::connect(path).map_err(|e| ErrorPair::from_io(ORIGIN, &e))?;
        let source = StreamSource::new(OwnedFd::from(stream)).map_err(|e| ErrorPair::from_io(ORIGIN, &e))?;
        Ok(self.install_port(Port::Pipe(PipePort {
            state: Mutex::new(PipeState::Connected(source)),
            path: None,
        })))
    }
}
