//! Console input
//!
//! Terminal reads have no native overlapped form, so each read is a work
//! item blocking on a duplicate of stdin.

use super::{Port, Readable, Transfer};
use crate::error::{os_code, ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::runtime::completion::Delivery;
use crate::runtime::overlapped::{IoBuffer, IoCallback, IoResult};
use crate::runtime::work::WorkItem;
use crate::runtime::Runtime;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::Arc;

pub struct ConsolePort {
    input: Arc<File>,
}

struct ConsoleRead {
    input: Arc<File>,
    buffer: IoBuffer,
    start: usize,
    len: usize,
    count: u32,
    callback: IoCallback,
}

impl WorkItem for ConsoleRead {
    fn work(&mut self) -> u32 {
        let in_range = self
            .start
            .checked_add(self.len)
            .is_some_and(|end| end <= self.buffer.len());
        if !in_range {
            return crate::error::code::BAD_ARGUMENTS;
        }
        // block on a private buffer so callers can still touch the shared one
        let mut scratch = vec![0; self.len];
        let n = loop {
            match (&*self.input).read(&mut scratch) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return os_code(&err),
            }
        };
        if !self.buffer.fill(self.start, &scratch[..n]) {
            return crate::error::code::BAD_ARGUMENTS;
        }
        self.count = n as u32;
        0
    }

    fn decode(self: Box<Self>, _rt: &Runtime, status: u32) -> Delivery {
        let ConsoleRead { count, callback, .. } = *self;
        Delivery::new(move || callback(IoResult { count, error: status }))
    }
}

impl Readable for ConsolePort {
    fn read(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        rt.schedule_work(Box::new(ConsoleRead {
            input: Arc::clone(&self.input),
            buffer: transfer.buffer,
            start: transfer.start,
            len: transfer.len,
            count: 0,
            callback,
        }))
    }
}

impl Runtime {
    /// Open console input. Writing to the console port is refused.
    pub fn open_console(&self) -> OsResult<Handle> {
        let input = io::stdin()
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| ErrorPair::from_io("open_console", &e))?;
        Ok(self.install_port(Port::Console(ConsolePort {
            input: Arc::new(File::from(input)),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use std::io::Write;

    #[test]
    fn test_console_write_denied() {
        let rt = Runtime::new();
        let console = rt.open_console().unwrap();
        let err = rt
            .write_port(console, IoBuffer::new(1), 0, 1, None, Box::new(|_| {}))
            .unwrap_err();
        assert_eq!(err, ErrorPair::access_denied("write_port"));
        assert_eq!(
            rt.read_port(console, IoBuffer::new(1), 0, 1, Some(0), Box::new(|_| {}))
                .unwrap_err()
                .code,
            code::BAD_ARGUMENTS
        );
        rt.close_port(console).unwrap();
    }

    #[test]
    fn test_pending_read_leaves_buffer_usable() {
        let (read_end, write_end) = crate::port::child::pipe().unwrap();
        let rt = Runtime::new();
        let port = rt.install_port(Port::Console(ConsolePort {
            input: Arc::new(File::from(read_end)),
        }));
        let (tx, rx) = crossbeam_channel::unbounded();
        let buffer = IoBuffer::new(8);
        rt.read_port(port, buffer.clone(), 0, 8, None, Box::new(move |r| tx.send(r).unwrap()))
            .unwrap();

        // give the worker time to park in read(2)
        std::thread::sleep(std::time::Duration::from_millis(100));
        let (len_tx, len_rx) = crossbeam_channel::bounded(1);
        let observer = buffer.clone();
        std::thread::spawn(move || len_tx.send(observer.len()).unwrap());
        assert_eq!(len_rx.recv_timeout(std::time::Duration::from_secs(2)), Ok(8));
        assert_eq!(buffer.to_vec(), vec![0; 8]);

        (&File::from(write_end)).write_all(b"typed").unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let result = loop {
            if let Ok(result) = rx.try_recv() {
                break result;
            }
            assert!(std::time::Instant::now() < deadline, "console read never completed");
            rt.run_once(std::time::Duration::from_millis(20));
        };
        assert_eq!(result, IoResult { count: 5, error: 0 });
        assert_eq!(&buffer.to_vec()[..5], b"typed");
        rt.close_port(port).unwrap();
    }
}
