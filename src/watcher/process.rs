//! Process-exit watcher
//!
//! Every watched child gets a wait thread. The thread observes the exit
//! without reaping, marks the entry closed so `terminate_process` can no
//! longer signal it, then reaps and posts the exit code as a completion.
//! Decoding that completion erases the process handle: the watcher is
//! one-shot.

use super::WatchState;
use crate::error::{os_code, ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::port::child::{pipe, ChildReader, ChildWriter};
use crate::port::Port;
use crate::runtime::completion::{Delivery, Descriptor, Poster};
use crate::runtime::Runtime;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;

/// Exit code reported when the exit status could not be collected.
pub const WAIT_FAILED: u32 = u32::MAX;

/// Table record of a watched process.
#[derive(Debug)]
pub struct ProcessEntry {
    pid: u32,
    state: Mutex<WatchState>,
}

impl ProcessEntry {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> WatchState {
        *self.state.lock()
    }
}

/// Payload of a process-exit callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub process: Handle,
    pub exit_code: u32,
}

pub type ProcessCallback = Box<dyn FnOnce(ProcessExit) + Send>;

/// Handles created for a watched child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedProcess {
    pub process: Handle,
    /// Read end of the child's merged stdout and stderr.
    pub stdout: Handle,
    /// Write end of the child's stdin.
    pub stdin: Handle,
}

/// Parked until the wait thread posts the exit.
struct ProcessWatch {
    process: Handle,
    entry: Arc<ProcessEntry>,
    callback: ProcessCallback,
}

fn complete_process_exit(rt: &Runtime, count: u32, descriptor: Descriptor, error: u32) -> Delivery {
    let Some(ProcessWatch {
        process,
        entry,
        callback,
    }) = rt.engine().side_table().take::<ProcessWatch>(descriptor)
    else {
        log::warn!("process exit for unknown descriptor {}", descriptor.0);
        return Delivery::none();
    };
    *entry.state.lock() = WatchState::Closed;
    rt.processes.remove_if(process, |live| Arc::ptr_eq(live, &entry));
    let exit_code = if error == 0 { count } else { WAIT_FAILED };
    log::debug!("process {} (pid {}) exited with {}", process, entry.pid, exit_code);
    Delivery::new(move || callback(ProcessExit { process, exit_code }))
}

/// Block until `pid` has exited, leaving it unreaped.
fn wait_exited(pid: u32) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn exit_code(status: ExitStatus) -> u32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u32,
        (None, Some(signal)) => 128 + signal as u32,
        (None, None) => WAIT_FAILED,
    }
}

fn wait_for_exit(mut child: Child, entry: Arc<ProcessEntry>, poster: Poster, descriptor: Descriptor) {
    if let Err(err) = wait_exited(entry.pid) {
        log::debug!("waitid on pid {}: {}", entry.pid, err);
    }
    // the zombie keeps the pid reserved until the wait below
    *entry.state.lock() = WatchState::Closed;
    match child.wait() {
        Ok(status) => poster.post(exit_code(status), complete_process_exit, descriptor, 0),
        Err(err) => poster.post(0, complete_process_exit, descriptor, os_code(&err)),
    }
}

fn build_command(argv: &[String], origin: &'static str) -> OsResult<Command> {
    let (program, args) = argv.split_first().ok_or(ErrorPair::bad_arguments(origin))?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

impl Runtime {
    /// Register a spawned child and start its wait thread.
    fn watch_child(&self, origin: &'static str, child: Child, callback: ProcessCallback) -> OsResult<Handle> {
        let entry = Arc::new(ProcessEntry {
            pid: child.id(),
            state: Mutex::new(WatchState::Armed),
        });
        let process = self.processes.allocate(Arc::clone(&entry));
        let descriptor = self.engine().side_table().register(ProcessWatch {
            process,
            entry: Arc::clone(&entry),
            callback,
        });

        let poster = self.engine().poster();
        let pid = entry.pid;
        let waiter = Arc::clone(&entry);
        let spawned = thread::Builder::new()
            .name(format!("osport-wait-{}", pid))
            .spawn(move || wait_for_exit(child, waiter, poster, descriptor));
        if let Err(err) = spawned {
            log::warn!("no wait thread for pid {}: {}", pid, err);
            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
            self.processes.deallocate(process);
            let _ = self.engine().side_table().take::<ProcessWatch>(descriptor);
            return Err(ErrorPair::from_io(origin, &err));
        }
        log::debug!("watching pid {} as process {}", entry.pid, process);
        Ok(process)
    }

    /// Start `argv` with piped stdio and watch for its exit.
    ///
    /// The child's stdout and stderr share one pipe.
    pub fn create_watched_process(&self, argv: &[String], callback: ProcessCallback) -> OsResult<WatchedProcess> {
        const ORIGIN: &str = "create_watched_process";
        let io_err = |e: io::Error| ErrorPair::from_io(ORIGIN, &e);
        let mut command = build_command(argv, ORIGIN)?;

        let (out_read, out_write) = pipe().map_err(io_err)?;
        let (in_read, in_write) = pipe().map_err(io_err)?;
        let err_write = out_write.try_clone().map_err(io_err)?;
        let stdout = ChildReader::new(out_read).map_err(io_err)?;
        let stdin = ChildWriter::new(in_write).map_err(io_err)?;

        command
            .stdin(Stdio::from(in_read))
            .stdout(Stdio::from(out_write))
            .stderr(Stdio::from(err_write));
        let spawned = command.spawn();
        // release the child's ends held by the parent
        drop(command);
        let child = spawned.map_err(io_err)?;

        let process = self.watch_child(ORIGIN, child, callback)?;
        Ok(WatchedProcess {
            process,
            stdout: self.install_port(Port::ProcessStdout(stdout)),
            stdin: self.install_port(Port::ProcessStdin(stdin)),
        })
    }

    /// Start `argv` in its own process group with no stdio and watch for
    /// its exit.
    pub fn create_detached_watched_process(&self, argv: &[String], callback: ProcessCallback) -> OsResult<Handle> {
        const ORIGIN: &str = "create_detached_watched_process";
        let mut command = build_command(argv, ORIGIN)?;
        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| ErrorPair::from_io(ORIGIN, &e))?;
        self.watch_child(ORIGIN, child, callback)
    }

    /// Kill a watched process. Its exit still arrives through the callback.
    pub fn terminate_process(&self, process: Handle) -> OsResult<()> {
        const ORIGIN: &str = "terminate_process";
        let entry = self
            .processes
            .lookup(process)
            .ok_or(ErrorPair::invalid_handle(ORIGIN))?;
        let state = entry.state.lock();
        if *state != WatchState::Armed {
            return Ok(());
        }
        match kill(Pid::from_raw(entry.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {
                log::debug!("terminated process {} (pid {})", process, entry.pid);
                Ok(())
            }
            Err(errno) => Err(ErrorPair::new(ORIGIN, errno as i32 as u32)),
        }
    }

    /// Pid of a live watched process.
    pub fn process_id(&self, process: Handle) -> OsResult<u32> {
        self.processes
            .with(process, |entry| entry.pid)
            .ok_or(ErrorPair::invalid_handle("process_id"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::code;
    use std::process::Command;

    #[test]
    fn test_exit_code_mapping() {
        let status = Command::new("sh").args(["-c", "exit 3"]).status().unwrap();
        assert_eq!(exit_code(status), 3);
        let killed = Command::new("sh").args(["-c", "kill -9 $$"]).status().unwrap();
        assert_eq!(exit_code(killed), 128 + 9);
    }

    #[test]
    fn test_empty_argv_rejected() {
        let rt = Runtime::new();
        let err = rt.create_watched_process(&[], Box::new(|_| {})).unwrap_err();
        assert_eq!(err, ErrorPair::new("create_watched_process", code::BAD_ARGUMENTS));
    }

    #[test]
    fn test_terminate_unknown_process() {
        let rt = Runtime::new();
        assert_eq!(
            rt.terminate_process(Handle(1)).unwrap_err().code,
            code::INVALID_HANDLE
        );
    }
}
