//! USB bulk pipes via usbdevfs
//!
//! Connecting claims interface 0 and binds the bulk endpoints used for
//! reads and writes. Transfers are blocking ioctls run on the driver's
//! device lanes. Each ioctl waits at most `driver.device_timeout_ms` and is
//! reissued until it finishes or the port is closed, which completes it
//! with `ECANCELED`.

use super::{Port, Readable, Transfer, Writable};
use crate::error::{code, ErrorPair, OsResult};
use crate::handle_table::Handle;
use crate::runtime::overlapped::{complete_overlapped, IoBuffer, IoCallback, OverlappedRequest};
use crate::runtime::Runtime;
use nix::errno::Errno;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEVICE_ROOT: &str = "/dev/bus/usb";
const INTERFACE: u32 = 0;
const ENDPOINT_IN: u8 = 0x80;

mod sys {
    /// `struct usbdevfs_bulktransfer`
    #[repr(C)]
    pub struct BulkTransfer {
        pub ep: u32,
        pub len: u32,
        pub timeout: u32,
        pub data: *mut libc::c_void,
    }

    nix::ioctl_readwrite!(usbdevfs_bulk, b'U', 2, BulkTransfer);
    nix::ioctl_read!(usbdevfs_claim_interface, b'U', 15, u32);
    nix::ioctl_read!(usbdevfs_release_interface, b'U', 16, u32);
}

use sys::{usbdevfs_bulk, usbdevfs_claim_interface, usbdevfs_release_interface, BulkTransfer};

pub struct UsbPort {
    device: Arc<File>,
    read_endpoint: u8,
    write_endpoint: u8,
    timeout_ms: u32,
    closed: Arc<AtomicBool>,
}

impl UsbPort {
    fn submit(&self, rt: &Runtime, endpoint: u8, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        let bulk = Bulk {
            device: Arc::clone(&self.device),
            endpoint,
            timeout_ms: self.timeout_ms,
            closed: Arc::clone(&self.closed),
        };
        let descriptor = OverlappedRequest::new(transfer.buffer.clone(), callback).arm(rt.engine());
        let Transfer { buffer, start, len, .. } = transfer;
        rt.driver()
            .submit_device(move || bulk.run(&buffer, start, len), complete_overlapped, descriptor)
            .map_err(|err| {
                OverlappedRequest::disarm(rt.engine(), descriptor);
                err
            })
    }

    /// Stop reissuing transfers, then give the interface back.
    pub(super) fn release(&self) {
        self.closed.store(true, Ordering::Release);
        let mut interface = INTERFACE;
        if let Err(err) = unsafe { usbdevfs_release_interface(self.device.as_raw_fd(), &mut interface) } {
            log::debug!("usb release interface: {}", err);
        }
    }
}

/// One bulk transfer as run on a device lane.
struct Bulk {
    device: Arc<File>,
    endpoint: u8,
    timeout_ms: u32,
    closed: Arc<AtomicBool>,
}

impl Bulk {
    fn run(&self, buffer: &IoBuffer, start: usize, len: usize) -> (u32, u32) {
        // the ioctl works on a private copy so the shared buffer stays unlocked
        let Some(mut scratch) = buffer.take_range(start, len) else {
            return (0, code::BAD_ARGUMENTS);
        };
        let result = until_closed(&self.closed, || {
            let mut request = BulkTransfer {
                ep: u32::from(self.endpoint),
                len: scratch.len() as u32,
                timeout: self.timeout_ms,
                data: scratch.as_mut_ptr().cast(),
            };
            unsafe { usbdevfs_bulk(self.device.as_raw_fd(), &mut request) }.map(|n| n as usize)
        });
        match result {
            Ok(count) => {
                if self.endpoint & ENDPOINT_IN != 0 && !buffer.fill(start, &scratch[..count.min(len)]) {
                    return (0, code::BAD_ARGUMENTS);
                }
                (count as u32, 0)
            }
            Err(error) => (0, error),
        }
    }
}

/// Reissue `attempt` while it times out, until the port is closed.
fn until_closed(closed: &AtomicBool, mut attempt: impl FnMut() -> nix::Result<usize>) -> Result<usize, u32> {
    loop {
        if closed.load(Ordering::Acquire) {
            return Err(code::CANCELLED);
        }
        match attempt() {
            Ok(count) => return Ok(count),
            Err(Errno::ETIMEDOUT) | Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno as i32 as u32),
        }
    }
}

impl Readable for UsbPort {
    fn read(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        self.submit(rt, self.read_endpoint | ENDPOINT_IN, transfer, callback)
    }
}

impl Writable for UsbPort {
    fn write(&self, rt: &Runtime, transfer: Transfer, callback: IoCallback) -> OsResult<()> {
        self.submit(rt, self.write_endpoint & !ENDPOINT_IN, transfer, callback)
    }
}

/// Paths of the device nodes under `/dev/bus/usb`.
pub fn usb_device_names() -> OsResult<Vec<String>> {
    let root = Path::new(DEVICE_ROOT);
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    let buses = std::fs::read_dir(root).map_err(|e| ErrorPair::from_io("usb_device_names", &e))?;
    for bus in buses.flatten() {
        let Ok(devices) = std::fs::read_dir(bus.path()) else {
            continue;
        };
        for device in devices.flatten() {
            names.push(device.path().display().to_string());
        }
    }
    names.sort();
    Ok(names)
}

impl Runtime {
    /// Open a USB device node and claim interface 0.
    pub fn connect_usb(&self, device_path: &Path, read_endpoint: u8, write_endpoint: u8) -> OsResult<Handle> {
        const ORIGIN: &str = "connect_usb";
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|e| ErrorPair::from_io(ORIGIN, &e))?;
        let mut interface = INTERFACE;
        unsafe { usbdevfs_claim_interface(device.as_raw_fd(), &mut interface) }
            .map_err(|errno| ErrorPair::new(ORIGIN, errno as i32 as u32))?;
        Ok(self.install_port(Port::Usb(UsbPort {
            device: Arc::new(device),
            read_endpoint,
            write_endpoint,
            timeout_ms: self.config().driver.device_timeout_ms,
            closed: Arc::new(AtomicBool::new(false)),
        })))
    }
}
