// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The tap device shared with the front end.
//!
//! The device node gives us three things: the shared ring page (mapped at offset 0), the grant
//! buffer (mapped right after it), and a file descriptor that becomes readable when the front
//! end publishes new requests. Telling the front end about new responses is an ioctl on the
//! same descriptor.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use libc::c_ulong;
use vm_memory::mmap::MmapRegionError;
use vm_memory::{FileOffset, MmapRegion};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::ioctl;

use crate::ring::grant::GRANT_BUFFER_SIZE;
use crate::ring::{self, BackRing, GrantBuffer, PAGE_SIZE};

// Notification that the back end has pushed responses.
const XPVTAP_IOCTL_RESP_PUSH: c_ulong = 1;

const DEVICE_TOKEN: u64 = 0;
const WAKEUP_TOKEN: u64 = 1;

/// Tap device errors.
#[derive(Debug)]
pub enum Error {
    /// Opening the device node failed.
    Open(io::Error),
    /// Duplicating the device descriptor for a mapping failed.
    CloneFd(io::Error),
    /// Mapping a shared region failed.
    Map(MmapRegionError),
    /// The mapped region doesn't have the expected layout.
    Ring(ring::Error),
    /// Setting up the wait set failed.
    Epoll(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            Open(e) => write!(f, "unable to open tap device: {}", e),
            CloneFd(e) => write!(f, "unable to duplicate tap device descriptor: {}", e),
            Map(e) => write!(f, "unable to map shared memory: {}", e),
            Ring(e) => write!(f, "bad shared memory layout: {}", e),
            Epoll(e) => write!(f, "unable to set up event wait: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Result of tap device operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The signalling half of the channel to the front end.
pub trait Notifier {
    /// Tells the front end that responses were published.
    fn notify(&self) -> io::Result<()>;

    /// Blocks until the front end may have published requests, or a wakeup was requested.
    ///
    /// Returning doesn't guarantee there is work; callers check the ring again.
    fn wait(&self) -> io::Result<()>;
}

/// Maps `size` bytes of `file` starting at `offset`, shared with every other mapping of it.
pub fn map_shared(file: &File, offset: u64, size: usize) -> Result<MmapRegion> {
    let file = file.try_clone().map_err(Error::CloneFd)?;
    MmapRegion::build(
        Some(FileOffset::new(file, offset)),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
    )
    .map_err(Error::Map)
}

/// The tap device node.
pub struct XpvtapDevice {
    file: File,
    epoll: Epoll,
    wakeup: Option<EventFd>,
}

impl XpvtapDevice {
    /// Opens the device node at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Open)?;

        let epoll = Epoll::new().map_err(Error::Epoll)?;
        epoll
            .ctl(
                ControlOperation::Add,
                file.as_raw_fd(),
                EpollEvent::new(EventSet::IN, DEVICE_TOKEN),
            )
            .map_err(Error::Epoll)?;

        Ok(XpvtapDevice {
            file,
            epoll,
            wakeup: None,
        })
    }

    /// Adds `evt` to the wait set, so writing to it ends a blocking `wait`.
    pub fn set_wakeup(&mut self, evt: EventFd) -> Result<()> {
        self.epoll
            .ctl(
                ControlOperation::Add,
                evt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, WAKEUP_TOKEN),
            )
            .map_err(Error::Epoll)?;
        self.wakeup = Some(evt);
        Ok(())
    }

    /// Returns the descriptor of the wakeup event, if one was set.
    pub fn wakeup_fd(&self) -> Option<RawFd> {
        self.wakeup.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Maps the shared ring page.
    pub fn map_ring(&self) -> Result<BackRing> {
        BackRing::new(map_shared(&self.file, 0, PAGE_SIZE)?).map_err(Error::Ring)
    }

    /// Maps the grant buffer that follows the ring page.
    pub fn map_grants(&self) -> Result<GrantBuffer> {
        GrantBuffer::new(map_shared(&self.file, PAGE_SIZE as u64, GRANT_BUFFER_SIZE)?)
            .map_err(Error::Ring)
    }
}

// Repeats `op` for as long as it is cut short by a signal.
fn retry_interrupted<T, F>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

impl Notifier for XpvtapDevice {
    fn notify(&self) -> io::Result<()> {
        retry_interrupted(|| {
            // SAFETY: the request takes no argument and the descriptor is owned by `self`.
            let ret = unsafe { ioctl(&self.file, XPVTAP_IOCTL_RESP_PUSH) };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        })
    }

    fn wait(&self) -> io::Result<()> {
        let mut events = [EpollEvent::default(); 2];
        match self.epoll.wait(-1, &mut events) {
            Ok(_) => Ok(()),
            // A signal arrived; let the caller look at what it changed.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }
}
