// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Disk image access.
//!
//! [`DiskBackend`] is the only thing the daemon knows about the disk image. Any failure of the
//! image surfaces as a single [`Error`] kind; retrying is left to the image implementation.

pub mod coalesce;
pub mod raw;

use std::fmt;
use std::io;

use vm_memory::{VolatileMemoryError, VolatileSlice};

pub use coalesce::{coalesce, IoCall};
pub use raw::RawImage;

/// Log2 of the sector size.
pub const SECTOR_SHIFT: u8 = 9;
/// Size of a sector, which is also the sub-block unit of a grant page.
pub const SECTOR_SIZE: u64 = (0x01 as u64) << SECTOR_SHIFT;
/// Number of sub-blocks in a grant page.
pub const SUBBLOCKS_PER_PAGE: u8 = 8;

/// Disk image errors.
#[derive(Debug)]
pub enum Error {
    /// Opening the image failed.
    Open(io::Error),
    /// Getting the image's metadata failed.
    GetFileMetadata(io::Error),
    /// Positioning within the image failed.
    Seek(io::Error),
    /// Transferring data between the image and guest memory failed.
    Transfer(VolatileMemoryError),
    /// Flushing the image failed.
    Flush(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            Open(e) => write!(f, "unable to open disk image: {}", e),
            GetFileMetadata(e) => write!(f, "unable to get disk image metadata: {}", e),
            Seek(e) => write!(f, "unable to seek in disk image: {}", e),
            Transfer(e) => write!(f, "disk image transfer failed: {}", e),
            Flush(e) => write!(f, "unable to flush disk image: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Result of disk image operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The capabilities of a disk image the daemon relies on.
pub trait DiskBackend {
    /// Fills `buf` with the image contents starting at byte `offset`.
    fn read(&mut self, offset: u64, buf: VolatileSlice) -> Result<()>;

    /// Stores `buf` in the image starting at byte `offset`.
    fn write(&mut self, offset: u64, buf: VolatileSlice) -> Result<()>;

    /// Makes previously written data durable.
    fn flush(&mut self) -> Result<()>;

    /// Size of the image in bytes.
    fn size(&self) -> Result<u64>;

    /// Number of whole sectors in the image.
    fn num_sectors(&self) -> Result<u64> {
        Ok(self.size()? >> SECTOR_SHIFT)
    }

    /// Chooses whether `close` skips its final flush.
    fn set_skip_flush_on_close(&mut self, skip: bool);

    /// Releases the image, flushing it first unless told otherwise.
    fn close(&mut self) -> Result<()>;
}
