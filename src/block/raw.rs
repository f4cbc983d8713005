// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Disk images stored as plain files.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::Path;

use vm_memory::{ReadVolatile, VolatileSlice, WriteVolatile};

use super::{DiskBackend, Error, Result};

/// A disk image stored as a plain file, byte for byte.
pub struct RawImage {
    file: File,
    skip_flush_on_close: bool,
    closed: bool,
}

impl RawImage {
    /// Opens the image at `path`.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(Error::Open)?;
        Ok(RawImage {
            file,
            skip_flush_on_close: false,
            closed: false,
        })
    }
}

impl DiskBackend for RawImage {
    fn read(&mut self, offset: u64, mut buf: VolatileSlice) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::Seek)?;
        self.file
            .read_exact_volatile(&mut buf)
            .map_err(Error::Transfer)
    }

    fn write(&mut self, offset: u64, buf: VolatileSlice) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(Error::Seek)?;
        self.file
            .write_all_volatile(&buf)
            .map_err(Error::Transfer)
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all().map_err(Error::Flush)
    }

    fn size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(Error::GetFileMetadata)
    }

    fn set_skip_flush_on_close(&mut self, skip: bool) {
        self.skip_flush_on_close = skip;
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.skip_flush_on_close {
            return Ok(());
        }
        self.flush()
    }
}
