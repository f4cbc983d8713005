// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Positional addressing of the guest data pages.
//!
//! Every ring slot owns `MAX_SEGMENTS_PER_REQUEST` consecutive pages, and segment `i` of the
//! request in slot `s` always lives in page `s * MAX_SEGMENTS_PER_REQUEST + i`.

use vm_memory::{MmapRegion, VolatileMemory, VolatileSlice};

use super::{Error, Result, MAX_SEGMENTS_PER_REQUEST, PAGE_SIZE, RING_SIZE};
use crate::block::SECTOR_SIZE;

const SLOT_SPAN: usize = MAX_SEGMENTS_PER_REQUEST * PAGE_SIZE;

/// Size of the grant buffer mapping.
pub const GRANT_BUFFER_SIZE: usize = RING_SIZE * SLOT_SPAN;

/// The mapped grant pages of every ring slot.
pub struct GrantBuffer {
    mem: MmapRegion,
}

impl GrantBuffer {
    /// Wraps the grant buffer mapping.
    pub fn new(mem: MmapRegion) -> Result<Self> {
        if mem.size() < GRANT_BUFFER_SIZE {
            return Err(Error::GrantBufferTooSmall(mem.size()));
        }
        Ok(GrantBuffer { mem })
    }

    /// Returns `len` bytes of the request in `slot`, starting at sub-block `first_subblock` of
    /// its `segment`-th page.
    ///
    /// The range may continue into the following pages of the same slot, but never past them.
    pub fn slice(
        &self,
        slot: usize,
        segment: usize,
        first_subblock: u8,
        len: usize,
    ) -> Result<VolatileSlice> {
        let out_of_bounds = Error::GrantOutOfBounds { slot, segment, len };
        if slot >= RING_SIZE || segment >= MAX_SEGMENTS_PER_REQUEST {
            return Err(out_of_bounds);
        }

        let slot_start = slot * SLOT_SPAN;
        let start = slot_start
            + segment * PAGE_SIZE
            + usize::from(first_subblock) * SECTOR_SIZE as usize;
        match start.checked_add(len) {
            Some(end) if end <= slot_start + SLOT_SPAN => {}
            _ => return Err(out_of_bounds),
        }

        self.mem.get_slice(start, len).map_err(Error::Memory)
    }
}
