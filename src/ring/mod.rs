// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The shared request/response ring and the grant buffer behind it.
//!
//! The ring page starts with a 64 byte header holding the producer indices of both directions,
//! followed by `RING_SIZE` entries that hold either a request or a response. The front end
//! produces requests and consumes responses; we do the opposite. Indices are free running `u32`
//! counters and an entry is selected by the index modulo `RING_SIZE`.

pub mod grant;
pub mod request;

use std::cmp;
use std::fmt;
use std::mem;
use std::sync::atomic::{fence, Ordering};

use vm_memory::{ByteValued, Bytes, MmapRegion, VolatileMemory, VolatileMemoryError};

pub use grant::GrantBuffer;
pub use request::{Operation, Request, RequestSlot, Segment, Status};

/// Size of a page of shared memory.
pub const PAGE_SIZE: usize = 4096;
/// Maximum number of segments (and grant pages) a single request can use.
pub const MAX_SEGMENTS_PER_REQUEST: usize = 11;

const RING_HEADER_SIZE: usize = 64;
const REQ_PROD_OFFSET: usize = 0;
const RSP_PROD_OFFSET: usize = 8;

const ENTRY_SIZE: usize = max(
    mem::size_of::<RequestSlot>(),
    mem::size_of::<ResponseSlot>(),
);

/// Number of entries in the ring.
pub const RING_SIZE: usize = round_down_pow2((PAGE_SIZE - RING_HEADER_SIZE) / ENTRY_SIZE);

const fn max(a: usize, b: usize) -> usize {
    if a > b {
        a
    } else {
        b
    }
}

const fn round_down_pow2(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        1 << (usize::BITS - 1 - n.leading_zeros())
    }
}

/// Ring related errors.
#[derive(Debug)]
pub enum Error {
    /// The ring mapping is smaller than a page.
    RingTooSmall(usize),
    /// The grant buffer mapping can't hold the pages of every ring slot.
    GrantBufferTooSmall(usize),
    /// The front end claims to have produced more requests than the ring holds.
    ProducerOverflow {
        /// Request producer index published by the front end.
        req_prod: u32,
        /// Our request consumer index.
        req_cons: u32,
    },
    /// A request slot failed validation. The header fields are kept for the response.
    InvalidRequest {
        /// Correlation token of the offending request.
        id: u64,
        /// Raw operation code of the offending request.
        operation: u8,
        /// What was wrong with it.
        error: request::Error,
    },
    /// A data range doesn't fit within the grant pages of its request.
    GrantOutOfBounds {
        /// Ring slot of the request.
        slot: usize,
        /// Segment the range starts at.
        segment: usize,
        /// Length of the range in bytes.
        len: usize,
    },
    /// Accessing shared memory failed.
    Memory(VolatileMemoryError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            RingTooSmall(size) => write!(f, "ring mapping of {} bytes is too small", size),
            GrantBufferTooSmall(size) => {
                write!(f, "grant buffer mapping of {} bytes is too small", size)
            }
            ProducerOverflow { req_prod, req_cons } => write!(
                f,
                "request producer {} is too far ahead of consumer {}",
                req_prod, req_cons
            ),
            InvalidRequest { id, operation, error } => write!(
                f,
                "invalid request id={:#x} op={}: {}",
                id, operation, error
            ),
            GrantOutOfBounds { slot, segment, len } => write!(
                f,
                "{} bytes at slot {} segment {} exceed the request's grant pages",
                len, slot, segment
            ),
            Memory(e) => write!(f, "shared memory access failed: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// Result of ring operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Response slot as laid out in the shared ring.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct ResponseSlot {
    id: u64,
    operation: u8,
    _reserved0: u8,
    status: i16,
    _reserved1: u32,
}

// Safe because ResponseSlot contains only plain data with explicit padding.
unsafe impl ByteValued for ResponseSlot {}

impl ResponseSlot {
    /// Returns the echoed correlation token.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the echoed raw operation code.
    pub fn operation(&self) -> u8 {
        self.operation
    }

    /// Returns the raw status code.
    pub fn status(&self) -> i16 {
        self.status
    }
}

fn entry_offset(index: u32) -> usize {
    // `as` is fine, the ring size is a power of two well below `u32::MAX`.
    RING_HEADER_SIZE + (index as usize & (RING_SIZE - 1)) * ENTRY_SIZE
}

/// The back end half of the shared ring.
///
/// We are the only writer of the response producer index and the only reader advancing over
/// requests, so no locking is involved. What matters is the publication order: a response is
/// written completely before the producer index that makes it visible moves.
pub struct BackRing {
    mem: MmapRegion,
    req_cons: u32,
    rsp_prod_pvt: u32,
}

impl BackRing {
    /// Wraps the mapping of the shared ring page.
    pub fn new(mem: MmapRegion) -> Result<Self> {
        if mem.size() < PAGE_SIZE {
            return Err(Error::RingTooSmall(mem.size()));
        }
        Ok(BackRing {
            mem,
            req_cons: 0,
            rsp_prod_pvt: 0,
        })
    }

    /// Returns the request consumer index.
    pub fn req_cons(&self) -> u32 {
        self.req_cons
    }

    /// Returns the private response producer index.
    pub fn rsp_prod(&self) -> u32 {
        self.rsp_prod_pvt
    }

    fn unconsumed(&self) -> Result<u32> {
        let req_prod: u32 = self
            .mem
            .as_volatile_slice()
            .load(REQ_PROD_OFFSET, Ordering::Acquire)
            .map_err(Error::Memory)?;

        let requests = req_prod.wrapping_sub(self.req_cons);
        if requests > RING_SIZE as u32 {
            return Err(Error::ProducerOverflow {
                req_prod,
                req_cons: self.req_cons,
            });
        }
        // Never consume a request we would have no response slot for.
        let free = RING_SIZE as u32 - self.req_cons.wrapping_sub(self.rsp_prod_pvt);
        Ok(cmp::min(requests, free))
    }

    /// Returns true if the front end has published requests we did not consume yet.
    pub fn has_pending(&self) -> Result<bool> {
        Ok(self.unconsumed()? > 0)
    }

    /// Copies the next request out of the ring and advances the consumer index.
    ///
    /// Returns `Ok(None)` when there is no work. The slot is consumed even when its contents
    /// fail validation, in which case `Error::InvalidRequest` still carries the header fields
    /// needed to answer it.
    pub fn take_next(&mut self) -> Result<Option<Request>> {
        if self.unconsumed()? == 0 {
            return Ok(None);
        }

        let slot = self.req_cons as usize & (RING_SIZE - 1);
        let raw: RequestSlot = self
            .mem
            .as_volatile_slice()
            .read_obj(entry_offset(self.req_cons))
            .map_err(Error::Memory)?;
        self.req_cons = self.req_cons.wrapping_add(1);

        Request::parse(slot, &raw)
            .map(Some)
            .map_err(|error| Error::InvalidRequest {
                id: raw.id(),
                operation: raw.operation(),
                error,
            })
    }

    /// Writes the next response slot and publishes it to the front end.
    pub fn push_response(&mut self, id: u64, operation: Operation, status: Status) -> Result<()> {
        let response = ResponseSlot {
            id,
            operation: operation.into(),
            status: status.into(),
            ..Default::default()
        };
        let mem = self.mem.as_volatile_slice();
        mem.write_obj(response, entry_offset(self.rsp_prod_pvt))
            .map_err(Error::Memory)?;
        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);

        // The slot contents must be visible before the index that covers them.
        fence(Ordering::Release);
        mem.store(self.rsp_prod_pvt, RSP_PROD_OFFSET, Ordering::Release)
            .map_err(Error::Memory)
    }
}
