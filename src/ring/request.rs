// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Block ring requests.
//!
//! A request slot is copied out of the shared ring exactly once and then parsed into a
//! [`Request`]. Everything in a slot comes from the front end, so the segment bounds and the
//! resulting disk range are validated here, before anything computes an address from them.

use std::fmt;

use vm_memory::ByteValued;

use super::MAX_SEGMENTS_PER_REQUEST;
use crate::block::{SECTOR_SHIFT, SECTOR_SIZE, SUBBLOCKS_PER_PAGE};

const BLKIF_OP_READ: u8 = 0;
const BLKIF_OP_WRITE: u8 = 1;
const BLKIF_OP_WRITE_BARRIER: u8 = 2;
const BLKIF_OP_FLUSH_DISKCACHE: u8 = 3;

const BLKIF_RSP_OKAY: i16 = 0;
const BLKIF_RSP_ERROR: i16 = -1;

/// Block request validation errors.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Guest gave us more segments than a request can carry.
    TooManySegments(u8),
    /// Guest gave us a segment with an empty or out of page sub-block range.
    InvalidSegment {
        /// Position of the segment within the request.
        index: usize,
        /// First sub-block claimed by the segment.
        first: u8,
        /// Last sub-block claimed by the segment.
        last: u8,
    },
    /// The requested range does not fit in a 64-bit disk offset.
    InvalidOffset,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::TooManySegments(n) => write!(f, "request carries {} segments", n),
            Error::InvalidSegment { index, first, last } => write!(
                f,
                "segment {} has invalid sub-block range {}..={}",
                index, first, last
            ),
            Error::InvalidOffset => write!(f, "request range overflows the disk offset"),
        }
    }
}

impl std::error::Error for Error {}

/// Type of request from front end to back end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Read request.
    Read,
    /// Write request.
    Write,
    /// Write barrier request.
    WriteBarrier,
    /// Disk cache flush request.
    FlushDiskCache,
    /// Unknown request.
    Unknown(u8),
}

impl From<u8> for Operation {
    fn from(value: u8) -> Self {
        match value {
            BLKIF_OP_READ => Operation::Read,
            BLKIF_OP_WRITE => Operation::Write,
            BLKIF_OP_WRITE_BARRIER => Operation::WriteBarrier,
            BLKIF_OP_FLUSH_DISKCACHE => Operation::FlushDiskCache,
            op => Operation::Unknown(op),
        }
    }
}

impl From<Operation> for u8 {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Read => BLKIF_OP_READ,
            Operation::Write => BLKIF_OP_WRITE,
            Operation::WriteBarrier => BLKIF_OP_WRITE_BARRIER,
            Operation::FlushDiskCache => BLKIF_OP_FLUSH_DISKCACHE,
            Operation::Unknown(op) => op,
        }
    }
}

/// Completion status reported back to the front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// The request completed.
    Okay,
    /// The request failed.
    Error,
}

impl From<Status> for i16 {
    fn from(status: Status) -> Self {
        match status {
            Status::Okay => BLKIF_RSP_OKAY,
            Status::Error => BLKIF_RSP_ERROR,
        }
    }
}

/// Segment descriptor as laid out in a request slot.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct SegmentSlot {
    gref: u32,
    first_sect: u8,
    last_sect: u8,
    _reserved: u16,
}

/// Request slot as laid out in the shared ring.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub struct RequestSlot {
    operation: u8,
    nr_segments: u8,
    handle: u16,
    _reserved: u32,
    id: u64,
    sector_number: u64,
    seg: [SegmentSlot; MAX_SEGMENTS_PER_REQUEST],
}

// Safe because SegmentSlot and RequestSlot contain only plain data with explicit padding.
unsafe impl ByteValued for SegmentSlot {}
unsafe impl ByteValued for RequestSlot {}

impl RequestSlot {
    /// Returns the correlation token chosen by the front end.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the raw operation code.
    pub fn operation(&self) -> u8 {
        self.operation
    }
}

/// An inclusive range of 512-byte sub-blocks within one grant page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    first_subblock: u8,
    last_subblock: u8,
}

impl Segment {
    /// Creates a segment, or returns `None` if the range is empty or leaves the page.
    pub fn new(first_subblock: u8, last_subblock: u8) -> Option<Segment> {
        if first_subblock > last_subblock || last_subblock >= SUBBLOCKS_PER_PAGE {
            return None;
        }
        Some(Segment {
            first_subblock,
            last_subblock,
        })
    }

    /// Returns the first sub-block of the range.
    pub fn first_subblock(&self) -> u8 {
        self.first_subblock
    }

    /// Returns the last sub-block of the range.
    pub fn last_subblock(&self) -> u8 {
        self.last_subblock
    }

    /// Returns the number of bytes covered by the segment.
    pub fn len(&self) -> usize {
        usize::from(self.last_subblock - self.first_subblock + 1) << SECTOR_SHIFT
    }

    /// Returns true if the segment begins at the first sub-block of its page.
    pub fn starts_page(&self) -> bool {
        self.first_subblock == 0
    }

    /// Returns true if the segment runs through the last sub-block of its page.
    pub fn ends_page(&self) -> bool {
        self.last_subblock == SUBBLOCKS_PER_PAGE - 1
    }
}

/// Stores the necessary information for the execution of a block request.
#[derive(Clone, Debug)]
pub struct Request {
    /// Opaque token echoed back in the response.
    id: u64,
    /// The type of the request.
    operation: Operation,
    /// The offset (multiplied by 512) where the read or write is to occur.
    sector: u64,
    /// The ring slot the request was taken from; selects its grant pages.
    slot: usize,
    /// Sub-block ranges, one per grant page. Empty for non data requests.
    segments: Vec<Segment>,
}

impl Request {
    /// Returns the correlation token.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the request type.
    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Returns the sector.
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Returns the byte offset on disk of the first segment.
    pub fn offset(&self) -> u64 {
        // Cannot overflow, `parse` checked the whole range for data requests.
        self.sector.wrapping_mul(SECTOR_SIZE)
    }

    /// Returns the ring slot the request occupied.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Returns the segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns the total number of data bytes the request transfers.
    pub fn data_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    /// Parses a request copied out of ring slot `slot`.
    pub fn parse(slot: usize, raw: &RequestSlot) -> Result<Request, Error> {
        let operation = Operation::from(raw.operation);
        let mut request = Request {
            id: raw.id,
            operation,
            sector: raw.sector_number,
            slot,
            segments: Vec::new(),
        };

        // Only data requests use their segments.
        if operation != Operation::Read && operation != Operation::Write {
            return Ok(request);
        }

        let count = usize::from(raw.nr_segments);
        if count > MAX_SEGMENTS_PER_REQUEST {
            return Err(Error::TooManySegments(raw.nr_segments));
        }

        for (index, seg) in raw.seg[..count].iter().enumerate() {
            let invalid = Error::InvalidSegment {
                index,
                first: seg.first_sect,
                last: seg.last_sect,
            };
            let segment = Segment::new(seg.first_sect, seg.last_sect).ok_or(invalid)?;
            request.segments.push(segment);
        }

        raw.sector_number
            .checked_mul(SECTOR_SIZE)
            .and_then(|offset| offset.checked_add(request.data_len()))
            .ok_or(Error::InvalidOffset)?;

        Ok(request)
    }
}
