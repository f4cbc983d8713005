// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Merging request segments into disk image calls.
//!
//! Segments of one request are laid out back to back on disk, while each one lives in its own
//! grant page. Consecutive segments can share a single image call only where the guest data is
//! also contiguous in the grant buffer: the earlier segment has to run to the end of its page
//! and the later one has to start at the beginning of the next. On some front ends segments
//! leave gaps inside their pages (one ending at sub-block 6, the next starting at sub-block 4),
//! and every such gap splits the transfer.

use crate::ring::Segment;

/// One disk image call covering a run of segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoCall {
    /// Byte offset on disk.
    pub offset: u64,
    /// Index of the segment whose page the guest buffer starts in.
    pub segment: usize,
    /// Sub-block of that page the guest buffer starts at.
    pub first_subblock: u8,
    /// Number of bytes to transfer.
    pub len: usize,
}

// The call being accumulated.
struct Window {
    offset: u64,
    segment: usize,
    first_subblock: u8,
    len: usize,
}

impl Window {
    fn anchor(offset: u64, segment: usize, first_subblock: u8) -> Self {
        Window {
            offset,
            segment,
            first_subblock,
            len: 0,
        }
    }

    fn call(&self) -> IoCall {
        IoCall {
            offset: self.offset,
            segment: self.segment,
            first_subblock: self.first_subblock,
            len: self.len,
        }
    }
}

/// Returns the ordered, minimal list of calls that transfer `segments` to or from disk,
/// starting at byte `offset`.
///
/// The caller checks that the whole range fits below `u64::MAX`; offsets past it wrap.
pub fn coalesce(offset: u64, segments: &[Segment]) -> Vec<IoCall> {
    let mut calls = Vec::with_capacity(segments.len());
    let first = match segments.first() {
        Some(seg) => seg,
        None => return calls,
    };

    let mut cur_offset = offset;
    let mut window = Window::anchor(offset, 0, first.first_subblock());

    for (i, seg) in segments.iter().enumerate() {
        // A gap at the start of this page ends the previous run.
        if window.len > 0 && !seg.starts_page() {
            calls.push(window.call());
            window = Window::anchor(cur_offset, i, seg.first_subblock());
        }

        window.len += seg.len();
        cur_offset = cur_offset.wrapping_add(seg.len() as u64);

        // So does a gap at the end of it, or running out of segments.
        let last = i + 1 == segments.len();
        if last || !seg.ends_page() {
            calls.push(window.call());
            if let Some(next) = segments.get(i + 1) {
                window = Window::anchor(cur_offset, i + 1, next.first_subblock());
            }
        }
    }

    calls
}
