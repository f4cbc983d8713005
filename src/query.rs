// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! One-shot questions about a disk image, answered without serving a front end.

use std::fmt;
use std::str::FromStr;

use crate::block::{self, DiskBackend};

/// The questions that can be asked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Query {
    /// Number of whole sectors in the image.
    Sectors,
}

/// The query name isn't one we know.
#[derive(Debug, PartialEq, Eq)]
pub struct UnknownQuery(String);

impl fmt::Display for UnknownQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown query \"{}\"", self.0)
    }
}

impl std::error::Error for UnknownQuery {}

impl FromStr for Query {
    type Err = UnknownQuery;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sectors" => Ok(Query::Sectors),
            _ => Err(UnknownQuery(s.to_owned())),
        }
    }
}

/// Answers `query` about `disk`, then closes it.
///
/// Queries never write, so the close time flush is always skipped.
pub fn answer<B: DiskBackend>(query: Query, disk: &mut B) -> block::Result<u64> {
    let answer = match query {
        Query::Sectors => disk.num_sectors(),
    };

    disk.set_skip_flush_on_close(true);
    let closed = disk.close();
    let answer = answer?;
    closed?;

    debug!("{:?}: {}", query, answer);
    Ok(answer)
}
