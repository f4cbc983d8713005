// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A paravirtualized block device backend.
//!
//! The front end (a guest block driver, reached through a tap device) places requests in a
//! shared ring and the data pages for those requests in a grant buffer. This crate drains the
//! ring, turns each request into as few disk image calls as possible, and publishes one
//! response per request back to the front end.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub mod block;
pub mod daemon;
pub mod device;
pub mod query;
pub mod ring;

pub use block::{DiskBackend, RawImage};
pub use daemon::{Config, Daemon, IoErrorPolicy};
pub use device::{Notifier, XpvtapDevice};
pub use ring::BackRing;
