//! The intake analytics event server.
//!
//! This library supports the intake binary found elsewhere in this project.
//! Accepted client events are appended to per-application dump files; those
//! files are rotated on size and on a timer, compressed and then kept, deleted
//! or uploaded to an object store. Alongside, a set of rolling counters
//! summarizes traffic over the last minute, hour, day and year.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

pub mod clock;
pub mod compression;
pub mod config;
pub mod dump;
pub mod ingest;
pub mod rotation;
pub mod status;
pub mod storage;
