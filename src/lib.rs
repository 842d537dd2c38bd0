//! culld - Cull Daemon for the Linux cachefiles Subsystem
//!
//! The Linux `cachefiles` module keeps an on-disk cache for network
//! filesystems.  The kernel manages the cache contents but delegates
//! space reclamation to userspace: when free space or free inodes fall
//! below the configured thresholds it signals `/dev/cachefiles`, and a
//! daemon is expected to find the coldest files in the cache tree and
//! write `cull <name>` commands back to the device.
//!
//! culld is that daemon.
//!
//! # Features
//!
//! - **Fully asynchronous walk**: one metadata query per directory
//!   entry is submitted through an async ring; tens of thousands of
//!   queries are kept in flight with hysteresis backpressure, so huge
//!   cache trees scan quickly with bounded memory.
//!
//! - **Oldest-first victim selection**: candidates are held in a
//!   bounded, time-ordered set that evicts its newest entry when over
//!   target, so a full scan always retains the coldest tail of the
//!   tree.  Files untouched for 120 days are reclaimed on sight.
//!
//! - **Batched working-directory changes**: the kernel applies `cull`
//!   to the process CWD, making the CWD a contended global resource.
//!   A dedicated arbiter batches all operations that target the same
//!   directory behind one `fchdir`.
//!
//! # Architecture
//!
//! ```text
//!  /dev/cachefiles ──readable──▶ Instance ──cull=1──▶ Cull engine
//!                                                        │
//!                     ┌──────────────────────────────────┤
//!                     ▼                                  ▼
//!                   Walk ──ancient files──────────▶ CullFileOp × N
//!                     │                                  │
//!                     │ retained set (oldest tail)       │ chdir lease
//!                     └──────────────────────────────────┤
//!                                                        ▼
//!                                      "cull <name>" ▶ /dev/cachefiles
//! ```
//!
//! The whole core runs on one cooperative thread; concurrency comes
//! from the async submission ring and cooperative tasks, never from
//! shared-state threading.

pub mod chdir;
pub mod config;
pub mod cull;
pub mod daemon;
pub mod dev;
pub mod dirnode;
pub mod error;
pub mod retained;
pub mod ring;
pub mod vfs;
pub mod walker;

pub use config::{CliArgs, Config};
pub use cull::{Cull, CullStats};
pub use dev::{CullResult, DevCachefiles};
pub use error::{ChdirError, DaemonError, Result};
pub use retained::{File, RetainedSet};
pub use ring::Ring;
pub use walker::{Walk, WalkLimits, WalkResult, WalkStats};
