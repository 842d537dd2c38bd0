//! Victim candidates and the time-ordered retained set
//!
//! While the walker scans the cache tree it accumulates cull
//! candidates here, ordered by access time.  The set is bounded: when
//! it is over its targets the *newest* entry is evicted, so what
//! survives a full scan is always the oldest tail of the tree.

use crate::dirnode::DirRef;
use std::collections::BTreeMap;
use std::ffi::OsString;

/// A retained victim candidate.  Immutable after construction.
pub struct File {
    /// The directory containing the file; kept open by this reference.
    pub dir: DirRef,

    /// Filename within `dir` (shorter than NAME_MAX).
    pub name: OsString,

    /// Last access time, seconds since the epoch.
    pub atime: i64,

    /// Size in bytes (512-byte blocks occupied, not apparent length).
    pub size: u64,
}

/// An ordered multiset of [`File`] keyed by access time.
///
/// Equal access times are kept in insertion order via a sequence
/// discriminator, so the set behaves as a true multiset.  Byte
/// accounting is maintained on every insert and removal:
/// `total_bytes() == sum of size over all entries` at every
/// observable point.
#[derive(Default)]
pub struct RetainedSet {
    files: BTreeMap<(i64, u64), File>,
    seq: u64,
    total_bytes: u64,
}

impl RetainedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Total size of all retained files, in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn insert(&mut self, file: File) {
        self.total_bytes += file.size;
        let key = (file.atime, self.seq);
        self.seq += 1;
        self.files.insert(key, file);
    }

    /// The most recently accessed file in the set.
    pub fn newest(&self) -> Option<&File> {
        self.files.last_key_value().map(|(_, f)| f)
    }

    /// The least recently accessed file in the set.
    pub fn oldest(&self) -> Option<&File> {
        self.files.first_key_value().map(|(_, f)| f)
    }

    /// Remove and return the most recently accessed file.
    pub fn pop_newest(&mut self) -> Option<File> {
        let (_, file) = self.files.pop_last()?;
        self.total_bytes -= file.size;
        Some(file)
    }

    /// Iterate oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &File> {
        self.files.values()
    }

    /// Consume the set, oldest first.
    pub fn into_oldest_first(self) -> impl Iterator<Item = File> {
        self.files.into_values()
    }
}
