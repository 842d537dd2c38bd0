//! Asynchronous cache-tree walker
//!
//! Walks a cache subtree and collects the files that have not been
//! accessed for the longest time.  The walk is fully asynchronous: one
//! metadata query per directory entry is submitted through the ring,
//! directories are descended as their type becomes known, and a
//! bounded, time-ordered set of cull candidates is maintained as
//! results stream in.
//!
//! # Architecture
//!
//! ```text
//!                ┌──────────────────────────────┐
//!                │            Walk              │
//!                │  job queue + task driver     │
//!                └──────┬────────────┬──────────┘
//!                       │            │
//!                 ┌─────▼────┐  ┌────▼─────┐
//!                 │ scan dir │  │ stat one │   × up to MAX_STAT
//!                 │ (readdir)│  │ (statx)  │
//!                 └─────┬────┘  └────┬─────┘
//!                       │            │
//!            stat job per entry   directory → scan job (gated)
//!                                 ancient file → streamed out
//!                                 regular file → retained set
//! ```
//!
//! Files older than the ancient cutoff are streamed to the consumer
//! immediately and never buffered; everything else competes for a slot
//! in the [`RetainedSet`], which sheds its newest entries to make room
//! once it is full under the collection targets.

mod gate;

use crate::dirnode::{DirNode, DirRef};
use crate::retained::{File, RetainedSet};
use crate::ring::Ring;
use gate::StatGate;
use std::cell::{Cell, RefCell};
use std::ffi::OsString;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Hard cap on retained candidates.
pub const MAX_FILES: u64 = 1024 * 1024;

/// Concurrent metadata queries allowed.
pub const MAX_STAT: usize = 16 * 1024;

/// Low-water mark at which suspended directory scans resume.
pub const RESUME_STAT: usize = 4 * 1024;

/// Ancient-file cutoff: files not accessed for this long are culled
/// unconditionally, without being retained.
pub const DISCARD_OLDER_THAN_SECS: i64 = 120 * 24 * 60 * 60;

/// Walk concurrency and retention bounds.  Fixed in production; the
/// constructor taking them exists so tests can exercise the gate and
/// the retention policy at a manageable scale.
#[derive(Debug, Clone, Copy)]
pub struct WalkLimits {
    pub max_files: u64,
    pub max_stat: usize,
    pub resume_stat: usize,
}

impl Default for WalkLimits {
    fn default() -> Self {
        Self {
            max_files: MAX_FILES,
            max_stat: MAX_STAT,
            resume_stat: RESUME_STAT,
        }
    }
}

/// An "ancient" file: older than the cutoff, reclaimed without being
/// retained.  Streamed to the consumer the moment it is classified.
pub struct AncientFile {
    pub dir: DirRef,
    pub name: OsString,
    pub size: u64,
}

/// Counters collected over one walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkStats {
    pub dirs_scanned: u64,
    pub dirs_failed: u64,
    pub files_seen: u64,
    pub ancient_files: u64,
    pub stat_errors: u64,
    pub max_pending_stats: usize,
}

/// The walk's output: the retained candidates plus counters.
/// `files.total_bytes()` is the sum of the retained sizes.
pub struct WalkResult {
    pub files: RetainedSet,
    pub stats: WalkStats,
}

/// Work items staged by running tasks and spawned by the driver.
///
/// Staging data rather than futures keeps the recursion
/// (scan → stat → scan …) out of the type system.
enum Job {
    Scan(DirRef),
    Stat(DirRef, OsString),
}

struct WalkInner {
    ring: Ring,
    gate: StatGate,

    /// Collect this number of files.  May collect more if the byte
    /// target has not been reached yet.
    collect_files: u64,

    /// Collect this number of bytes.  May collect more if the file
    /// target has not been reached yet.
    collect_bytes: u64,

    max_files: u64,

    /// Cull everything last accessed before this timestamp.
    discard_older_than: i64,

    result: RefCell<RetainedSet>,
    ancient_tx: mpsc::UnboundedSender<AncientFile>,
    jobs_tx: mpsc::UnboundedSender<Job>,

    dirs_scanned: Cell<u64>,
    dirs_failed: Cell<u64>,
    files_seen: Cell<u64>,
    ancient_files: Cell<u64>,
    stat_errors: Cell<u64>,
}

/// Walk a filesystem tree and collect the files that have not been
/// accessed for the longest time.  Ancient files are streamed through
/// the receiver returned by the constructor; [`Walk::run`] resolves to
/// the final [`WalkResult`] exactly once.
pub struct Walk {
    inner: Rc<WalkInner>,
    jobs_rx: mpsc::UnboundedReceiver<Job>,
}

impl Walk {
    /// Create a walk with the production limits.
    pub fn new(
        ring: Ring,
        collect_files: u64,
        collect_bytes: u64,
    ) -> (Self, mpsc::UnboundedReceiver<AncientFile>) {
        Self::with_limits(ring, collect_files, collect_bytes, WalkLimits::default())
    }

    /// Create a walk with explicit limits.
    pub fn with_limits(
        ring: Ring,
        collect_files: u64,
        collect_bytes: u64,
        limits: WalkLimits,
    ) -> (Self, mpsc::UnboundedReceiver<AncientFile>) {
        let (ancient_tx, ancient_rx) = mpsc::unbounded_channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let inner = Rc::new(WalkInner {
            ring,
            gate: StatGate::new(limits.max_stat, limits.resume_stat),
            collect_files,
            collect_bytes,
            max_files: limits.max_files,
            discard_older_than: now - DISCARD_OLDER_THAN_SECS,
            result: RefCell::new(RetainedSet::new()),
            ancient_tx,
            jobs_tx,
            dirs_scanned: Cell::new(0),
            dirs_failed: Cell::new(0),
            files_seen: Cell::new(0),
            ancient_files: Cell::new(0),
            stat_errors: Cell::new(0),
        });

        (Self { inner, jobs_rx }, ancient_rx)
    }

    /// Run the walk over the tree rooted at `root_fd` (a path-only
    /// directory descriptor, consumed by the walk).
    ///
    /// Must be called within a `LocalSet`.  Dropping the returned
    /// future cancels every in-flight task.
    pub async fn run(mut self, root_fd: OwnedFd) -> WalkResult {
        let inner = Rc::clone(&self.inner);
        let root = DirRef::adopt(DirNode::root(root_fd, Some(inner.ring.clone())));
        inner.stage(Job::Scan(root));

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            while let Ok(job) = self.jobs_rx.try_recv() {
                tasks.spawn_local(WalkInner::run_job(Rc::clone(&inner), job));
            }
            if tasks.is_empty() {
                // nothing running, so nothing can stage more work
                break;
            }
            tokio::select! {
                biased;
                Some(job) = self.jobs_rx.recv() => {
                    tasks.spawn_local(WalkInner::run_job(Rc::clone(&inner), job));
                }
                Some(_) = tasks.join_next() => {}
            }
        }

        let files = inner.result.take();
        let stats = WalkStats {
            dirs_scanned: inner.dirs_scanned.get(),
            dirs_failed: inner.dirs_failed.get(),
            files_seen: inner.files_seen.get(),
            ancient_files: inner.ancient_files.get(),
            stat_errors: inner.stat_errors.get(),
            max_pending_stats: inner.gate.max_pending(),
        };
        debug!(
            retained = files.len(),
            retained_bytes = files.total_bytes(),
            dirs = stats.dirs_scanned,
            files = stats.files_seen,
            "walk finished"
        );
        WalkResult { files, stats }
    }
}

impl WalkInner {
    fn stage(&self, job: Job) {
        // the receiver lives in Walk::run for the whole walk
        let _ = self.jobs_tx.send(job);
    }

    async fn run_job(inner: Rc<Self>, job: Job) {
        match job {
            Job::Scan(dir) => Self::scan_directory(inner, dir).await,
            Job::Stat(dir, name) => Self::stat_entry(inner, dir, name).await,
        }
    }

    /// Read one directory and stage a metadata query per entry.
    ///
    /// The gate is awaited before every entry, so a single huge
    /// directory cannot flood the ring.
    async fn scan_directory(inner: Rc<Self>, dir: DirRef) {
        let entries = match inner.ring.read_dir(dir.fd()).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to scan directory: {}", e);
                inner.dirs_failed.set(inner.dirs_failed.get() + 1);
                return;
            }
        };
        inner.dirs_scanned.set(inner.dirs_scanned.get() + 1);

        for name in entries {
            inner.gate.admit().await;
            inner.gate.begin();
            inner.stage(Job::Stat(dir.clone(), name));
        }
    }

    /// Query one entry's metadata and act on its type.
    async fn stat_entry(inner: Rc<Self>, dir: DirRef, name: OsString) {
        let result = inner.ring.statx(dir.fd(), &name).await;
        inner.gate.complete();

        let stx = match result {
            Ok(stx) => stx,
            Err(e) => {
                // entries disappearing mid-scan are routine on a live cache
                if e.raw_os_error() == Some(libc::ENOENT) {
                    debug!("Entry {:?} vanished during scan", name);
                } else {
                    warn!("Stat error for {:?}: {}", name, e);
                }
                inner.stat_errors.set(inner.stat_errors.get() + 1);
                return;
            }
        };

        match u32::from(stx.stx_mode) & libc::S_IFMT {
            libc::S_IFDIR => {
                // cap memory before descending
                inner.gate.admit().await;
                match inner.ring.open_dir_path(dir.fd(), &name).await {
                    Ok(fd) => {
                        let child = DirRef::adopt(DirNode::child(dir.clone(), fd));
                        inner.stage(Job::Scan(child));
                    }
                    Err(e) => {
                        warn!("Failed to open directory {:?}: {}", name, e);
                        inner.dirs_failed.set(inner.dirs_failed.get() + 1);
                    }
                }
            }
            libc::S_IFREG => {
                let size = stx.stx_blocks * 512;
                inner.add_file(&dir, name, stx.stx_atime.tv_sec, size);
            }
            _ => {}
        }
    }

    /// Classify a regular file: stream it out if ancient, otherwise
    /// offer it to the retained set.
    fn add_file(&self, dir: &DirRef, name: OsString, atime: i64, size: u64) {
        self.files_seen.set(self.files_seen.get() + 1);

        if atime < self.discard_older_than {
            self.ancient_files.set(self.ancient_files.get() + 1);
            let _ = self.ancient_tx.send(AncientFile {
                dir: dir.clone(),
                name,
                size,
            });
            return;
        }

        let mut files = self.result.borrow_mut();

        // While the set is already full under either rule, drop the
        // newest entry to make room: the set is sorted by access time
        // and the oldest files are the ones worth keeping.
        while files.len() as u64 >= self.max_files
            || (files.len() as u64 >= self.collect_files
                && files.total_bytes() > self.collect_bytes)
        {
            if files.pop_newest().is_none() {
                break;
            }
        }

        files.insert(File {
            dir: dir.clone(),
            name,
            atime,
            size,
        });
    }
}
