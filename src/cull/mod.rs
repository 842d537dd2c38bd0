//! The cull operation
//!
//! Walks the whole cache tree and asks the kernel to reclaim the files
//! that have not been accessed for the longest time.  Ancient files
//! reported by the walker are culled as soon as they are discovered;
//! everything the walker retains to the end of the scan is culled
//! afterwards, oldest first.
//!
//! Every cull command requires the process CWD to be the victim's
//! directory, so operations are funneled through the [`Chdir`]
//! arbiter and run concurrently against the control device.  The
//! engine resolves exactly once, when the walk has finished and every
//! operation has completed, reporting aggregate counters.

mod op;

use crate::chdir::Chdir;
use crate::dev::DevCachefiles;
use crate::ring::Ring;
use crate::walker::{Walk, WalkLimits};
use humansize::{format_size, BINARY};
use op::CullFileOp;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::pin::pin;
use std::rc::Rc;
use tokio::task::JoinSet;
use tracing::info;

/// Aggregate counters for one cull round.
#[derive(Debug, Clone, Copy, Default)]
pub struct CullStats {
    /// Files the kernel reclaimed (or that were already gone).
    pub deleted_files: u64,

    /// Bytes those files occupied.
    pub deleted_bytes: u64,

    /// Files the kernel retained because they are in use.
    pub busy: u64,

    /// Operations that failed (chdir refused, name too long, or an
    /// unexpected write error).
    pub errors: u64,
}

pub(crate) struct CullInner {
    pub(crate) ring: Ring,
    pub(crate) dev: DevCachefiles,
    pub(crate) chdir: Chdir,
    pub(crate) stats: RefCell<CullStats>,
}

/// One cull round: walk, then reclaim.
pub struct Cull {
    ring: Ring,
    dev: DevCachefiles,
    cull_files: u64,
    cull_bytes: u64,
    limits: WalkLimits,
}

impl Cull {
    /// Create a cull round that tries to reclaim at least `cull_files`
    /// files and `cull_bytes` bytes.
    pub fn new(ring: Ring, dev: DevCachefiles, cull_files: u64, cull_bytes: u64) -> Self {
        Self::with_limits(ring, dev, cull_files, cull_bytes, WalkLimits::default())
    }

    /// Like [`Cull::new`] with explicit walk limits (tests).
    pub fn with_limits(
        ring: Ring,
        dev: DevCachefiles,
        cull_files: u64,
        cull_bytes: u64,
        limits: WalkLimits,
    ) -> Self {
        Self {
            ring,
            dev,
            cull_files,
            cull_bytes,
            limits,
        }
    }

    /// Run the round over the tree rooted at `root_fd` (path-only,
    /// consumed).  Resolves exactly once, with the aggregate counters;
    /// no error surface escapes to the caller.
    ///
    /// Must be called within a `LocalSet`.  Dropping the returned
    /// future cancels the walk and every in-flight operation.
    pub async fn run(self, root_fd: OwnedFd) -> CullStats {
        let (walk, mut ancient_rx) =
            Walk::with_limits(self.ring.clone(), self.cull_files, self.cull_bytes, self.limits);

        let inner = Rc::new(CullInner {
            ring: self.ring,
            dev: self.dev,
            chdir: Chdir::new(),
            stats: RefCell::new(CullStats::default()),
        });

        let mut walk_fut = pin!(walk.run(root_fd));
        let mut walk_done = false;
        let mut ancient_done = false;

        // Ops are staged here and started from the top of the loop,
        // never from within a walker notification.
        let mut new_operations: VecDeque<CullFileOp> = VecDeque::new();
        let mut operations: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(op) = new_operations.pop_front() {
                operations.spawn_local(op::run(Rc::clone(&inner), op));
            }
            if walk_done && ancient_done && operations.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                ancient = ancient_rx.recv(), if !ancient_done => match ancient {
                    Some(file) => new_operations.push_back(CullFileOp {
                        dir: file.dir,
                        name: file.name,
                        size: file.size,
                    }),
                    None => ancient_done = true,
                },
                result = walk_fut.as_mut(), if !walk_done => {
                    walk_done = true;
                    info!(
                        "Cull: delete {} files, {} bytes",
                        result.files.len(),
                        result.files.total_bytes()
                    );
                    for file in result.files.into_oldest_first() {
                        new_operations.push_back(CullFileOp {
                            dir: file.dir,
                            name: file.name,
                            size: file.size,
                        });
                    }
                }
                Some(_) = operations.join_next() => {}
                else => {}
            }
        }

        let stats = *inner.stats.borrow();
        info!(
            "Cull: deleted {} files, {} ({} in use, {} errors)",
            stats.deleted_files,
            format_size(stats.deleted_bytes, BINARY),
            stats.busy,
            stats.errors
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chdir::TEST_ARBITER_LOCK;
    use crate::dirnode::{DirNode, DirRef};
    use crate::ring::open_path;
    use std::ffi::OsString;
    use std::io::Read;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::os::unix::net::UnixStream;
    use tokio::task::LocalSet;

    fn run_local<F: std::future::Future>(f: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(LocalSet::new().run_until(f))
    }

    #[test]
    fn test_op_failure_paths() {
        let _guard = TEST_ARBITER_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        let tmp = tempfile::tempdir().unwrap();
        let file_path = tmp.path().join("plain");
        std::fs::write(&file_path, b"x").unwrap();

        let (device, mut peer) = UnixStream::pair().unwrap();
        let dev_fd = device.as_raw_fd();

        run_local(async move {
            let inner = Rc::new(CullInner {
                ring: Ring::new(),
                dev: DevCachefiles::new(dev_fd),
                chdir: Chdir::new(),
                stats: RefCell::new(CullStats::default()),
            });

            // chdir refused: one error, no write reaches the device
            let not_a_dir = DirRef::adopt(DirNode::root(
                OwnedFd::from(std::fs::File::open(&file_path).unwrap()),
                None,
            ));
            op::run(
                Rc::clone(&inner),
                CullFileOp {
                    dir: not_a_dir,
                    name: OsString::from("victim"),
                    size: 4096,
                },
            )
            .await;

            // oversized filename: formatting fails after the lease
            let dir = DirRef::adopt(DirNode::root(open_path(tmp.path()).unwrap(), None));
            op::run(
                Rc::clone(&inner),
                CullFileOp {
                    dir,
                    name: OsString::from("x".repeat(crate::dev::NAME_MAX)),
                    size: 4096,
                },
            )
            .await;

            let stats = *inner.stats.borrow();
            assert_eq!(stats.errors, 2);
            assert_eq!(stats.deleted_files, 0);
            assert_eq!(stats.busy, 0);
        });

        drop(device);
        let mut written = Vec::new();
        peer.read_to_end(&mut written).unwrap();
        assert!(written.is_empty(), "no cull command may be submitted");
    }
}
