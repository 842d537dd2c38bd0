//! A single in-flight cull operation
//!
//! Each operation owns a reference to the victim's directory, acquires
//! a chdir lease for it, and submits one `cull <name>` write to the
//! control device.  The lease is released before the outcome is
//! recorded: recording completion may be the step that lets the engine
//! finish, and the arbiter must not be torn down from inside its own
//! dispatch.

use super::CullInner;
use crate::dev::{CullResult, DevCachefiles};
use crate::dirnode::DirRef;
use std::ffi::OsString;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use tracing::warn;

/// One victim: directory reference, name and accounted size.
/// At most one write is ever submitted per operation.
pub(crate) struct CullFileOp {
    pub dir: DirRef,
    pub name: OsString,
    pub size: u64,
}

/// Run one operation to completion, updating exactly one counter.
pub(crate) async fn run(inner: Rc<CullInner>, op: CullFileOp) {
    let lease = match inner.chdir.acquire(&op.dir).await {
        Ok(lease) => lease,
        Err(_) => {
            inner.stats.borrow_mut().errors += 1;
            return;
        }
    };

    let Some(cmd) = DevCachefiles::format_cull(&op.name) else {
        drop(lease);
        warn!("Filename too long to cull: {:?}", op.name);
        inner.stats.borrow_mut().errors += 1;
        return;
    };

    let result = inner.ring.write(inner.dev.as_raw_fd(), cmd).await;
    drop(lease);

    let mut stats = inner.stats.borrow_mut();
    match DevCachefiles::classify(&op.name, &result) {
        CullResult::Success => {
            stats.deleted_files += 1;
            stats.deleted_bytes += op.size;
        }
        CullResult::Busy => stats.busy += 1,
        CullResult::Error => stats.errors += 1,
    }
}
