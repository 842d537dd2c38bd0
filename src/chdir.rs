//! Arbitration of the process-wide current working directory
//!
//! The kernel applies `cull <name>` to the process's current working
//! directory, so every cull operation needs the CWD set to the
//! directory containing its victim.  The CWD is a single-slot global
//! resource; this module owns it.  No other code in the process may
//! call `chdir`/`fchdir`.
//!
//! Waiters asking for the same directory are batched: one `fchdir`
//! serves the whole cohort, and each waiter receives a [`ChdirLease`]
//! that pins the CWD until dropped.  Only when the last lease of a
//! batch is released does the arbiter move on to the next directory.
//! Directories are visited in numeric descriptor order.
//!
//! Batches are dispatched from a deferred step on the event loop,
//! never inline from a waiter's completion, so a waiter releasing its
//! lease (or cancelling) can never re-enter the dispatch machinery.

use crate::dirnode::DirRef;
use crate::error::ChdirError;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// Only one arbiter (and therefore one cull engine) may exist per
/// process; a second one would fight over the CWD.
static ARBITER_ACTIVE: AtomicBool = AtomicBool::new(false);

struct Waiter {
    /// Keeps the target directory (and its descriptor) alive while
    /// queued.
    dir: DirRef,
    tx: oneshot::Sender<Result<ChdirLease, ChdirError>>,
}

#[derive(Default)]
struct WaiterMap {
    /// Waiter queues keyed by target descriptor, ordered by numeric
    /// identity.
    map: BTreeMap<RawFd, VecDeque<Waiter>>,

    /// The directory the process is currently chdir'd to, while leases
    /// are outstanding.
    current: Option<RawFd>,
}

struct ChdirInner {
    state: RefCell<WaiterMap>,

    /// Outstanding leases for the current batch, including the
    /// synthetic lease held during dispatch.
    leases: Cell<usize>,

    /// Coalesces deferred step scheduling.
    step_scheduled: Cell<bool>,

    /// Number of fchdir syscalls issued.
    chdir_calls: Cell<u64>,
}

/// The arbiter.  See the module documentation.
pub struct Chdir {
    inner: Rc<ChdirInner>,
}

/// A share-counted token pinning the process CWD to one directory.
///
/// Dropping the last lease of a batch lets the arbiter advance to the
/// next directory.
pub struct ChdirLease {
    inner: Rc<ChdirInner>,
}

impl ChdirLease {
    fn grant(inner: &Rc<ChdirInner>) -> Self {
        inner.leases.set(inner.leases.get() + 1);
        Self {
            inner: Rc::clone(inner),
        }
    }
}

impl Drop for ChdirLease {
    fn drop(&mut self) {
        let remaining = self.inner.leases.get() - 1;
        self.inner.leases.set(remaining);
        if remaining == 0 {
            self.inner.abandoned();
        }
    }
}

impl Chdir {
    /// Create the arbiter.
    ///
    /// # Panics
    ///
    /// Panics if another arbiter already exists in this process.
    pub fn new() -> Self {
        assert!(
            ARBITER_ACTIVE
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "only one chdir arbiter may exist per process"
        );
        Self {
            inner: Rc::new(ChdirInner {
                state: RefCell::new(WaiterMap::default()),
                leases: Cell::new(0),
                step_scheduled: Cell::new(false),
                chdir_calls: Cell::new(0),
            }),
        }
    }

    /// Acquire a lease on `dir` as the process CWD.
    ///
    /// Completes once the CWD is `dir` (possibly immediately, if a
    /// batch for `dir` is already active), or with [`ChdirError`] if
    /// the kernel refused the change.  Dropping the returned future
    /// before completion cancels the request.
    pub async fn acquire(&self, dir: &DirRef) -> Result<ChdirLease, ChdirError> {
        let fd = dir.fd();

        {
            let state = self.inner.state.borrow();
            if state.current == Some(fd) && self.inner.leases.get() > 0 {
                drop(state);
                return Ok(ChdirLease::grant(&self.inner));
            }
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.borrow_mut();
            state.map.entry(fd).or_default().push_back(Waiter {
                dir: dir.clone(),
                tx,
            });
            if state.current.is_none() {
                drop(state);
                self.inner.schedule_step();
            }
        }

        // The sender is dropped without sending only if the arbiter
        // itself goes away.
        rx.await.unwrap_or(Err(ChdirError))
    }

    /// Number of fchdir syscalls issued so far.
    pub fn chdir_calls(&self) -> u64 {
        self.inner.chdir_calls.get()
    }
}

impl Default for Chdir {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Chdir {
    fn drop(&mut self) {
        // Fail anything still queued.
        let waiters: Vec<Waiter> = {
            let mut state = self.inner.state.borrow_mut();
            state.current = None;
            state
                .map
                .iter_mut()
                .flat_map(|(_, q)| q.drain(..))
                .collect()
        };
        for waiter in waiters {
            let _ = waiter.tx.send(Err(ChdirError));
        }

        // Revert to "/" so we don't occupy an arbitrary directory
        // (that would prevent unmounting, for example).
        unsafe { libc::chdir(c"/".as_ptr()) };

        ARBITER_ACTIVE.store(false, Ordering::Release);
    }
}

impl ChdirInner {
    /// Last lease of the current batch was released.
    fn abandoned(self: &Rc<Self>) {
        debug_assert_eq!(self.leases.get(), 0);

        let has_waiters = {
            let mut state = self.state.borrow_mut();
            state.current = None;
            !state.map.is_empty()
        };
        if has_waiters {
            self.schedule_step();
        }
    }

    fn schedule_step(self: &Rc<Self>) {
        if self.step_scheduled.replace(true) {
            return;
        }
        let inner = Rc::clone(self);
        tokio::task::spawn_local(async move {
            inner.step_scheduled.set(false);
            inner.step();
        });
    }

    /// Advance to the next directory batch.  Runs only from the
    /// deferred slot.
    fn step(self: &Rc<Self>) {
        if self.leases.get() > 0 {
            // a batch is active; same-directory waiters fast-path in
            // acquire(), everything else waits for the leases
            return;
        }

        loop {
            let (fd, mut batch) = {
                let mut state = self.state.borrow_mut();

                // find the first descriptor with live waiters, dropping
                // cancelled entries along the way
                let fd = loop {
                    let Some((&fd, _)) = state.map.iter().next() else {
                        state.current = None;
                        return;
                    };
                    let queue = state.map.get_mut(&fd).expect("entry just observed");
                    queue.retain(|w| !w.tx.is_closed());
                    if queue.is_empty() {
                        state.map.remove(&fd);
                        continue;
                    }
                    break fd;
                };

                let batch = state.map.remove(&fd).expect("entry just observed");
                (fd, batch)
            };

            self.chdir_calls.set(self.chdir_calls.get() + 1);
            if unsafe { libc::fchdir(fd) } < 0 {
                debug!(fd, "fchdir failed, abandoning batch");
                // the whole cohort fails; waiters arriving later for
                // the same directory start a fresh batch
                for waiter in batch.drain(..) {
                    let _ = waiter.tx.send(Err(ChdirError));
                }
                continue;
            }

            self.state.borrow_mut().current = Some(fd);

            // Pin the batch for the duration of the dispatch so a
            // waiter that releases (or has cancelled) mid-loop cannot
            // trigger the idle transition underneath us.
            let dispatch_pin = ChdirLease::grant(self);
            for waiter in batch.drain(..) {
                let Waiter { dir, tx } = waiter;
                let _ = tx.send(Ok(ChdirLease::grant(self)));
                drop(dir);
            }
            drop(dispatch_pin);
            return;
        }
    }
}

#[cfg(test)]
pub(crate) static TEST_ARBITER_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
