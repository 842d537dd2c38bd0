//! Reference-counted directory nodes
//!
//! Every directory the walker enters is represented by a [`DirNode`]
//! holding a path-only (`O_PATH`) descriptor.  The descriptor is kept
//! for two reasons: it lets later stages (retained victims, in-flight
//! cull operations, the chdir arbiter) refer to the directory long
//! after its name went out of scope, and it can be handed to `fchdir`
//! without re-traversing the path.
//!
//! [`DirRef`] is the only safe handle.  A non-root node owns exactly
//! one reference to its parent, so an entire ancestor chain stays open
//! as long as anything below it is alive.  When the last reference is
//! dropped the descriptor is closed through the submission queue so
//! the host thread never blocks on close; nodes created without a
//! queue close synchronously.

use crate::ring::Ring;
use std::ops::Deref;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

/// One directory in the scanned tree.
pub struct DirNode {
    parent: Option<DirRef>,
    fd: Option<OwnedFd>,
    ring: Option<Ring>,
}

impl DirNode {
    /// Create the root node of a walk.
    pub fn root(fd: OwnedFd, ring: Option<Ring>) -> Self {
        Self {
            parent: None,
            fd: Some(fd),
            ring,
        }
    }

    /// Create a child node, taking a reference on the parent.
    pub fn child(parent: DirRef, fd: OwnedFd) -> Self {
        let ring = parent.ring.clone();
        Self {
            parent: Some(parent),
            fd: Some(fd),
            ring,
        }
    }

    /// The path-only descriptor.  Valid for the node's entire lifetime.
    pub fn fd(&self) -> RawFd {
        // fd is only vacated inside Drop
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    pub fn parent(&self) -> Option<&DirRef> {
        self.parent.as_ref()
    }
}

impl Drop for DirNode {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            match &self.ring {
                Some(ring) => ring.close(fd),
                None => drop(fd),
            }
        }
    }
}

/// Owning handle to a [`DirNode`].
///
/// Cloning takes another reference; dropping releases one.  Use
/// [`DirRef::adopt`] to wrap a freshly created node without an extra
/// increment.
#[derive(Clone)]
pub struct DirRef(Rc<DirNode>);

impl DirRef {
    /// Consume a freshly created node.
    pub fn adopt(node: DirNode) -> Self {
        Self(Rc::new(node))
    }

    /// Whether two references point at the same node.
    pub fn same_node(a: &Self, b: &Self) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Number of live references to the node.
    pub fn ref_count(this: &Self) -> usize {
        Rc::strong_count(&this.0)
    }
}

impl Deref for DirRef {
    type Target = DirNode;

    fn deref(&self) -> &DirNode {
        &self.0
    }
}
