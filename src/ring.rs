//! Asynchronous syscall submission queue
//!
//! The walker and the cull engine drive many filesystem operations
//! concurrently (`statx`, path-only opens, directory reads, the cull
//! `write` itself, and handle closes) while the core logic stays on a
//! single cooperative thread.  This module is the submission interface
//! between the two: operations are handed off here and their
//! completions are awaited by the submitting task.
//!
//! Submissions may be serviced by internal worker threads; the core
//! never observes that.  All arguments cross the boundary by value
//! (raw descriptor numbers and owned byte strings), and the refcount
//! discipline on directory nodes guarantees that a descriptor stays
//! open until every operation that captured it has completed.

use std::ffi::{CStr, CString, OsStr, OsString};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use tokio::runtime::Handle;

/// Handle to the submission queue.  Cheap to clone; all clones share
/// the same completion stream (the host runtime).
#[derive(Debug, Clone)]
pub struct Ring {
    handle: Handle,
}

impl Ring {
    /// Bind to the current runtime.  Must be called from within it.
    pub fn new() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    /// Query file metadata relative to a directory descriptor.
    ///
    /// Issues one `statx` for type, atime and block count, without
    /// following symlinks, crossing automounts, or forcing a remote
    /// attribute sync.
    pub async fn statx(&self, dirfd: RawFd, name: &OsStr) -> io::Result<libc::statx> {
        let name = to_cstring(name)?;
        self.submit(move || {
            let mut stx = std::mem::MaybeUninit::<libc::statx>::zeroed();
            let rc = unsafe {
                libc::statx(
                    dirfd,
                    name.as_ptr(),
                    libc::AT_NO_AUTOMOUNT | libc::AT_SYMLINK_NOFOLLOW | libc::AT_STATX_DONT_SYNC,
                    libc::STATX_TYPE | libc::STATX_ATIME | libc::STATX_BLOCKS,
                    stx.as_mut_ptr(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(unsafe { stx.assume_init() })
        })
        .await
    }

    /// Open a subdirectory path-only (`O_PATH`), suitable for `fchdir`
    /// and as a base for relative operations.
    pub async fn open_dir_path(&self, dirfd: RawFd, name: &OsStr) -> io::Result<OwnedFd> {
        let name = to_cstring(name)?;
        self.submit(move || {
            let fd = unsafe {
                libc::openat(
                    dirfd,
                    name.as_ptr(),
                    libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(unsafe { OwnedFd::from_raw_fd(fd) })
        })
        .await
    }

    /// List the entries of a directory identified by a path-only
    /// descriptor, skipping `.` and `..`.
    pub async fn read_dir(&self, dirfd: RawFd) -> io::Result<Vec<OsString>> {
        self.submit(move || read_entries(dirfd)).await
    }

    /// Write a buffer to a descriptor with a single `write` syscall.
    pub async fn write(
        &self,
        fd: RawFd,
        buf: impl AsRef<[u8]> + Send + 'static,
    ) -> io::Result<usize> {
        self.submit(move || {
            let bytes = buf.as_ref();
            let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        })
        .await
    }

    /// Close a descriptor off the host thread.  Fire and forget; close
    /// errors on path-only descriptors carry no information.
    pub fn close(&self, fd: OwnedFd) {
        self.handle.spawn_blocking(move || drop(fd));
    }

    async fn submit<T, F>(&self, op: F) -> io::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> io::Result<T> + Send + 'static,
    {
        self.handle
            .spawn_blocking(op)
            .await
            .map_err(io::Error::other)?
    }
}

fn to_cstring(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

fn read_entries(dirfd: RawFd) -> io::Result<Vec<OsString>> {
    // A path-only descriptor cannot be read directly; reopen "." for
    // reading relative to it.
    let fd = unsafe {
        libc::openat(
            dirfd,
            c".".as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let dir = unsafe { libc::fdopendir(fd) };
    if dir.is_null() {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let mut names = Vec::new();
    loop {
        let entry = unsafe { libc::readdir64(dir) };
        if entry.is_null() {
            break;
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(OsString::from_vec(bytes.to_vec()));
    }

    // closes the underlying descriptor as well
    unsafe { libc::closedir(dir) };
    Ok(names)
}

/// Open a path path-only, for the cache root and its subdirectories.
pub fn open_path(path: &Path) -> io::Result<OwnedFd> {
    let path = to_cstring(path.as_os_str())?;
    let fd = unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Open a subdirectory path-only, synchronously (setup paths only).
pub fn open_path_at(dirfd: RawFd, name: &str) -> io::Result<OwnedFd> {
    let name = to_cstring(OsStr::new(name))?;
    let fd = unsafe {
        libc::openat(
            dirfd,
            name.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
