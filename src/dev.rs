//! /dev/cachefiles control device adapter
//!
//! The kernel side of cachefiles is driven through a character device:
//! ASCII commands, one per `write`, no trailing newline.  Reading the
//! device yields whitespace-separated `key=value` tokens describing the
//! cache state; the daemon reacts to `cull=<nonzero>` by starting a
//! cull round.
//!
//! The cull request itself is the payload `cull <name>`, written while
//! the process's working directory is the directory containing the
//! victim.  fscache is buggy with `writev()`, so every command must be
//! a single plain `write`.

use crate::error::DeviceError;
use std::ffi::OsStr;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::warn;

/// Maximum filename length accepted by the kernel (excluding NUL)
pub const NAME_MAX: usize = 255;

/// Command buffer size: `cull ` / `inuse ` prefix plus the filename
pub const CMD_BUF_SIZE: usize = NAME_MAX + 8;

/// Path of the control device
pub const DEVICE_PATH: &str = "/dev/cachefiles";

/// Outcome of a cull command, as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullResult {
    /// The file was reclaimed, or was already gone (ESTALE/ENOENT)
    Success,

    /// The kernel retained the file because it is in use (EBUSY)
    Busy,

    /// Any other failure; logged with the filename
    Error,
}

/// A formatted control-device command held in a fixed buffer.
///
/// The kernel rejects names of NAME_MAX or longer, so the whole
/// command always fits in [`CMD_BUF_SIZE`] bytes.
#[derive(Clone, Copy)]
pub struct CullCommand {
    buf: [u8; CMD_BUF_SIZE],
    len: usize,
}

impl CullCommand {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsRef<[u8]> for CullCommand {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for CullCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Thin adapter over a `/dev/cachefiles` file descriptor (non-owning).
///
/// The descriptor is owned elsewhere (by the daemon instance); this
/// wrapper only formats and submits commands and interprets replies,
/// so it can be freely copied into the cull engine.
#[derive(Debug, Clone, Copy)]
pub struct DevCachefiles {
    fd: RawFd,
}

impl DevCachefiles {
    /// Wrap an already opened control device descriptor
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Open the control device read-write and non-blocking.
    ///
    /// Non-blocking mode is required for readiness-driven reads on the
    /// event loop.
    pub fn open() -> Result<OwnedFd, DeviceError> {
        let fd = unsafe {
            libc::open(
                c"/dev/cachefiles".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(DeviceError::Open {
                path: PathBuf::from(DEVICE_PATH),
                source: io::Error::last_os_error(),
            });
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Write one configuration command to the device.
    ///
    /// Exactly one `write` syscall, no newline.
    pub fn write_command(&self, command: &str) -> Result<(), DeviceError> {
        let n = unsafe {
            libc::write(
                self.fd,
                command.as_bytes().as_ptr().cast(),
                command.len(),
            )
        };
        if n < 0 {
            return Err(DeviceError::Write {
                command: command.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        if n as usize != command.len() {
            return Err(DeviceError::ShortWrite {
                command: command.to_string(),
            });
        }
        Ok(())
    }

    /// Submit the pre-bind configuration followed by `bind`.
    pub fn bind(&self, kernel_config: &[String]) -> Result<(), DeviceError> {
        for line in kernel_config {
            self.write_command(line)?;
        }
        self.write_command("bind")
    }

    /// Read pending state tokens from the device into `buf`.
    pub fn read_state(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Format a `cull <name>` command.
    ///
    /// Returns `None` if the name is too long for the kernel to accept.
    pub fn format_cull(name: &OsStr) -> Option<CullCommand> {
        let name = name.as_bytes();
        if name.len() >= NAME_MAX {
            return None;
        }

        let mut cmd = CullCommand {
            buf: [0; CMD_BUF_SIZE],
            len: 5 + name.len(),
        };
        cmd.buf[..5].copy_from_slice(b"cull ");
        cmd.buf[5..5 + name.len()].copy_from_slice(name);
        Some(cmd)
    }

    /// Classify the result of a cull write.
    ///
    /// ESTALE and ENOENT mean the file is already gone, which is as
    /// good as a successful cull.  EBUSY means the kernel retained the
    /// file; leave it alone.  Everything else is an error, logged with
    /// the filename.
    pub fn classify(name: &OsStr, result: &io::Result<usize>) -> CullResult {
        match result {
            Ok(_) => CullResult::Success,
            Err(e) => match e.raw_os_error() {
                Some(libc::ESTALE) | Some(libc::ENOENT) => CullResult::Success,
                Some(libc::EBUSY) => CullResult::Busy,
                _ => {
                    warn!("Failed to cull {:?}: {}", name, e);
                    CullResult::Error
                }
            },
        }
    }

    /// Parse device state tokens and decide whether the kernel wants a
    /// cull round.
    ///
    /// The state line is a whitespace-separated sequence of `key=value`
    /// pairs; only `cull=<nonzero>` matters here.  The last occurrence
    /// wins.
    pub fn wants_cull(state: &[u8]) -> bool {
        let state = String::from_utf8_lossy(state);
        let mut start_cull = false;
        for token in state.split_ascii_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                if key == "cull" {
                    start_cull = value != "0";
                }
            }
        }
        start_cull
    }
}

// Keep the adapter usable with AsyncFd registration.
impl AsRawFd for DevCachefiles {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn err(code: i32) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(code))
    }

    #[test]
    fn test_format_cull() {
        let cmd = DevCachefiles::format_cull(OsStr::new("Es0g000w...")).unwrap();
        assert_eq!(cmd.as_bytes(), b"cull Es0g000w...");
    }

    #[test]
    fn test_format_cull_rejects_long_names() {
        let long = OsString::from("x".repeat(NAME_MAX));
        assert!(DevCachefiles::format_cull(&long).is_none());

        let fits = OsString::from("x".repeat(NAME_MAX - 1));
        let cmd = DevCachefiles::format_cull(&fits).unwrap();
        assert_eq!(cmd.as_bytes().len(), 5 + NAME_MAX - 1);
    }

    #[test]
    fn test_format_cull_round_trip() {
        let name = OsStr::new("@42_data");
        let cmd = DevCachefiles::format_cull(name).unwrap();
        let text = std::str::from_utf8(cmd.as_bytes()).unwrap();
        assert_eq!(text.strip_prefix("cull ").unwrap(), "@42_data");
    }

    #[test]
    fn test_classify() {
        let name = OsStr::new("f");
        assert_eq!(
            DevCachefiles::classify(name, &Ok(7)),
            CullResult::Success
        );
        assert_eq!(
            DevCachefiles::classify(name, &err(libc::ESTALE)),
            CullResult::Success
        );
        assert_eq!(
            DevCachefiles::classify(name, &err(libc::ENOENT)),
            CullResult::Success
        );
        assert_eq!(
            DevCachefiles::classify(name, &err(libc::EBUSY)),
            CullResult::Busy
        );
        assert_eq!(
            DevCachefiles::classify(name, &err(libc::EIO)),
            CullResult::Error
        );
        assert_eq!(
            DevCachefiles::classify(name, &err(libc::EPERM)),
            CullResult::Error
        );
    }

    #[test]
    fn test_wants_cull() {
        assert!(DevCachefiles::wants_cull(b"cull=1"));
        assert!(DevCachefiles::wants_cull(b"brun=10 frun=7 cull=1"));
        assert!(!DevCachefiles::wants_cull(b"cull=0"));
        assert!(!DevCachefiles::wants_cull(b"brun=10 frun=7"));
        assert!(!DevCachefiles::wants_cull(b""));
        // last occurrence wins
        assert!(!DevCachefiles::wants_cull(b"cull=1 cull=0"));
        assert!(DevCachefiles::wants_cull(b"cull=0 cull=1"));
        // malformed tokens are ignored
        assert!(DevCachefiles::wants_cull(b"noise cull=1 ="));
    }
}
