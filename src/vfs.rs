//! Filesystem occupancy probing for cull target sizing
//!
//! When the kernel requests a cull, the daemon sizes the round from
//! the cache filesystem's free space: enough files to bring free
//! inodes back over the `frun` watermark, and enough bytes for the
//! `brun` watermark, with a 1 MiB floor so a round always frees
//! something.  If the filesystem cannot be queried the round falls
//! back to the floor alone.

use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use tracing::warn;

/// Floor for the byte target of a cull round.
pub const MIN_CULL_BYTES: u64 = 1024 * 1024;

/// How much one cull round should try to reclaim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CullTargets {
    pub files: u64,
    pub bytes: u64,
}

/// Size a cull round from the filesystem containing `fd`.
pub fn cull_targets(fd: RawFd, brun: u8, frun: u8) -> CullTargets {
    let mut stat = MaybeUninit::<libc::statvfs>::zeroed();
    if unsafe { libc::fstatvfs(fd, stat.as_mut_ptr()) } != 0 {
        warn!("fstatvfs() failed: {}", io::Error::last_os_error());
        return CullTargets {
            files: 0,
            bytes: MIN_CULL_BYTES,
        };
    }
    let stat = unsafe { stat.assume_init() };

    targets_from_statvfs(
        stat.f_files as u64,
        stat.f_ffree as u64,
        stat.f_blocks as u64,
        stat.f_bfree as u64,
        stat.f_bsize as u64,
        brun,
        frun,
    )
}

/// The sizing arithmetic: rounded-up watermark targets minus what is
/// already free.
pub fn targets_from_statvfs(
    total_files: u64,
    free_files: u64,
    total_blocks: u64,
    free_blocks: u64,
    block_size: u64,
    brun: u8,
    frun: u8,
) -> CullTargets {
    let target_files = (total_files * u64::from(frun) + 99) / 100;
    let files = target_files.saturating_sub(free_files);

    let target_blocks = (total_blocks * u64::from(brun) + 99) / 100;
    let bytes = target_blocks
        .saturating_sub(free_blocks)
        .saturating_mul(block_size)
        .max(MIN_CULL_BYTES);

    CullTargets { files, bytes }
}
