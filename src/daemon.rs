//! Daemon instance wiring
//!
//! Owns the control device and the cache directory handles, and runs
//! the main loop: wait for the kernel to signal that a cull is wanted,
//! size the round from the cache filesystem, run one cull engine to
//! completion, repeat.  At most one cull runs at a time; while one is
//! in progress the device is simply not polled.

use crate::config::Config;
use crate::cull::Cull;
use crate::dev::DevCachefiles;
use crate::error::Result;
use crate::ring::{open_path, open_path_at, Ring};
use crate::vfs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info};

/// Watermark inflation applied when sizing a cull round: aim a little
/// above the configured thresholds so rounds don't immediately
/// retrigger.
const RUN_MARGIN: u8 = 2;

pub struct Instance {
    device: OwnedFd,
    cache_fd: OwnedFd,

    // Kept open for the lifetime of the daemon, like the cache root.
    // TODO implement a graveyard reaper
    #[allow(dead_code)]
    graveyard_fd: OwnedFd,

    brun: u8,
    frun: u8,
    culling_disabled: bool,
}

impl Instance {
    /// Open and bind the cache described by `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let device = DevCachefiles::open()?;
        DevCachefiles::new(device.as_raw_fd()).bind(&config.kernel_config)?;

        let fscache_fd = open_path(&config.dir)?;
        let cache_fd = open_path_at(fscache_fd.as_raw_fd(), "cache")?;
        let graveyard_fd = open_path_at(fscache_fd.as_raw_fd(), "graveyard")?;

        Ok(Self {
            device,
            cache_fd,
            graveyard_fd,
            brun: config.brun,
            frun: config.frun,
            culling_disabled: config.culling_disabled,
        })
    }

    /// Run the daemon until interrupted.
    ///
    /// Must be called within a `LocalSet` on a current-thread runtime.
    pub async fn run(self) -> Result<()> {
        let ring = Ring::new();
        let dev = DevCachefiles::new(self.device.as_raw_fd());
        let device = AsyncFd::with_interest(dev, Interest::READABLE)?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut polling = true;

        info!("cache bound, waiting for kernel cull requests");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    debug!("interrupt, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    debug!("SIGTERM, shutting down");
                    break;
                }
                guard = device.readable(), if polling => {
                    let mut guard = guard?;
                    let mut buf = [0u8; 1024];
                    match device.get_ref().read_state(&mut buf) {
                        Ok(0) => {
                            error!("/dev/cachefiles closed by the kernel");
                            polling = false;
                        }
                        Ok(n) => {
                            if DevCachefiles::wants_cull(&buf[..n]) && !self.culling_disabled {
                                if !self.cull_round(&ring, dev, &mut sigterm).await {
                                    break;
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            guard.clear_ready();
                        }
                        Err(e) => {
                            error!("reading /dev/cachefiles failed: {}", e);
                            polling = false;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Size and run one cull round.  Returns false if the daemon was
    /// asked to shut down while the round was in flight.
    async fn cull_round(
        &self,
        ring: &Ring,
        dev: DevCachefiles,
        sigterm: &mut tokio::signal::unix::Signal,
    ) -> bool {
        let brun = self.brun.saturating_add(RUN_MARGIN).min(100);
        let frun = self.frun.saturating_add(RUN_MARGIN).min(100);
        let targets = vfs::cull_targets(self.cache_fd.as_raw_fd(), brun, frun);
        info!("Cull: start files={} bytes={}", targets.files, targets.bytes);

        let root = match open_path_at(self.cache_fd.as_raw_fd(), ".") {
            Ok(fd) => fd,
            Err(e) => {
                error!("Failed to open cache root: {}", e);
                return true;
            }
        };

        let cull = Cull::new(ring.clone(), dev, targets.files, targets.bytes);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupt, cancelling cull");
                false
            }
            _ = sigterm.recv() => {
                debug!("SIGTERM, cancelling cull");
                false
            }
            _ = cull.run(root) => true,
        }
    }
}
