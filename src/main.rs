//! culld - Cull daemon for the Linux cachefiles subsystem
//!
//! Entry point: parse the command line, load the configuration, bind
//! the cache and run the daemon loop on a single-threaded runtime.

use anyhow::{Context, Result};
use clap::Parser;
use culld::config::{CliArgs, Config};
use culld::daemon::Instance;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.debug)?;

    let mut config = Config::load(&args.config).context("Invalid configuration")?;
    if args.nocull {
        config.culling_disabled = true;
    }

    let instance = Instance::new(&config).context("Failed to bind cache")?;

    // The core is single-threaded and cooperative; all of it runs
    // inside one LocalSet on a current-thread runtime.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create runtime")?;
    let local = tokio::task::LocalSet::new();
    runtime
        .block_on(local.run_until(instance.run()))
        .context("Daemon failed")?;

    Ok(())
}

fn setup_logging(debug: bool) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("culld=debug,info")
    } else {
        EnvFilter::new("culld=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
