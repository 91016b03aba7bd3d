//! hyperv-runner-pool: warm pool of ephemeral Hyper-V GitHub Actions runners.
//!
//! Loads the YAML configuration, wires the hypervisor driver and registry
//! client (real or mock), initializes the pool, and runs until an interrupt
//! or terminate signal triggers a graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use hyperv_runner_pool::config::Config;
use hyperv_runner_pool::github::mock::MockIdentityClient;
use hyperv_runner_pool::github::{GithubClient, IdentityClient};
use hyperv_runner_pool::logging;
use hyperv_runner_pool::pool::Pool;
use hyperv_runner_pool::vm::hyperv::HyperVManager;
use hyperv_runner_pool::vm::mock::MockVmManager;
use hyperv_runner_pool::vm::VmManager;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const COMMIT: &str = env!("POOL_COMMIT");
const BUILD_DATE: &str = env!("POOL_BUILD_DATE");

/// Manage a pool of ephemeral Hyper-V VMs for GitHub Actions runners.
#[derive(Parser, Debug)]
#[command(name = "hyperv-runner-pool", version = VERSION)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Disable the system tray icon (console mode).
    #[arg(long, env = "NO_TRAY")]
    no_tray: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print version, commit and build date.
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if matches!(args.command, Some(Command::Version)) {
        println!("hyperv-runner-pool {VERSION} (commit: {COMMIT}, built: {BUILD_DATE})");
        return Ok(());
    }

    let config_path = args
        .config
        .context("--config <path> is required (see --help)")?;
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let _log_guard = logging::init(&config.logging);

    info!(
        version = VERSION,
        commit = COMMIT,
        built = BUILD_DATE,
        "starting Hyper-V runner pool"
    );
    info!(
        config_file = %config_path.display(),
        pool_size = config.runners.pool_size,
        mock_mode = config.debug.use_mock,
        "configuration loaded"
    );
    info!(path = %config.hyperv.template_path, "using template path");
    info!(path = %config.hyperv.storage_path, "using storage path");

    let (vm, identity): (Arc<dyn VmManager>, Arc<dyn IdentityClient>) = if config.debug.use_mock {
        info!("using mock VM manager and registry client (development mode)");
        (
            Arc::new(MockVmManager::new()),
            Arc::new(MockIdentityClient::new()),
        )
    } else {
        info!("using Hyper-V VM manager (production mode)");
        (
            Arc::new(HyperVManager::new(config.clone())),
            Arc::new(GithubClient::new(config.clone()).context("failed to build GitHub client")?),
        )
    };

    let pool = Pool::new(config, vm, identity);

    // The tray front-end ships separately; without it both modes run the
    // console path.
    if args.no_tray {
        info!("running in console mode (no system tray)");
    }

    if let Err(e) = pool.initialize().await {
        error!(error = %e, "failed to initialize pool");
        warn!("some VMs may not be ready, but continuing to run");
    }

    info!("orchestrator running, monitoring VMs for job completion");
    info!("press Ctrl+C to shut down gracefully");

    wait_for_shutdown_signal().await;
    info!("received shutdown signal");

    if let Err(e) = pool.shutdown().await {
        error!(error = %e, "error during shutdown");
        return Err(e.into());
    }

    info!("shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, or on SIGTERM where that exists.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for interrupt signal");
                }
            }
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for interrupt signal");
        }
    }
}
