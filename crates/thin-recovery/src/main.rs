//! Portworx thin-pool metadata recovery CLI.
//!
//! Repairs the metadata of a Portworx LVM thin pool in place. Runs inside
//! the Portworx container; re-running after an interruption resumes from
//! the last persisted step.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use thin_recovery::orchestrator::EXIT_FAILURE;
use thin_recovery::{
    run_until_signal, ui, AutoConfirmer, Confirmer, InteractiveConfirmer, Orchestrator,
    RecoveryConfig, RecoverySession, RunOptions, SystemProbe, SystemRunner,
};

/// Portworx thin-pool metadata recovery.
#[derive(Parser)]
#[command(
    name = "px-thin-recovery",
    version,
    disable_version_flag = true,
    about = "Repair corrupted LVM thin-pool metadata on a Portworx node",
    long_about = "Repair corrupted LVM thin-pool metadata on a Portworx node.\n\n\
                  The metadata volume is copied to tmpfs, repaired with thin_repair,\n\
                  verified and written back. Every step is recorded, so re-running\n\
                  after an interruption resumes where the previous run stopped."
)]
struct Cli {
    /// Volume group holding the thin pool.
    vg: String,

    /// Accept every confirmation prompt.
    #[arg(short = 'y', long)]
    yes: bool,

    /// Print version.
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,

    /// TOML file overriding default paths and limits.
    #[arg(long, env = "PX_THIN_RECOVERY_CONFIG")]
    config: Option<PathBuf>,

    /// Thin pool LV name.
    #[arg(long)]
    pool: Option<String>,

    /// Enable debug logging.
    #[arg(long)]
    verbose: bool,

    /// Do not require PID 1 to be the Portworx container init.
    #[arg(long)]
    skip_container_check: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            ui::print_error(&format!("{e:#}"));
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => RecoveryConfig::load(path)?,
        None => RecoveryConfig::default(),
    };
    if let Some(pool) = cli.pool {
        config.pool_name = pool;
    }

    let confirmer: Arc<dyn Confirmer> = if cli.yes {
        Arc::new(AutoConfirmer)
    } else {
        Arc::new(InteractiveConfirmer)
    };

    let session = RecoverySession::new(cli.vg, config);
    let mut orchestrator = Orchestrator::new(
        session,
        Arc::new(SystemRunner),
        confirmer,
        Arc::new(SystemProbe),
        RunOptions {
            skip_container_check: cli.skip_container_check,
        },
    );

    let code = run_until_signal(&mut orchestrator, shutdown_signal()).await;
    Ok(ExitCode::from(code))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C");
        },
        () = terminate => {
            info!("Received SIGTERM");
        },
    }
}
