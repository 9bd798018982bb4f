#![allow(clippy::multiple_crate_versions)]

use anyhow::Context;
use clap::Parser;
use provisioner::settings::DEFAULT_MAX_CONCURRENT;
use provisioner::{logging, Provisioner, ProvisioningSummary, Settings};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "provision", version)]
#[command(about = "Download model assets from Hugging Face, CivitAI and direct URLs", long_about = None)]
struct Cli {
    /// Config file path or http(s) URL (Google Drive sharing links work too)
    config: String,

    /// Parse and validate the config without downloading or writing anything
    #[arg(long)]
    dry_run: bool,

    /// Workspace root [env: WORKSPACE, default: /workspace]
    #[arg(long, value_name = "PATH")]
    workspace: Option<PathBuf>,

    /// Maximum simultaneous downloads
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Log file [default: <workspace>/logs/provision.log]
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Show per-download progress bars
    #[arg(long)]
    progress: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut settings = Settings::from_env(cli.workspace.clone());
    settings.max_concurrent = cli.max_concurrent.max(1);
    settings.show_progress = cli.progress;

    // A dry run leaves the filesystem untouched, log file included
    let log_file = if cli.dry_run {
        None
    } else {
        Some(cli.log_file.clone().unwrap_or_else(|| settings.log_file()))
    };
    if let Err(e) = logging::init(log_file.as_deref()) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    match provision(&cli, settings).await {
        Ok(summary) if summary.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("Provisioning aborted: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn provision(cli: &Cli, settings: Settings) -> anyhow::Result<ProvisioningSummary> {
    tracing::debug!("{settings:?}");
    Provisioner::new(settings)
        .run(&cli.config, cli.dry_run)
        .await
        .with_context(|| format!("cannot provision from {}", cli.config))
}
