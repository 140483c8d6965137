//! bosh-micro: deploys a single micro BOSH director VM through a local CPI.
//!
//! Commands:
//! - `bosh-micro deployment <manifest>` - set the manifest for this session
//! - `bosh-micro deploy <stemcell.tgz> <cpi-release.tgz> [release.tgz ...]`
//! - `bosh-micro delete <cpi-release.tgz>`

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod cmd;
mod output;

#[derive(Parser)]
#[command(name = "bosh-micro")]
#[command(version, about = "Deploys a micro BOSH director VM through a local CPI")]
struct Cli {
  /// Enable verbose logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Set or show the deployment manifest for this workstation
  Deployment {
    /// Path to the deployment manifest
    manifest: Option<PathBuf>,
  },

  /// Deploy the micro BOSH VM described by the current deployment manifest
  Deploy {
    /// <stemcell-tarball> <cpi-release-tarball> [release-tarball ...]
    #[arg(num_args = 0..)]
    args: Vec<PathBuf>,
  },

  /// Delete the deployed micro BOSH VM and its resources
  Delete {
    /// <cpi-release-tarball>
    #[arg(num_args = 0..)]
    args: Vec<PathBuf>,
  },
}

impl Commands {
  fn name(&self) -> &'static str {
    match self {
      Commands::Deployment { .. } => "deployment",
      Commands::Deploy { .. } => "deploy",
      Commands::Delete { .. } => "delete",
    }
  }
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .with_writer(std::io::stderr)
    .init();

  let command_name = cli.command.name();
  match run(cli.command) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      output::print_error(&format!("Command '{}' failed: {:#}", command_name, err));
      ExitCode::FAILURE
    }
  }
}

fn run(command: Commands) -> Result<()> {
  match command {
    Commands::Deployment { manifest } => cmd::cmd_deployment(manifest.as_deref()),
    Commands::Deploy { args } => {
      let rt = tokio::runtime::Runtime::new().context("Creating async runtime")?;
      rt.block_on(cmd::cmd_deploy(&args))
    }
    Commands::Delete { args } => {
      let rt = tokio::runtime::Runtime::new().context("Creating async runtime")?;
      rt.block_on(cmd::cmd_delete(&args))
    }
  }
}
