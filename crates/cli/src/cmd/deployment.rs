//! Implementation of the `bosh-micro deployment` command.
//!
//! Records the manifest path in `~/.bosh_micro.json` so `deploy` and
//! `delete` know which deployment they operate on. Without an argument it
//! shows the current setting.

use std::path::Path;

use anyhow::{Result, bail};

use bosh_micro_lib::config::{UserConfig, UserConfigService};

use crate::output;

pub fn cmd_deployment(manifest: Option<&Path>) -> Result<()> {
  let service = UserConfigService::default_service()?;

  let Some(manifest) = manifest else {
    let config = service.load()?;
    match config.deployment {
      Some(path) => println!("Current deployment is '{}'", path.display()),
      None => bail!("Deployment not set"),
    }
    return Ok(());
  };

  if !manifest.exists() {
    bail!("Verifying that the deployment '{}' exists", manifest.display());
  }
  let absolute = manifest
    .canonicalize()
    .map_err(|e| anyhow::anyhow!("Resolving deployment path '{}': {}", manifest.display(), e))?;

  service.save(&UserConfig {
    deployment: Some(absolute.clone()),
  })?;

  output::print_success(&format!("Deployment set to '{}'", absolute.display()));
  Ok(())
}
