//! Implementation of the `bosh-micro delete` command.
//!
//! Stage sequence: validating, installing CPI, deleting deployment. The
//! registry is started only when something recorded actually requires CPI
//! calls; a delete against an empty state never binds the port, makes no
//! CPI calls, and still exits 0 after cleanup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use bosh_micro_lib::agent::{AgentClient, HttpAgentClient};
use bosh_micro_lib::cloud::{Cloud, CpiCloud, CpiCmdRunner};
use bosh_micro_lib::config::UserConfigService;
use bosh_micro_lib::deployment::Deleter;
use bosh_micro_lib::installation::{Installation, Installer, Target, validate_cpi_release};
use bosh_micro_lib::manifest::{self, ParsedManifests, validator};
use bosh_micro_lib::release::{self, Manager};
use bosh_micro_lib::state::StateStore;
use bosh_micro_lib::ui::{Stage, Ui};

pub async fn cmd_delete(args: &[PathBuf]) -> Result<()> {
  if args.is_empty() {
    eprintln!("Invalid usage - delete command requires at least 1 argument");
    println!("Expected usage: bosh-micro delete <cpi-release-tarball>");
    bail!("Invalid usage - delete command requires at least 1 argument");
  }
  let release_path = &args[0];

  let user_config = UserConfigService::default_service()?.load()?;
  let manifest_path = user_config
    .deployment
    .clone()
    .context("Deployment manifest not set. Run 'bosh-micro deployment <manifest-path>' first")?;
  let store = StateStore::new(
    user_config
      .deployment_state_path()
      .expect("deployment path is set above"),
  );

  let ui = Ui::terminal();
  let stage = Stage::new(ui.clone());

  let mut releases = Manager::new();
  let mut installation: Option<Installation> = None;

  let result = delete_flow(&stage, &store, &manifest_path, release_path, &mut releases, &mut installation).await;

  if let Some(mut installation) = installation.take() {
    installation.stop().await;
  }
  releases.delete_all();

  result
}

async fn delete_flow(
  stage: &Stage,
  store: &StateStore,
  manifest_path: &std::path::Path,
  release_path: &std::path::Path,
  releases: &mut Manager,
  installation_slot: &mut Option<Installation>,
) -> Result<()> {
  let mut manifests_out: Option<ParsedManifests> = None;
  {
    let manifests_ref = &mut manifests_out;
    let releases_ref = &mut *releases;
    stage
      .perform_complex("validating", |validation_stage| async move {
        {
          let releases_ref = &mut *releases_ref;
          validation_stage
            .perform("Validating releases", || async move {
              if !release_path.exists() {
                bail!("Verifying that the release '{}' exists", release_path.display());
              }
              let release = release::extract(release_path)
                .with_context(|| format!("Extracting release '{}'", release_path.display()))?;
              releases_ref.add(release);
              Ok(())
            })
            .await?;
        }

        let mut parsed_local: Option<ParsedManifests> = None;
        {
          let parsed_ref = &mut parsed_local;
          validation_stage
            .perform("Validating deployment manifest", || async move {
              let parsed = manifest::parse(manifest_path)?;
              validator::validate_release_set(&parsed.release_set).context("Validating release set manifest")?;
              validator::validate_installation(&parsed.installation, &parsed.release_set)
                .context("Validating installation manifest")?;
              *parsed_ref = Some(parsed);
              Ok(())
            })
            .await?;
        }
        let parsed = parsed_local.context("manifest validation produced no manifests")?;

        {
          let parsed_ref = &parsed;
          let releases_shared = &*releases_ref;
          validation_stage
            .perform("Validating cpi release", || async move {
              let template = &parsed_ref.installation.template;
              let release = releases_shared.find_by_name(&template.release).with_context(|| {
                format!("installation release '{}' must refer to a provided release", template.release)
              })?;
              validate_cpi_release(release, &template.name)
                .with_context(|| format!("Invalid CPI release '{}'", release.name))?;
              Ok(())
            })
            .await?;
        }

        *manifests_ref = Some(parsed);
        Ok(())
      })
      .await?;
  }
  let manifests = manifests_out.context("validation completed without manifests")?;

  let target = Target::for_manifest(manifest_path);
  let needs_cpi_calls = store.exists() && store.load()?.has_entities();
  {
    let releases_shared = &*releases;
    let manifests_ref = &manifests;
    let target_ref = &target;
    let installation_ref = &mut *installation_slot;
    stage
      .perform_complex("installing CPI", |install_stage| async move {
        let installed = Installer::new(releases_shared)
          .install(&manifests_ref.installation, target_ref, &install_stage)
          .await
          .context("Installing CPI")?;
        *installation_ref = Some(installed);

        if needs_cpi_calls {
          let installation = installation_ref.as_mut().expect("installed above");
          install_stage
            .perform("Starting registry", || async move { installation.start_registry().await })
            .await?;
          if manifests_ref.installation.ssh_tunnel.is_some() {
            let installation = installation_ref.as_mut().expect("installed above");
            install_stage
              .perform("Starting SSH tunnel", || async move { installation.start_ssh_tunnel().await })
              .await?;
          }
        }
        Ok(())
      })
      .await?;
  }
  let installation = installation_slot.as_ref().expect("installing CPI stage completed");

  let state = store.load()?;
  let runner = CpiCmdRunner::new(installation.job_path(), state.director_id.clone());
  let cloud: Arc<dyn Cloud> = Arc::new(CpiCloud::new(runner));
  let agent: Arc<dyn AgentClient> = Arc::new(
    HttpAgentClient::new(&manifests.installation.mbus, &state.director_id).context("Creating agent client")?,
  );

  let deleter = Deleter::new(cloud, agent, store.clone());
  let deleter_ref = &deleter;
  stage
    .perform_complex("deleting deployment", |delete_stage| async move {
      deleter_ref.delete(&delete_stage).await.context("Deleting deployment")
    })
    .await?;

  Ok(())
}
