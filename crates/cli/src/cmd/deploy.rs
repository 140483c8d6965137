//! Implementation of the `bosh-micro deploy` command.
//!
//! Stage sequence: validating (one substep per input), installing CPI
//! (compile + install the CPI job locally, start the registry and tunnel),
//! uploading stemcell (skipped when unchanged), deploying (VM/disk
//! convergence, apply, start). A deploy whose inputs all match the last
//! successful run short-circuits before any installation work.
//!
//! The extracted stemcell and releases are scoped to this command: they are
//! deleted on every exit path, after the pipeline finishes or fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use bosh_micro_lib::agent::{AgentClient, HttpAgentClient};
use bosh_micro_lib::blobstore::{Blobstore, HttpBlobstore};
use bosh_micro_lib::cloud::{Cloud, CpiCloud, CpiCmdRunner};
use bosh_micro_lib::config::UserConfigService;
use bosh_micro_lib::deployment::stemcell::{self, ExtractedStemcell};
use bosh_micro_lib::deployment::{Deployer, DeploymentRecord, StemcellManager};
use bosh_micro_lib::installation::{Installation, Installer, Target, validate_cpi_release};
use bosh_micro_lib::manifest::{self, ParsedManifests, validator};
use bosh_micro_lib::release::{self, Manager, Release};
use bosh_micro_lib::state::StateStore;
use bosh_micro_lib::ui::{Stage, Ui};

pub async fn cmd_deploy(args: &[PathBuf]) -> Result<()> {
  if args.len() < 2 {
    eprintln!("Invalid usage - deploy command requires at least 2 arguments");
    println!("Expected usage: bosh-micro deploy <stemcell-tarball> <cpi-release-tarball> [release-2-tarball ...]");
    bail!("Invalid usage - deploy command requires at least 2 arguments");
  }
  let stemcell_path = &args[0];
  let release_paths = &args[1..];

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

  // scoped inputs, released on every exit path below
  let mut releases = Manager::new();
  let mut extracted_stemcell: Option<ExtractedStemcell> = None;
  let mut installation: Option<Installation> = None;

  let result = deploy_flow(
    &stage,
    &ui,
    &store,
    &manifest_path,
    stemcell_path,
    release_paths,
    &mut releases,
    &mut extracted_stemcell,
    &mut installation,
  )
  .await;

  if let Some(mut installation) = installation.take() {
    installation.stop().await;
  }
  if let Some(stemcell) = extracted_stemcell.take() {
    stemcell.delete();
  }
  releases.delete_all();

  result
}

#[allow(clippy::too_many_arguments)]
async fn deploy_flow(
  stage: &Stage,
  ui: &Ui,
  store: &StateStore,
  manifest_path: &Path,
  stemcell_path: &Path,
  release_paths: &[PathBuf],
  releases: &mut Manager,
  extracted_stemcell: &mut Option<ExtractedStemcell>,
  installation_slot: &mut Option<Installation>,
) -> Result<()> {
  let manifests = validate(stage, manifest_path, stemcell_path, release_paths, releases, extracted_stemcell).await?;

  let stemcell = extracted_stemcell.as_ref().expect("validation extracted the stemcell");
  let release_refs: Vec<&Release> = releases.list().iter().collect();

  let record = DeploymentRecord::new(store.clone());
  if record.is_deployed(
    manifest_path,
    &release_refs,
    &stemcell.manifest.name,
    &stemcell.manifest.version,
  )? {
    ui.print_line("No deployment, stemcell or cpi release changes. Skipping deploy.");
    return Ok(());
  }

  let target = Target::for_manifest(manifest_path);
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
  let blobstore: Arc<dyn Blobstore> =
    Arc::new(HttpBlobstore::from_mbus_url(&manifests.installation.mbus).context("Creating blobstore client")?);

  let stemcell_manager = StemcellManager::new(cloud.clone(), store.clone());
  let mut stemcell_record = None;
  {
    let record_ref = &mut stemcell_record;
    let manager_ref = &stemcell_manager;
    stage
      .perform_complex("uploading stemcell", |upload_stage| async move {
        *record_ref = Some(manager_ref.upload(stemcell, &upload_stage).await?);
        Ok(())
      })
      .await?;
  }
  let stemcell_record = stemcell_record.context("stemcell upload completed without a record")?;

  let deployer = Deployer::new(cloud, agent, blobstore, store.clone());
  {
    let deployer_ref = &deployer;
    let deployment_ref = &manifests.deployment;
    let stemcell_record_ref = &stemcell_record;
    let releases_shared = &*releases;
    let record_ref = &record;
    let manager_ref = &stemcell_manager;
    stage
      .perform_complex("deploying", |deploy_stage| async move {
        deployer_ref
          .deploy(deployment_ref, stemcell_record_ref, releases_shared, &deploy_stage)
          .await
          .context("Deploying Microbosh")?;

        let release_refs: Vec<&Release> = releases_shared.list().iter().collect();
        record_ref
          .update(manifest_path, &release_refs)
          .context("Updating deployment record")?;

        manager_ref.delete_unused(&deploy_stage).await?;
        Ok(())
      })
      .await?;
  }

  Ok(())
}

/// The `validating` stage: one substep per input, every substep free of
/// side effects beyond extraction into temp dirs.
async fn validate(
  stage: &Stage,
  manifest_path: &Path,
  stemcell_path: &Path,
  release_paths: &[PathBuf],
  releases: &mut Manager,
  extracted_stemcell: &mut Option<ExtractedStemcell>,
) -> Result<ParsedManifests> {
  let mut manifests_out: Option<ParsedManifests> = None;
  {
    let manifests_ref = &mut manifests_out;
    let releases_ref = &mut *releases;
    let stemcell_ref = &mut *extracted_stemcell;
    stage
      .perform_complex("validating", |validation_stage| async move {
        validation_stage
          .perform("Validating stemcell", || async move {
            if !stemcell_path.exists() {
              bail!("Verifying that the stemcell '{}' exists", stemcell_path.display());
            }
            let extracted = stemcell::extract(stemcell_path)
              .with_context(|| format!("Extracting stemcell from '{}'", stemcell_path.display()))?;
            *stemcell_ref = Some(extracted);
            Ok(())
          })
          .await?;

        {
          let releases_ref = &mut *releases_ref;
          validation_stage
            .perform("Validating releases", || async move {
              for path in release_paths {
                if !path.exists() {
                  bail!("Verifying that the release '{}' exists", path.display());
                }
                let release = release::extract(path)
                  .with_context(|| format!("Extracting release '{}'", path.display()))?;
                releases_ref.add(release);
              }
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
              validator::validate_deployment(&parsed.deployment).context("Validating deployment manifest")?;
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

  manifests_out.context("validation completed without manifests")
}
