//! Instance state construction.
//!
//! Builds everything the agent needs to converge a VM: the transitive
//! compiled-package closure (in dependency order), the rendered-template
//! archive, and the network layout, assembled into an `ApplySpec`.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::agent::{ApplyJob, ApplyJobTemplate, ApplySpec, RenderedTemplatesArchiveSpec};
use crate::blobstore::Blobstore;
use crate::compile::{CompiledPackageRef, PackageCompiler, ReleasePackagesCompiler};
use crate::manifest::{DeploymentManifest, NetworkInterface};
use crate::release::Manager;
use crate::template::{JobListRenderer, merge_properties};
use crate::ui::Stage;

/// The desired state of the deployed instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceState {
  deployment_name: String,
  job_name: String,
  index: u32,
  networks: BTreeMap<String, NetworkInterface>,
  templates: Vec<ApplyJobTemplate>,
  packages: BTreeMap<String, CompiledPackageRef>,
  rendered_archive: RenderedTemplatesArchiveSpec,
  configuration_hash: String,
}

impl InstanceState {
  /// The wire payload for the agent. Pure; a fixed state always serializes
  /// to the same bytes.
  pub fn to_apply_spec(&self) -> ApplySpec {
    ApplySpec {
      deployment: self.deployment_name.clone(),
      index: self.index,
      networks: self.networks.clone(),
      job: ApplyJob {
        name: self.job_name.clone(),
        templates: self.templates.clone(),
      },
      packages: self.packages.clone(),
      rendered_templates_archive: self.rendered_archive.clone(),
      configuration_hash: self.configuration_hash.clone(),
    }
  }

  /// Every compiled package, transitive dependencies included.
  pub fn compiled_packages(&self) -> Vec<&CompiledPackageRef> {
    self.packages.values().collect()
  }

  pub fn network_interfaces(&self) -> &BTreeMap<String, NetworkInterface> {
    &self.networks
  }
}

/// Builds an `InstanceState` for one deployment job.
pub struct StateBuilder<'a> {
  releases: &'a Manager,
  compiler: &'a PackageCompiler,
  blobstore: Arc<dyn Blobstore>,
}

impl<'a> StateBuilder<'a> {
  pub fn new(releases: &'a Manager, compiler: &'a PackageCompiler, blobstore: Arc<dyn Blobstore>) -> Self {
    Self {
      releases,
      compiler,
      blobstore,
    }
  }

  /// Resolve the job's release templates, compile their package closures,
  /// render and upload the templates, and assemble the state.
  pub async fn build(
    &self,
    job_name: &str,
    index: u32,
    deployment: &DeploymentManifest,
    stage: &Stage,
  ) -> Result<InstanceState> {
    let job = deployment
      .find_job(job_name)
      .ok_or_else(|| anyhow!("job '{}' not found in deployment manifest", job_name))?;

    let mut release_jobs = Vec::new();
    for template in &job.templates {
      let resolved = self
        .releases
        .find_job(&template.release, &template.name)
        .with_context(|| format!("Resolving job '{}' from release '{}'", template.name, template.release))?;
      release_jobs.push(resolved);
    }

    // compile each referenced job's transitive package closure
    let release_compiler = ReleasePackagesCompiler::new(self.compiler);
    let mut packages: BTreeMap<String, CompiledPackageRef> = BTreeMap::new();
    for (release, release_job) in &release_jobs {
      let compiled = release_compiler
        .compile_closure(release, &release_job.packages, stage)
        .await?;
      packages.extend(compiled);
    }

    let properties = merge_properties(&deployment.properties, &job.properties);
    let jobs_to_render: Vec<_> = release_jobs.iter().map(|(_, j)| *j).collect();

    let mut rendered: Option<(RenderedTemplatesArchiveSpec, String)> = None;
    let rendered_ref = &mut rendered;
    let blobstore = &self.blobstore;
    let deployment_name = &deployment.name;
    stage
      .perform("Rendering job templates", || async move {
        let list = JobListRenderer::render(&jobs_to_render, &properties, deployment_name)
          .context("Rendering job templates")?;
        let archive = JobListRenderer::compress(&list).context("Compressing rendered job templates")?;
        let blobstore_id = blobstore
          .add(archive.path())
          .await
          .context("Uploading rendered job templates")?;
        *rendered_ref = Some((
          RenderedTemplatesArchiveSpec {
            sha1: archive.sha1.clone(),
            blobstore_id,
          },
          archive.fingerprint.clone(),
        ));
        Ok(())
      })
      .await?;
    let (rendered_archive, configuration_hash) =
      rendered.ok_or_else(|| anyhow!("template rendering completed without an archive"))?;

    Ok(InstanceState {
      deployment_name: deployment.name.clone(),
      job_name: job.name.clone(),
      index,
      networks: deployment.network_interfaces(job)?,
      templates: release_jobs
        .iter()
        .map(|(_, j)| ApplyJobTemplate {
          name: j.name.clone(),
          version: j.fingerprint.clone(),
        })
        .collect(),
      packages,
      rendered_archive,
      configuration_hash,
    })
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap as Map;
  use std::path::Path;

  use tempfile::TempDir;

  use crate::manifest::{JobNetwork, JobSpec, Network, Properties, ReleaseJobRef, Update};
  use crate::release::{Job, Package, Release};
  use crate::ui::Ui;
  use crate::util::testutil::{FakeBlobstore, write_package_archive};

  use super::*;

  fn release_with_chain(temp: &Path) -> Release {
    let libyaml = write_package_archive(temp, "libyaml", r#"echo lib > "$BOSH_INSTALL_TARGET/out""#);
    let ruby = write_package_archive(temp, "ruby", "true");
    let cpi = write_package_archive(temp, "cpi", "true");

    let templates_dir = temp.join("jobs/cpi/templates");
    std::fs::create_dir_all(&templates_dir).unwrap();
    std::fs::write(templates_dir.join("cpi.json.erb"), r#"{"region": "((aws.region))"}"#).unwrap();

    let mut templates = Map::new();
    templates.insert("cpi.json.erb".to_string(), "config/cpi.json".to_string());

    Release::for_test(
      "bosh-aws-cpi",
      "1",
      vec![Job {
        name: "cpi".to_string(),
        fingerprint: "cpi-job-fp".to_string(),
        templates,
        packages: vec!["cpi".to_string()],
        templates_dir,
      }],
      vec![
        Package {
          name: "cpi".to_string(),
          fingerprint: "cpi-fp".to_string(),
          dependencies: vec!["ruby".to_string()],
          archive_path: cpi,
        },
        Package {
          name: "ruby".to_string(),
          fingerprint: "ruby-fp".to_string(),
          dependencies: vec!["libyaml".to_string()],
          archive_path: ruby,
        },
        Package {
          name: "libyaml".to_string(),
          fingerprint: "libyaml-fp".to_string(),
          dependencies: vec![],
          archive_path: libyaml,
        },
      ],
    )
  }

  fn deployment() -> DeploymentManifest {
    let mut properties = Properties::new();
    properties.insert("aws".to_string(), serde_json::json!({"region": "us-east-1"}));
    DeploymentManifest {
      name: "micro".to_string(),
      networks: vec![Network {
        name: "default".to_string(),
        network_type: "dynamic".to_string(),
        ip: Some("10.0.0.5".to_string()),
        cloud_properties: Properties::new(),
      }],
      resource_pools: vec![],
      disk_pools: vec![],
      jobs: vec![JobSpec {
        name: "bosh".to_string(),
        instances: 1,
        templates: vec![ReleaseJobRef {
          name: "cpi".to_string(),
          release: "bosh-aws-cpi".to_string(),
        }],
        networks: vec![JobNetwork {
          name: "default".to_string(),
          static_ips: vec![],
        }],
        persistent_disk_pool: None,
        properties: Properties::new(),
      }],
      properties,
      update: Update::default(),
    }
  }

  async fn build_state(temp: &TempDir) -> (InstanceState, Ui) {
    let mut releases = Manager::new();
    releases.add(release_with_chain(temp.path()));
    let compiler = PackageCompiler::new(Arc::new(FakeBlobstore::new()));
    let blobstore = Arc::new(FakeBlobstore::new());
    let builder = StateBuilder::new(&releases, &compiler, blobstore);
    let ui = Ui::buffer();

    let state = builder
      .build("bosh", 0, &deployment(), &Stage::new(ui.clone()))
      .await
      .unwrap();
    (state, ui)
  }

  #[tokio::test]
  async fn build_compiles_the_transitive_closure() {
    let temp = TempDir::new().unwrap();
    let (state, ui) = build_state(&temp).await;

    let names: Vec<&str> = state.compiled_packages().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["cpi", "libyaml", "ruby"]);

    let lines = ui.lines();
    assert!(lines[0].contains("Compiling package 'libyaml/libyaml-fp'"));
    assert!(lines[1].contains("Compiling package 'ruby/ruby-fp'"));
    assert!(lines[2].contains("Compiling package 'cpi/cpi-fp'"));
    assert!(lines[3].contains("Rendering job templates"));
  }

  #[tokio::test]
  async fn apply_spec_is_deterministic() {
    let temp = TempDir::new().unwrap();
    let (state, _) = build_state(&temp).await;

    let first = serde_json::to_vec(&state.to_apply_spec()).unwrap();
    let second = serde_json::to_vec(&state.to_apply_spec()).unwrap();

    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn apply_spec_carries_networks_and_archive() {
    let temp = TempDir::new().unwrap();
    let (state, _) = build_state(&temp).await;

    let spec = state.to_apply_spec();
    assert_eq!(spec.deployment, "micro");
    assert_eq!(spec.job.name, "bosh");
    assert_eq!(spec.job.templates[0].name, "cpi");
    assert_eq!(spec.job.templates[0].version, "cpi-job-fp");
    assert_eq!(spec.networks["default"].ip.as_deref(), Some("10.0.0.5"));
    assert_eq!(spec.packages.len(), 3);
    assert!(spec.packages.values().all(|p| !p.blobstore_id.is_empty()));
    assert_eq!(spec.rendered_templates_archive.sha1.len(), 40);
    assert_eq!(spec.configuration_hash.len(), 40);
  }

  #[tokio::test]
  async fn build_fails_for_unknown_deployment_job() {
    let temp = TempDir::new().unwrap();
    let mut releases = Manager::new();
    releases.add(release_with_chain(temp.path()));
    let compiler = PackageCompiler::new(Arc::new(FakeBlobstore::new()));
    let builder = StateBuilder::new(&releases, &compiler, Arc::new(FakeBlobstore::new()));

    let result = builder
      .build("nonexistent", 0, &deployment(), &Stage::new(Ui::buffer()))
      .await;

    assert!(result.is_err());
  }

  #[tokio::test]
  async fn build_fails_for_unknown_release_job() {
    let temp = TempDir::new().unwrap();
    let mut releases = Manager::new();
    releases.add(release_with_chain(temp.path()));
    let compiler = PackageCompiler::new(Arc::new(FakeBlobstore::new()));
    let builder = StateBuilder::new(&releases, &compiler, Arc::new(FakeBlobstore::new()));

    let mut manifest = deployment();
    manifest.jobs[0].templates[0].name = "not-a-job".to_string();

    let err = builder
      .build("bosh", 0, &manifest, &Stage::new(Ui::buffer()))
      .await
      .unwrap_err();

    assert!(err.to_string().contains("Resolving job 'not-a-job'"));
  }
}
