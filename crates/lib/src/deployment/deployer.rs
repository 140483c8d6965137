//! The deploy pipeline.
//!
//! Runs inside the `deploying` stage and converges the system to the
//! manifest:
//!
//! 1. tear down the previous VM, if any (a stray VM from an interrupted run
//!    whose agent never answers is deleted regardless)
//! 2. create the new VM and wait for its agent
//! 3. converge persistent disks (create, reattach or migrate)
//! 4. build the instance state, apply it, start, and wait for running
//!
//! Every step reads the state store first and becomes a no-op when already
//! satisfied, which is what makes an interrupted deploy restartable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::agent::{self, AgentClient, AgentError};
use crate::blobstore::Blobstore;
use crate::cloud::Cloud;
use crate::compile::PackageCompiler;
use crate::manifest::DeploymentManifest;
use crate::release::Manager;
use crate::state::{StateStore, StemcellRecord};
use crate::ui::{SkipStage, Stage};

use super::disk::{DiskDeployer, DiskManager};
use super::state_builder::StateBuilder;
use super::vm::{Vm, VmManager};

/// Tunable agent waits; production values per the agent contract.
#[derive(Debug, Clone, Copy)]
pub struct AgentWaits {
  pub ping_timeout: Duration,
  pub ping_delay: Duration,
  pub running_attempts: u32,
  pub running_delay: Duration,
}

impl Default for AgentWaits {
  fn default() -> Self {
    Self {
      ping_timeout: agent::PING_TIMEOUT,
      ping_delay: agent::PING_DELAY,
      running_attempts: agent::RUNNING_MAX_ATTEMPTS,
      running_delay: agent::RUNNING_DELAY,
    }
  }
}

pub struct Deployer {
  cloud: Arc<dyn Cloud>,
  agent: Arc<dyn AgentClient>,
  blobstore: Arc<dyn Blobstore>,
  store: StateStore,
  waits: AgentWaits,
}

impl Deployer {
  pub fn new(cloud: Arc<dyn Cloud>, agent: Arc<dyn AgentClient>, blobstore: Arc<dyn Blobstore>, store: StateStore) -> Self {
    Self {
      cloud,
      agent,
      blobstore,
      store,
      waits: AgentWaits::default(),
    }
  }

  pub fn with_waits(mut self, waits: AgentWaits) -> Self {
    self.waits = waits;
    self
  }

  /// Converge the deployment; the caller wraps this in the `deploying`
  /// stage.
  pub async fn deploy(
    &self,
    deployment: &DeploymentManifest,
    stemcell: &StemcellRecord,
    releases: &Manager,
    stage: &Stage,
  ) -> Result<()> {
    let vm_manager = VmManager::new(self.cloud.clone(), self.agent.clone(), self.store.clone());

    if let Some(existing) = vm_manager.find_current()? {
      self.delete_existing_vm(&vm_manager, &existing, stage).await?;
    }

    let job = deployment
      .jobs
      .first()
      .ok_or_else(|| anyhow!("deployment manifest has no jobs to deploy"))?;

    let mut created: Option<Vm> = None;
    let created_ref = &mut created;
    stage
      .perform(&format!("Creating VM from stemcell '{}'", stemcell.cid), || async move {
        *created_ref = Some(vm_manager.create(stemcell, deployment).await?);
        Ok(())
      })
      .await?;
    let vm = created.ok_or_else(|| anyhow!("VM creation completed without a VM"))?;

    let vm_ref = &vm;
    stage
      .perform(
        &format!("Waiting for the agent on VM '{}' to be ready", vm.cid()),
        || async move {
          vm_ref
            .wait_until_agent_ready(self.waits.ping_timeout, self.waits.ping_delay)
            .await
        },
      )
      .await?;

    let disk_pool = deployment.disk_pool(job)?;
    let disk_deployer = DiskDeployer::new(DiskManager::new(self.cloud.clone(), self.store.clone()));
    disk_deployer.deploy(disk_pool, &vm, stage).await?;

    let compiler = PackageCompiler::new(self.blobstore.clone());
    let builder = StateBuilder::new(releases, &compiler, self.blobstore.clone());
    let state = builder.build(&job.name, 0, deployment, stage).await?;
    let spec = state.to_apply_spec();

    let spec_ref = &spec;
    stage
      .perform("Applying micro BOSH spec", || async move { vm_ref.apply(spec_ref).await })
      .await?;
    stage
      .perform("Starting the agent", || async move { vm_ref.start().await })
      .await?;
    stage
      .perform(
        &format!("Waiting for instance '{}/0' to be running", job.name),
        || async move {
          vm_ref
            .wait_until_jobs_running(self.waits.running_attempts, self.waits.running_delay)
            .await
        },
      )
      .await?;

    Ok(())
  }

  /// Remove the previous VM. The wait step is reported as skipped when the
  /// agent never answers; the VM is deleted either way.
  async fn delete_existing_vm(&self, vm_manager: &VmManager, existing: &Vm, stage: &Stage) -> Result<()> {
    let mut reachable = true;
    let reachable_ref = &mut reachable;
    stage
      .perform(&format!("Waiting for the agent on VM '{}'", existing.cid()), || async move {
        match existing
          .wait_until_agent_ready(self.waits.ping_timeout, self.waits.ping_delay)
          .await
        {
          Ok(()) => Ok(()),
          Err(err) if is_ping_timeout(&err) => {
            *reachable_ref = false;
            Err(anyhow!(SkipStage("agent unresponsive".to_string())))
          }
          Err(err) => Err(err),
        }
      })
      .await?;

    stage
      .perform(&format!("Deleting VM '{}'", existing.cid()), || async move {
        vm_manager.delete(existing, reachable).await
      })
      .await
  }
}

fn is_ping_timeout(err: &anyhow::Error) -> bool {
  matches!(err.downcast_ref::<AgentError>(), Some(AgentError::PingTimeout { .. }))
}
