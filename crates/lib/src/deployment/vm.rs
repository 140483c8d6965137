//! VM lifecycle.
//!
//! A `Vm` pairs an IaaS cid with the agent reachable inside it; it exposes
//! exactly the operations the orchestrator drives through the
//! `created -> agent_ready -> applied -> running -> stopped -> deleted`
//! lifecycle. The `VmManager` owns record bookkeeping in the state store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::agent::{self, AgentClient, ApplySpec};
use crate::cloud::Cloud;
use crate::manifest::DeploymentManifest;
use crate::state::{DiskRepo, StateStore, StemcellRecord, VmRecord, VmRepo};

use super::disk::Disk;

/// A created VM and its agent.
pub struct Vm {
  record: VmRecord,
  cloud: Arc<dyn Cloud>,
  agent: Arc<dyn AgentClient>,
}

impl Vm {
  pub fn cid(&self) -> &str {
    &self.record.cid
  }

  pub fn record(&self) -> &VmRecord {
    &self.record
  }

  /// Ping until the agent responds.
  pub async fn wait_until_agent_ready(&self, timeout: Duration, delay: Duration) -> Result<()> {
    agent::wait_until_ready(self.agent.as_ref(), timeout, delay)
      .await
      .with_context(|| format!("Waiting for the agent on VM '{}'", self.cid()))?;
    Ok(())
  }

  pub async fn apply(&self, spec: &ApplySpec) -> Result<()> {
    self
      .agent
      .apply(spec)
      .await
      .with_context(|| format!("Applying the agent state on VM '{}'", self.cid()))?;
    Ok(())
  }

  pub async fn start(&self) -> Result<()> {
    self
      .agent
      .start()
      .await
      .with_context(|| format!("Starting jobs on VM '{}'", self.cid()))?;
    Ok(())
  }

  pub async fn stop(&self) -> Result<()> {
    self
      .agent
      .stop()
      .await
      .with_context(|| format!("Stopping jobs on VM '{}'", self.cid()))?;
    Ok(())
  }

  /// Poll the agent until the applied job reports running.
  pub async fn wait_until_jobs_running(&self, max_attempts: u32, delay: Duration) -> Result<()> {
    agent::wait_until_running(self.agent.as_ref(), max_attempts, delay)
      .await
      .with_context(|| format!("Waiting for jobs to be running on VM '{}'", self.cid()))?;
    Ok(())
  }

  /// Attach on the IaaS, then mount inside the VM.
  pub async fn attach_disk(&self, disk: &Disk) -> Result<()> {
    self.cloud.attach_disk(self.cid(), disk.cid()).await?;
    self.agent.mount_disk(disk.cid()).await?;
    Ok(())
  }

  /// Unmount inside the VM, then detach on the IaaS.
  pub async fn detach_disk(&self, disk: &Disk) -> Result<()> {
    self.agent.unmount_disk(disk.cid()).await?;
    self.cloud.detach_disk(self.cid(), disk.cid()).await?;
    Ok(())
  }

  pub async fn migrate_disk(&self, from: &Disk, to: &Disk) -> Result<()> {
    self.agent.migrate_disk(from.cid(), to.cid()).await?;
    Ok(())
  }

  /// Disk cids the agent currently sees.
  pub async fn mounted_disks(&self) -> Result<Vec<String>> {
    Ok(self.agent.list_disk().await?)
  }

  pub async fn unmount_disk_cid(&self, disk_cid: &str) -> Result<()> {
    self.agent.unmount_disk(disk_cid).await?;
    Ok(())
  }

  #[cfg(test)]
  pub fn for_test(cid: &str, cloud: Arc<dyn Cloud>, agent: Arc<dyn AgentClient>) -> Self {
    Self {
      record: VmRecord {
        id: format!("{}-id", cid),
        cid: cid.to_string(),
        stemcell_id: "stemcell-id-test".to_string(),
      },
      cloud,
      agent,
    }
  }
}

/// Creates and deletes VMs, keeping the state store current.
pub struct VmManager {
  cloud: Arc<dyn Cloud>,
  agent: Arc<dyn AgentClient>,
  store: StateStore,
}

impl VmManager {
  pub fn new(cloud: Arc<dyn Cloud>, agent: Arc<dyn AgentClient>, store: StateStore) -> Self {
    Self { cloud, agent, store }
  }

  /// Wrap the current VM record, if one exists.
  pub fn find_current(&self) -> Result<Option<Vm>> {
    let repo = VmRepo::new(&self.store);
    Ok(repo.find_current()?.map(|record| Vm {
      record,
      cloud: self.cloud.clone(),
      agent: self.agent.clone(),
    }))
  }

  /// Request a VM from the CPI and record it as current.
  ///
  /// The current disk (if any) is passed as disk locality so the IaaS can
  /// place the VM near its future data.
  pub async fn create(&self, stemcell: &StemcellRecord, manifest: &DeploymentManifest) -> Result<Vm> {
    let job = manifest
      .jobs
      .first()
      .context("deployment manifest has no jobs to deploy")?;
    let networks = manifest.network_interfaces(job)?;

    let disk_locality: Vec<String> = DiskRepo::new(&self.store)
      .find_current()?
      .map(|d| vec![d.cid])
      .unwrap_or_default();

    let agent_id = Uuid::new_v4().to_string();
    let cid = self
      .cloud
      .create_vm(
        &agent_id,
        &stemcell.cid,
        &manifest.vm_cloud_properties(),
        &networks,
        &disk_locality,
        &manifest.vm_env(),
      )
      .await
      .with_context(|| format!("Creating VM from stemcell '{}'", stemcell.cid))?;

    let record = VmRepo::new(&self.store).save_current(&cid, &stemcell.id)?;

    Ok(Vm {
      record,
      cloud: self.cloud.clone(),
      agent: self.agent.clone(),
    })
  }

  /// Tear a VM down. When the agent answers, jobs are stopped and disks
  /// unmounted first; an unreachable agent (stray VM from an interrupted
  /// run) is deleted regardless.
  pub async fn delete(&self, vm: &Vm, agent_reachable: bool) -> Result<()> {
    if agent_reachable {
      vm.stop().await?;
      for disk_cid in vm.mounted_disks().await? {
        vm.unmount_disk_cid(&disk_cid).await?;
      }
    }

    self
      .cloud
      .delete_vm(vm.cid())
      .await
      .with_context(|| format!("Deleting VM '{}'", vm.cid()))?;

    VmRepo::new(&self.store).delete(&vm.record.id)?;
    Ok(())
  }
}
