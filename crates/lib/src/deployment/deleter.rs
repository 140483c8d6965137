//! The delete pipeline.
//!
//! Runs inside the `deleting deployment` stage: tears down the current VM,
//! disk and stemcell (IaaS call first, then the record, so a crash between
//! the two is re-tried on the next run), then cleans up any orphaned
//! records left over from interrupted migrations or uploads.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use crate::agent::{AgentClient, AgentError};
use crate::cloud::Cloud;
use crate::state::{DiskRepo, StateStore, StemcellRepo};
use crate::ui::{SkipStage, Stage};

use super::deployer::AgentWaits;
use super::disk::DiskManager;
use super::stemcell::StemcellManager;
use super::vm::VmManager;

pub struct Deleter {
  cloud: Arc<dyn Cloud>,
  agent: Arc<dyn AgentClient>,
  store: StateStore,
  waits: AgentWaits,
}

impl Deleter {
  pub fn new(cloud: Arc<dyn Cloud>, agent: Arc<dyn AgentClient>, store: StateStore) -> Self {
    Self {
      cloud,
      agent,
      store,
      waits: AgentWaits::default(),
    }
  }

  pub fn with_waits(mut self, waits: AgentWaits) -> Self {
    self.waits = waits;
    self
  }

  /// Tear everything down; the caller wraps this in the `deleting
  /// deployment` stage.
  pub async fn delete(&self, stage: &Stage) -> Result<()> {
    let vm_manager = VmManager::new(self.cloud.clone(), self.agent.clone(), self.store.clone());

    if let Some(vm) = vm_manager.find_current()? {
      let vm_ref = &vm;
      let mut reachable = true;
      let reachable_ref = &mut reachable;
      stage
        .perform(&format!("Waiting for the agent on VM '{}'", vm.cid()), || async move {
          match vm_ref
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

      let vm_manager_ref = &vm_manager;
      stage
        .perform(&format!("Deleting VM '{}'", vm.cid()), || async move {
          vm_manager_ref.delete(vm_ref, reachable).await
        })
        .await?;
    }

    if let Some(disk) = DiskRepo::new(&self.store).find_current()? {
      stage
        .perform(&format!("Deleting disk '{}'", disk.cid), || async move {
          self
            .cloud
            .delete_disk(&disk.cid)
            .await
            .with_context(|| format!("Deleting disk '{}'", disk.cid))?;
          DiskRepo::new(&self.store).delete(&disk.id)?;
          Ok(())
        })
        .await?;
    }

    if let Some(stemcell) = StemcellRepo::new(&self.store).find_current()? {
      stage
        .perform(&format!("Deleting stemcell '{}'", stemcell.cid), || async move {
          self
            .cloud
            .delete_stemcell(&stemcell.cid)
            .await
            .with_context(|| format!("Deleting stemcell '{}'", stemcell.cid))?;
          StemcellRepo::new(&self.store).delete(&stemcell.id)?;
          Ok(())
        })
        .await?;
    }

    self.cleanup(stage).await
  }

  /// Delete orphaned records: disks and stemcells nothing references.
  async fn cleanup(&self, stage: &Stage) -> Result<()> {
    DiskManager::new(self.cloud.clone(), self.store.clone())
      .delete_unused(stage)
      .await?;
    StemcellManager::new(self.cloud.clone(), self.store.clone())
      .delete_unused(stage)
      .await?;
    Ok(())
  }
}

fn is_ping_timeout(err: &anyhow::Error) -> bool {
  matches!(err.downcast_ref::<AgentError>(), Some(AgentError::PingTimeout { .. }))
}
