//! Persistent disk management.
//!
//! A deploy converges the primary disk toward the manifest's disk pool:
//!
//! | current | pool      | action                                          |
//! |---------|-----------|-------------------------------------------------|
//! | none    | none      | nothing                                         |
//! | none    | size > 0  | create, attach, promote to current              |
//! | exists  | none      | demote; the disk is reclaimed below             |
//! | exists  | unchanged | reattach to the new VM                          |
//! | exists  | changed   | create secondary, migrate, detach, promote      |
//!
//! Promotion to current happens only after the replacement is attached and
//! migrated, so a failure mid-migration leaves the previous primary intact.
//! Disks left behind are removed afterwards by `delete_unused`.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cloud::Cloud;
use crate::manifest::DiskPool;
use crate::state::{DiskRecord, DiskRepo, StateStore};
use crate::ui::Stage;

use super::vm::Vm;

/// A persistent disk known to the state store.
#[derive(Debug, Clone, PartialEq)]
pub struct Disk {
  pub record: DiskRecord,
}

impl Disk {
  pub fn cid(&self) -> &str {
    &self.record.cid
  }

  /// A disk needs migration when the pool asks for a different size or
  /// different cloud properties.
  pub fn needs_migration(&self, pool: &DiskPool) -> bool {
    self.record.size != pool.disk_size || self.record.cloud_properties != pool.cloud_properties
  }
}

/// Creates, promotes and retires disks.
pub struct DiskManager {
  cloud: Arc<dyn Cloud>,
  store: StateStore,
}

impl DiskManager {
  pub fn new(cloud: Arc<dyn Cloud>, store: StateStore) -> Self {
    Self { cloud, store }
  }

  pub fn find_current(&self) -> Result<Option<Disk>> {
    let repo = DiskRepo::new(&self.store);
    Ok(repo.find_current()?.map(|record| Disk { record }))
  }

  pub async fn create(&self, pool: &DiskPool, vm_cid: &str) -> Result<Disk> {
    let cid = self
      .cloud
      .create_disk(pool.disk_size, &pool.cloud_properties, vm_cid)
      .await
      .context("Creating disk")?;
    let repo = DiskRepo::new(&self.store);
    let record = repo.save(&cid, pool.disk_size, &pool.cloud_properties)?;
    Ok(Disk { record })
  }

  pub fn promote(&self, disk: &Disk) -> Result<()> {
    let repo = DiskRepo::new(&self.store);
    repo.update_current(&disk.record.id)?;
    Ok(())
  }

  /// Drop the current pointer so the disk counts as unused.
  pub fn demote_current(&self) -> Result<()> {
    DiskRepo::new(&self.store).clear_current()?;
    Ok(())
  }

  /// Delete every disk that is not current, on the IaaS and in the state
  /// file.
  pub async fn delete_unused(&self, stage: &Stage) -> Result<()> {
    let repo = DiskRepo::new(&self.store);
    for record in repo.find_unused()? {
      stage
        .perform(&format!("Deleting unused disk '{}'", record.cid), || async move {
          self
            .cloud
            .delete_disk(&record.cid)
            .await
            .with_context(|| format!("Deleting unused disk '{}'", record.cid))?;
          let repo = DiskRepo::new(&self.store);
          repo.delete(&record.id)?;
          Ok(())
        })
        .await?;
    }
    Ok(())
  }
}

/// Drives the disk state machine for one deploy.
pub struct DiskDeployer {
  manager: DiskManager,
}

impl DiskDeployer {
  pub fn new(manager: DiskManager) -> Self {
    Self { manager }
  }

  /// Converge the VM's persistent disk toward the pool, returning the disks
  /// now attached.
  pub async fn deploy(&self, pool: Option<&DiskPool>, vm: &Vm, stage: &Stage) -> Result<Vec<Disk>> {
    let Some(pool) = pool else {
      // No persistent disk requested. A previously-current disk is no
      // longer attached to anything (the old VM's teardown released it),
      // so demoting it makes it unused and delete_unused reclaims it now.
      if self.manager.find_current()?.is_some() {
        self.manager.demote_current()?;
      }
      self.manager.delete_unused(stage).await?;
      return Ok(Vec::new());
    };

    let disks = match self.manager.find_current()? {
      None => {
        let disk = self.create_disk(pool, vm, stage).await?;
        self.attach_disk(&disk, vm, stage).await?;
        self.manager.promote(&disk)?;
        vec![disk]
      }
      Some(primary) => {
        self.attach_disk(&primary, vm, stage).await?;

        if primary.needs_migration(pool) {
          let secondary = self.create_disk(pool, vm, stage).await?;
          self.attach_disk(&secondary, vm, stage).await?;
          self.migrate_disk(&primary, &secondary, vm, stage).await?;
          self.detach_disk(&primary, vm, stage).await?;
          self.manager.promote(&secondary)?;
          vec![secondary]
        } else {
          vec![primary]
        }
      }
    };

    self.manager.delete_unused(stage).await?;

    Ok(disks)
  }

  async fn create_disk(&self, pool: &DiskPool, vm: &Vm, stage: &Stage) -> Result<Disk> {
    let mut created: Option<Disk> = None;
    let created_ref = &mut created;
    stage
      .perform("Creating disk", || async move {
        *created_ref = Some(self.manager.create(pool, vm.cid()).await?);
        Ok(())
      })
      .await?;
    created.context("disk creation completed without a disk")
  }

  async fn attach_disk(&self, disk: &Disk, vm: &Vm, stage: &Stage) -> Result<()> {
    stage
      .perform(
        &format!("Attaching disk '{}' to VM '{}'", disk.cid(), vm.cid()),
        || async move {
          vm.attach_disk(disk)
            .await
            .with_context(|| format!("Attaching disk '{}' to VM '{}'", disk.cid(), vm.cid()))
        },
      )
      .await
  }

  async fn migrate_disk(&self, from: &Disk, to: &Disk, vm: &Vm, stage: &Stage) -> Result<()> {
    stage
      .perform(
        &format!("Migrating disk content from '{}' to '{}'", from.cid(), to.cid()),
        || async move {
          vm.migrate_disk(from, to)
            .await
            .with_context(|| format!("Migrating disk content from '{}' to '{}'", from.cid(), to.cid()))
        },
      )
      .await
  }

  async fn detach_disk(&self, disk: &Disk, vm: &Vm, stage: &Stage) -> Result<()> {
    stage
      .perform(&format!("Detaching disk '{}'", disk.cid()), || async move {
        vm.detach_disk(disk)
          .await
          .with_context(|| format!("Detaching disk '{}'", disk.cid()))
      })
      .await
  }
}
