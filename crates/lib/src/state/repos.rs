//! Typed record access over the state store.
//!
//! Each repo loads the state, applies one mutation, and saves it back. With
//! a single writer per invocation this keeps every record change durable
//! before the pipeline moves on.

use uuid::Uuid;

use super::{DiskRecord, ReleaseRecord, StateError, StateStore, StemcellRecord, VmRecord};

pub struct StemcellRepo<'a> {
  store: &'a StateStore,
}

impl<'a> StemcellRepo<'a> {
  pub fn new(store: &'a StateStore) -> Self {
    Self { store }
  }

  /// Record an uploaded stemcell and return it.
  pub fn save(&self, name: &str, version: &str, cid: &str) -> Result<StemcellRecord, StateError> {
    let mut state = self.store.load()?;
    let record = StemcellRecord {
      id: Uuid::new_v4().to_string(),
      name: name.to_string(),
      version: version.to_string(),
      cid: cid.to_string(),
    };
    state.stemcells.push(record.clone());
    self.store.save(&state)?;
    Ok(record)
  }

  pub fn find(&self, name: &str, version: &str) -> Result<Option<StemcellRecord>, StateError> {
    let state = self.store.load()?;
    Ok(
      state
        .stemcells
        .iter()
        .find(|s| s.name == name && s.version == version)
        .cloned(),
    )
  }

  pub fn find_current(&self) -> Result<Option<StemcellRecord>, StateError> {
    let state = self.store.load()?;
    let Some(id) = state.current_stemcell_id else {
      return Ok(None);
    };
    Ok(state.stemcells.iter().find(|s| s.id == id).cloned())
  }

  pub fn update_current(&self, id: &str) -> Result<(), StateError> {
    let mut state = self.store.load()?;
    if !state.stemcells.iter().any(|s| s.id == id) {
      return Err(StateError::RecordNotFound(id.to_string()));
    }
    state.current_stemcell_id = Some(id.to_string());
    self.store.save(&state)
  }

  /// Stemcells that are not the current one.
  pub fn find_unused(&self) -> Result<Vec<StemcellRecord>, StateError> {
    let state = self.store.load()?;
    Ok(
      state
        .stemcells
        .iter()
        .filter(|s| state.current_stemcell_id.as_deref() != Some(s.id.as_str()))
        .cloned()
        .collect(),
    )
  }

  pub fn delete(&self, id: &str) -> Result<(), StateError> {
    let mut state = self.store.load()?;
    state.stemcells.retain(|s| s.id != id);
    if state.current_stemcell_id.as_deref() == Some(id) {
      state.current_stemcell_id = None;
    }
    self.store.save(&state)
  }
}

pub struct DiskRepo<'a> {
  store: &'a StateStore,
}

impl<'a> DiskRepo<'a> {
  pub fn new(store: &'a StateStore) -> Self {
    Self { store }
  }

  pub fn save(
    &self,
    cid: &str,
    size: u64,
    cloud_properties: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<DiskRecord, StateError> {
    let mut state = self.store.load()?;
    let record = DiskRecord {
      id: Uuid::new_v4().to_string(),
      cid: cid.to_string(),
      size,
      cloud_properties: cloud_properties.clone(),
    };
    state.disks.push(record.clone());
    self.store.save(&state)?;
    Ok(record)
  }

  pub fn find_current(&self) -> Result<Option<DiskRecord>, StateError> {
    let state = self.store.load()?;
    let Some(id) = state.current_disk_id else {
      return Ok(None);
    };
    Ok(state.disks.iter().find(|d| d.id == id).cloned())
  }

  pub fn update_current(&self, id: &str) -> Result<(), StateError> {
    let mut state = self.store.load()?;
    if !state.disks.iter().any(|d| d.id == id) {
      return Err(StateError::RecordNotFound(id.to_string()));
    }
    state.current_disk_id = Some(id.to_string());
    self.store.save(&state)
  }

  /// Drop the current pointer; the record stays and becomes unused.
  pub fn clear_current(&self) -> Result<(), StateError> {
    let mut state = self.store.load()?;
    state.current_disk_id = None;
    self.store.save(&state)
  }

  /// Disks that are not the current one.
  pub fn find_unused(&self) -> Result<Vec<DiskRecord>, StateError> {
    let state = self.store.load()?;
    Ok(
      state
        .disks
        .iter()
        .filter(|d| state.current_disk_id.as_deref() != Some(d.id.as_str()))
        .cloned()
        .collect(),
    )
  }

  pub fn delete(&self, id: &str) -> Result<(), StateError> {
    let mut state = self.store.load()?;
    state.disks.retain(|d| d.id != id);
    if state.current_disk_id.as_deref() == Some(id) {
      state.current_disk_id = None;
    }
    self.store.save(&state)
  }
}

pub struct VmRepo<'a> {
  store: &'a StateStore,
}

impl<'a> VmRepo<'a> {
  pub fn new(store: &'a StateStore) -> Self {
    Self { store }
  }

  /// Record a created VM and mark it current.
  pub fn save_current(&self, cid: &str, stemcell_id: &str) -> Result<VmRecord, StateError> {
    let mut state = self.store.load()?;
    let record = VmRecord {
      id: Uuid::new_v4().to_string(),
      cid: cid.to_string(),
      stemcell_id: stemcell_id.to_string(),
    };
    state.vms.push(record.clone());
    state.current_vm_id = Some(record.id.clone());
    self.store.save(&state)?;
    Ok(record)
  }

  pub fn find_current(&self) -> Result<Option<VmRecord>, StateError> {
    let state = self.store.load()?;
    let Some(id) = state.current_vm_id else {
      return Ok(None);
    };
    Ok(state.vms.iter().find(|v| v.id == id).cloned())
  }

  /// Drop a VM record, clearing the current pointer if it referenced it.
  pub fn delete(&self, id: &str) -> Result<(), StateError> {
    let mut state = self.store.load()?;
    state.vms.retain(|v| v.id != id);
    if state.current_vm_id.as_deref() == Some(id) {
      state.current_vm_id = None;
    }
    self.store.save(&state)
  }
}

pub struct ReleaseRepo<'a> {
  store: &'a StateStore,
}

impl<'a> ReleaseRepo<'a> {
  pub fn new(store: &'a StateStore) -> Self {
    Self { store }
  }

  /// Replace the recorded release set.
  pub fn update(&self, releases: Vec<ReleaseRecord>) -> Result<(), StateError> {
    let mut state = self.store.load()?;
    state.releases = releases;
    self.store.save(&state)
  }

  pub fn list(&self) -> Result<Vec<ReleaseRecord>, StateError> {
    Ok(self.store.load()?.releases)
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  fn temp_store() -> (TempDir, StateStore) {
    let temp = TempDir::new().unwrap();
    let store = StateStore::new(temp.path().join("deployment.json"));
    (temp, store)
  }

  #[test]
  fn stemcell_save_find_and_current() {
    let (_temp, store) = temp_store();
    let repo = StemcellRepo::new(&store);

    let record = repo.save("ubuntu-trusty", "3126", "stemcell-cid-1").unwrap();
    assert_eq!(repo.find("ubuntu-trusty", "3126").unwrap(), Some(record.clone()));
    assert_eq!(repo.find_current().unwrap(), None);

    repo.update_current(&record.id).unwrap();
    assert_eq!(repo.find_current().unwrap(), Some(record));
  }

  #[test]
  fn stemcell_update_current_requires_record() {
    let (_temp, store) = temp_store();
    let repo = StemcellRepo::new(&store);

    assert!(matches!(
      repo.update_current("missing"),
      Err(StateError::RecordNotFound(_))
    ));
  }

  #[test]
  fn stemcell_unused_excludes_current() {
    let (_temp, store) = temp_store();
    let repo = StemcellRepo::new(&store);

    let old = repo.save("ubuntu-trusty", "3125", "stemcell-cid-1").unwrap();
    let new = repo.save("ubuntu-trusty", "3126", "stemcell-cid-2").unwrap();
    repo.update_current(&new.id).unwrap();

    assert_eq!(repo.find_unused().unwrap(), vec![old]);
  }

  #[test]
  fn disk_clear_current_keeps_the_record() {
    let (_temp, store) = temp_store();
    let repo = DiskRepo::new(&store);

    let record = repo.save("disk-cid-1", 1024, &serde_json::Map::new()).unwrap();
    repo.update_current(&record.id).unwrap();
    repo.clear_current().unwrap();

    assert_eq!(repo.find_current().unwrap(), None);
    assert_eq!(repo.find_unused().unwrap(), vec![record]);
  }

  #[test]
  fn disk_delete_clears_current_pointer() {
    let (_temp, store) = temp_store();
    let repo = DiskRepo::new(&store);

    let record = repo.save("disk-cid-1", 1024, &serde_json::Map::new()).unwrap();
    repo.update_current(&record.id).unwrap();
    repo.delete(&record.id).unwrap();

    assert_eq!(repo.find_current().unwrap(), None);
    assert!(repo.find_unused().unwrap().is_empty());
  }

  #[test]
  fn vm_save_current_sets_pointer() {
    let (_temp, store) = temp_store();
    let repo = VmRepo::new(&store);

    let record = repo.save_current("vm-cid-1", "stemcell-id-1").unwrap();
    assert_eq!(repo.find_current().unwrap(), Some(record.clone()));

    repo.delete(&record.id).unwrap();
    assert_eq!(repo.find_current().unwrap(), None);
  }

  #[test]
  fn release_update_replaces_list() {
    let (_temp, store) = temp_store();
    let repo = ReleaseRepo::new(&store);

    repo
      .update(vec![ReleaseRecord {
        name: "bosh-aws-cpi".to_string(),
        version: "1".to_string(),
      }])
      .unwrap();
    repo
      .update(vec![ReleaseRecord {
        name: "bosh-aws-cpi".to_string(),
        version: "2".to_string(),
      }])
      .unwrap();

    let releases = repo.list().unwrap();
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].version, "2");
  }
}
