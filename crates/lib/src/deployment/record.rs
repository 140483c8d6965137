//! Deploy skip-check fingerprints.
//!
//! After a successful deploy the manifest digest and the deployed release
//! set are recorded; a later deploy with identical inputs (and the same
//! stemcell) is a no-op.

use std::path::Path;

use anyhow::{Context, Result};

use crate::release::Release;
use crate::state::{ReleaseRecord, ReleaseRepo, StateStore, StemcellRepo};
use crate::util::sha1_of_file;

pub struct DeploymentRecord {
  store: StateStore,
}

impl DeploymentRecord {
  pub fn new(store: StateStore) -> Self {
    Self { store }
  }

  /// True when nothing changed since the last successful deploy: same
  /// manifest digest, same release set, and the current stemcell matches.
  pub fn is_deployed(
    &self,
    manifest_path: &Path,
    releases: &[&Release],
    stemcell_name: &str,
    stemcell_version: &str,
  ) -> Result<bool> {
    let state = self.store.load()?;

    let Some(recorded_sha) = state.last_deployed_manifest_sha else {
      return Ok(false);
    };
    let manifest_sha = sha1_of_file(manifest_path).context("Fingerprinting deployment manifest")?;
    if recorded_sha != manifest_sha {
      return Ok(false);
    }

    let mut expected: Vec<ReleaseRecord> = releases
      .iter()
      .map(|r| ReleaseRecord {
        name: r.name.clone(),
        version: r.version.clone(),
      })
      .collect();
    expected.sort_by(|a, b| a.name.cmp(&b.name));
    let mut recorded = state.releases.clone();
    recorded.sort_by(|a, b| a.name.cmp(&b.name));
    if expected != recorded {
      return Ok(false);
    }

    let current_stemcell = StemcellRepo::new(&self.store).find_current()?;
    Ok(match current_stemcell {
      Some(s) => s.name == stemcell_name && s.version == stemcell_version,
      None => false,
    })
  }

  /// Record the inputs of the deploy that just succeeded.
  pub fn update(&self, manifest_path: &Path, releases: &[&Release]) -> Result<()> {
    let manifest_sha = sha1_of_file(manifest_path).context("Fingerprinting deployment manifest")?;

    let mut state = self.store.load()?;
    state.last_deployed_manifest_sha = Some(manifest_sha);
    self.store.save(&state)?;

    ReleaseRepo::new(&self.store).update(
      releases
        .iter()
        .map(|r| ReleaseRecord {
          name: r.name.clone(),
          version: r.version.clone(),
        })
        .collect(),
    )?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  struct Setup {
    temp: TempDir,
    store: StateStore,
    manifest_path: std::path::PathBuf,
  }

  fn setup() -> Setup {
    let temp = TempDir::new().unwrap();
    let store = StateStore::new(temp.path().join("deployment.json"));
    let manifest_path = temp.path().join("manifest.json");
    std::fs::write(&manifest_path, r#"{"name": "micro"}"#).unwrap();
    Setup {
      temp,
      store,
      manifest_path,
    }
  }

  fn record_current_stemcell(store: &StateStore) {
    let repo = StemcellRepo::new(store);
    let record = repo.save("ubuntu-trusty", "3126", "stemcell-cid-1").unwrap();
    repo.update_current(&record.id).unwrap();
  }

  #[test]
  fn not_deployed_when_nothing_recorded() {
    let s = setup();
    let record = DeploymentRecord::new(s.store.clone());
    let release = Release::for_test("bosh-aws-cpi", "1", vec![], vec![]);

    assert!(
      !record
        .is_deployed(&s.manifest_path, &[&release], "ubuntu-trusty", "3126")
        .unwrap()
    );
  }

  #[test]
  fn deployed_when_everything_matches() {
    let s = setup();
    let record = DeploymentRecord::new(s.store.clone());
    let release = Release::for_test("bosh-aws-cpi", "1", vec![], vec![]);
    record_current_stemcell(&s.store);

    record.update(&s.manifest_path, &[&release]).unwrap();

    assert!(
      record
        .is_deployed(&s.manifest_path, &[&release], "ubuntu-trusty", "3126")
        .unwrap()
    );
  }

  #[test]
  fn manifest_change_invalidates() {
    let s = setup();
    let record = DeploymentRecord::new(s.store.clone());
    let release = Release::for_test("bosh-aws-cpi", "1", vec![], vec![]);
    record_current_stemcell(&s.store);
    record.update(&s.manifest_path, &[&release]).unwrap();

    std::fs::write(&s.manifest_path, r#"{"name": "micro", "changed": true}"#).unwrap();

    assert!(
      !record
        .is_deployed(&s.manifest_path, &[&release], "ubuntu-trusty", "3126")
        .unwrap()
    );
    let _ = &s.temp;
  }

  #[test]
  fn release_version_change_invalidates() {
    let s = setup();
    let record = DeploymentRecord::new(s.store.clone());
    let release_v1 = Release::for_test("bosh-aws-cpi", "1", vec![], vec![]);
    record_current_stemcell(&s.store);
    record.update(&s.manifest_path, &[&release_v1]).unwrap();

    let release_v2 = Release::for_test("bosh-aws-cpi", "2", vec![], vec![]);

    assert!(
      !record
        .is_deployed(&s.manifest_path, &[&release_v2], "ubuntu-trusty", "3126")
        .unwrap()
    );
  }

  #[test]
  fn stemcell_change_invalidates() {
    let s = setup();
    let record = DeploymentRecord::new(s.store.clone());
    let release = Release::for_test("bosh-aws-cpi", "1", vec![], vec![]);
    record_current_stemcell(&s.store);
    record.update(&s.manifest_path, &[&release]).unwrap();

    assert!(
      !record
        .is_deployed(&s.manifest_path, &[&release], "ubuntu-trusty", "3127")
        .unwrap()
    );
  }
}
