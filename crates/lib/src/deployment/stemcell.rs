//! Stemcell extraction and upload.
//!
//! A stemcell tarball carries `stemcell.json` (name, version, cloud
//! properties) and the raw `image` the CPI uploads to the IaaS. Uploading is
//! skipped when the same name/version is already recorded, which is what
//! makes re-deploys cheap.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use serde::Deserialize;
use tar::Archive;
use thiserror::Error;
use tracing::warn;

use crate::cloud::Cloud;
use crate::manifest::Properties;
use crate::state::{StateStore, StemcellRecord, StemcellRepo};
use crate::ui::{SkipStage, Stage};

#[derive(Debug, Error)]
pub enum StemcellError {
  #[error("extracting stemcell from '{path}': {source}")]
  Extract {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("stemcell metadata 'stemcell.json' missing from '{0}'")]
  MissingMetadata(String),

  #[error("parsing stemcell metadata: {0}")]
  ParseMetadata(#[source] serde_json::Error),

  #[error("stemcell image missing from '{0}'")]
  MissingImage(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StemcellManifest {
  pub name: String,
  pub version: String,
  #[serde(default)]
  pub cloud_properties: Properties,
}

/// A stemcell unpacked into a process-private temp dir.
pub struct ExtractedStemcell {
  pub manifest: StemcellManifest,
  dir: tempfile::TempDir,
}

impl ExtractedStemcell {
  pub fn image_path(&self) -> PathBuf {
    self.dir.path().join("image")
  }

  /// Remove the extracted directory; called exactly once, by the command
  /// scope that created it.
  pub fn delete(self) {
    if let Err(e) = self.dir.close() {
      warn!(error = %e, "failed to delete extracted stemcell");
    }
  }
}

/// Unpack a stemcell tarball and read its metadata.
pub fn extract(tarball_path: &Path) -> Result<ExtractedStemcell, StemcellError> {
  let extract_err = |source| StemcellError::Extract {
    path: tarball_path.display().to_string(),
    source,
  };

  let dir = tempfile::tempdir().map_err(extract_err)?;
  let file = File::open(tarball_path).map_err(extract_err)?;
  let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
  archive.unpack(dir.path()).map_err(extract_err)?;

  let metadata_path = dir.path().join("stemcell.json");
  if !metadata_path.exists() {
    return Err(StemcellError::MissingMetadata(tarball_path.display().to_string()));
  }
  let metadata_file = File::open(&metadata_path).map_err(extract_err)?;
  let manifest: StemcellManifest =
    serde_json::from_reader(BufReader::new(metadata_file)).map_err(StemcellError::ParseMetadata)?;

  if !dir.path().join("image").exists() {
    return Err(StemcellError::MissingImage(tarball_path.display().to_string()));
  }

  Ok(ExtractedStemcell { manifest, dir })
}

/// Uploads stemcells and retires unused ones.
pub struct StemcellManager {
  cloud: Arc<dyn Cloud>,
  store: StateStore,
}

impl StemcellManager {
  pub fn new(cloud: Arc<dyn Cloud>, store: StateStore) -> Self {
    Self { cloud, store }
  }

  /// Upload the stemcell unless the same name/version is already recorded.
  ///
  /// The record becomes current either way, so the rest of the pipeline
  /// always sees the stemcell it should build on.
  pub async fn upload(&self, stemcell: &ExtractedStemcell, stage: &Stage) -> Result<StemcellRecord> {
    let repo = StemcellRepo::new(&self.store);
    let name = &stemcell.manifest.name;
    let version = &stemcell.manifest.version;

    let mut uploaded: Option<StemcellRecord> = None;
    let uploaded_ref = &mut uploaded;
    stage
      .perform(&format!("Uploading stemcell '{}/{}'", name, version), || async move {
        if let Some(existing) = repo.find(name, version)? {
          repo.update_current(&existing.id)?;
          *uploaded_ref = Some(existing);
          return Err(anyhow!(SkipStage("Stemcell already uploaded".to_string())));
        }

        let cid = self
          .cloud
          .create_stemcell(&stemcell.image_path(), &stemcell.manifest.cloud_properties)
          .await
          .with_context(|| format!("Uploading stemcell '{}/{}'", name, version))?;
        let record = repo.save(name, version, &cid)?;
        repo.update_current(&record.id)?;
        *uploaded_ref = Some(record);
        Ok(())
      })
      .await?;

    uploaded.ok_or_else(|| anyhow!("stemcell upload completed without a record"))
  }

  /// Delete every stemcell that is not current, on the IaaS and in the
  /// state file.
  pub async fn delete_unused(&self, stage: &Stage) -> Result<()> {
    let repo = StemcellRepo::new(&self.store);
    for record in repo.find_unused()? {
      let repo = &repo;
      stage
        .perform(&format!("Deleting unused stemcell '{}'", record.cid), || async move {
          self
            .cloud
            .delete_stemcell(&record.cid)
            .await
            .with_context(|| format!("Deleting unused stemcell '{}'", record.cid))?;
          repo.delete(&record.id)?;
          Ok(())
        })
        .await?;
    }
    Ok(())
  }
}
