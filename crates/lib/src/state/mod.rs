//! Durable deployment state.
//!
//! Everything the orchestrator must remember between invocations lives in a
//! single JSON file (`deployment.json`) next to the manifest: the director
//! identity, the stemcell/disk/VM records with their IaaS-assigned cids, and
//! the fingerprints of the last successful deploy. Writes are atomic
//! (write-temp-then-rename); a single writer is assumed.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod repos;

pub use repos::{DiskRepo, ReleaseRepo, StemcellRepo, VmRepo};

#[derive(Debug, Error)]
pub enum StateError {
  #[error("reading deployment state: {0}")]
  Read(#[source] io::Error),

  #[error("writing deployment state: {0}")]
  Write(#[source] io::Error),

  #[error("parsing deployment state: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("serializing deployment state: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("record '{0}' not found in deployment state")]
  RecordNotFound(String),
}

/// A stemcell uploaded to the IaaS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StemcellRecord {
  pub id: String,
  pub name: String,
  pub version: String,
  pub cid: String,
}

/// A persistent disk created on the IaaS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskRecord {
  pub id: String,
  pub cid: String,
  pub size: u64,
  #[serde(default)]
  pub cloud_properties: serde_json::Map<String, serde_json::Value>,
}

/// A VM created on the IaaS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
  pub id: String,
  pub cid: String,
  pub stemcell_id: String,
}

/// A release that was part of the last successful deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRecord {
  pub name: String,
  pub version: String,
}

/// Schema of `deployment.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
  pub director_id: String,
  #[serde(default)]
  pub stemcells: Vec<StemcellRecord>,
  #[serde(default)]
  pub disks: Vec<DiskRecord>,
  #[serde(default)]
  pub vms: Vec<VmRecord>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub current_stemcell_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub current_disk_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub current_vm_id: Option<String>,
  #[serde(default)]
  pub releases: Vec<ReleaseRecord>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_deployed_manifest_sha: Option<String>,
}

impl DeploymentState {
  /// Whether any IaaS entity is still recorded.
  pub fn has_entities(&self) -> bool {
    !self.stemcells.is_empty() || !self.disks.is_empty() || !self.vms.is_empty()
  }
}

/// Reads and writes the deployment state file.
#[derive(Debug, Clone)]
pub struct StateStore {
  path: PathBuf,
}

impl StateStore {
  pub fn new(path: PathBuf) -> Self {
    Self { path }
  }

  pub fn path(&self) -> &PathBuf {
    &self.path
  }

  /// Whether the state file exists on disk.
  pub fn exists(&self) -> bool {
    self.path.exists()
  }

  /// Load the state, creating it (with a fresh director id) if missing.
  ///
  /// The director id is assigned exactly once and persisted immediately so
  /// a crash later in the run cannot lose it.
  pub fn load(&self) -> Result<DeploymentState, StateError> {
    let content = match fs::read_to_string(&self.path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        let state = DeploymentState {
          director_id: Uuid::new_v4().to_string(),
          ..DeploymentState::default()
        };
        self.save(&state)?;
        return Ok(state);
      }
      Err(e) => return Err(StateError::Read(e)),
    };

    serde_json::from_str(&content).map_err(StateError::Parse)
  }

  /// Persist the state atomically.
  pub fn save(&self, state: &DeploymentState) -> Result<(), StateError> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent).map_err(StateError::Write)?;
    }

    let content = serde_json::to_string_pretty(state).map_err(StateError::Serialize)?;
    let temp_path = self.path.with_extension("json.tmp");
    fs::write(&temp_path, &content).map_err(StateError::Write)?;
    fs::rename(&temp_path, &self.path).map_err(StateError::Write)?;

    Ok(())
  }
}
