//! Recording fakes for the orchestrator's collaborator seams.
//!
//! Each fake records every call it receives and answers from a small script
//! of canned results, so tests can assert on exact call sequences the way
//! the pipeline drives its collaborators.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::agent::{AgentClient, AgentError, AgentState, ApplySpec};
use crate::blobstore::{Blobstore, BlobstoreError};
use crate::cloud::{Cloud, CloudError};
use crate::manifest::{NetworkInterface, Properties};

/// Blobstore over a temp dir; blob ids are sequential.
pub struct FakeBlobstore {
  dir: tempfile::TempDir,
  counter: Mutex<u32>,
  pub adds: Mutex<Vec<PathBuf>>,
}

impl FakeBlobstore {
  pub fn new() -> Self {
    Self {
      dir: tempfile::TempDir::new().unwrap(),
      counter: Mutex::new(0),
      adds: Mutex::new(Vec::new()),
    }
  }

  pub fn add_count(&self) -> usize {
    self.adds.lock().unwrap().len()
  }

  pub fn blob_path(&self, blob_id: &str) -> PathBuf {
    self.dir.path().join(blob_id)
  }
}

#[async_trait]
impl Blobstore for FakeBlobstore {
  async fn add(&self, path: &Path) -> Result<String, BlobstoreError> {
    let mut counter = self.counter.lock().unwrap();
    *counter += 1;
    let blob_id = format!("blob-{}", counter);
    std::fs::copy(path, self.dir.path().join(&blob_id)).map_err(|source| BlobstoreError::ReadSource {
      path: path.display().to_string(),
      source,
    })?;
    self.adds.lock().unwrap().push(path.to_path_buf());
    Ok(blob_id)
  }

  async fn get(&self, blob_id: &str, dest: &Path) -> Result<(), BlobstoreError> {
    std::fs::copy(self.dir.path().join(blob_id), dest).map_err(|source| BlobstoreError::WriteDest {
      path: dest.display().to_string(),
      source,
    })?;
    Ok(())
  }
}

/// Cloud fake recording `(method, arguments)` pairs.
pub struct FakeCloud {
  pub calls: Mutex<Vec<(String, Vec<String>)>>,
  cids: Mutex<HashMap<String, VecDeque<String>>>,
  failures: Mutex<HashMap<String, (String, String)>>,
}

impl FakeCloud {
  pub fn new() -> Self {
    let mut cids = HashMap::new();
    cids.insert("create_stemcell".to_string(), VecDeque::from(["stemcell-cid-1".to_string()]));
    cids.insert("create_vm".to_string(), VecDeque::from(["vm-cid-1".to_string()]));
    cids.insert("create_disk".to_string(), VecDeque::from(["disk-cid-1".to_string()]));
    Self {
      calls: Mutex::new(Vec::new()),
      cids: Mutex::new(cids),
      failures: Mutex::new(HashMap::new()),
    }
  }

  /// Queue the cid the next call of `method` returns.
  pub fn push_cid(&self, method: &str, cid: &str) {
    self
      .cids
      .lock()
      .unwrap()
      .entry(method.to_string())
      .or_default()
      .push_back(cid.to_string());
  }

  /// Make `method` fail with a CPI error.
  pub fn fail(&self, method: &str, error_type: &str, message: &str) {
    self
      .failures
      .lock()
      .unwrap()
      .insert(method.to_string(), (error_type.to_string(), message.to_string()));
  }

  pub fn called_methods(&self) -> Vec<String> {
    self.calls.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
  }

  fn record(&self, method: &str, arguments: Vec<String>) -> Result<(), CloudError> {
    self.calls.lock().unwrap().push((method.to_string(), arguments));
    if let Some((error_type, message)) = self.failures.lock().unwrap().get(method) {
      return Err(CloudError::Cpi {
        method: method.to_string(),
        error_type: error_type.clone(),
        message: message.clone(),
        ok_to_retry: false,
      });
    }
    Ok(())
  }

  fn next_cid(&self, method: &str) -> String {
    self
      .cids
      .lock()
      .unwrap()
      .get_mut(method)
      .and_then(VecDeque::pop_front)
      .unwrap_or_else(|| format!("{}-cid", method))
  }
}

#[async_trait]
impl Cloud for FakeCloud {
  async fn create_stemcell(&self, image_path: &Path, _cloud_properties: &Properties) -> Result<String, CloudError> {
    self.record("create_stemcell", vec![image_path.display().to_string()])?;
    Ok(self.next_cid("create_stemcell"))
  }

  async fn create_vm(
    &self,
    agent_id: &str,
    stemcell_cid: &str,
    _cloud_properties: &Properties,
    _networks: &BTreeMap<String, NetworkInterface>,
    disk_locality: &[String],
    _env: &Properties,
  ) -> Result<String, CloudError> {
    self.record(
      "create_vm",
      vec![agent_id.to_string(), stemcell_cid.to_string(), disk_locality.join(",")],
    )?;
    Ok(self.next_cid("create_vm"))
  }

  async fn create_disk(&self, size: u64, _cloud_properties: &Properties, vm_cid: &str) -> Result<String, CloudError> {
    self.record("create_disk", vec![size.to_string(), vm_cid.to_string()])?;
    Ok(self.next_cid("create_disk"))
  }

  async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<(), CloudError> {
    self.record("attach_disk", vec![vm_cid.to_string(), disk_cid.to_string()])
  }

  async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<(), CloudError> {
    self.record("detach_disk", vec![vm_cid.to_string(), disk_cid.to_string()])
  }

  async fn delete_vm(&self, vm_cid: &str) -> Result<(), CloudError> {
    self.record("delete_vm", vec![vm_cid.to_string()])
  }

  async fn delete_disk(&self, disk_cid: &str) -> Result<(), CloudError> {
    self.record("delete_disk", vec![disk_cid.to_string()])
  }

  async fn delete_stemcell(&self, stemcell_cid: &str) -> Result<(), CloudError> {
    self.record("delete_stemcell", vec![stemcell_cid.to_string()])
  }
}

/// Agent fake with scripted readiness and job states.
pub struct FakeAgentClient {
  pub calls: Mutex<Vec<String>>,
  pub applied_specs: Mutex<Vec<ApplySpec>>,
  ping_failures: Mutex<u32>,
  job_states: Mutex<VecDeque<String>>,
  disks: Mutex<Vec<String>>,
}

impl FakeAgentClient {
  pub fn new() -> Self {
    Self {
      calls: Mutex::new(Vec::new()),
      applied_specs: Mutex::new(Vec::new()),
      ping_failures: Mutex::new(0),
      job_states: Mutex::new(VecDeque::new()),
      disks: Mutex::new(Vec::new()),
    }
  }

  /// Fail the first `count` pings before answering.
  pub fn fail_pings(&self, count: u32) {
    *self.ping_failures.lock().unwrap() = count;
  }

  /// Queue `get_state` job states; once drained, `running` is returned.
  pub fn push_job_state(&self, state: &str) {
    self.job_states.lock().unwrap().push_back(state.to_string());
  }

  pub fn set_disks(&self, disks: Vec<String>) {
    *self.disks.lock().unwrap() = disks;
  }

  pub fn called_methods(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  fn record(&self, call: String) {
    self.calls.lock().unwrap().push(call);
  }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
  async fn ping(&self) -> Result<String, AgentError> {
    self.record("ping".to_string());
    let mut failures = self.ping_failures.lock().unwrap();
    if *failures > 0 {
      *failures -= 1;
      return Err(AgentError::PingTimeout {
        timeout: Duration::from_secs(0),
      });
    }
    Ok("pong".to_string())
  }

  async fn get_state(&self) -> Result<AgentState, AgentError> {
    self.record("get_state".to_string());
    let job_state = self
      .job_states
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| "running".to_string());
    Ok(AgentState { job_state })
  }

  async fn apply(&self, spec: &ApplySpec) -> Result<(), AgentError> {
    self.record("apply".to_string());
    self.applied_specs.lock().unwrap().push(spec.clone());
    Ok(())
  }

  async fn start(&self) -> Result<(), AgentError> {
    self.record("start".to_string());
    Ok(())
  }

  async fn stop(&self) -> Result<(), AgentError> {
    self.record("stop".to_string());
    Ok(())
  }

  async fn list_disk(&self) -> Result<Vec<String>, AgentError> {
    self.record("list_disk".to_string());
    Ok(self.disks.lock().unwrap().clone())
  }

  async fn mount_disk(&self, disk_cid: &str) -> Result<(), AgentError> {
    self.record(format!("mount_disk({})", disk_cid));
    Ok(())
  }

  async fn unmount_disk(&self, disk_cid: &str) -> Result<(), AgentError> {
    self.record(format!("unmount_disk({})", disk_cid));
    Ok(())
  }

  async fn migrate_disk(&self, from_disk_cid: &str, to_disk_cid: &str) -> Result<(), AgentError> {
    self.record(format!("migrate_disk({}, {})", from_disk_cid, to_disk_cid));
    Ok(())
  }
}

/// Write a package source tarball whose `packaging` script is `script`.
pub fn write_package_archive(dir: &Path, name: &str, script: &str) -> PathBuf {
  let path = dir.join(format!("{}.tgz", name));
  let tgz = std::fs::File::create(&path).unwrap();
  let encoder = flate2::write::GzEncoder::new(tgz, flate2::Compression::default());
  let mut builder = tar::Builder::new(encoder);
  let body = format!("#!/bin/sh\n{}\n", script);
  let mut header = tar::Header::new_gnu();
  header.set_size(body.len() as u64);
  header.set_mode(0o755);
  header.set_cksum();
  builder.append_data(&mut header, "packaging", body.as_bytes()).unwrap();
  builder.into_inner().unwrap().finish().unwrap();
  path
}
