//! Cloud operations through the CPI.
//!
//! `Cloud` is the capability seam the orchestrator sees: exactly the eight
//! IaaS operations it needs. `CpiCloud` implements it over the spawned CPI
//! executable, retrying retryable errors and tolerating not-found on
//! deletes so teardown is idempotent.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::manifest::{NetworkInterface, Properties};

pub mod cpi;

pub use cpi::{CmdContext, CpiCmdRunner};

/// Attempts for a retryable CPI error.
const MAX_CPI_ATTEMPTS: u32 = 3;

/// Base delay between retryable attempts; grows linearly.
const CPI_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CloudError {
  #[error("cpi method '{method}' failed: {error_type}: {message}")]
  Cpi {
    method: String,
    error_type: String,
    message: String,
    ok_to_retry: bool,
  },

  #[error("running cpi at '{path}': {source}")]
  Exec {
    path: String,
    #[source]
    source: io::Error,
  },

  #[error("cpi at '{path}' exited with status {status:?}: {stderr}")]
  Exited {
    path: String,
    status: Option<i32>,
    stderr: String,
  },

  #[error("cpi method '{method}' produced an invalid response: {source}")]
  InvalidResponse {
    method: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("cpi method '{method}' returned '{value}' instead of a cid")]
  UnexpectedResult { method: String, value: String },
}

impl CloudError {
  fn is_retryable(&self) -> bool {
    matches!(self, CloudError::Cpi { ok_to_retry: true, .. })
  }

  fn is_not_found(&self) -> bool {
    matches!(self, CloudError::Cpi { error_type, .. } if error_type.contains("NotFound"))
  }
}

/// The IaaS operations the orchestrator performs.
#[async_trait]
pub trait Cloud: Send + Sync {
  async fn create_stemcell(&self, image_path: &Path, cloud_properties: &Properties) -> Result<String, CloudError>;

  #[allow(clippy::too_many_arguments)]
  async fn create_vm(
    &self,
    agent_id: &str,
    stemcell_cid: &str,
    cloud_properties: &Properties,
    networks: &BTreeMap<String, NetworkInterface>,
    disk_locality: &[String],
    env: &Properties,
  ) -> Result<String, CloudError>;

  async fn create_disk(&self, size: u64, cloud_properties: &Properties, vm_cid: &str) -> Result<String, CloudError>;

  async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<(), CloudError>;

  async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<(), CloudError>;

  async fn delete_vm(&self, vm_cid: &str) -> Result<(), CloudError>;

  async fn delete_disk(&self, disk_cid: &str) -> Result<(), CloudError>;

  async fn delete_stemcell(&self, stemcell_cid: &str) -> Result<(), CloudError>;
}

/// Production `Cloud` over the installed CPI executable.
pub struct CpiCloud {
  runner: CpiCmdRunner,
}

impl CpiCloud {
  pub fn new(runner: CpiCmdRunner) -> Self {
    Self { runner }
  }

  /// Run a method, retrying when the CPI says the error is retryable.
  async fn call(&self, method: &str, arguments: Vec<Value>) -> Result<Value, CloudError> {
    let mut attempt = 1;
    loop {
      match self.runner.run(method, &arguments).await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_retryable() && attempt < MAX_CPI_ATTEMPTS => {
          warn!(method, attempt, error = %err, "retryable cpi error");
          tokio::time::sleep(CPI_RETRY_DELAY * attempt).await;
          attempt += 1;
        }
        Err(err) => return Err(err),
      }
    }
  }

  /// Run a delete method; a not-found error means the work is already done.
  async fn call_delete(&self, method: &str, arguments: Vec<Value>) -> Result<(), CloudError> {
    match self.call(method, arguments).await {
      Ok(_) => Ok(()),
      Err(err) if err.is_not_found() => {
        debug!(method, "cpi reports entity already gone");
        Ok(())
      }
      Err(err) => Err(err),
    }
  }

  fn expect_cid(method: &str, value: Value) -> Result<String, CloudError> {
    match value {
      Value::String(cid) => Ok(cid),
      other => Err(CloudError::UnexpectedResult {
        method: method.to_string(),
        value: other.to_string(),
      }),
    }
  }
}

#[async_trait]
impl Cloud for CpiCloud {
  async fn create_stemcell(&self, image_path: &Path, cloud_properties: &Properties) -> Result<String, CloudError> {
    let result = self
      .call(
        "create_stemcell",
        vec![json!(image_path.display().to_string()), json!(cloud_properties)],
      )
      .await?;
    Self::expect_cid("create_stemcell", result)
  }

  async fn create_vm(
    &self,
    agent_id: &str,
    stemcell_cid: &str,
    cloud_properties: &Properties,
    networks: &BTreeMap<String, NetworkInterface>,
    disk_locality: &[String],
    env: &Properties,
  ) -> Result<String, CloudError> {
    let result = self
      .call(
        "create_vm",
        vec![
          json!(agent_id),
          json!(stemcell_cid),
          json!(cloud_properties),
          json!(networks),
          json!(disk_locality),
          json!(env),
        ],
      )
      .await?;
    Self::expect_cid("create_vm", result)
  }

  async fn create_disk(&self, size: u64, cloud_properties: &Properties, vm_cid: &str) -> Result<String, CloudError> {
    let result = self
      .call("create_disk", vec![json!(size), json!(cloud_properties), json!(vm_cid)])
      .await?;
    Self::expect_cid("create_disk", result)
  }

  async fn attach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<(), CloudError> {
    self.call("attach_disk", vec![json!(vm_cid), json!(disk_cid)]).await?;
    Ok(())
  }

  async fn detach_disk(&self, vm_cid: &str, disk_cid: &str) -> Result<(), CloudError> {
    self.call("detach_disk", vec![json!(vm_cid), json!(disk_cid)]).await?;
    Ok(())
  }

  async fn delete_vm(&self, vm_cid: &str) -> Result<(), CloudError> {
    self.call_delete("delete_vm", vec![json!(vm_cid)]).await
  }

  async fn delete_disk(&self, disk_cid: &str) -> Result<(), CloudError> {
    self.call_delete("delete_disk", vec![json!(disk_cid)]).await
  }

  async fn delete_stemcell(&self, stemcell_cid: &str) -> Result<(), CloudError> {
    self.call_delete("delete_stemcell", vec![json!(stemcell_cid)]).await
  }
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::os::unix::fs::PermissionsExt;

  use tempfile::TempDir;

  use super::*;

  fn cloud_with_script(script_body: &str) -> (TempDir, CpiCloud) {
    let temp = TempDir::new().unwrap();
    let bin_dir = temp.path().join("bin");
    fs::create_dir_all(&bin_dir).unwrap();
    let cpi = bin_dir.join("cpi");
    fs::write(&cpi, format!("#!/bin/sh\ncd \"$(dirname \"$0\")/..\"\n{}\n", script_body)).unwrap();
    fs::set_permissions(&cpi, fs::Permissions::from_mode(0o755)).unwrap();
    let runner = CpiCmdRunner::new(temp.path(), "director-uuid-1".to_string());
    (temp, CpiCloud::new(runner))
  }

  #[tokio::test]
  async fn create_stemcell_returns_cid() {
    let (_temp, cloud) = cloud_with_script(r#"cat > /dev/null; echo '{"result":"stemcell-cid-1","error":null}'"#);

    let cid = cloud
      .create_stemcell(Path::new("/tmp/image"), &Properties::new())
      .await
      .unwrap();

    assert_eq!(cid, "stemcell-cid-1");
  }

  #[tokio::test]
  async fn retryable_errors_are_retried_until_success() {
    // Fails twice with ok_to_retry, then succeeds; attempts counted in a file.
    let (_temp, cloud) = cloud_with_script(
      r#"cat > /dev/null
count=$(cat attempts 2>/dev/null || echo 0)
count=$((count + 1))
echo "$count" > attempts
if [ "$count" -lt 3 ]; then
  echo '{"result":null,"error":{"type":"Bosh::Clouds::CloudError","message":"try again","ok_to_retry":true}}'
else
  echo '{"result":"vm-cid-1","error":null}'
fi"#,
    );

    let cid = cloud
      .create_vm(
        "agent-1",
        "stemcell-cid-1",
        &Properties::new(),
        &BTreeMap::new(),
        &[],
        &Properties::new(),
      )
      .await
      .unwrap();

    assert_eq!(cid, "vm-cid-1");
  }

  #[tokio::test]
  async fn non_retryable_errors_fail_immediately() {
    let (temp, cloud) = cloud_with_script(
      r#"cat > /dev/null
count=$(cat attempts 2>/dev/null || echo 0)
echo $((count + 1)) > attempts
echo '{"result":null,"error":{"type":"Bosh::Clouds::CloudError","message":"bad credentials","ok_to_retry":false}}'"#,
    );

    let err = cloud.create_disk(1024, &Properties::new(), "vm-cid-1").await.unwrap_err();

    assert!(matches!(err, CloudError::Cpi { ok_to_retry: false, .. }));
    let attempts = fs::read_to_string(temp.path().join("attempts")).unwrap();
    assert_eq!(attempts.trim(), "1");
  }

  #[tokio::test]
  async fn delete_tolerates_not_found() {
    let (_temp, cloud) = cloud_with_script(
      r#"cat > /dev/null; echo '{"result":null,"error":{"type":"Bosh::Clouds::DiskNotFound","message":"disk-cid-1 not found","ok_to_retry":false}}'"#,
    );

    cloud.delete_disk("disk-cid-1").await.unwrap();
  }

  #[tokio::test]
  async fn delete_propagates_other_errors() {
    let (_temp, cloud) = cloud_with_script(
      r#"cat > /dev/null; echo '{"result":null,"error":{"type":"Bosh::Clouds::CloudError","message":"permission denied","ok_to_retry":false}}'"#,
    );

    assert!(cloud.delete_vm("vm-cid-1").await.is_err());
  }

  #[tokio::test]
  async fn non_string_cid_is_rejected() {
    let (_temp, cloud) = cloud_with_script(r#"cat > /dev/null; echo '{"result":42,"error":null}'"#);

    assert!(matches!(
      cloud.create_stemcell(Path::new("/tmp/image"), &Properties::new()).await,
      Err(CloudError::UnexpectedResult { .. })
    ));
  }
}
