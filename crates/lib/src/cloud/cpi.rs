//! CPI wire protocol.
//!
//! The CPI is a per-IaaS executable installed by the installer. Each call
//! spawns `bin/cpi`, writes one JSON request on stdin:
//!
//! ```text
//! {"method": "create_vm", "arguments": [...], "context": {"director_uuid": "..."}}
//! ```
//!
//! and reads one JSON response `{"result": ..., "error": ..., "log": "..."}`
//! from stdout. Only one call is in flight per process.

use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::CloudError;

#[derive(Debug, Clone, Serialize)]
pub struct CmdContext {
  pub director_uuid: String,
}

#[derive(Serialize)]
struct CmdInput<'a> {
  method: &'a str,
  arguments: &'a [Value],
  context: &'a CmdContext,
}

/// Error half of a CPI response.
#[derive(Debug, Clone, Deserialize)]
pub struct CmdError {
  #[serde(rename = "type")]
  pub error_type: String,
  pub message: String,
  #[serde(default)]
  pub ok_to_retry: bool,
}

#[derive(Debug, Deserialize)]
struct CmdOutput {
  result: Option<Value>,
  error: Option<CmdError>,
  #[serde(default)]
  log: String,
}

/// Spawns the installed CPI executable for each method call.
#[derive(Debug, Clone)]
pub struct CpiCmdRunner {
  cpi_path: PathBuf,
  context: CmdContext,
}

impl CpiCmdRunner {
  /// `job_dir` is the installed CPI job; the executable is `bin/cpi` within.
  pub fn new(job_dir: &std::path::Path, director_uuid: String) -> Self {
    Self {
      cpi_path: job_dir.join("bin").join("cpi"),
      context: CmdContext { director_uuid },
    }
  }

  pub fn cpi_path(&self) -> &PathBuf {
    &self.cpi_path
  }

  /// Perform one request/response round trip.
  pub async fn run(&self, method: &str, arguments: &[Value]) -> Result<Value, CloudError> {
    let request = serde_json::to_vec(&CmdInput {
      method,
      arguments,
      context: &self.context,
    })
    .map_err(|e| CloudError::InvalidResponse {
      method: method.to_string(),
      source: e,
    })?;

    debug!(method, cpi = %self.cpi_path.display(), "invoking cpi");

    let mut child = Command::new(&self.cpi_path)
      .stdin(Stdio::piped())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .spawn()
      .map_err(|source| CloudError::Exec {
        path: self.cpi_path.display().to_string(),
        source,
      })?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    stdin.write_all(&request).await.map_err(|source| CloudError::Exec {
      path: self.cpi_path.display().to_string(),
      source,
    })?;
    drop(stdin);

    let output = child.wait_with_output().await.map_err(|source| CloudError::Exec {
      path: self.cpi_path.display().to_string(),
      source,
    })?;

    if !output.status.success() {
      return Err(CloudError::Exited {
        path: self.cpi_path.display().to_string(),
        status: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
      });
    }

    let parsed: CmdOutput = serde_json::from_slice(&output.stdout).map_err(|source| CloudError::InvalidResponse {
      method: method.to_string(),
      source,
    })?;

    if !parsed.log.is_empty() {
      debug!(method, log = %parsed.log, "cpi log");
    }

    if let Some(error) = parsed.error {
      return Err(CloudError::Cpi {
        method: method.to_string(),
        error_type: error.error_type,
        message: error.message,
        ok_to_retry: error.ok_to_retry,
      });
    }

    Ok(parsed.result.unwrap_or(Value::Null))
  }
}

#[cfg(test)]
mod tests {
  use std::fs;
  use std::os::unix::fs::PermissionsExt;

  use tempfile::TempDir;

  use super::*;

  /// Install a fake `bin/cpi` shell script into a temp job dir.
  fn fake_cpi(script_body: &str) -> (TempDir, CpiCmdRunner) {
    let temp = TempDir::new().unwrap();
    let bin_dir = temp.path().join("bin");
    fs::create_dir_all(&bin_dir).unwrap();
    let cpi = bin_dir.join("cpi");
    fs::write(&cpi, format!("#!/bin/sh\n{}\n", script_body)).unwrap();
    fs::set_permissions(&cpi, fs::Permissions::from_mode(0o755)).unwrap();
    let runner = CpiCmdRunner::new(temp.path(), "director-uuid-1".to_string());
    (temp, runner)
  }

  #[tokio::test]
  async fn run_returns_the_result() {
    let (_temp, runner) = fake_cpi(r#"cat > /dev/null; echo '{"result":"stemcell-cid-1","error":null,"log":""}'"#);

    let result = runner.run("create_stemcell", &[]).await.unwrap();

    assert_eq!(result, Value::String("stemcell-cid-1".to_string()));
  }

  #[tokio::test]
  async fn run_sends_method_and_context() {
    // The fake echoes the request back as its result string.
    let (_temp, runner) = fake_cpi(
      r#"request=$(cat)
printf '{"result": %s, "error": null, "log": ""}' "$(printf '%s' "$request" | sed 's/"/\\"/g; s/^/"/; s/$/"/')""#,
    );

    let result = runner
      .run("create_vm", &[Value::String("agent-1".to_string())])
      .await
      .unwrap();

    let echoed = result.as_str().unwrap();
    assert!(echoed.contains(r#""method":"create_vm""#));
    assert!(echoed.contains(r#""arguments":["agent-1"]"#));
    assert!(echoed.contains(r#""director_uuid":"director-uuid-1""#));
  }

  #[tokio::test]
  async fn run_surfaces_cpi_errors() {
    let (_temp, runner) = fake_cpi(
      r#"cat > /dev/null; echo '{"result":null,"error":{"type":"Bosh::Clouds::CloudError","message":"out of capacity","ok_to_retry":true},"log":""}'"#,
    );

    let err = runner.run("create_vm", &[]).await.unwrap_err();

    match err {
      CloudError::Cpi {
        method,
        error_type,
        ok_to_retry,
        ..
      } => {
        assert_eq!(method, "create_vm");
        assert_eq!(error_type, "Bosh::Clouds::CloudError");
        assert!(ok_to_retry);
      }
      other => panic!("expected Cpi error, got: {}", other),
    }
  }

  #[tokio::test]
  async fn run_reports_nonzero_exit() {
    let (_temp, runner) = fake_cpi("cat > /dev/null; echo 'broken' >&2; exit 3");

    let err = runner.run("create_vm", &[]).await.unwrap_err();

    match err {
      CloudError::Exited { status, stderr, .. } => {
        assert_eq!(status, Some(3));
        assert_eq!(stderr, "broken");
      }
      other => panic!("expected Exited error, got: {}", other),
    }
  }

  #[tokio::test]
  async fn run_reports_missing_executable() {
    let temp = TempDir::new().unwrap();
    let runner = CpiCmdRunner::new(temp.path(), "director-uuid-1".to_string());

    assert!(matches!(
      runner.run("ping", &[]).await.unwrap_err(),
      CloudError::Exec { .. }
    ));
  }
}
