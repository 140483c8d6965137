//! Reverse SSH tunnel to the target network.
//!
//! When the manifest configures `ssh_tunnel`, a reverse forward is opened so
//! the CPI-managed VM can reach the workstation's registry: the registry
//! port is forwarded from the remote side back to the local side
//! (`local_forward_port = remote_forward_port = registry.port`).
//!
//! The system ssh client is driven as a child process, the same external
//! process seam the CPI uses. An early exit of the child is a fatal start
//! error; otherwise the tunnel lives until the orchestrator stops it.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::manifest::SshTunnelConfig;

/// Grace period after spawn in which an exit is treated as a start failure.
const START_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SshTunnelError {
  #[error("spawning ssh tunnel to '{host}': {source}")]
  Spawn {
    host: String,
    #[source]
    source: std::io::Error,
  },

  #[error("ssh tunnel to '{host}' exited during startup with status {status:?}")]
  StartFailed { host: String, status: Option<i32> },
}

fn ssh_args(config: &SshTunnelConfig, registry_port: u16) -> Vec<String> {
  let mut args = vec![
    "-N".to_string(),
    "-o".to_string(),
    "StrictHostKeyChecking=no".to_string(),
    "-o".to_string(),
    "UserKnownHostsFile=/dev/null".to_string(),
    "-o".to_string(),
    "ExitOnForwardFailure=yes".to_string(),
    "-o".to_string(),
    "BatchMode=yes".to_string(),
  ];
  if let Some(key) = &config.private_key {
    args.push("-i".to_string());
    args.push(key.clone());
  }
  args.push("-R".to_string());
  args.push(format!("{}:127.0.0.1:{}", registry_port, registry_port));
  args.push("-p".to_string());
  args.push(config.port.to_string());
  args.push(format!("{}@{}", config.user, config.host));
  args
}

/// A running tunnel; killed on stop or drop.
#[derive(Debug)]
pub struct SshTunnel {
  child: Child,
  host: String,
}

impl SshTunnel {
  /// Spawn the tunnel and verify it survives the startup grace period.
  pub async fn start(config: &SshTunnelConfig, registry_port: u16) -> Result<Self, SshTunnelError> {
    let args = ssh_args(config, registry_port);
    debug!(host = %config.host, ?args, "starting ssh tunnel");

    let mut child = Command::new("ssh")
      .args(&args)
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .spawn()
      .map_err(|source| SshTunnelError::Spawn {
        host: config.host.clone(),
        source,
      })?;

    tokio::time::sleep(START_GRACE).await;
    if let Ok(Some(status)) = child.try_wait() {
      return Err(SshTunnelError::StartFailed {
        host: config.host.clone(),
        status: status.code(),
      });
    }

    info!(host = %config.host, port = registry_port, "ssh tunnel established");
    Ok(Self {
      child,
      host: config.host.clone(),
    })
  }

  /// Tear the tunnel down.
  pub async fn stop(mut self) {
    if let Err(e) = self.child.kill().await {
      warn!(host = %self.host, error = %e, "failed to kill ssh tunnel");
    }
  }
}
