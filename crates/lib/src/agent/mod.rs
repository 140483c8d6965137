//! Agent RPC over the mbus channel.
//!
//! The agent inside the deployed VM answers JSON-RPC style messages posted
//! to the https mbus URL. Short methods answer inline; long-running methods
//! (`apply`, `stop`, `start`, disk operations) return a task id which is
//! polled via `get_task` until it leaves the `running` state.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};
use url::Url;

pub mod applyspec;

pub use applyspec::{ApplyJob, ApplyJobTemplate, ApplySpec, RenderedTemplatesArchiveSpec};

/// How long a new VM gets to answer its first ping.
pub const PING_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Delay between pings while waiting for readiness.
pub const PING_DELAY: Duration = Duration::from_millis(500);

/// Attempts for the job to report `running` after start.
pub const RUNNING_MAX_ATTEMPTS: u32 = 5;

/// Delay between `get_state` attempts.
pub const RUNNING_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AgentError {
  #[error("invalid mbus URL '{url}': {reason}")]
  InvalidUrl { url: String, reason: String },

  #[error("sending '{method}' to agent: {source}")]
  Send {
    method: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("agent raised on '{method}': {message}")]
  Exception { method: String, message: String },

  #[error("agent task for '{method}' failed: {message}")]
  TaskFailed { method: String, message: String },

  #[error("agent returned unexpected response for '{method}': {value}")]
  UnexpectedResponse { method: String, value: String },

  #[error("agent did not become ready within {timeout:?}")]
  PingTimeout { timeout: Duration },

  #[error("agent job not running after {attempts} attempts")]
  NotRunning { attempts: u32 },
}

/// Job state half of the agent's `get_state` response.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentState {
  pub job_state: String,
}

/// The agent operations the orchestrator performs.
#[async_trait]
pub trait AgentClient: Send + Sync {
  async fn ping(&self) -> Result<String, AgentError>;
  async fn get_state(&self) -> Result<AgentState, AgentError>;
  async fn apply(&self, spec: &ApplySpec) -> Result<(), AgentError>;
  async fn start(&self) -> Result<(), AgentError>;
  async fn stop(&self) -> Result<(), AgentError>;
  async fn list_disk(&self) -> Result<Vec<String>, AgentError>;
  async fn mount_disk(&self, disk_cid: &str) -> Result<(), AgentError>;
  async fn unmount_disk(&self, disk_cid: &str) -> Result<(), AgentError>;
  async fn migrate_disk(&self, from_disk_cid: &str, to_disk_cid: &str) -> Result<(), AgentError>;
}

/// Ping until the agent answers or the timeout elapses.
pub async fn wait_until_ready(client: &dyn AgentClient, timeout: Duration, delay: Duration) -> Result<(), AgentError> {
  let deadline = Instant::now() + timeout;
  loop {
    match client.ping().await {
      Ok(_) => return Ok(()),
      Err(err) => {
        trace!(error = %err, "agent not ready yet");
        if Instant::now() >= deadline {
          return Err(AgentError::PingTimeout { timeout });
        }
        tokio::time::sleep(delay).await;
      }
    }
  }
}

/// Poll `get_state` until the job reports `running`.
pub async fn wait_until_running(
  client: &dyn AgentClient,
  max_attempts: u32,
  delay: Duration,
) -> Result<(), AgentError> {
  for attempt in 1..=max_attempts {
    if let Ok(state) = client.get_state().await
      && state.job_state == "running"
    {
      return Ok(());
    }
    if attempt < max_attempts {
      tokio::time::sleep(delay).await;
    }
  }
  Err(AgentError::NotRunning {
    attempts: max_attempts,
  })
}

/// Production agent client over the https mbus.
pub struct HttpAgentClient {
  client: reqwest::Client,
  endpoint: Url,
  username: String,
  password: Option<String>,
  reply_to: String,
  task_poll_delay: Duration,
}

impl HttpAgentClient {
  /// `reply_to` identifies this director in agent responses.
  pub fn new(mbus_url: &str, reply_to: &str) -> Result<Self, AgentError> {
    let url = Url::parse(mbus_url).map_err(|e| AgentError::InvalidUrl {
      url: mbus_url.to_string(),
      reason: e.to_string(),
    })?;

    let username = url.username().to_string();
    let password = url.password().map(str::to_string);
    let mut endpoint = url;
    // credentials travel in the Authorization header, not the URL
    let _ = endpoint.set_username("");
    let _ = endpoint.set_password(None);

    let client = reqwest::Client::builder()
      .danger_accept_invalid_certs(true)
      .build()
      .map_err(|e| AgentError::InvalidUrl {
        url: mbus_url.to_string(),
        reason: e.to_string(),
      })?;

    Ok(Self {
      client,
      endpoint,
      username,
      password,
      reply_to: reply_to.to_string(),
      task_poll_delay: Duration::from_secs(1),
    })
  }

  /// Override the task poll delay (tests use milliseconds).
  pub fn with_task_poll_delay(mut self, delay: Duration) -> Self {
    self.task_poll_delay = delay;
    self
  }

  async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<Value, AgentError> {
    let body = json!({
      "method": method,
      "arguments": arguments,
      "reply_to": self.reply_to,
    });
    trace!(method, "sending agent message");

    let response = self
      .client
      .post(self.endpoint.clone())
      .basic_auth(&self.username, self.password.as_deref())
      .json(&body)
      .send()
      .await
      .and_then(|r| r.error_for_status())
      .map_err(|source| AgentError::Send {
        method: method.to_string(),
        source,
      })?;

    let reply: Value = response.json().await.map_err(|source| AgentError::Send {
      method: method.to_string(),
      source,
    })?;

    if let Some(exception) = reply.get("exception") {
      let message = exception
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown agent exception")
        .to_string();
      return Err(AgentError::Exception {
        method: method.to_string(),
        message,
      });
    }

    match reply.get("value") {
      Some(value) => Ok(value.clone()),
      None => Err(AgentError::UnexpectedResponse {
        method: method.to_string(),
        value: reply.to_string(),
      }),
    }
  }

  /// Send a task-returning method and poll until the task completes.
  async fn send_and_track(&self, method: &str, arguments: Vec<Value>) -> Result<(), AgentError> {
    let mut value = self.send(method, arguments).await?;

    loop {
      let Some(state) = value.get("state").and_then(Value::as_str) else {
        // No task envelope: the method completed synchronously.
        return Ok(());
      };
      match state {
        "running" => {
          let task_id = value
            .get("agent_task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::UnexpectedResponse {
              method: method.to_string(),
              value: value.to_string(),
            })?
            .to_string();
          debug!(method, task_id = %task_id, "agent task running");
          tokio::time::sleep(self.task_poll_delay).await;
          value = self.send("get_task", vec![json!(task_id)]).await?;
        }
        "failed" => {
          let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("task failed")
            .to_string();
          return Err(AgentError::TaskFailed {
            method: method.to_string(),
            message,
          });
        }
        _ => return Ok(()),
      }
    }
  }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
  async fn ping(&self) -> Result<String, AgentError> {
    let value = self.send("ping", vec![]).await?;
    value.as_str().map(str::to_string).ok_or(AgentError::UnexpectedResponse {
      method: "ping".to_string(),
      value: value.to_string(),
    })
  }

  async fn get_state(&self) -> Result<AgentState, AgentError> {
    let value = self.send("get_state", vec![]).await?;
    let job_state = value
      .get("job_state")
      .and_then(Value::as_str)
      .ok_or_else(|| AgentError::UnexpectedResponse {
        method: "get_state".to_string(),
        value: value.to_string(),
      })?
      .to_string();
    Ok(AgentState { job_state })
  }

  async fn apply(&self, spec: &ApplySpec) -> Result<(), AgentError> {
    let spec_value = serde_json::to_value(spec).expect("apply spec serializes");
    self.send_and_track("apply", vec![spec_value]).await
  }

  async fn start(&self) -> Result<(), AgentError> {
    self.send_and_track("start", vec![]).await
  }

  async fn stop(&self) -> Result<(), AgentError> {
    self.send_and_track("stop", vec![]).await
  }

  async fn list_disk(&self) -> Result<Vec<String>, AgentError> {
    let value = self.send("list_disk", vec![]).await?;
    let disks = value.as_array().ok_or_else(|| AgentError::UnexpectedResponse {
      method: "list_disk".to_string(),
      value: value.to_string(),
    })?;
    Ok(
      disks
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect(),
    )
  }

  async fn mount_disk(&self, disk_cid: &str) -> Result<(), AgentError> {
    self.send_and_track("mount_disk", vec![json!(disk_cid)]).await
  }

  async fn unmount_disk(&self, disk_cid: &str) -> Result<(), AgentError> {
    self.send_and_track("unmount_disk", vec![json!(disk_cid)]).await
  }

  async fn migrate_disk(&self, from_disk_cid: &str, to_disk_cid: &str) -> Result<(), AgentError> {
    self
      .send_and_track("migrate_disk", vec![json!(from_disk_cid), json!(to_disk_cid)])
      .await
  }
}
