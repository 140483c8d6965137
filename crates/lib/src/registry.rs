//! Agent settings registry.
//!
//! During `create_vm` the CPI stores the new agent's settings here, and the
//! agent fetches them on boot. The server lives only for the duration of one
//! orchestrator invocation:
//!
//! - `PUT /instances/{instance_id}/settings` stores the settings blob
//! - `GET /instances/{instance_id}/settings` returns the last PUT or 404

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("binding registry on {addr}: {source}")]
  Bind {
    addr: String,
    #[source]
    source: std::io::Error,
  },

  #[error("registry server failed: {0}")]
  Serve(#[source] std::io::Error),
}

type Settings = Arc<Mutex<HashMap<String, serde_json::Value>>>;

async fn get_settings(Path(instance_id): Path<String>, State(settings): State<Settings>) -> Response {
  let settings = settings.lock().expect("settings poisoned");
  match settings.get(&instance_id) {
    Some(value) => Json(value.clone()).into_response(),
    None => StatusCode::NOT_FOUND.into_response(),
  }
}

async fn put_settings(
  Path(instance_id): Path<String>,
  State(settings): State<Settings>,
  Json(body): Json<serde_json::Value>,
) -> StatusCode {
  let mut settings = settings.lock().expect("settings poisoned");
  settings.insert(instance_id, body);
  StatusCode::CREATED
}

/// A running registry server; dropped or stopped when the command ends.
#[derive(Debug)]
pub struct RegistryServer {
  addr: SocketAddr,
  shutdown_tx: oneshot::Sender<()>,
  handle: JoinHandle<Result<(), RegistryError>>,
}

impl RegistryServer {
  /// Bind and start serving. Port 0 picks an ephemeral port.
  pub async fn start(host: &str, port: u16) -> Result<Self, RegistryError> {
    let bind_addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&bind_addr)
      .await
      .map_err(|source| RegistryError::Bind {
        addr: bind_addr.clone(),
        source,
      })?;
    let addr = listener.local_addr().map_err(|source| RegistryError::Bind {
      addr: bind_addr,
      source,
    })?;

    let settings: Settings = Arc::new(Mutex::new(HashMap::new()));
    let app = Router::new()
      .route("/instances/{instance_id}/settings", get(get_settings).put(put_settings))
      .with_state(settings);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
      axum::serve(listener, app)
        .with_graceful_shutdown(async {
          let _ = shutdown_rx.await;
        })
        .await
        .map_err(RegistryError::Serve)
    });

    info!(addr = %addr, "registry started");
    Ok(Self {
      addr,
      shutdown_tx,
      handle,
    })
  }

  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  pub fn port(&self) -> u16 {
    self.addr.port()
  }

  /// Shut the server down and wait for it to finish.
  pub async fn stop(self) -> Result<(), RegistryError> {
    let _ = self.shutdown_tx.send(());
    match self.handle.await {
      Ok(result) => result,
      // The serve task never panics; a join error means it was cancelled.
      Err(_) => Ok(()),
    }
  }
}
