//! Instance lifecycle: validate, bind, register, serve
//!
//! An instance wraps one engine behind one listener. Startup order matters:
//! the listener is bound first so the registry is never told about an
//! address that cannot accept connections, and a refused registration aborts
//! before any request is served.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info};

use udslab_engine::DiagnosticEngine;

use crate::error::NodeError;
use crate::registry::{register_instance, InstanceRecord};
use crate::wire::{FrameError, UdsHttpFrame};

/// Identity the registry stores and shows for this device
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// Which listener the instance serves on
#[derive(Debug, Clone)]
pub enum ListenerConfig {
    Unix { path: PathBuf },
    Tcp { addr: String },
}

impl ListenerConfig {
    /// Default unix socket path for a named instance: `<cwd>/<name>.uds.sock`
    pub fn default_unix_for(name: &str) -> Self {
        let dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp"));
        Self::Unix {
            path: dir.join(format!("{name}.uds.sock")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub info: InstanceInfo,
    pub listener: ListenerConfig,
    pub registry_url: String,
    /// Skip the registration call entirely (standalone/test operation)
    pub register: bool,
}

/// A validated but not yet bound instance
pub struct Instance {
    engine: Arc<DiagnosticEngine>,
    config: InstanceConfig,
}

impl Instance {
    pub fn new(engine: Arc<DiagnosticEngine>, config: InstanceConfig) -> Result<Self, NodeError> {
        if config.info.id.is_empty() {
            return Err(NodeError::EmptyField { field: "info.id" });
        }
        if config.info.name.is_empty() {
            return Err(NodeError::EmptyField { field: "info.name" });
        }
        if config.register && config.registry_url.is_empty() {
            return Err(NodeError::EmptyField {
                field: "registry_url",
            });
        }
        Ok(Self { engine, config })
    }

    /// Bind the listener and, unless disabled, register with the registry.
    pub async fn bind(self) -> Result<BoundInstance, NodeError> {
        let listener = match &self.config.listener {
            ListenerConfig::Tcp { addr } => {
                let listener = TcpListener::bind(addr).await.map_err(|source| {
                    NodeError::Bind {
                        addr: addr.clone(),
                        source,
                    }
                })?;
                BoundListener::Tcp(listener)
            }
            ListenerConfig::Unix { path } => {
                // a stale socket file from a previous run would fail the bind
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path).map_err(|source| NodeError::Bind {
                    addr: path.display().to_string(),
                    source,
                })?;
                BoundListener::Unix(listener, path.clone())
            }
        };

        let external_addr = listener.external_addr()?;
        info!(addr = %external_addr, "Listener bound");

        if self.config.register {
            let record = InstanceRecord {
                id: self.config.info.id.clone(),
                name: self.config.info.name.clone(),
                description: self.config.info.description.clone(),
                addr: external_addr.clone(),
            };
            register_instance(&self.config.registry_url, &record).await?;
        }

        Ok(BoundInstance {
            engine: self.engine,
            listener,
            external_addr,
        })
    }
}

enum BoundListener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl BoundListener {
    fn external_addr(&self) -> Result<String, NodeError> {
        match self {
            Self::Tcp(listener) => Ok(format!("tcp:{}", listener.local_addr()?)),
            Self::Unix(_, path) => Ok(format!("unix:{}", path.display())),
        }
    }
}

/// An instance with its listener bound and registration done
pub struct BoundInstance {
    engine: Arc<DiagnosticEngine>,
    listener: BoundListener,
    external_addr: String,
}

impl std::fmt::Debug for BoundInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundInstance")
            .field("external_addr", &self.external_addr)
            .finish_non_exhaustive()
    }
}

impl BoundInstance {
    /// The address the registry was told, `<network>:<address>`.
    pub fn external_addr(&self) -> &str {
        &self.external_addr
    }

    /// Serve requests until the process ends.
    pub async fn serve(self) -> Result<(), NodeError> {
        let app = router(self.engine);
        match self.listener {
            BoundListener::Tcp(listener) => axum::serve(listener, app).await?,
            BoundListener::Unix(listener, _) => axum::serve(listener, app).await?,
        }
        Ok(())
    }
}

/// The instance HTTP surface: `POST /uds`.
pub fn router(engine: Arc<DiagnosticEngine>) -> Router {
    Router::new()
        .route("/uds", post(handle_uds))
        .with_state(engine)
}

async fn handle_uds(
    State(engine): State<Arc<DiagnosticEngine>>,
    Json(frame): Json<UdsHttpFrame>,
) -> Result<Json<UdsHttpFrame>, FrameError> {
    let request = frame.to_request()?;
    debug!(sid = %frame.sid, bytes = request.payload.len(), "Received UDS request");
    let response = engine.handle_request(&request);
    Ok(Json(UdsHttpFrame::from_response(&response)))
}
