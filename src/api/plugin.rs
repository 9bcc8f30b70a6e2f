//! Volume Plugin Server
//!
//! JSON-over-HTTP volume plugin protocol, served on a Unix socket in the
//! container engine's plugin directory and optionally on TCP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Request, State},
    routing::post,
    Json, Router,
};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::driver::VolumeDriver;
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    pub driver: Arc<VolumeDriver>,
}

/// Volume plugin server
pub struct PluginServer {
    socket_path: PathBuf,
    bind_address: Option<String>,
    state: Arc<AppState>,
}

impl PluginServer {
    pub fn new(
        socket_path: PathBuf,
        bind_address: Option<String>,
        driver: Arc<VolumeDriver>,
    ) -> Self {
        Self {
            socket_path,
            bind_address,
            state: Arc::new(AppState { driver }),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/Plugin.Activate", post(handle_activate))
            .route("/VolumeDriver.Create", post(handle_create))
            .route("/VolumeDriver.Remove", post(handle_remove))
            .route("/VolumeDriver.Get", post(handle_get))
            .route("/VolumeDriver.List", post(handle_list))
            .route("/VolumeDriver.Path", post(handle_path))
            .route("/VolumeDriver.Mount", post(handle_mount))
            .route("/VolumeDriver.Unmount", post(handle_unmount))
            .route("/VolumeDriver.Capabilities", post(handle_capabilities))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until a listener fails
    pub async fn start(&self) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));

        match &self.bind_address {
            Some(address) => {
                tokio::try_join!(
                    serve_unix(&self.socket_path, app.clone()),
                    serve_tcp(address, app)
                )?;
            }
            None => serve_unix(&self.socket_path, app).await?,
        }
        Ok(())
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            tracing::debug!("Socket {} not removed: {}", self.socket_path.display(), e);
        }
    }
}

async fn serve_unix(socket_path: &Path, app: Router) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Remove stale socket
    if socket_path.exists() {
        tokio::fs::remove_file(socket_path).await?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!("Volume plugin listening on {}", socket_path.display());

    loop {
        let (stream, _addr) = listener.accept().await?;
        let app = app.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                app.clone().oneshot(request)
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("Plugin connection error: {}", e);
            }
        });
    }
}

async fn serve_tcp(address: &str, app: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!("Volume plugin listening on {}", address);

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {}", e)))
}

// ============ Request/Response Types ============

/// Request body shared by the volume calls; absent fields default
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeRequest {
    pub name: String,
    pub opts: Option<HashMap<String, String>>,
    #[serde(rename = "ID")]
    pub id: String,
}

/// Plugin activation response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    pub implements: Vec<String>,
}

/// A volume as the container engine sees it
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeEntry {
    pub name: String,
    pub mountpoint: String,
}

/// Capabilities payload
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesEntry {
    pub scope: String,
}

/// Every volume call answers with this envelope; `Err` is empty on success
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<VolumeEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitiesEntry>,
    #[serde(default)]
    pub err: String,
}

impl PluginResponse {
    fn ok() -> Self {
        Self::default()
    }

    fn error(e: &Error) -> Self {
        Self {
            err: e.to_string(),
            ..Self::default()
        }
    }
}

fn parse_request(body: &Bytes) -> Result<VolumeRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(VolumeRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| Error::InvalidArgument(format!("invalid request body: {}", e)))
}

/// Run a driver call off the async runtime; driver calls block on file I/O
/// and the process-wide lock
async fn call<T, F>(state: &AppState, body: &Bytes, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&VolumeDriver, VolumeRequest) -> Result<T> + Send + 'static,
{
    let request = parse_request(body)?;
    let driver = Arc::clone(&state.driver);
    tokio::task::spawn_blocking(move || f(driver.as_ref(), request))
        .await
        .map_err(|e| Error::Internal(format!("driver task failed: {}", e)))?
}

fn respond<T>(
    op: &str,
    result: Result<T>,
    ok: impl FnOnce(T) -> PluginResponse,
) -> Json<PluginResponse> {
    match result {
        Ok(value) => Json(ok(value)),
        Err(e) => {
            tracing::warn!("{} failed: {}", op, e);
            Json(PluginResponse::error(&e))
        }
    }
}

fn entry(name: String, mountpoint: &Path) -> VolumeEntry {
    VolumeEntry {
        name,
        mountpoint: mountpoint.display().to_string(),
    }
}

// ============ Handlers ============

async fn handle_activate() -> Json<ActivateResponse> {
    Json(ActivateResponse {
        implements: vec!["VolumeDriver".to_string()],
    })
}

async fn handle_create(State(state): State<Arc<AppState>>, body: Bytes) -> Json<PluginResponse> {
    let result = call(&state, &body, |driver, req| {
        driver.create(&req.name, &req.opts.unwrap_or_default())
    })
    .await;
    respond("Create", result, |_| PluginResponse::ok())
}

async fn handle_remove(State(state): State<Arc<AppState>>, body: Bytes) -> Json<PluginResponse> {
    let result = call(&state, &body, |driver, req| driver.remove(&req.name)).await;
    respond("Remove", result, |_| PluginResponse::ok())
}

async fn handle_get(State(state): State<Arc<AppState>>, body: Bytes) -> Json<PluginResponse> {
    let result = call(&state, &body, |driver, req| driver.get(&req.name)).await;
    respond("Get", result, |info| PluginResponse {
        volume: Some(entry(info.name, &info.mountpoint)),
        ..PluginResponse::ok()
    })
}

async fn handle_list(State(state): State<Arc<AppState>>, body: Bytes) -> Json<PluginResponse> {
    let result = call(&state, &body, |driver, _| driver.list()).await;
    respond("List", result, |volumes| PluginResponse {
        volumes: Some(
            volumes
                .into_iter()
                .map(|info| entry(info.name, &info.mountpoint))
                .collect(),
        ),
        ..PluginResponse::ok()
    })
}

async fn handle_path(State(state): State<Arc<AppState>>, body: Bytes) -> Json<PluginResponse> {
    let result = call(&state, &body, |driver, req| driver.path(&req.name)).await;
    respond("Path", result, |path| PluginResponse {
        mountpoint: Some(path.display().to_string()),
        ..PluginResponse::ok()
    })
}

async fn handle_mount(State(state): State<Arc<AppState>>, body: Bytes) -> Json<PluginResponse> {
    let result = call(&state, &body, |driver, req| driver.mount(&req.name, &req.id)).await;
    respond("Mount", result, |path| PluginResponse {
        mountpoint: Some(path.display().to_string()),
        ..PluginResponse::ok()
    })
}

async fn handle_unmount(State(state): State<Arc<AppState>>, body: Bytes) -> Json<PluginResponse> {
    let result = call(&state, &body, |driver, req| driver.unmount(&req.name, &req.id)).await;
    respond("Unmount", result, |_| PluginResponse::ok())
}

async fn handle_capabilities(State(state): State<Arc<AppState>>) -> Json<PluginResponse> {
    Json(PluginResponse {
        capabilities: Some(CapabilitiesEntry {
            scope: state.driver.capabilities().scope.as_str().to_string(),
        }),
        ..PluginResponse::ok()
    })
}
