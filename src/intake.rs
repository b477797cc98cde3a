//! HTTP intake.
//!
//! Accepts webhook callbacks shaped `GET /<prefix>/<apiKey>/<dataId>` with a
//! JSON body, validates the key, decodes the payload and hands the event to
//! the dispatch loop. Every failure mode is a per-request rejection; a
//! panicking handler is caught at the boundary and the listener keeps
//! serving.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{Event, TriggerEvent};

/// Requests with bodies beyond this are rejected while reading.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Static API keys, loaded once at startup.
///
/// Exact-match linear scan; the set is small and read-only, so concurrent
/// handler invocations share it without synchronisation.
#[derive(Debug, Clone, Default)]
pub struct ApiKeySet {
    keys: Vec<String>,
}

impl ApiKeySet {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }
}

/// Shared handler state: the key set and the dispatch channel sender.
pub struct IntakeState {
    keys: ApiKeySet,
    tx: mpsc::Sender<Event>,
}

impl IntakeState {
    pub fn new(keys: ApiKeySet, tx: mpsc::Sender<Event>) -> Self {
        Self { keys, tx }
    }
}

/// Intake listener settings.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    pub addr: String,
    pub port: u16,
    pub use_tls: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// A bound-but-not-yet-serving intake listener.
///
/// Binding and TLS material loading happen here so that failures surface
/// before the bridge reports itself started.
pub struct IntakeServer {
    listener: std::net::TcpListener,
    tls: Option<RustlsConfig>,
    local_addr: SocketAddr,
}

impl IntakeServer {
    pub async fn bind(config: IntakeConfig) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.addr, config.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", config.addr, config.port))?;

        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("binding intake listener on {addr}"))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let tls = if config.use_tls {
            let (cert, key) = config
                .cert_file
                .as_ref()
                .zip(config.key_file.as_ref())
                .context("TLS enabled but certificate or key path missing")?;
            Some(
                RustlsConfig::from_pem_file(cert, key)
                    .await
                    .context("loading TLS certificate and key")?,
            )
        } else {
            None
        };

        Ok(Self {
            listener,
            tls,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown token fires, then drain gracefully.
    pub async fn serve(self, state: Arc<IntakeState>, shutdown: CancellationToken) -> Result<()> {
        let app = router(state);

        match self.tls {
            Some(tls) => {
                info!(addr = %self.local_addr, "intake listening (TLS)");
                let handle = axum_server::Handle::new();
                let watcher = handle.clone();
                tokio::spawn(async move {
                    shutdown.cancelled().await;
                    watcher.graceful_shutdown(Some(Duration::from_secs(3)));
                });
                axum_server::from_tcp_rustls(self.listener, tls)
                    .handle(handle)
                    .serve(app.into_make_service())
                    .await?;
            }
            None => {
                info!(addr = %self.local_addr, "intake listening");
                let listener = tokio::net::TcpListener::from_std(self.listener)?;
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await?;
            }
        }

        Ok(())
    }
}

/// Build the intake router: one catch-all handler so the
/// `/<prefix>/<key>/<dataId>` shape is parsed from the raw path, wrapped in
/// a panic boundary.
pub fn router(state: Arc<IntakeState>) -> Router {
    Router::new()
        .fallback(handle_trigger)
        .layer(tower_http::catch_panic::CatchPanicLayer::custom(
            panic_response,
        ))
        .with_state(state)
}

async fn handle_trigger(State(state): State<Arc<IntakeState>>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    debug!(%method, %path, "intake request");

    if method != Method::GET {
        info!(%method, %path, "rejecting non-GET request");
        return StatusCode::NOT_FOUND.into_response();
    }

    // `/<prefix>/<key>/<dataId>`; the prefix is ignored and segments past
    // the third are ignored too.
    let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
    if segments.len() < 3 {
        info!(%path, "rejecting request with too few path segments");
        return StatusCode::NOT_FOUND.into_response();
    }
    let key = segments[1];
    let data_id = segments[2];

    if !state.keys.contains(key) {
        warn!(key, "rejecting request with invalid API key");
        return StatusCode::NOT_FOUND.into_response();
    }

    if data_id.is_empty() {
        info!(%path, "rejecting request with empty dataId");
        return StatusCode::NOT_FOUND.into_response();
    }

    let bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            info!("rejecting request, body read failed: {e}");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let payload: TriggerEvent = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(e) => {
            info!("rejecting request, payload decode failed: {e}");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let event = Event {
        data_id: data_id.to_string(),
        payload,
    };
    debug!(data_id = %event.data_id, "accepted event");

    // Blocks until the dispatch loop takes the event; back-pressure on the
    // webhook caller is intentional and there is no hand-off timeout.
    if state.tx.send(event).await.is_err() {
        warn!("dispatch channel closed, dropping event");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    StatusCode::OK.into_response()
}

/// Convert a handler panic into a logged rejection so one bad request cannot
/// take the listener down.
fn panic_response(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!("request handler panicked: {detail}");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
