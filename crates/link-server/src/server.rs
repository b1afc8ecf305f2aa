//! Axum WebSocket listener.
//!
//! Every path upgrades; the path picks the session kind. Connections past
//! the configured limit are refused with 503 before the upgrade.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use link_device::{BleBackend, BtBackend};
use metrics::counter;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::manager::SessionManager;
use crate::session::SessionKind;

/// Failure to start the listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Host is not a loopback address.
    #[error("refusing to bind non-loopback host {0}")]
    NotLoopback(String),
    /// Host is not an IP address or `localhost`.
    #[error("invalid host {0}")]
    InvalidHost(String),
    /// Bind or accept failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Shared state for the upgrade handler.
pub struct AppState<BLE: BleBackend, BT: BtBackend> {
    /// The process-wide Session Manager.
    pub manager: Arc<SessionManager<BLE, BT>>,
}

impl<BLE: BleBackend, BT: BtBackend> Clone for AppState<BLE, BT> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

/// Build the router. Every path is a WebSocket endpoint.
pub fn build_router<BLE: BleBackend, BT: BtBackend>(state: AppState<BLE, BT>) -> Router {
    Router::new()
        .fallback(ws_handler::<BLE, BT>)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind the loopback listener and start serving. Returns a handle to stop it.
pub async fn start<BLE: BleBackend, BT: BtBackend>(
    manager: Arc<SessionManager<BLE, BT>>,
) -> Result<ServerHandle<BLE, BT>, ServerError> {
    let server = &manager.config().server;
    let addr = loopback_addr(&server.host, server.port)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, max_connections = server.max_connections, "gateway listening");

    let router = build_router(AppState {
        manager: Arc::clone(&manager),
    });
    let token = manager.shutdown_coordinator().stop_token();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(token.cancelled_owned())
            .await
        {
            warn!(error = %e, "listener failed");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        manager,
        server,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle<BLE: BleBackend, BT: BtBackend> {
    addr: SocketAddr,
    manager: Arc<SessionManager<BLE, BT>>,
    server: JoinHandle<()>,
}

impl<BLE: BleBackend, BT: BtBackend> ServerHandle<BLE, BT> {
    /// Bound address (useful with port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The Session Manager serving this listener.
    pub fn manager(&self) -> &Arc<SessionManager<BLE, BT>> {
        &self.manager
    }

    /// Stop accepting, close every session, and wait for them to release
    /// their backends. Returns `false` if the wait timed out.
    pub async fn shutdown(self, timeout: Option<Duration>) -> bool {
        let coordinator = self.manager.shutdown_coordinator();
        coordinator.begin();
        let _ = self.manager.close_all("server shutting down");
        coordinator.drain(vec![self.server], timeout).await
    }
}

async fn ws_handler<BLE: BleBackend, BT: BtBackend>(
    State(state): State<AppState<BLE, BT>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(permit) = state.manager.try_admit() else {
        warn!(path = uri.path(), "connection refused, no free slots");
        counter!("ws_connections_refused_total").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let kind = SessionKind::from_path(uri.path());
    let max = state.manager.config().server.transport.max_message_size;
    let manager = state.manager;
    // Frames up to twice the limit still reach the session so it can answer
    // with message-too-large; anything larger is dropped by the codec.
    ws.max_message_size(max.saturating_mul(2))
        .max_frame_size(max.saturating_mul(2))
        .on_upgrade(move |socket| {
            let tracked = manager.shutdown_coordinator().connections().clone();
            tracked.track_future(manager.serve(socket, kind, permit))
        })
}

fn loopback_addr(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let ip = if host.eq_ignore_ascii_case("localhost") {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        host.parse::<IpAddr>().map_err(|_| ServerError::InvalidHost(host.to_owned()))?
    };
    if !ip.is_loopback() {
        return Err(ServerError::NotLoopback(host.to_owned()));
    }
    Ok(SocketAddr::new(ip, port))
}
