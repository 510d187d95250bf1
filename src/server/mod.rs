//! HTTP surface: the `/ws` subscription endpoint plus a small status API.

mod connection;
mod handlers;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::hub::Hub;
use crate::shutdown::ShutdownSignal;

/// Per-connection I/O bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub write_timeout: Duration,
    pub ping_interval: Duration,
}

impl From<&Config> for ConnectionSettings {
    fn from(config: &Config) -> Self {
        Self {
            write_timeout: config.write_timeout,
            ping_interval: config.ping_interval,
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub(crate) hub: Arc<Hub>,
    pub(crate) shutdown: ShutdownSignal,
    pub(crate) settings: ConnectionSettings,
    pub(crate) connections: ConnectionTracker,
}

impl ServerState {
    pub fn new(hub: Arc<Hub>, shutdown: ShutdownSignal, settings: ConnectionSettings) -> Self {
        Self {
            hub,
            shutdown,
            settings,
            connections: ConnectionTracker::default(),
        }
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }
}

/// Counts live connection tasks so shutdown can wait for them to finish.
#[derive(Clone, Debug)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<usize>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }
}

impl ConnectionTracker {
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    pub(crate) fn enter(&self) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        ConnectionGuard {
            active: self.active.clone(),
        }
    }

    /// Waits until no connection task is running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        // `wait_for` cannot fail while `self` holds the sender.
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        )
    }
}

pub(crate) struct ConnectionGuard {
    active: Arc<watch::Sender<usize>>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(connection::handle_upgrade))
        .route("/api/v1/health", get(handlers::handle_health))
        .route("/api/v1/snapshot", get(handlers::handle_snapshot))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::Bind {
            addr,
            message: e.to_string(),
        })
}

/// Serves until the shutdown signal fires, then stops accepting.
pub async fn serve(listener: TcpListener, state: ServerState) -> Result<(), ServerError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    let mut shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .map_err(|e| ServerError::Serve(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// The listen address could not be bound (port in use, no permission).
    Bind { addr: SocketAddr, message: String },
    Serve(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind { addr, message } => {
                write!(f, "failed to bind {}: {}", addr, message)
            }
            ServerError::Serve(msg) => write!(f, "server error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}
