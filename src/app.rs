//! Process wiring: poller, hub and server built from one `Config`.
//!
//! Shutdown order once the signal fires:
//! 1. the listener stops accepting and new upgrades are refused
//! 2. the poller finishes its in-flight cycle and exits
//! 3. the hub closes, ending every feed; connection tasks send a close frame
//! 4. `wait` returns when the connection tasks are gone or the drain
//!    timeout expires

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::hub::{Hub, HubStats};
use crate::poller::{Poller, PollerStats};
use crate::region::FileRegion;
use crate::server::{self, ConnectionSettings, ConnectionTracker, ServerError, ServerState};
use crate::shutdown::Shutdown;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Server(ServerError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(e) => write!(f, "invalid configuration: {}", e),
            AppError::Server(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(e) => Some(e),
            AppError::Server(e) => Some(e),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Config(e)
    }
}

impl From<ServerError> for AppError {
    fn from(e: ServerError) -> Self {
        AppError::Server(e)
    }
}

/// Final counters, logged on exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub poller: PollerStats,
    pub hub: HubStats,
    /// Connection tasks still running when the drain timeout expired.
    pub undrained: usize,
}

/// A started instance.
pub struct App {
    addr: SocketAddr,
    hub: Arc<Hub>,
    shutdown: Shutdown,
    connections: ConnectionTracker,
    drain_timeout: Duration,
    server: JoinHandle<Result<(), ServerError>>,
    poller: JoinHandle<PollerStats>,
}

/// Validates `config`, binds the listener and spawns the poller and server.
///
/// Returns once the listener is bound, so a bind failure surfaces here.
pub async fn start(config: Config, shutdown: Shutdown) -> Result<App, AppError> {
    config.validate()?;

    let hub = Arc::new(Hub::new());
    let listener = server::bind(config.listen_addr()).await?;
    let addr = listener.local_addr().map_err(|e| ServerError::Bind {
        addr: config.listen_addr(),
        message: e.to_string(),
    })?;

    let region = FileRegion::new(config.region_path.clone(), config.region_map_len);
    info!(
        region = %region.path().display(),
        interval_ms = config.poll_interval.as_millis() as u64,
        "watching shared region"
    );
    let poller = Poller::new(region, hub.clone(), config.poll_interval);
    let poller = tokio::spawn(poller.run(shutdown.signal()));

    let state = ServerState::new(
        hub.clone(),
        shutdown.signal(),
        ConnectionSettings::from(&config),
    );
    let connections = state.connections().clone();
    let server = tokio::spawn(server::serve(listener, state));

    Ok(App {
        addr,
        hub,
        shutdown,
        connections,
        drain_timeout: config.drain_timeout,
        server,
        poller,
    })
}

/// Runs until `shutdown` fires, then drains.
pub async fn run(config: Config, shutdown: Shutdown) -> Result<ShutdownReport, AppError> {
    start(config, shutdown).await?.wait().await
}

impl App {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Blocks until shutdown (or a fatal server error) and tears down in order.
    pub async fn wait(mut self) -> Result<ShutdownReport, AppError> {
        let mut signal = self.shutdown.signal();
        let mut server_result = None;
        tokio::select! {
            _ = signal.wait() => {}
            res = &mut self.server => {
                // The server only returns on its own after a fatal error.
                server_result = Some(flatten(res));
                self.shutdown.trigger();
            }
        }
        info!("shutting down");

        let poller = match (&mut self.poller).await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "poller task failed");
                PollerStats::default()
            }
        };

        self.hub.close();
        let undrained = if self.connections.wait_idle(self.drain_timeout).await {
            0
        } else {
            let left = self.connections.active();
            warn!(left, "drain timeout expired with open connections");
            left
        };

        let server_result = match server_result {
            Some(res) => res,
            None => match tokio::time::timeout(self.drain_timeout, &mut self.server).await {
                Ok(res) => flatten(res),
                Err(_) => {
                    warn!("listener did not stop within drain timeout");
                    self.server.abort();
                    Ok(())
                }
            },
        };

        let report = ShutdownReport {
            poller,
            hub: self.hub.stats(),
            undrained,
        };
        info!(
            cycles = report.poller.cycles,
            published = report.poller.published,
            subscribers_served = report.hub.registered_total,
            undrained,
            "stopped"
        );
        server_result.map(|()| report).map_err(AppError::from)
    }
}

fn flatten(
    res: Result<Result<(), ServerError>, tokio::task::JoinError>,
) -> Result<(), ServerError> {
    res.map_err(|e| ServerError::Serve(e.to_string()))?
}
