//! Session: one client connection, one upstream connection and the two pumps between them.
//!
//! The session ends as soon as either pump stops. The other pump is told to stop through the
//! shutdown channel, then both write sides are shut down and both connections dropped.

use crate::config::Config;
use crate::framing::DEFAULT_MAX_FRAME_BYTES;
use crate::metrics::Metrics;
use crate::pump::{Direction, Pump, PumpExit};
use crate::rectifier::Rectifier;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinError;
use tracing::{debug, error, info, Instrument};

/// Per-session settings taken from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub rectify_client_to_server: bool,
    pub rectify_server_to_client: bool,
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rectify_client_to_server: true,
            rectify_server_to_client: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            rectify_client_to_server: config.rectify.client_to_server,
            rectify_server_to_client: config.rectify.server_to_client,
            max_frame_bytes: config.max_frame_bytes(),
        }
    }
}

pub struct Session {
    rectifier: Rectifier,
    config: SessionConfig,
    metrics: Arc<Metrics>,
}

impl Session {
    pub fn new(rectifier: Rectifier, config: SessionConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            rectifier,
            config,
            metrics,
        }
    }

    fn rectifier_for(&self, enabled: bool) -> Option<Rectifier> {
        enabled.then(|| self.rectifier.clone())
    }

    /// Pump frames between `client` and `upstream` until either side closes or fails.
    /// Returns the first fatal error, if the session ended on one.
    pub async fn run<C, U>(self, client: C, upstream: U) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        U: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (upstream_read, upstream_write) = tokio::io::split(upstream);
        let client_write = Arc::new(Mutex::new(client_write));
        let upstream_write = Arc::new(Mutex::new(upstream_write));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let to_server = Pump::new(
            Direction::ClientToServer,
            client_read,
            Arc::clone(&upstream_write),
            Arc::clone(&client_write),
            self.rectifier_for(self.config.rectify_client_to_server),
            self.config.max_frame_bytes,
            Arc::clone(&self.metrics),
        );
        let to_client = Pump::new(
            Direction::ServerToClient,
            upstream_read,
            Arc::clone(&client_write),
            Arc::clone(&upstream_write),
            self.rectifier_for(self.config.rectify_server_to_client),
            self.config.max_frame_bytes,
            Arc::clone(&self.metrics),
        );

        self.metrics.session_started();
        info!("Session started");

        let mut to_server = tokio::spawn(to_server.run(shutdown_rx.clone()).in_current_span());
        let mut to_client = tokio::spawn(to_client.run(shutdown_rx).in_current_span());

        let (first_direction, first) = tokio::select! {
            r = &mut to_server => (Direction::ClientToServer, r),
            r = &mut to_client => (Direction::ServerToClient, r),
        };
        let (other_direction, other) = match first_direction {
            Direction::ClientToServer => (Direction::ServerToClient, to_client),
            Direction::ServerToClient => (Direction::ClientToServer, to_server),
        };
        debug!("{} pump finished first, stopping {}", first_direction, other_direction);

        let first = pump_result(first_direction, first);
        let _ = shutdown_tx.send(true);
        let second = pump_result(other_direction, other.await);

        if let Err(e) = client_write.lock().await.shutdown().await {
            debug!("Client shutdown: {}", e);
        }
        if let Err(e) = upstream_write.lock().await.shutdown().await {
            debug!("Upstream shutdown: {}", e);
        }
        drop(client_write);
        drop(upstream_write);

        self.metrics.session_ended();
        let result = first.and(second);
        match &result {
            Ok(()) => info!("Session closed"),
            Err(e) => {
                self.metrics.inc_session_error();
                info!("Session closed on error: {:#}", e);
            }
        }
        result
    }
}

/// Fold a pump's join result into the session outcome; a panicked pump counts as a fatal error.
fn pump_result(
    direction: Direction,
    joined: std::result::Result<Result<PumpExit>, JoinError>,
) -> Result<()> {
    match joined {
        Ok(Ok(exit)) => {
            debug!("{} pump exited: {:?}", direction, exit);
            Ok(())
        }
        Ok(Err(e)) => Err(e),
        Err(e) => {
            error!("{} pump task failed: {}", direction, e);
            Err(anyhow!("{} pump task failed: {}", direction, e))
        }
    }
}
