//! Process shutdown: stop the listener, then drain connection tasks.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default bound on [`ShutdownCoordinator::drain`].
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Listener stop signal plus the tracker every connection task joins.
pub struct ShutdownCoordinator {
    stop: CancellationToken,
    connections: TaskTracker,
}

impl ShutdownCoordinator {
    /// Fresh coordinator; nothing stopped, nothing tracked.
    pub fn new() -> Self {
        Self {
            stop: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }

    /// Token the listener watches to stop accepting.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Tracker for connection tasks.
    pub fn connections(&self) -> &TaskTracker {
        &self.connections
    }

    /// Stop accepting connections. Idempotent.
    pub fn begin(&self) {
        self.stop.cancel();
    }

    /// Whether [`begin`](Self::begin) has run.
    pub fn is_draining(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Stop accepting, then wait up to `timeout` for every tracked
    /// connection and every handle in `others`. `false` on timeout.
    pub async fn drain(&self, others: Vec<JoinHandle<()>>, timeout: Option<Duration>) -> bool {
        let limit = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.begin();
        let _ = self.connections.close();
        info!(
            connections = self.connections.len(),
            other_tasks = others.len(),
            limit_ms = limit.as_millis(),
            "draining"
        );

        let connections = self.connections.clone();
        let all_done = async move {
            connections.wait().await;
            for joined in join_all(others).await {
                if let Err(e) = joined {
                    warn!(error = %e, "task failed while draining");
                }
            }
        };

        match tokio::time::timeout(limit, all_done).await {
            Ok(()) => true,
            Err(_) => {
                warn!(?limit, remaining = self.connections.len(), "drain deadline passed");
                false
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
