use crate::manager::QueueManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Periodically deletes failed-job records older than a retention window.
#[derive(Debug, Clone)]
pub struct FailedJobPruner {
    manager: Arc<QueueManager>,
    retention: Duration,
    interval: Duration,
    connections: Vec<String>,
}

impl FailedJobPruner {
    /// Prune every connection of `manager`, keeping `retention` worth of
    /// records.
    pub fn new(manager: Arc<QueueManager>, retention: Duration) -> Self {
        let connections = manager.connection_names().map(String::from).collect();
        Self {
            manager,
            retention,
            interval: DEFAULT_INTERVAL,
            connections,
        }
    }

    /// Set how often to prune.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Only prune these connections.
    pub fn connections(mut self, connections: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.connections = connections.into_iter().map(Into::into).collect();
        self
    }

    /// Run one pass over every connection and return the number of records
    /// deleted. A connection that fails is logged and skipped.
    pub async fn prune_once(&self) -> u64 {
        let mut deleted = 0;
        for connection in &self.connections {
            match self
                .manager
                .prune_failed(self.retention, Some(connection))
                .await
            {
                Ok(count) => {
                    debug!(%connection, count, "Pruned failed jobs");
                    deleted += count;
                }
                Err(error) => warn!(%connection, %error, "Failed to prune failed jobs"),
            }
        }
        deleted
    }

    /// Prune on every interval tick until `shutdown` is cancelled.
    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let deleted = self.prune_once().await;
                        if deleted > 0 {
                            info!(deleted, "Pruned old failed jobs");
                        }
                    }
                }
            }
        })
    }
}
