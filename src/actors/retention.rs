//! RetentionActor - deletes metric samples past the retention window
//!
//! Runs once at startup, then every [`CLEANUP_INTERVAL`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace};

use crate::storage::StorageBackend;

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

pub enum RetentionCommand {
    /// Run a cleanup now and report how many samples were deleted
    CleanupNow {
        respond_to: oneshot::Sender<usize>,
    },
    Shutdown,
}

pub struct RetentionActor {
    backend: Arc<dyn StorageBackend>,
    retention_days: u32,
    command_rx: mpsc::Receiver<RetentionCommand>,
}

impl RetentionActor {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        retention_days: u32,
        command_rx: mpsc::Receiver<RetentionCommand>,
    ) -> Self {
        Self {
            backend,
            retention_days,
            command_rx,
        }
    }

    #[instrument(skip(self), fields(retention_days = self.retention_days))]
    pub async fn run(mut self) {
        debug!("starting retention actor");

        // First tick fires immediately: that is the startup cleanup.
        let mut ticker = time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cleanup().await;
                }

                cmd = self.command_rx.recv() => match cmd {
                    Some(RetentionCommand::CleanupNow { respond_to }) => {
                        let deleted = self.cleanup().await;
                        let _ = respond_to.send(deleted);
                    }
                    Some(RetentionCommand::Shutdown) | None => break,
                },
            }
        }

        debug!("retention actor stopped");
    }

    async fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.retention_days));
        trace!("deleting samples before {}", cutoff);

        match self.backend.cleanup_old_metrics(cutoff).await {
            Ok(0) => {
                trace!("retention cleanup: nothing to delete");
                0
            }
            Ok(deleted) => {
                info!("retention cleanup deleted {} samples", deleted);
                deleted
            }
            Err(e) => {
                // Retried on the next tick.
                error!("retention cleanup failed: {}", e);
                0
            }
        }
    }
}

#[derive(Clone)]
pub struct RetentionHandle {
    sender: mpsc::Sender<RetentionCommand>,
}

impl RetentionHandle {
    pub fn spawn(backend: Arc<dyn StorageBackend>, retention_days: u32) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        tokio::spawn(RetentionActor::new(backend, retention_days, cmd_rx).run());
        Self { sender: cmd_tx }
    }

    pub async fn cleanup_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RetentionCommand::CleanupNow { respond_to: tx })
            .await
            .context("failed to send CleanupNow command")?;
        rx.await.context("failed to receive cleanup result")
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(RetentionCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
