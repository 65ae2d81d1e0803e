//! AlertNotifier - forwards alert lifecycle events to a webhook
//!
//! ```text
//! AlertEngine ──broadcast──▶ AlertNotifier ──POST──▶ webhook
//! ```
//!
//! Delivery is best effort. A failed POST is logged and dropped; alert state
//! never depends on it.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, instrument, trace, warn};

use crate::config::WebhookConfig;
use crate::storage::{AlertStatus, Severity};

use super::messages::{AlertEvent, AlertEventKind};

/// JSON body sent for every delivered event
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub event: AlertEventKind,
    pub alert_id: i64,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub alert_type: String,
    pub device: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

impl From<&AlertEvent> for WebhookPayload {
    fn from(event: &AlertEvent) -> Self {
        let alert = &event.alert;
        Self {
            event: event.kind,
            alert_id: alert.id,
            title: alert.title.clone(),
            message: alert.message.clone(),
            severity: alert.severity,
            status: alert.status,
            alert_type: alert.alert_type.clone(),
            device: alert.device_id.clone(),
            context: alert.context.clone(),
            created_at: alert.created_at,
        }
    }
}

pub enum NotifierCommand {
    Shutdown,
}

pub struct AlertNotifier {
    client: reqwest::Client,
    url: String,
    events: broadcast::Receiver<AlertEvent>,
    command_rx: mpsc::Receiver<NotifierCommand>,
}

impl AlertNotifier {
    pub fn new(
        config: &WebhookConfig,
        events: broadcast::Receiver<AlertEvent>,
        command_rx: mpsc::Receiver<NotifierCommand>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build webhook client")?;

        Ok(Self {
            client,
            url: config.url.clone(),
            events,
            command_rx,
        })
    }

    #[instrument(skip(self), fields(url = %self.url))]
    pub async fn run(mut self) {
        debug!("starting alert notifier");

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => self.handle(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("notifier lagged, dropped {} alert events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("alert event channel closed");
                        break;
                    }
                },

                cmd = self.command_rx.recv() => match cmd {
                    Some(NotifierCommand::Shutdown) | None => break,
                },
            }
        }

        debug!("alert notifier stopped");
    }

    async fn handle(&self, event: AlertEvent) {
        if event.kind == AlertEventKind::Acknowledged {
            trace!("not forwarding acknowledgement of alert {}", event.alert.id);
            return;
        }

        if let Err(e) = self.send(&WebhookPayload::from(&event)).await {
            warn!("failed to deliver alert {}: {:#}", event.alert.id, e);
        }
    }

    async fn send(&self, payload: &WebhookPayload) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .context("failed to send webhook request")?;

        if !response.status().is_success() {
            anyhow::bail!("webhook returned {}", response.status());
        }

        trace!("delivered {:?} for alert {}", payload.event, payload.alert_id);
        Ok(())
    }
}

/// Handle for a running [`AlertNotifier`]
#[derive(Clone)]
pub struct NotifierHandle {
    sender: mpsc::Sender<NotifierCommand>,
}

impl NotifierHandle {
    pub fn spawn(config: &WebhookConfig, events: broadcast::Receiver<AlertEvent>) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let actor = AlertNotifier::new(config, events, cmd_rx)?;
        tokio::spawn(actor.run());
        Ok(Self { sender: cmd_tx })
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(NotifierCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
