//! MonitoringEngine - the operations exposed to callers (API layer, CLI)
//!
//! Wires the orchestrator, the alert engine and the remediation dispatcher
//! over one store, one inventory and one collector.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::actors::messages::{AlertEvent, CycleKind, CycleReport, DeviceReport};
use crate::actors::{NotifierHandle, PollingOrchestrator, RetentionHandle, ScheduleHandle};
use crate::collector::DeviceCollector;
use crate::config::{Config, StorageConfig};
use crate::error::EngineError;
use crate::inventory::Inventory;
use crate::remediation::{PlaybookRegistry, RemediationDispatcher, TaskId};
use crate::rules::{AlertEngine, default_rules};
use crate::storage::{
    Alert, AlertFilter, MetricIngestor, RemediationFilter, RemediationLog, StorageBackend,
};

struct Background {
    schedule: ScheduleHandle,
    notifier: Option<NotifierHandle>,
    retention: Option<RetentionHandle>,
}

pub struct MonitoringEngine {
    config: Config,
    store: Arc<dyn StorageBackend>,
    alerts: Arc<AlertEngine>,
    orchestrator: PollingOrchestrator,
    dispatcher: RemediationDispatcher,
    background: Mutex<Option<Background>>,
}

impl MonitoringEngine {
    /// Build the engine. Fails if the playbook mappings are inconsistent.
    pub fn new(
        config: Config,
        store: Arc<dyn StorageBackend>,
        inventory: Arc<dyn Inventory>,
        collector: Arc<dyn DeviceCollector>,
    ) -> Result<Self, EngineError> {
        let registry = PlaybookRegistry::from_config(&config.remediation)?;
        debug!("registered playbooks: {}", registry.names().join(", "));

        let alerts = Arc::new(AlertEngine::new(
            store.clone(),
            default_rules(&config.thresholds),
        ));
        let orchestrator = PollingOrchestrator::new(
            inventory.clone(),
            collector.clone(),
            MetricIngestor::new(store.clone(), config.rates),
            alerts.clone(),
            config.polling.clone(),
        );
        let dispatcher = RemediationDispatcher::new(
            store.clone(),
            inventory,
            collector,
            alerts.clone(),
            registry,
            config.remediation.timeout(),
        );

        Ok(Self {
            config,
            store,
            alerts,
            orchestrator,
            dispatcher,
            background: Mutex::new(None),
        })
    }

    /// Start the polling cadences, the webhook notifier and metric retention.
    /// Calling it again while running does nothing.
    ///
    /// Remediations left `in_progress` by a previous run are failed first.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            debug!("engine already started");
            return Ok(());
        }

        self.recover_interrupted_remediations().await?;

        let notifier = match &self.config.notifications.webhook {
            Some(webhook) => Some(NotifierHandle::spawn(webhook, self.alerts.subscribe())?),
            None => None,
        };

        let retention = match &self.config.storage {
            StorageConfig::Sqlite { retention_days, .. } => {
                Some(RetentionHandle::spawn(self.store.clone(), *retention_days))
            }
            StorageConfig::None => None,
        };

        let schedule = ScheduleHandle::spawn(self.orchestrator.clone(), &self.config.polling);

        info!(
            "engine started: fast cycle every {}s, slow cycle every {}s, {} concurrent checks",
            self.config.polling.fast_interval_secs,
            self.config.polling.slow_interval_secs,
            self.config.polling.max_concurrent
        );

        *background = Some(Background {
            schedule,
            notifier,
            retention,
        });
        Ok(())
    }

    /// Stop background work. In-flight device checks get the configured
    /// grace period and running remediations are waited for. The store is
    /// closed last.
    pub async fn shutdown(&self) {
        info!("shutting down engine");

        match self.background.lock().await.take() {
            Some(background) => {
                background.schedule.shutdown().await;
                if let Some(notifier) = background.notifier {
                    if let Err(e) = notifier.shutdown().await {
                        warn!("failed to stop notifier: {:#}", e);
                    }
                }
                if let Some(retention) = background.retention {
                    if let Err(e) = retention.shutdown().await {
                        warn!("failed to stop retention: {:#}", e);
                    }
                }
            }
            None => self.orchestrator.cancel(),
        }

        self.dispatcher
            .shutdown(self.config.polling.shutdown_grace())
            .await;

        if let Err(e) = self.store.close().await {
            warn!("failed to close store: {}", e);
        }
    }

    /// Check one device now (fast-cycle metrics)
    pub async fn trigger_check(&self, device_id: &str) -> Result<DeviceReport, EngineError> {
        self.orchestrator
            .check_device(device_id, CycleKind::Fast)
            .await
    }

    /// Run a fast cycle over every device now
    pub async fn trigger_check_all(&self) -> Result<CycleReport, EngineError> {
        self.orchestrator.run_cycle(CycleKind::Fast).await
    }

    pub async fn trigger_cycle(&self, kind: CycleKind) -> Result<CycleReport, EngineError> {
        self.orchestrator.run_cycle(kind).await
    }

    pub async fn list_active_alerts(&self) -> Result<Vec<Alert>, EngineError> {
        self.alerts.list_active().await
    }

    pub async fn list_alerts(&self, filter: AlertFilter) -> Result<Vec<Alert>, EngineError> {
        self.alerts.list(filter).await
    }

    pub async fn acknowledge_alert(&self, id: i64, actor: &str) -> Result<Alert, EngineError> {
        self.alerts.acknowledge(id, actor).await
    }

    pub async fn resolve_alert(
        &self,
        id: i64,
        notes: Option<String>,
    ) -> Result<Alert, EngineError> {
        self.alerts.resolve(id, notes).await
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    pub async fn auto_remediate(&self, alert_id: i64) -> Result<TaskId, EngineError> {
        self.dispatcher.auto_remediate(alert_id).await
    }

    pub async fn run_playbook(
        &self,
        device_id: &str,
        playbook: &str,
    ) -> Result<TaskId, EngineError> {
        self.dispatcher.run_playbook(device_id, playbook).await
    }

    pub async fn get_remediation_status(&self, task: TaskId) -> Result<RemediationLog, EngineError> {
        self.dispatcher.status(task).await
    }

    /// Block until a remediation run is finished
    pub async fn wait_for_remediation(&self, task: TaskId) -> Result<RemediationLog, EngineError> {
        self.dispatcher.wait(task).await
    }

    /// Fail remediation logs still `in_progress` from a process that stopped
    /// before finishing them. Returns how many were failed.
    pub async fn recover_interrupted_remediations(&self) -> Result<usize, EngineError> {
        self.dispatcher.recover_interrupted().await
    }

    pub async fn list_remediation_logs(
        &self,
        filter: RemediationFilter,
    ) -> Result<Vec<RemediationLog>, EngineError> {
        self.dispatcher.list_logs(filter).await
    }

    pub fn store(&self) -> &Arc<dyn StorageBackend> {
        &self.store
    }
}
