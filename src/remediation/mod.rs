//! Remediation dispatcher
//!
//! ## Execution protocol
//!
//! ```text
//! validate (device, playbook, class, render) ──▶ claim in_progress log
//!        │ fails synchronously                        │ Conflict → RemediationInProgress
//!        ▼                                            ▼
//!     EngineError                          spawned run with timeout
//!                                                     │
//!                         success ─▶ log success, resolve triggering alert
//!                         failure ─▶ log failed, alert stays open
//!                         nothing to run ─▶ log skipped
//! ```
//!
//! The per-device slot is claimed in the store, so two dispatchers sharing a
//! database still cannot run corrective actions on one device at once. The
//! task id is stored on the log, and status lookups go to the store. The
//! dispatcher only tracks runs that are still going.

pub mod playbook;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::Device;
use crate::collector::{CollectError, DeviceCollector};
use crate::error::EngineError;
use crate::inventory::Inventory;
use crate::rules::AlertEngine;
use crate::storage::{
    Alert, NewRemediation, RemediationFilter, RemediationLog, RemediationOutcome,
    RemediationStatus, StorageBackend, StorageError,
};

pub use playbook::{Playbook, PlaybookRegistry, RenderError};

/// Opaque handle of a detached remediation run
pub type TaskId = Uuid;

/// Error recorded on runs that never reached a terminal state
pub const INTERRUPTED: &str = "interrupted before completion";

/// A run that has not written its terminal state yet
struct Running {
    log_id: i64,
    started: Instant,
    handle: JoinHandle<()>,
    done: watch::Receiver<bool>,
}

struct Inner {
    store: Arc<dyn StorageBackend>,
    inventory: Arc<dyn Inventory>,
    collector: Arc<dyn DeviceCollector>,
    alerts: Arc<AlertEngine>,
    registry: PlaybookRegistry,
    timeout: Duration,
    running: Mutex<HashMap<TaskId, Running>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct RemediationDispatcher {
    inner: Arc<Inner>,
}

impl RemediationDispatcher {
    pub fn new(
        store: Arc<dyn StorageBackend>,
        inventory: Arc<dyn Inventory>,
        collector: Arc<dyn DeviceCollector>,
        alerts: Arc<AlertEngine>,
        registry: PlaybookRegistry,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                inventory,
                collector,
                alerts,
                registry,
                timeout,
                running: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn registry(&self) -> &PlaybookRegistry {
        &self.inner.registry
    }

    /// Run the playbook mapped to the alert's type against its device
    #[instrument(skip(self))]
    pub async fn auto_remediate(&self, alert_id: i64) -> Result<TaskId, EngineError> {
        let alert = self.inner.alerts.get(alert_id).await?;
        if !alert.status.is_open() {
            return Err(EngineError::AlertNotOpen(alert_id));
        }

        let playbook = self
            .inner
            .registry
            .for_alert_type(&alert.alert_type)
            .ok_or_else(|| EngineError::NoPlaybookMapped(alert.alert_type.clone()))?
            .clone();
        let device = self.device(&alert.device_id).await?;

        self.dispatch(device, playbook, Some(alert)).await
    }

    /// Run a named playbook against a device, outside any alert
    #[instrument(skip(self))]
    pub async fn run_playbook(
        &self,
        device_id: &str,
        playbook: &str,
    ) -> Result<TaskId, EngineError> {
        let device = self.device(device_id).await?;
        let playbook = self
            .inner
            .registry
            .get(playbook)
            .ok_or_else(|| EngineError::UnknownPlaybook(playbook.to_string()))?
            .clone();

        self.dispatch(device, playbook, None).await
    }

    /// Current log of a remediation run
    pub async fn status(&self, task: TaskId) -> Result<RemediationLog, EngineError> {
        self.inner
            .store
            .get_remediation_by_task(task)
            .await?
            .ok_or(EngineError::TaskNotFound(task))
    }

    /// Wait for a run to reach its terminal state and return the final log.
    ///
    /// A run started by another process is not tracked here, so its current
    /// log is returned straight away.
    pub async fn wait(&self, task: TaskId) -> Result<RemediationLog, EngineError> {
        let done = self
            .inner
            .running
            .lock()
            .await
            .get(&task)
            .map(|run| run.done.clone());

        if let Some(mut done) = done {
            // a closed channel means the run was aborted
            let _ = done.wait_for(|finished| *finished).await;
        }

        self.status(task).await
    }

    /// Number of runs started here that have not finished yet
    pub async fn in_flight(&self) -> usize {
        self.inner.running.lock().await.len()
    }

    /// Fail the logs of runs that were still going when their process
    /// stopped, so their devices can be remediated again.
    #[instrument(skip(self))]
    pub async fn recover_interrupted(&self) -> Result<usize, EngineError> {
        let count = self
            .inner
            .store
            .interrupt_remediations(INTERRUPTED, Utc::now())
            .await?;
        if count > 0 {
            warn!("{} remediations were interrupted by a previous shutdown", count);
        }
        Ok(count)
    }

    /// Refuse new runs and wait for the ones in flight.
    ///
    /// Each run is bounded by the remediation timeout, so waiting longer than
    /// that plus `grace` means the run is stuck. Those are aborted and their
    /// logs failed.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) {
        let running: Vec<(TaskId, Running)> = {
            let mut running = self.inner.running.lock().await;
            self.inner.closed.store(true, Ordering::SeqCst);
            running.drain().collect()
        };
        if running.is_empty() {
            return;
        }

        info!("waiting for {} remediations to finish", running.len());
        let deadline = Instant::now() + self.inner.timeout + grace;

        for (task, mut run) in running {
            if timeout_at(deadline, &mut run.handle).await.is_ok() {
                continue;
            }

            run.handle.abort();
            warn!("aborting remediation task {} (log {})", task, run.log_id);

            let outcome = RemediationOutcome {
                status: RemediationStatus::Failed,
                commands_executed: Vec::new(),
                command_output: None,
                error_message: Some(INTERRUPTED.to_string()),
                duration_ms: elapsed_ms(run.started),
            };
            if let Err(e) = self
                .inner
                .store
                .finish_remediation(run.log_id, outcome, Utc::now())
                .await
            {
                error!("failed to record abort of remediation {}: {}", run.log_id, e);
            }
        }
    }

    pub async fn list_logs(
        &self,
        filter: RemediationFilter,
    ) -> Result<Vec<RemediationLog>, EngineError> {
        Ok(self.inner.store.list_remediations(filter).await?)
    }

    async fn device(&self, id: &str) -> Result<Device, EngineError> {
        self.inner
            .inventory
            .get_device(id)
            .await?
            .ok_or_else(|| EngineError::DeviceNotFound(id.to_string()))
    }

    async fn dispatch(
        &self,
        device: Device,
        playbook: Playbook,
        alert: Option<Alert>,
    ) -> Result<TaskId, EngineError> {
        if !playbook.applies_to(device.class) {
            return Err(EngineError::PlaybookNotApplicable {
                playbook: playbook.name,
                class: device.class,
            });
        }

        let commands = playbook.render(&render_variables(&device, alert.as_ref()))?;

        // Claim and spawn under the lock so `shutdown` cannot miss a run.
        let mut running = self.inner.running.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Cancelled);
        }

        let task = Uuid::new_v4();
        let started = Instant::now();
        let request = NewRemediation {
            task_id: task,
            device_id: device.id.clone(),
            playbook_name: playbook.name.clone(),
            alert_id: alert.as_ref().map(|a| a.id),
        };
        let log = match self.inner.store.claim_remediation(request, Utc::now()).await {
            Ok(log) => log,
            Err(StorageError::Conflict(_)) => {
                debug!("{} already has a remediation in progress", device.id);
                return Err(EngineError::RemediationInProgress(device.id));
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            "running playbook '{}' on {} (task {}, log {})",
            playbook.name,
            device.display(),
            task,
            log.id
        );

        let (finished, done) = watch::channel(false);
        let handle = tokio::spawn(execute(
            self.inner.clone(),
            Run {
                task,
                device,
                playbook: playbook.name,
                commands,
                log_id: log.id,
                alert_id: alert.map(|a| a.id),
                started,
            },
            finished,
        ));
        running.insert(
            task,
            Running {
                log_id: log.id,
                started,
                handle,
                done,
            },
        );

        Ok(task)
    }
}

/// Template variables for one run: the device, the alert key and every
/// scalar in the alert details
fn render_variables(device: &Device, alert: Option<&Alert>) -> HashMap<String, String> {
    let mut variables = HashMap::from([
        ("device_id".to_string(), device.id.clone()),
        ("device_name".to_string(), device.name.clone()),
        ("address".to_string(), device.address.to_string()),
    ]);

    if let Some(alert) = alert {
        variables.insert("alert_type".to_string(), alert.alert_type.clone());
        variables.insert("context".to_string(), alert.context.clone());

        if let Value::Object(details) = &alert.details {
            for (key, value) in details {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                variables.insert(key.clone(), value);
            }
        }
    }

    variables
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

struct Run {
    task: TaskId,
    device: Device,
    playbook: String,
    commands: Vec<String>,
    log_id: i64,
    alert_id: Option<i64>,
    started: Instant,
}

#[instrument(skip_all, fields(device = %run.device.id, playbook = %run.playbook))]
async fn execute(inner: Arc<Inner>, run: Run, finished: watch::Sender<bool>) {
    let task = run.task;
    record(&inner, run).await;

    inner.running.lock().await.remove(&task);
    finished.send_replace(true);
}

async fn record(inner: &Inner, run: Run) {
    let Run {
        device,
        playbook,
        commands,
        log_id,
        alert_id,
        started,
        ..
    } = run;

    let mut outcome = if commands.is_empty() {
        debug!("playbook rendered no commands, skipping");
        RemediationOutcome {
            status: RemediationStatus::Skipped,
            commands_executed: Vec::new(),
            command_output: None,
            error_message: None,
            duration_ms: 0,
        }
    } else {
        let run = timeout(
            inner.timeout,
            inner.collector.execute_commands(&device, &commands),
        )
        .await;

        match run {
            Ok(Ok(result)) => RemediationOutcome {
                status: RemediationStatus::Success,
                commands_executed: result.issued,
                command_output: Some(result.output),
                error_message: None,
                duration_ms: 0,
            },
            Ok(Err(CollectError::CommandFailed {
                command,
                issued,
                message,
            })) => RemediationOutcome {
                status: RemediationStatus::Failed,
                commands_executed: issued,
                command_output: None,
                error_message: Some(format!("command '{command}' failed: {message}")),
                duration_ms: 0,
            },
            Ok(Err(e)) => RemediationOutcome {
                status: RemediationStatus::Failed,
                commands_executed: Vec::new(),
                command_output: None,
                error_message: Some(e.to_string()),
                duration_ms: 0,
            },
            Err(_) => RemediationOutcome {
                status: RemediationStatus::Failed,
                commands_executed: Vec::new(),
                command_output: None,
                error_message: Some(format!("timed out after {:?}", inner.timeout)),
                duration_ms: 0,
            },
        }
    };
    outcome.duration_ms = elapsed_ms(started);

    let status = outcome.status;
    match status {
        RemediationStatus::Failed => warn!(
            "playbook failed: {}",
            outcome.error_message.as_deref().unwrap_or("unknown error")
        ),
        _ => info!("playbook finished: {} in {} ms", status, outcome.duration_ms),
    }

    if let Err(e) = inner
        .store
        .finish_remediation(log_id, outcome, Utc::now())
        .await
    {
        error!("failed to record outcome of remediation {}: {}", log_id, e);
        return;
    }

    if let (RemediationStatus::Success, Some(alert_id)) = (status, alert_id) {
        let notes = format!("Auto-remediated by playbook: {playbook}");
        if let Err(e) = inner.alerts.resolve(alert_id, Some(notes)).await {
            warn!("failed to resolve alert {} after remediation: {}", alert_id, e);
        }
    }
}
