//! Alert lifecycle: from rule observations to stored alerts
//!
//! ```text
//!            condition held for window          ack (human)
//!   (none) ─────────────────────────────▶ active ─────────▶ acknowledged
//!                                           │                  │
//!                 cleared for window / resolve (human or remediation)
//!                                           ▼                  ▼
//!                                        resolved ◀────────────┘
//! ```

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, instrument, trace, warn};

use crate::Device;
use crate::actors::messages::{AlertEvent, AlertEventKind, CycleKind, PollOutcome};
use crate::error::EngineError;
use crate::storage::{
    Alert, AlertFilter, AlertKey, AlertStatus, AlertTransition, AlertUpsert, NewAlert,
    StorageBackend, StorageResult,
};

use super::hysteresis::{HysteresisTracker, Verdict};
use super::{AlertRule, Condition, Observation};

const DEFAULT_RESOLUTION_NOTE: &str = "condition cleared";
const PRUNE_AT: usize = 4096;
const PRUNE_IDLE_CYCLES: u32 = 16;

/// What one evaluation changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub opened: Vec<i64>,
    pub escalated: Vec<i64>,
    pub resolved: Vec<i64>,

    /// Rules skipped because they failed on this outcome
    pub failed_rules: Vec<&'static str>,
    pub storage_errors: usize,
}

pub struct AlertEngine {
    store: Arc<dyn StorageBackend>,
    rules: Vec<Box<dyn AlertRule>>,
    tracker: Mutex<HysteresisTracker>,
    events: broadcast::Sender<AlertEvent>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn StorageBackend>, rules: Vec<Box<dyn AlertRule>>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            store,
            rules,
            tracker: Mutex::new(HysteresisTracker::new()),
            events,
        }
    }

    /// Subscribe to alert lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    fn publish(&self, kind: AlertEventKind, alert: &Alert) {
        // No subscribers is fine.
        let _ = self.events.send(AlertEvent {
            kind,
            alert: alert.clone(),
        });
    }

    /// Run every rule over one device's outcome and apply the results.
    ///
    /// A failing rule is logged and skipped; storage errors are logged per
    /// alert key. Neither stops the remaining rules.
    #[instrument(skip_all, fields(device = %device.id, kind = %kind))]
    pub async fn evaluate(
        &self,
        device: &Device,
        kind: CycleKind,
        outcome: &PollOutcome,
    ) -> EvaluationSummary {
        let mut summary = EvaluationSummary::default();
        let mut actions = Vec::new();

        {
            let mut tracker = self.tracker.lock().await;
            for rule in &self.rules {
                let observations = match rule.evaluate(device, kind, outcome) {
                    Ok(observations) => observations,
                    Err(e) => {
                        warn!(rule = rule.name(), "rule evaluation failed: {}", e);
                        summary.failed_rules.push(rule.name());
                        continue;
                    }
                };

                for observation in observations {
                    let key = AlertKey::new(&device.id, observation.alert_type, &observation.context);
                    let window = if observation.immediate {
                        1
                    } else {
                        rule.hysteresis()
                    };
                    match tracker.observe(&key, observation.is_firing(), window) {
                        Verdict::Hold => trace!("holding {} within hysteresis window", key),
                        verdict => actions.push((key, observation, verdict)),
                    }
                }
            }

            if tracker.len() > PRUNE_AT {
                tracker.prune(PRUNE_IDLE_CYCLES);
            }
        }

        for (key, observation, verdict) in actions {
            if let Err(e) = self.apply(&key, observation, verdict, &mut summary).await {
                warn!("failed to update alert {}: {}", key, e);
                summary.storage_errors += 1;
            }
        }

        summary
    }

    async fn apply(
        &self,
        key: &AlertKey,
        observation: Observation,
        verdict: Verdict,
        summary: &mut EvaluationSummary,
    ) -> StorageResult<()> {
        let now = Utc::now();

        match (verdict, observation.condition) {
            (Verdict::Open, Condition::Firing(firing)) => {
                let alert = NewAlert {
                    key: key.clone(),
                    severity: firing.severity,
                    title: firing.title,
                    message: firing.message,
                    details: firing.details,
                };
                match self.store.upsert_alert(alert, now).await? {
                    AlertUpsert::Created(alert) => {
                        info!(
                            "alert opened: [{}] {} ({})",
                            alert.severity, alert.title, alert.message
                        );
                        summary.opened.push(alert.id);
                        self.publish(AlertEventKind::Opened, &alert);
                    }
                    AlertUpsert::Escalated(alert) => {
                        info!("alert {} escalated to {}: {}", alert.id, alert.severity, alert.message);
                        summary.escalated.push(alert.id);
                        self.publish(AlertEventKind::Escalated, &alert);
                    }
                    AlertUpsert::Unchanged(alert) => {
                        trace!("alert {} still open", alert.id);
                    }
                }
            }
            (Verdict::Clear, Condition::Clear { notes }) => {
                let Some(open) = self.store.find_open_alert(key).await? else {
                    return Ok(());
                };
                let notes = notes.unwrap_or_else(|| DEFAULT_RESOLUTION_NOTE.to_string());
                let resolved = self
                    .store
                    .transition_alert(open.id, AlertTransition::Resolve { notes: Some(notes) }, now)
                    .await?;
                info!("alert auto-resolved: {} ({})", resolved.title, key);
                summary.resolved.push(resolved.id);
                self.publish(AlertEventKind::Resolved, &resolved);
            }
            (verdict, condition) => {
                debug!("ignoring {:?} verdict for {:?}", verdict, condition);
            }
        }

        Ok(())
    }

    /// Active alerts, newest first
    pub async fn list_active(&self) -> Result<Vec<Alert>, EngineError> {
        Ok(self
            .store
            .list_alerts(AlertFilter {
                status: Some(AlertStatus::Active),
                ..Default::default()
            })
            .await?)
    }

    pub async fn list(&self, filter: AlertFilter) -> Result<Vec<Alert>, EngineError> {
        Ok(self.store.list_alerts(filter).await?)
    }

    pub async fn get(&self, id: i64) -> Result<Alert, EngineError> {
        self.store
            .get_alert(id)
            .await?
            .ok_or(EngineError::AlertNotFound(id))
    }

    /// active → acknowledged, recording who did it
    #[instrument(skip(self))]
    pub async fn acknowledge(&self, id: i64, actor: &str) -> Result<Alert, EngineError> {
        let current = self.get(id).await?;
        if current.status == AlertStatus::Acknowledged {
            return Ok(current);
        }

        let alert = self
            .store
            .transition_alert(
                id,
                AlertTransition::Acknowledge {
                    by: actor.to_string(),
                },
                Utc::now(),
            )
            .await
            .map_err(|e| EngineError::for_alert(id, e))?;

        info!("alert {} acknowledged by {}", id, actor);
        self.publish(AlertEventKind::Acknowledged, &alert);
        Ok(alert)
    }

    /// active|acknowledged → resolved. Resolving a resolved alert returns it
    /// unchanged.
    #[instrument(skip(self))]
    pub async fn resolve(&self, id: i64, notes: Option<String>) -> Result<Alert, EngineError> {
        let current = self.get(id).await?;
        if current.status == AlertStatus::Resolved {
            debug!("alert {} already resolved", id);
            return Ok(current);
        }

        let alert = self
            .store
            .transition_alert(id, AlertTransition::Resolve { notes }, Utc::now())
            .await
            .map_err(|e| EngineError::for_alert(id, e))?;

        info!("alert {} resolved", id);
        self.publish(AlertEventKind::Resolved, &alert);
        Ok(alert)
    }
}
