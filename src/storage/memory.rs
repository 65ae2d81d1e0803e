//! In-memory storage backend (no persistence)
//!
//! Used when storage is disabled in the config and throughout the tests.
//! Every operation takes one lock over the whole state, which gives the
//! same uniqueness guarantees the SQLite backend gets from its indexes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::backend::{HealthStatus, QueryRange, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    Alert, AlertFilter, AlertKey, AlertStatus, AlertTransition, AlertUpsert, MetricSample,
    MetricType, NewAlert, NewRemediation, RemediationFilter, RemediationLog, RemediationOutcome,
    RemediationStatus,
};

type SeriesKey = (String, MetricType, String);

#[derive(Default)]
struct MemoryState {
    /// Samples per series, kept sorted by timestamp
    series: HashMap<SeriesKey, Vec<MetricSample>>,
    alerts: Vec<Alert>,
    remediations: Vec<RemediationLog>,
}

impl MemoryState {
    fn alert_mut(&mut self, id: i64) -> Option<&mut Alert> {
        self.alerts.iter_mut().find(|a| a.id == id)
    }

    fn open_alert_mut(&mut self, key: &AlertKey) -> Option<&mut Alert> {
        self.alerts
            .iter_mut()
            .find(|a| a.status.is_open() && a.key() == *key)
    }

    fn sample_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }
}

/// In-memory storage backend
pub struct MemoryBackend {
    state: RwLock<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn insert_samples(&self, samples: Vec<MetricSample>) -> StorageResult<()> {
        let mut state = self.state.write().await;
        for sample in samples {
            let key = (
                sample.device_id.clone(),
                sample.metric_type,
                sample.context.clone(),
            );
            let series = state.series.entry(key).or_default();
            let pos = series.partition_point(|s| s.timestamp <= sample.timestamp);
            series.insert(pos, sample);
        }
        Ok(())
    }

    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<MetricSample>> {
        let state = self.state.read().await;
        let key = (query.device_id, query.metric_type, query.context);

        Ok(state
            .series
            .get(&key)
            .map(|series| {
                series
                    .iter()
                    .filter(|s| s.timestamp >= query.start && s.timestamp <= query.end)
                    .take(query.limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_latest(
        &self,
        device_id: &str,
        metric_type: MetricType,
        context: &str,
        limit: usize,
    ) -> StorageResult<Vec<MetricSample>> {
        let state = self.state.read().await;
        let key = (device_id.to_string(), metric_type, context.to_string());

        Ok(state
            .series
            .get(&key)
            .map(|series| series[series.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default())
    }

    async fn cleanup_old_metrics(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let mut deleted = 0;
        for series in state.series.values_mut() {
            let len = series.len();
            series.retain(|s| s.timestamp >= before);
            deleted += len - series.len();
        }
        state.series.retain(|_, series| !series.is_empty());
        debug!("deleted {} old samples from memory", deleted);
        Ok(deleted)
    }

    async fn upsert_alert(
        &self,
        alert: NewAlert,
        at: DateTime<Utc>,
    ) -> StorageResult<AlertUpsert> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.open_alert_mut(&alert.key) {
            if alert.severity > existing.severity {
                existing.severity = alert.severity;
                existing.title = alert.title;
                existing.message = alert.message;
                existing.details = alert.details;
                existing.updated_at = at;
                return Ok(AlertUpsert::Escalated(existing.clone()));
            }
            return Ok(AlertUpsert::Unchanged(existing.clone()));
        }

        let id = state.alerts.len() as i64 + 1;
        let created = Alert {
            id,
            device_id: alert.key.device_id,
            alert_type: alert.key.alert_type,
            context: alert.key.context,
            severity: alert.severity,
            status: AlertStatus::Active,
            title: alert.title,
            message: alert.message,
            details: alert.details,
            created_at: at,
            updated_at: at,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            resolution_notes: None,
        };
        state.alerts.push(created.clone());
        Ok(AlertUpsert::Created(created))
    }

    async fn find_open_alert(&self, key: &AlertKey) -> StorageResult<Option<Alert>> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .iter()
            .find(|a| a.status.is_open() && a.key() == *key)
            .cloned())
    }

    async fn get_alert(&self, id: i64) -> StorageResult<Option<Alert>> {
        let state = self.state.read().await;
        Ok(state.alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn list_alerts(&self, filter: AlertFilter) -> StorageResult<Vec<Alert>> {
        let state = self.state.read().await;
        Ok(state
            .alerts
            .iter()
            .rev()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    async fn transition_alert(
        &self,
        id: i64,
        transition: AlertTransition,
        at: DateTime<Utc>,
    ) -> StorageResult<Alert> {
        let mut state = self.state.write().await;
        let alert = state
            .alert_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("alert {id}")))?;
        alert.apply(&transition, at)?;
        Ok(alert.clone())
    }

    async fn claim_remediation(
        &self,
        request: NewRemediation,
        at: DateTime<Utc>,
    ) -> StorageResult<RemediationLog> {
        let mut state = self.state.write().await;

        if state.remediations.iter().any(|log| {
            log.device_id == request.device_id && log.status == RemediationStatus::InProgress
        }) {
            return Err(StorageError::Conflict(format!(
                "remediation already in progress for device {}",
                request.device_id
            )));
        }

        let log = RemediationLog {
            id: state.remediations.len() as i64 + 1,
            task_id: Some(request.task_id),
            device_id: request.device_id,
            playbook_name: request.playbook_name,
            alert_id: request.alert_id,
            status: RemediationStatus::InProgress,
            commands_executed: Vec::new(),
            command_output: None,
            error_message: None,
            duration_ms: None,
            created_at: at,
            started_at: Some(at),
            completed_at: None,
        };
        state.remediations.push(log.clone());
        Ok(log)
    }

    async fn finish_remediation(
        &self,
        id: i64,
        outcome: RemediationOutcome,
        at: DateTime<Utc>,
    ) -> StorageResult<RemediationLog> {
        let mut state = self.state.write().await;
        let log = state
            .remediations
            .iter_mut()
            .find(|log| log.id == id)
            .ok_or_else(|| StorageError::NotFound(format!("remediation log {id}")))?;

        if log.status != RemediationStatus::InProgress {
            return Err(StorageError::Conflict(format!(
                "remediation log {id} is already {}",
                log.status
            )));
        }

        log.status = outcome.status;
        log.commands_executed = outcome.commands_executed;
        log.command_output = outcome.command_output;
        log.error_message = outcome.error_message;
        log.duration_ms = Some(outcome.duration_ms);
        log.completed_at = Some(at);
        Ok(log.clone())
    }

    async fn get_remediation(&self, id: i64) -> StorageResult<Option<RemediationLog>> {
        let state = self.state.read().await;
        Ok(state.remediations.iter().find(|log| log.id == id).cloned())
    }

    async fn get_remediation_by_task(
        &self,
        task_id: Uuid,
    ) -> StorageResult<Option<RemediationLog>> {
        let state = self.state.read().await;
        Ok(state
            .remediations
            .iter()
            .find(|log| log.task_id == Some(task_id))
            .cloned())
    }

    async fn interrupt_remediations(
        &self,
        message: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let mut state = self.state.write().await;
        let mut interrupted = 0;

        for log in state
            .remediations
            .iter_mut()
            .filter(|log| log.status == RemediationStatus::InProgress)
        {
            log.status = RemediationStatus::Failed;
            log.error_message = Some(message.to_string());
            log.duration_ms = log
                .started_at
                .map(|started| (at - started).num_milliseconds().max(0));
            log.completed_at = Some(at);
            interrupted += 1;
        }

        Ok(interrupted)
    }

    async fn list_remediations(
        &self,
        filter: RemediationFilter,
    ) -> StorageResult<Vec<RemediationLog>> {
        let state = self.state.read().await;
        Ok(state
            .remediations
            .iter()
            .rev()
            .filter(|log| filter.matches(log))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let state = self.state.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_samples".to_string(), state.sample_count().to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let state = self.state.read().await;
        Ok(format!(
            "In-Memory: {} samples across {} series, {} alerts, {} remediation logs",
            state.sample_count(),
            state.series.len(),
            state.alerts.len(),
            state.remediations.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
