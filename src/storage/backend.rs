//! Storage backend trait definition
//!
//! This module defines the core `StorageBackend` trait that all
//! storage implementations must implement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::StorageResult;
use super::schema::{
    Alert, AlertFilter, AlertKey, AlertTransition, AlertUpsert, MetricSample, MetricType,
    NewAlert, NewRemediation, RemediationFilter, RemediationLog, RemediationOutcome,
};

/// Query parameters for fetching one series within a time range
#[derive(Debug, Clone)]
pub struct QueryRange {
    pub device_id: String,
    pub metric_type: MetricType,

    /// Sub-entity of the series; empty for device-wide metrics
    pub context: String,

    /// Start of time range (inclusive)
    pub start: DateTime<Utc>,

    /// End of time range (inclusive)
    pub end: DateTime<Utc>,

    /// Maximum number of results to return
    pub limit: Option<usize>,
}

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: std::collections::HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// The store is the only place the engine's state survives a cycle: metric
/// series, alerts and remediation logs. Two guarantees are enforced here
/// rather than by callers, because callers race:
///
/// - at most one open (active or acknowledged) alert per [`AlertKey`]
/// - at most one `in_progress` remediation per device
///
/// Implementations must be `Send + Sync` as they are shared between the
/// orchestrator's device tasks, the rule engine and the dispatcher.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ========================================================================
    // Metrics
    // ========================================================================

    /// Insert a batch of samples atomically
    async fn insert_samples(&self, samples: Vec<MetricSample>) -> StorageResult<()>;

    /// Query one series within a time range, oldest first
    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<MetricSample>>;

    /// Get the N most recent samples of one series, oldest first
    async fn query_latest(
        &self,
        device_id: &str,
        metric_type: MetricType,
        context: &str,
        limit: usize,
    ) -> StorageResult<Vec<MetricSample>>;

    /// Delete samples older than the specified timestamp
    ///
    /// Returns the number of samples deleted.
    async fn cleanup_old_metrics(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    // ========================================================================
    // Alerts
    // ========================================================================

    /// Open an alert for `alert.key` unless one is already open.
    ///
    /// An existing open alert is returned untouched, except that a higher
    /// severity raises it in place (title and message refreshed). Severity is
    /// never lowered here.
    async fn upsert_alert(&self, alert: NewAlert, at: DateTime<Utc>)
    -> StorageResult<AlertUpsert>;

    async fn find_open_alert(&self, key: &AlertKey) -> StorageResult<Option<Alert>>;

    async fn get_alert(&self, id: i64) -> StorageResult<Option<Alert>>;

    /// Newest first
    async fn list_alerts(&self, filter: AlertFilter) -> StorageResult<Vec<Alert>>;

    /// Apply a lifecycle transition (see [`Alert::apply`]).
    ///
    /// Fails with `NotFound` for an unknown id.
    async fn transition_alert(
        &self,
        id: i64,
        transition: AlertTransition,
        at: DateTime<Utc>,
    ) -> StorageResult<Alert>;

    // ========================================================================
    // Remediation
    // ========================================================================

    /// Atomically create an `in_progress` log for the device.
    ///
    /// Fails with `Conflict` if the device already has one.
    async fn claim_remediation(
        &self,
        request: NewRemediation,
        at: DateTime<Utc>,
    ) -> StorageResult<RemediationLog>;

    /// Write the terminal state of a claimed remediation.
    ///
    /// Fails with `Conflict` if the log is not `in_progress`.
    async fn finish_remediation(
        &self,
        id: i64,
        outcome: RemediationOutcome,
        at: DateTime<Utc>,
    ) -> StorageResult<RemediationLog>;

    async fn get_remediation(&self, id: i64) -> StorageResult<Option<RemediationLog>>;

    async fn get_remediation_by_task(&self, task_id: Uuid)
    -> StorageResult<Option<RemediationLog>>;

    /// Fail every `in_progress` log with `message`, releasing the device slots.
    ///
    /// Used at startup for runs whose process went away before they finished.
    /// Returns the number of logs changed.
    async fn interrupt_remediations(&self, message: &str, at: DateTime<Utc>)
    -> StorageResult<usize>;

    /// Newest first
    async fn list_remediations(
        &self,
        filter: RemediationFilter,
    ) -> StorageResult<Vec<RemediationLog>>;

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Check backend health
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable stats about the backend
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
