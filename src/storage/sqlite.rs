//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (rule evaluation, status queries) do not block the
//!   per-device commit writes
//! - **Migrations**: Schema versioning with sqlx, embedded from `./migrations`
//!
//! The open-alert and in-progress-remediation guarantees are partial unique
//! indexes, so they hold even with several engine processes on one file.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::backend::{HealthStatus, QueryRange, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::{
    Alert, AlertFilter, AlertKey, AlertStatus, AlertTransition, AlertUpsert, MetricSample,
    MetricType, NewAlert, NewRemediation, RemediationFilter, RemediationLog, RemediationOutcome,
    RemediationStatus,
};

const SAMPLE_COLUMNS: &str = "device_id, metric_type, context, value, unit, timestamp, metadata";

const ALERT_COLUMNS: &str = "id, device_id, alert_type, context, severity, status, title, \
    message, details, created_at, updated_at, acknowledged_by, acknowledged_at, resolved_at, \
    resolution_notes";

const REMEDIATION_COLUMNS: &str = "id, task_id, device_id, playbook_name, alert_id, status, \
    commands_executed, command_output, error_message, duration_ms, created_at, started_at, \
    completed_at";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database file and run migrations
    ///
    /// ```no_run
    /// # use netpulse::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./netpulse.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn optional_timestamp(row: &SqliteRow, column: &str) -> Option<DateTime<Utc>> {
        row.get::<Option<i64>, _>(column)
            .map(Self::millis_to_timestamp)
    }

    fn sample_from_row(row: &SqliteRow) -> StorageResult<MetricSample> {
        let metric_type: String = row.get("metric_type");
        let metadata: String = row.get("metadata");

        Ok(MetricSample {
            device_id: row.get("device_id"),
            metric_type: metric_type.parse()?,
            context: row.get("context"),
            value: row.get("value"),
            unit: row.get("unit"),
            timestamp: Self::millis_to_timestamp(row.get("timestamp")),
            metadata: serde_json::from_str(&metadata)?,
        })
    }

    fn alert_from_row(row: &SqliteRow) -> StorageResult<Alert> {
        let severity: String = row.get("severity");
        let status: String = row.get("status");
        let details: String = row.get("details");

        Ok(Alert {
            id: row.get("id"),
            device_id: row.get("device_id"),
            alert_type: row.get("alert_type"),
            context: row.get("context"),
            severity: severity.parse()?,
            status: status.parse()?,
            title: row.get("title"),
            message: row.get("message"),
            details: serde_json::from_str(&details)?,
            created_at: Self::millis_to_timestamp(row.get("created_at")),
            updated_at: Self::millis_to_timestamp(row.get("updated_at")),
            acknowledged_by: row.get("acknowledged_by"),
            acknowledged_at: Self::optional_timestamp(row, "acknowledged_at"),
            resolved_at: Self::optional_timestamp(row, "resolved_at"),
            resolution_notes: row.get("resolution_notes"),
        })
    }

    fn remediation_from_row(row: &SqliteRow) -> StorageResult<RemediationLog> {
        let status: String = row.get("status");
        let commands: String = row.get("commands_executed");
        let task_id: Option<String> = row.get("task_id");
        let task_id = task_id
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .map_err(|e| StorageError::SerializationError(format!("invalid task id: {e}")))?;

        Ok(RemediationLog {
            id: row.get("id"),
            task_id,
            device_id: row.get("device_id"),
            playbook_name: row.get("playbook_name"),
            alert_id: row.get("alert_id"),
            status: status.parse()?,
            commands_executed: serde_json::from_str(&commands)?,
            command_output: row.get("command_output"),
            error_message: row.get("error_message"),
            duration_ms: row.get("duration_ms"),
            created_at: Self::millis_to_timestamp(row.get("created_at")),
            started_at: Self::optional_timestamp(row, "started_at"),
            completed_at: Self::optional_timestamp(row, "completed_at"),
        })
    }

    async fn fetch_alert(&self, id: i64) -> StorageResult<Option<Alert>> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::alert_from_row)
            .transpose()
    }

    async fn fetch_remediation(&self, id: i64) -> StorageResult<Option<RemediationLog>> {
        let sql = format!("SELECT {REMEDIATION_COLUMNS} FROM remediation_logs WHERE id = ?");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::remediation_from_row)
            .transpose()
    }

    async fn fetch_remediation_by_task(
        &self,
        task_id: Uuid,
    ) -> StorageResult<Option<RemediationLog>> {
        let sql = format!("SELECT {REMEDIATION_COLUMNS} FROM remediation_logs WHERE task_id = ?");
        sqlx::query(&sql)
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::remediation_from_row)
            .transpose()
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, samples), fields(count = samples.len()))]
    async fn insert_samples(&self, samples: Vec<MetricSample>) -> StorageResult<()> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for sample in samples {
            let metadata_json = serde_json::to_string(&sample.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO metric_samples (
                    device_id, metric_type, context, value, unit, timestamp, metadata
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&sample.device_id)
            .bind(sample.metric_type.as_str())
            .bind(&sample.context)
            .bind(sample.value)
            .bind(&sample.unit)
            .bind(Self::timestamp_to_millis(&sample.timestamp))
            .bind(metadata_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("batch insert complete");
        Ok(())
    }

    #[instrument(skip(self), fields(device_id = %query.device_id, metric = %query.metric_type))]
    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<MetricSample>> {
        let limit_clause = query
            .limit
            .map(|l| format!("LIMIT {}", l))
            .unwrap_or_default();

        let sql = format!(
            r#"
            SELECT {SAMPLE_COLUMNS}
            FROM metric_samples
            WHERE device_id = ? AND metric_type = ? AND context = ?
              AND timestamp >= ? AND timestamp <= ?
            ORDER BY timestamp ASC, id ASC
            {limit_clause}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(&query.device_id)
            .bind(query.metric_type.as_str())
            .bind(&query.context)
            .bind(Self::timestamp_to_millis(&query.start))
            .bind(Self::timestamp_to_millis(&query.end))
            .fetch_all(&self.pool)
            .await?;

        let results = rows
            .iter()
            .map(Self::sample_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        debug!("query returned {} samples", results.len());
        Ok(results)
    }

    #[instrument(skip(self))]
    async fn query_latest(
        &self,
        device_id: &str,
        metric_type: MetricType,
        context: &str,
        limit: usize,
    ) -> StorageResult<Vec<MetricSample>> {
        let sql = format!(
            r#"
            SELECT {SAMPLE_COLUMNS}
            FROM metric_samples
            WHERE device_id = ? AND metric_type = ? AND context = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(device_id)
            .bind(metric_type.as_str())
            .bind(context)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut results = rows
            .iter()
            .map(Self::sample_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        // Reverse to get chronological order (oldest first)
        results.reverse();
        Ok(results)
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_metrics(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM metric_samples WHERE timestamp < ?")
            .bind(Self::timestamp_to_millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        info!("deleted {} old samples", deleted);
        Ok(deleted)
    }

    #[instrument(skip(self, alert), fields(key = %alert.key))]
    async fn upsert_alert(
        &self,
        alert: NewAlert,
        at: DateTime<Utc>,
    ) -> StorageResult<AlertUpsert> {
        let now = Self::timestamp_to_millis(&at);
        let details = serde_json::to_string(&alert.details)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO alerts (
                device_id, alert_type, context, severity, status, title, message,
                details, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'active', ?, ?, ?, ?, ?)
            ON CONFLICT (device_id, alert_type, context)
                WHERE status IN ('active', 'acknowledged')
                DO NOTHING
            "#,
        )
        .bind(&alert.key.device_id)
        .bind(&alert.key.alert_type)
        .bind(&alert.key.context)
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&details)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            let id = inserted.last_insert_rowid();
            let created = self
                .fetch_alert(id)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("alert {id}")))?;
            return Ok(AlertUpsert::Created(created));
        }

        let existing = self.find_open_alert(&alert.key).await?.ok_or_else(|| {
            StorageError::Conflict(format!("open alert for {} vanished during upsert", alert.key))
        })?;

        if alert.severity <= existing.severity {
            return Ok(AlertUpsert::Unchanged(existing));
        }

        sqlx::query(
            r#"
            UPDATE alerts
            SET severity = ?, title = ?, message = ?, details = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&details)
        .bind(now)
        .bind(existing.id)
        .execute(&self.pool)
        .await?;

        let escalated = self
            .fetch_alert(existing.id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("alert {}", existing.id)))?;
        Ok(AlertUpsert::Escalated(escalated))
    }

    async fn find_open_alert(&self, key: &AlertKey) -> StorageResult<Option<Alert>> {
        let sql = format!(
            r#"
            SELECT {ALERT_COLUMNS} FROM alerts
            WHERE device_id = ? AND alert_type = ? AND context = ?
              AND status IN ('active', 'acknowledged')
            "#
        );
        sqlx::query(&sql)
            .bind(&key.device_id)
            .bind(&key.alert_type)
            .bind(&key.context)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::alert_from_row)
            .transpose()
    }

    async fn get_alert(&self, id: i64) -> StorageResult<Option<Alert>> {
        self.fetch_alert(id).await
    }

    async fn list_alerts(&self, filter: AlertFilter) -> StorageResult<Vec<Alert>> {
        let sql = format!(
            r#"
            SELECT {ALERT_COLUMNS} FROM alerts
            WHERE (?1 IS NULL OR device_id = ?1)
              AND (?2 IS NULL OR status = ?2)
              AND (?3 = 0 OR status IN ('active', 'acknowledged'))
            ORDER BY id DESC
            "#
        );
        let open_only = filter.status.is_none() && filter.open_only;

        let rows = sqlx::query(&sql)
            .bind(filter.device_id)
            .bind(filter.status.map(AlertStatus::as_str))
            .bind(open_only)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::alert_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn transition_alert(
        &self,
        id: i64,
        transition: AlertTransition,
        at: DateTime<Utc>,
    ) -> StorageResult<Alert> {
        let mut alert = self
            .fetch_alert(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("alert {id}")))?;
        let previous_status = alert.status;

        if !alert.apply(&transition, at)? {
            return Ok(alert);
        }

        let updated = sqlx::query(
            r#"
            UPDATE alerts
            SET status = ?, updated_at = ?, acknowledged_by = ?, acknowledged_at = ?,
                resolved_at = ?, resolution_notes = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(alert.status.as_str())
        .bind(Self::timestamp_to_millis(&alert.updated_at))
        .bind(&alert.acknowledged_by)
        .bind(alert.acknowledged_at.as_ref().map(Self::timestamp_to_millis))
        .bind(alert.resolved_at.as_ref().map(Self::timestamp_to_millis))
        .bind(&alert.resolution_notes)
        .bind(id)
        .bind(previous_status.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            // Someone else moved it first; report what is stored now.
            warn!("alert {} changed concurrently during transition", id);
            return self
                .fetch_alert(id)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("alert {id}")));
        }

        Ok(alert)
    }

    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    async fn claim_remediation(
        &self,
        request: NewRemediation,
        at: DateTime<Utc>,
    ) -> StorageResult<RemediationLog> {
        let now = Self::timestamp_to_millis(&at);

        let result = sqlx::query(
            r#"
            INSERT INTO remediation_logs (
                task_id, device_id, playbook_name, alert_id, status, created_at, started_at
            )
            VALUES (?, ?, ?, ?, 'in_progress', ?, ?)
            "#,
        )
        .bind(request.task_id.to_string())
        .bind(&request.device_id)
        .bind(&request.playbook_name)
        .bind(request.alert_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match StorageError::from(e) {
            StorageError::Conflict(_) => StorageError::Conflict(format!(
                "remediation already in progress for device {}",
                request.device_id
            )),
            other => other,
        })?;

        let id = result.last_insert_rowid();
        self.fetch_remediation(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("remediation log {id}")))
    }

    #[instrument(skip(self, outcome), fields(status = %outcome.status))]
    async fn finish_remediation(
        &self,
        id: i64,
        outcome: RemediationOutcome,
        at: DateTime<Utc>,
    ) -> StorageResult<RemediationLog> {
        let commands = serde_json::to_string(&outcome.commands_executed)?;

        let updated = sqlx::query(
            r#"
            UPDATE remediation_logs
            SET status = ?, commands_executed = ?, command_output = ?, error_message = ?,
                duration_ms = ?, completed_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(outcome.status.as_str())
        .bind(commands)
        .bind(&outcome.command_output)
        .bind(&outcome.error_message)
        .bind(outcome.duration_ms)
        .bind(Self::timestamp_to_millis(&at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        let log = self
            .fetch_remediation(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("remediation log {id}")))?;

        if updated.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "remediation log {id} is already {}",
                log.status
            )));
        }
        Ok(log)
    }

    async fn get_remediation(&self, id: i64) -> StorageResult<Option<RemediationLog>> {
        self.fetch_remediation(id).await
    }

    async fn get_remediation_by_task(
        &self,
        task_id: Uuid,
    ) -> StorageResult<Option<RemediationLog>> {
        self.fetch_remediation_by_task(task_id).await
    }

    #[instrument(skip(self))]
    async fn interrupt_remediations(
        &self,
        message: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let now = Self::timestamp_to_millis(&at);

        let result = sqlx::query(
            r#"
            UPDATE remediation_logs
            SET status = 'failed', error_message = ?1,
                duration_ms = MAX(?2 - COALESCE(started_at, created_at), 0),
                completed_at = ?2
            WHERE status = 'in_progress'
            "#,
        )
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let interrupted = result.rows_affected() as usize;
        if interrupted > 0 {
            warn!("marked {} interrupted remediations as failed", interrupted);
        }
        Ok(interrupted)
    }

    async fn list_remediations(
        &self,
        filter: RemediationFilter,
    ) -> StorageResult<Vec<RemediationLog>> {
        let sql = format!(
            r#"
            SELECT {REMEDIATION_COLUMNS} FROM remediation_logs
            WHERE (?1 IS NULL OR device_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY id DESC
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(filter.device_id)
            .bind(filter.status.map(RemediationStatus::as_str))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::remediation_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let (samples,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM metric_samples")
            .fetch_one(&self.pool)
            .await?;
        let (open_alerts,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM alerts WHERE status IN ('active', 'acknowledged')",
        )
        .fetch_one(&self.pool)
        .await?;
        let (remediations,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM remediation_logs")
            .fetch_one(&self.pool)
            .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        Ok(format!(
            "SQLite: {} samples, {} open alerts, {} remediation logs, {:.2} MB on disk",
            samples, open_alerts, remediations, file_size_mb
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
