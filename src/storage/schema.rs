//! Persisted row types
//!
//! These types are the records the engine owns: time-series samples, alerts
//! and remediation audit logs. Enums are stored as their snake_case string
//! form, timestamps as Unix milliseconds and structured data as JSON text.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::DeviceId;
use crate::rate::RateUnit;

use super::error::StorageError;

/// Metadata key carrying the declared counter width (32 or 64)
pub const META_COUNTER_BITS: &str = "counter_bits";

/// Metadata key carrying the interface speed in bits per second
pub const META_IF_SPEED: &str = "if_speed_bps";

/// Metadata key set on derived samples computed across a counter reset
pub const META_DISCONTINUITY: &str = "discontinuity";

/// Kind of metric a sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    CpuUtilization,
    MemoryUtilization,
    Uptime,
    InterfaceStatus,
    InterfaceInOctets,
    InterfaceOutOctets,
    InterfaceInErrors,
    InterfaceOutErrors,
    InterfaceInRate,
    InterfaceOutRate,
    InterfaceInErrorRate,
    InterfaceOutErrorRate,
    BgpNeighborState,
    OspfNeighborState,
    PingLatency,
    PingLoss,
    ConnectionCount,
    Custom,
}

/// How a derived series is computed from a counter series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derivation {
    pub target: MetricType,
    pub unit: RateUnit,
}

impl MetricType {
    pub const ALL: [MetricType; 18] = [
        MetricType::CpuUtilization,
        MetricType::MemoryUtilization,
        MetricType::Uptime,
        MetricType::InterfaceStatus,
        MetricType::InterfaceInOctets,
        MetricType::InterfaceOutOctets,
        MetricType::InterfaceInErrors,
        MetricType::InterfaceOutErrors,
        MetricType::InterfaceInRate,
        MetricType::InterfaceOutRate,
        MetricType::InterfaceInErrorRate,
        MetricType::InterfaceOutErrorRate,
        MetricType::BgpNeighborState,
        MetricType::OspfNeighborState,
        MetricType::PingLatency,
        MetricType::PingLoss,
        MetricType::ConnectionCount,
        MetricType::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::CpuUtilization => "cpu_utilization",
            MetricType::MemoryUtilization => "memory_utilization",
            MetricType::Uptime => "uptime",
            MetricType::InterfaceStatus => "interface_status",
            MetricType::InterfaceInOctets => "interface_in_octets",
            MetricType::InterfaceOutOctets => "interface_out_octets",
            MetricType::InterfaceInErrors => "interface_in_errors",
            MetricType::InterfaceOutErrors => "interface_out_errors",
            MetricType::InterfaceInRate => "interface_in_rate",
            MetricType::InterfaceOutRate => "interface_out_rate",
            MetricType::InterfaceInErrorRate => "interface_in_error_rate",
            MetricType::InterfaceOutErrorRate => "interface_out_error_rate",
            MetricType::BgpNeighborState => "bgp_neighbor_state",
            MetricType::OspfNeighborState => "ospf_neighbor_state",
            MetricType::PingLatency => "ping_latency",
            MetricType::PingLoss => "ping_loss",
            MetricType::ConnectionCount => "connection_count",
            MetricType::Custom => "custom",
        }
    }

    /// The rate series derived from this counter, if it is one
    pub fn derivation(self) -> Option<Derivation> {
        let (target, unit) = match self {
            MetricType::InterfaceInOctets => {
                (MetricType::InterfaceInRate, RateUnit::BitsPerSecond)
            }
            MetricType::InterfaceOutOctets => {
                (MetricType::InterfaceOutRate, RateUnit::BitsPerSecond)
            }
            MetricType::InterfaceInErrors => {
                (MetricType::InterfaceInErrorRate, RateUnit::PerSecond)
            }
            MetricType::InterfaceOutErrors => {
                (MetricType::InterfaceOutErrorRate, RateUnit::PerSecond)
            }
            _ => return None,
        };
        Some(Derivation { target, unit })
    }

    /// Derived series are computed during ingestion, never collected
    pub fn is_derived(self) -> bool {
        matches!(
            self,
            MetricType::InterfaceInRate
                | MetricType::InterfaceOutRate
                | MetricType::InterfaceInErrorRate
                | MetricType::InterfaceOutErrorRate
        )
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| StorageError::SerializationError(format!("unknown metric type: {s}")))
    }
}

/// One time-stamped observation
///
/// `context` identifies the sub-entity a sample is about (an interface name,
/// a BGP peer address); it is empty for device-wide metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub device_id: DeviceId,
    pub metric_type: MetricType,
    #[serde(default)]
    pub context: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

impl MetricSample {
    pub fn new(
        device_id: impl Into<DeviceId>,
        metric_type: MetricType,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            metric_type,
            context: String::new(),
            value,
            unit: None,
            timestamp,
            metadata: Value::Null,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }

    pub fn meta_bool(&self, key: &str) -> bool {
        self.metadata
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StorageError::SerializationError(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

string_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

string_enum!(AlertStatus {
    Active => "active",
    Acknowledged => "acknowledged",
    Resolved => "resolved",
});

impl AlertStatus {
    /// Active and acknowledged alerts both hold the uniqueness key
    pub fn is_open(self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

/// Deduplication key: at most one open alert exists per key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertKey {
    pub device_id: DeviceId,
    pub alert_type: String,
    pub context: String,
}

impl AlertKey {
    pub fn new(
        device_id: impl Into<DeviceId>,
        alert_type: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            alert_type: alert_type.into(),
            context: context.into(),
        }
    }
}

impl fmt::Display for AlertKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{}/{}", self.device_id, self.alert_type)
        } else {
            write!(f, "{}/{}/{}", self.device_id, self.alert_type, self.context)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub device_id: DeviceId,
    pub alert_type: String,
    pub context: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
}

/// A lifecycle change requested on an alert
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Acknowledge { by: String },
    Resolve { notes: Option<String> },
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey::new(&self.device_id, &self.alert_type, &self.context)
    }

    /// Apply a lifecycle transition in place.
    ///
    /// Returns `Ok(false)` when the alert is already in the requested state
    /// (acknowledging an acknowledged alert, resolving a resolved one).
    /// Acknowledging a resolved alert is rejected.
    pub fn apply(
        &mut self,
        transition: &AlertTransition,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        match (transition, self.status) {
            (AlertTransition::Acknowledge { .. }, AlertStatus::Acknowledged)
            | (AlertTransition::Resolve { .. }, AlertStatus::Resolved) => Ok(false),
            (AlertTransition::Acknowledge { .. }, AlertStatus::Resolved) => {
                Err(StorageError::InvalidTransition(format!(
                    "alert {} is resolved and cannot be acknowledged",
                    self.id
                )))
            }
            (AlertTransition::Acknowledge { by }, AlertStatus::Active) => {
                self.status = AlertStatus::Acknowledged;
                self.acknowledged_by = Some(by.clone());
                self.acknowledged_at = Some(at);
                self.updated_at = at;
                Ok(true)
            }
            (AlertTransition::Resolve { notes }, _) => {
                self.status = AlertStatus::Resolved;
                self.resolved_at = Some(at);
                self.resolution_notes = notes.clone();
                self.updated_at = at;
                Ok(true)
            }
        }
    }
}

/// An alert the rule engine wants open
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub key: AlertKey,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub details: Value,
}

/// Result of asking the store to open an alert for a key
#[derive(Debug, Clone, PartialEq)]
pub enum AlertUpsert {
    /// No open alert existed; a new row was inserted
    Created(Alert),

    /// An open alert already existed and was left as it was
    Unchanged(Alert),

    /// An open alert existed at a lower severity and was raised in place
    Escalated(Alert),
}

impl AlertUpsert {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertUpsert::Created(a) | AlertUpsert::Unchanged(a) | AlertUpsert::Escalated(a) => a,
        }
    }

    pub fn into_alert(self) -> Alert {
        match self {
            AlertUpsert::Created(a) | AlertUpsert::Unchanged(a) | AlertUpsert::Escalated(a) => a,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertFilter {
    pub device_id: Option<DeviceId>,
    pub status: Option<AlertStatus>,

    /// Match active and acknowledged alerts; ignored when `status` is set
    pub open_only: bool,
}

impl AlertFilter {
    pub fn open() -> Self {
        Self {
            open_only: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        if self
            .device_id
            .as_ref()
            .is_some_and(|id| *id != alert.device_id)
        {
            return false;
        }
        match self.status {
            Some(status) => alert.status == status,
            None => !self.open_only || alert.status.is_open(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    Skipped,
}

string_enum!(RemediationStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Success => "success",
    Failed => "failed",
    Skipped => "skipped",
});

impl RemediationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RemediationStatus::Success | RemediationStatus::Failed | RemediationStatus::Skipped
        )
    }
}

/// Audit record of one playbook execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationLog {
    pub id: i64,
    /// Handle returned to the caller that started the run. Missing on logs
    /// written before task ids were stored.
    pub task_id: Option<Uuid>,
    pub device_id: DeviceId,
    pub playbook_name: String,
    pub alert_id: Option<i64>,
    pub status: RemediationStatus,
    pub commands_executed: Vec<String>,
    pub command_output: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Request to claim the per-device remediation slot
#[derive(Debug, Clone, PartialEq)]
pub struct NewRemediation {
    pub task_id: Uuid,
    pub device_id: DeviceId,
    pub playbook_name: String,
    pub alert_id: Option<i64>,
}

/// Terminal state written when a remediation finishes
#[derive(Debug, Clone, PartialEq)]
pub struct RemediationOutcome {
    pub status: RemediationStatus,
    pub commands_executed: Vec<String>,
    pub command_output: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemediationFilter {
    pub device_id: Option<DeviceId>,
    pub status: Option<RemediationStatus>,
}

impl RemediationFilter {
    pub fn matches(&self, log: &RemediationLog) -> bool {
        self.device_id
            .as_ref()
            .is_none_or(|id| *id == log.device_id)
            && self.status.is_none_or(|status| status == log.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(status: AlertStatus) -> Alert {
        let now = Utc::now();
        Alert {
            id: 1,
            device_id: "r1".to_string(),
            alert_type: "cpu_utilization".to_string(),
            context: String::new(),
            severity: Severity::Warning,
            status,
            title: "High CPU".to_string(),
            message: "CPU at 80%".to_string(),
            details: Value::Null,
            created_at: now,
            updated_at: now,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            resolution_notes: None,
        }
    }

    #[test]
    fn test_metric_type_string_roundtrip_covers_catalogue() {
        for t in MetricType::ALL {
            assert_eq!(t.as_str().parse::<MetricType>().unwrap(), t);
        }
        assert!("bogus".parse::<MetricType>().is_err());
    }

    #[test]
    fn test_counter_derivations() {
        let d = MetricType::InterfaceInOctets.derivation().unwrap();
        assert_eq!(d.target, MetricType::InterfaceInRate);
        assert_eq!(d.unit, RateUnit::BitsPerSecond);

        let d = MetricType::InterfaceOutErrors.derivation().unwrap();
        assert_eq!(d.target, MetricType::InterfaceOutErrorRate);
        assert_eq!(d.unit, RateUnit::PerSecond);

        assert!(MetricType::CpuUtilization.derivation().is_none());
        assert!(MetricType::InterfaceInRate.derivation().is_none());
        assert!(MetricType::InterfaceInRate.is_derived());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_acknowledge_then_resolve() {
        let mut a = alert(AlertStatus::Active);
        let now = Utc::now();

        let changed = a
            .apply(&AlertTransition::Acknowledge { by: "noc".into() }, now)
            .unwrap();
        assert!(changed);
        assert_eq!(a.status, AlertStatus::Acknowledged);
        assert_eq!(a.acknowledged_by.as_deref(), Some("noc"));

        let changed = a
            .apply(&AlertTransition::Resolve { notes: None }, now)
            .unwrap();
        assert!(changed);
        assert_eq!(a.status, AlertStatus::Resolved);
        assert_eq!(a.resolved_at, Some(now));
    }

    #[test]
    fn test_resolving_resolved_alert_is_noop() {
        let mut a = alert(AlertStatus::Resolved);
        let changed = a
            .apply(
                &AlertTransition::Resolve {
                    notes: Some("again".into()),
                },
                Utc::now(),
            )
            .unwrap();
        assert!(!changed);
        assert_eq!(a.resolution_notes, None);
    }

    #[test]
    fn test_acknowledging_resolved_alert_is_rejected() {
        let mut a = alert(AlertStatus::Resolved);
        let result = a.apply(&AlertTransition::Acknowledge { by: "noc".into() }, Utc::now());
        assert!(matches!(result, Err(StorageError::InvalidTransition(_))));
    }

    #[test]
    fn test_alert_filter() {
        let open = AlertFilter::open();
        assert!(open.matches(&alert(AlertStatus::Active)));
        assert!(open.matches(&alert(AlertStatus::Acknowledged)));
        assert!(!open.matches(&alert(AlertStatus::Resolved)));

        let other_device = AlertFilter {
            device_id: Some("r2".into()),
            ..Default::default()
        };
        assert!(!other_device.matches(&alert(AlertStatus::Active)));
    }
}
