//! Message types passed between the orchestrator, the rule engine and the
//! notification actors
//!
//! Reports flow back to callers by value; alert lifecycle changes are
//! broadcast as [`AlertEvent`]s to any number of subscribers.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::DeviceId;
use crate::collector::{CollectError, ProbeResult};
use crate::rules::EvaluationSummary;
use crate::storage::{Alert, MetricSample};

/// The two independent polling cadences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// Liveness, system and interface metrics
    Fast,

    /// Routing-protocol state
    Slow,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Fast => write!(f, "fast"),
            CycleKind::Slow => write!(f, "slow"),
        }
    }
}

/// Why a reachable device produced no fresh metrics
#[derive(Debug, Clone, PartialEq)]
pub enum PollFailure {
    Collect(CollectError),
    Storage(String),
}

impl fmt::Display for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollFailure::Collect(e) => write!(f, "{e}"),
            PollFailure::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

/// Outcome of one device check
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Probe and collection succeeded. `samples` holds everything written,
    /// derived rates included.
    Collected {
        probe: ProbeResult,
        samples: Vec<MetricSample>,
    },

    /// The probe failed; collection was skipped
    Unreachable,

    /// The probe succeeded but collection did not; nothing was written
    Failed {
        probe: ProbeResult,
        failure: PollFailure,
    },
}

impl PollOutcome {
    pub fn is_reachable(&self) -> bool {
        !matches!(self, PollOutcome::Unreachable)
    }

    pub fn samples(&self) -> &[MetricSample] {
        match self {
            PollOutcome::Collected { samples, .. } => samples,
            _ => &[],
        }
    }

    pub fn probe(&self) -> Option<&ProbeResult> {
        match self {
            PollOutcome::Collected { probe, .. } | PollOutcome::Failed { probe, .. } => {
                Some(probe)
            }
            PollOutcome::Unreachable => None,
        }
    }
}

/// Result of checking one device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub device_id: DeviceId,
    pub kind: CycleKind,
    pub checked_at: DateTime<Utc>,
    pub outcome: PollOutcome,
    pub alerts: EvaluationSummary,
}

/// Result of one polling cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub kind: CycleKind,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub devices: Vec<DeviceReport>,

    /// Device tasks dropped by a cancellation before they could commit
    pub abandoned: usize,
    pub cancelled: bool,
}

impl CycleReport {
    pub fn reachable(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.outcome.is_reachable())
            .count()
    }

    pub fn unreachable(&self) -> usize {
        self.devices.len() - self.reachable()
    }

    pub fn failed(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| matches!(d.outcome, PollOutcome::Failed { .. }))
            .count()
    }

    pub fn device(&self, id: &str) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| d.device_id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEventKind {
    Opened,
    Escalated,
    Acknowledged,
    Resolved,
}

/// Broadcast whenever an alert changes state
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub kind: AlertEventKind,
    pub alert: Alert,
}
