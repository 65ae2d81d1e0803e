//! Alert rule engine
//!
//! Rules are pure functions over one device's poll outcome. Each returns an
//! [`Observation`] per (alert_type, context) it has an opinion on:
//!
//! - `Firing` – the condition holds this cycle
//! - `Clear`  – the condition does not hold this cycle
//! - nothing  – the outcome carries no data for the rule (e.g. no CPU sample
//!   in a routing cycle, or an unreachable device); open alerts stay as they are
//!
//! [`AlertEngine`] runs the observations through the hysteresis tracker and
//! turns them into alert lifecycle changes.

pub mod hysteresis;
pub mod lifecycle;
pub mod state;
pub mod threshold;

use serde_json::Value;
use thiserror::Error;

use crate::Device;
use crate::actors::messages::{CycleKind, PollOutcome};
use crate::config::ThresholdsConfig;
use crate::storage::{MetricType, Severity};

pub use lifecycle::{AlertEngine, EvaluationSummary};

pub const DEVICE_UNREACHABLE: &str = "device_unreachable";
pub const POLL_FAILURE: &str = "poll_failure";
pub const CPU_UTILIZATION: &str = "cpu_utilization";
pub const MEMORY_UTILIZATION: &str = "memory_utilization";
pub const PACKET_LOSS: &str = "packet_loss";
pub const INTERFACE_DOWN: &str = "interface_down";
pub const INTERFACE_ERRORS: &str = "interface_errors";
pub const BGP_NEIGHBOR_DOWN: &str = "bgp_neighbor_down";
pub const OSPF_NEIGHBOR_DOWN: &str = "ospf_neighbor_down";

/// Every alert type the built-in rules can raise
pub const ALERT_TYPES: [&str; 9] = [
    DEVICE_UNREACHABLE,
    POLL_FAILURE,
    CPU_UTILIZATION,
    MEMORY_UTILIZATION,
    PACKET_LOSS,
    INTERFACE_DOWN,
    INTERFACE_ERRORS,
    BGP_NEIGHBOR_DOWN,
    OSPF_NEIGHBOR_DOWN,
];

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuleError {
    #[error("malformed {metric} sample{}: {reason}", context_suffix(.context))]
    MalformedSample {
        metric: MetricType,
        context: String,
        reason: String,
    },
}

fn context_suffix(context: &str) -> String {
    if context.is_empty() {
        String::new()
    } else {
        format!(" for {context}")
    }
}

/// Alert content when a condition holds
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Firing(Firing),

    /// `notes` replaces the default resolution note
    Clear { notes: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub alert_type: &'static str,
    pub context: String,
    pub condition: Condition,

    /// Resolve any open alert right away, regardless of the hysteresis window
    pub immediate: bool,
}

impl Observation {
    pub fn firing(alert_type: &'static str, context: impl Into<String>, firing: Firing) -> Self {
        Self {
            alert_type,
            context: context.into(),
            condition: Condition::Firing(firing),
            immediate: false,
        }
    }

    pub fn clear(alert_type: &'static str, context: impl Into<String>) -> Self {
        Self {
            alert_type,
            context: context.into(),
            condition: Condition::Clear { notes: None },
            immediate: false,
        }
    }

    pub fn clear_with_notes(
        alert_type: &'static str,
        context: impl Into<String>,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            alert_type,
            context: context.into(),
            condition: Condition::Clear {
                notes: Some(notes.into()),
            },
            immediate: false,
        }
    }

    pub fn immediately(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn is_firing(&self) -> bool {
        matches!(self.condition, Condition::Firing(_))
    }
}

pub trait AlertRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Consecutive cycles an observation must repeat before it opens or
    /// clears an alert
    fn hysteresis(&self) -> u32 {
        1
    }

    fn evaluate(
        &self,
        device: &Device,
        kind: CycleKind,
        outcome: &PollOutcome,
    ) -> Result<Vec<Observation>, RuleError>;
}

/// The standard rule set, parameterised from the configuration
pub fn default_rules(thresholds: &ThresholdsConfig) -> Vec<Box<dyn AlertRule>> {
    vec![
        Box::new(state::UnreachableRule),
        Box::new(state::PollFailureRule::new(thresholds.poll_failure_hysteresis)),
        Box::new(threshold::ThresholdRule::utilization(
            CPU_UTILIZATION,
            MetricType::CpuUtilization,
            "CPU",
            thresholds.cpu,
        )),
        Box::new(threshold::ThresholdRule::utilization(
            MEMORY_UTILIZATION,
            MetricType::MemoryUtilization,
            "Memory",
            thresholds.memory,
        )),
        Box::new(threshold::ThresholdRule::utilization(
            PACKET_LOSS,
            MetricType::PingLoss,
            "Packet loss",
            thresholds.packet_loss,
        )),
        Box::new(threshold::InterfaceErrorRule::new(thresholds.interface_errors)),
        Box::new(state::InterfaceDownRule),
        Box::new(state::NeighborDownRule::bgp()),
        Box::new(state::NeighborDownRule::ospf()),
    ]
}

/// Interfaces worth alerting on: physical ports and tunnels, never
/// loopbacks or management ports
pub fn is_monitored_interface(name: &str) -> bool {
    const SKIP: [&str; 5] = ["loopback", "null", "voip-null", "management", "mgmt"];
    const PHYSICAL: [&str; 5] = ["gigabitethernet", "fastethernet", "ethernet", "serial", "tunnel"];

    let name = name.to_lowercase();
    !SKIP.iter().any(|p| name.contains(p)) && PHYSICAL.iter().any(|p| name.contains(p))
}
