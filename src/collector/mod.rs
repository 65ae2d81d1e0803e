//! Device collector interface
//!
//! Collectors hide the wire protocols (ICMP, SNMP, SSH) behind three
//! operations: a cheap reachability probe, a metric collection bounded by a
//! timeout, and a privileged command path used by remediation.

pub mod exec;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::Device;
use crate::actors::messages::CycleKind;
use crate::storage::MetricSample;

/// Result of a reachability probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub reachable: bool,

    /// Round-trip time, when the probe measures one
    pub latency_ms: Option<f64>,

    /// Percentage of probe packets lost
    pub packet_loss: Option<f64>,
}

impl ProbeResult {
    pub fn reachable(latency_ms: Option<f64>, packet_loss: Option<f64>) -> Self {
        Self {
            reachable: true,
            latency_ms,
            packet_loss,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            latency_ms: None,
            packet_loss: Some(100.0),
        }
    }
}

/// Output of a privileged command run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    /// Commands in the order they were sent to the device
    pub issued: Vec<String>,
    pub output: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// A command was rejected part way through a run. `issued` holds every
    /// command sent, including the failing one.
    #[error("command '{command}' failed: {message}")]
    CommandFailed {
        command: String,
        issued: Vec<String>,
        message: String,
    },
}

#[async_trait]
pub trait DeviceCollector: Send + Sync {
    /// Lightweight liveness check. `reply_timeout` is how long to wait for
    /// each reply; the whole probe must end within
    /// `reply_timeout + PROBE_SLACK`.
    ///
    /// [`PROBE_SLACK`]: crate::config::PROBE_SLACK
    async fn probe(&self, device: &Device, reply_timeout: Duration) -> ProbeResult;

    /// Gather the metrics for one cadence. Fast cycles return system and
    /// interface metrics, slow cycles return routing-protocol state.
    async fn collect(
        &self,
        device: &Device,
        kind: CycleKind,
        timeout: Duration,
    ) -> Result<Vec<MetricSample>, CollectError>;

    /// Run configuration commands in order, stopping at the first failure.
    async fn execute_commands(
        &self,
        device: &Device,
        commands: &[String],
    ) -> Result<ExecutionResult, CollectError>;
}
