//! State-transition rules: reachability, polling health, interface and
//! routing-neighbour state

use serde_json::json;

use crate::Device;
use crate::actors::messages::{CycleKind, PollOutcome};
use crate::storage::{MetricSample, MetricType, Severity};

use super::{
    AlertRule, BGP_NEIGHBOR_DOWN, DEVICE_UNREACHABLE, Firing, INTERFACE_DOWN, OSPF_NEIGHBOR_DOWN,
    Observation, POLL_FAILURE, RuleError, is_monitored_interface,
};

pub struct UnreachableRule;

impl AlertRule for UnreachableRule {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    fn evaluate(
        &self,
        device: &Device,
        _kind: CycleKind,
        outcome: &PollOutcome,
    ) -> Result<Vec<Observation>, RuleError> {
        if outcome.is_reachable() {
            return Ok(vec![Observation::clear_with_notes(
                DEVICE_UNREACHABLE,
                "",
                "Device is reachable again (auto-resolved)",
            )]);
        }

        Ok(vec![Observation::firing(
            DEVICE_UNREACHABLE,
            "",
            Firing {
                severity: Severity::Critical,
                title: format!("Device Unreachable: {}", device.name),
                message: format!("Device {} is not responding to ping", device.display()),
                details: json!({ "address": device.address }),
            },
        )])
    }
}

/// A reachable device whose collection keeps failing
pub struct PollFailureRule {
    hysteresis: u32,
}

impl PollFailureRule {
    pub fn new(hysteresis: u32) -> Self {
        Self { hysteresis }
    }
}

impl AlertRule for PollFailureRule {
    fn name(&self) -> &'static str {
        POLL_FAILURE
    }

    fn hysteresis(&self) -> u32 {
        self.hysteresis
    }

    fn evaluate(
        &self,
        device: &Device,
        kind: CycleKind,
        outcome: &PollOutcome,
    ) -> Result<Vec<Observation>, RuleError> {
        let context = kind.to_string();
        match outcome {
            PollOutcome::Unreachable => Ok(Vec::new()),
            PollOutcome::Collected { .. } => Ok(vec![Observation::clear(POLL_FAILURE, context)]),
            PollOutcome::Failed { failure, .. } => Ok(vec![Observation::firing(
                POLL_FAILURE,
                context,
                Firing {
                    severity: Severity::Warning,
                    title: format!("Polling Failed: {}", device.name),
                    message: format!(
                        "{} polling of {} failed: {}",
                        kind,
                        device.display(),
                        failure
                    ),
                    details: json!({ "cycle": kind, "error": failure.to_string() }),
                },
            )]),
        }
    }
}

/// Operationally down interfaces that are not administratively shut down
pub struct InterfaceDownRule;

impl AlertRule for InterfaceDownRule {
    fn name(&self) -> &'static str {
        INTERFACE_DOWN
    }

    fn evaluate(
        &self,
        device: &Device,
        _kind: CycleKind,
        outcome: &PollOutcome,
    ) -> Result<Vec<Observation>, RuleError> {
        let mut observations = Vec::new();

        for sample in outcome
            .samples()
            .iter()
            .filter(|s| s.metric_type == MetricType::InterfaceStatus)
        {
            let interface = sample.context.as_str();
            if !is_monitored_interface(interface) {
                continue;
            }
            if !sample.value.is_finite() {
                return Err(RuleError::MalformedSample {
                    metric: MetricType::InterfaceStatus,
                    context: interface.to_string(),
                    reason: "status is not a number".to_string(),
                });
            }

            let admin_down = sample
                .meta_str("admin_status")
                .is_some_and(|s| s.eq_ignore_ascii_case("down"));

            if admin_down {
                observations.push(
                    Observation::clear_with_notes(
                        INTERFACE_DOWN,
                        interface,
                        format!(
                            "Interface {interface} was administratively shutdown (auto-resolved)"
                        ),
                    )
                    .immediately(),
                );
            } else if sample.value >= 1.0 {
                observations.push(Observation::clear_with_notes(
                    INTERFACE_DOWN,
                    interface,
                    format!("Interface {interface} is now up (auto-resolved)"),
                ));
            } else {
                observations.push(Observation::firing(
                    INTERFACE_DOWN,
                    interface,
                    Firing {
                        severity: Severity::Warning,
                        title: format!("Interface Down: {interface}"),
                        message: format!("Interface {} on {} is down", interface, device.name),
                        details: json!({
                            "interface": interface,
                            "if_index": sample.metadata.get("if_index"),
                        }),
                    },
                ));
            }
        }

        Ok(observations)
    }
}

/// Routing adjacency that is not in its healthy state
pub struct NeighborDownRule {
    protocol: &'static str,
    alert_type: &'static str,
    metric: MetricType,
    is_up: fn(&str) -> bool,
}

impl NeighborDownRule {
    /// BGP sessions are healthy only when established
    pub fn bgp() -> Self {
        Self {
            protocol: "BGP",
            alert_type: BGP_NEIGHBOR_DOWN,
            metric: MetricType::BgpNeighborState,
            is_up: |state| state.trim().eq_ignore_ascii_case("established"),
        }
    }

    /// OSPF adjacencies are healthy in any FULL state (FULL/DR, FULL/BDR, ...)
    pub fn ospf() -> Self {
        Self {
            protocol: "OSPF",
            alert_type: OSPF_NEIGHBOR_DOWN,
            metric: MetricType::OspfNeighborState,
            is_up: |state| state.to_lowercase().contains("full"),
        }
    }

    fn state_of(&self, sample: &MetricSample) -> Result<(bool, String), RuleError> {
        if let Some(state) = sample.meta_str("state") {
            return Ok(((self.is_up)(state), state.to_string()));
        }
        if sample.value.is_finite() {
            let up = sample.value >= 1.0;
            return Ok((up, if up { "up" } else { "down" }.to_string()));
        }
        Err(RuleError::MalformedSample {
            metric: self.metric,
            context: sample.context.clone(),
            reason: "no state and no numeric value".to_string(),
        })
    }
}

impl AlertRule for NeighborDownRule {
    fn name(&self) -> &'static str {
        self.alert_type
    }

    fn evaluate(
        &self,
        device: &Device,
        _kind: CycleKind,
        outcome: &PollOutcome,
    ) -> Result<Vec<Observation>, RuleError> {
        let mut observations = Vec::new();

        for sample in outcome
            .samples()
            .iter()
            .filter(|s| s.metric_type == self.metric)
        {
            let neighbor = sample.context.as_str();
            let (up, state) = self.state_of(sample)?;

            if up {
                observations.push(Observation::clear_with_notes(
                    self.alert_type,
                    neighbor,
                    format!("Neighbor recovered to state: {state}"),
                ));
            } else {
                observations.push(Observation::firing(
                    self.alert_type,
                    neighbor,
                    Firing {
                        severity: Severity::Critical,
                        title: format!("{} Neighbor Down", self.protocol),
                        message: format!(
                            "{} neighbor {} on {} is in state: {}",
                            self.protocol, neighbor, device.name, state
                        ),
                        details: json!({
                            "neighbor": neighbor,
                            "state": state,
                            "protocol": self.protocol.to_lowercase(),
                        }),
                    },
                ));
            }
        }

        Ok(observations)
    }
}
