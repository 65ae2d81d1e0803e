//! Numeric threshold rules

use std::collections::BTreeMap;

use serde_json::json;

use crate::Device;
use crate::actors::messages::{CycleKind, PollOutcome};
use crate::config::Threshold;
use crate::storage::{MetricSample, MetricType, Severity};

use super::{
    AlertRule, Firing, INTERFACE_ERRORS, Observation, RuleError, is_monitored_interface,
};

/// Percentage metric compared against warning and critical levels
pub struct ThresholdRule {
    alert_type: &'static str,
    metric: MetricType,
    label: &'static str,
    threshold: Threshold,
}

impl ThresholdRule {
    pub fn utilization(
        alert_type: &'static str,
        metric: MetricType,
        label: &'static str,
        threshold: Threshold,
    ) -> Self {
        Self {
            alert_type,
            metric,
            label,
            threshold,
        }
    }

    fn severity_for(&self, value: f64) -> Option<(Severity, f64)> {
        if value >= self.threshold.critical {
            Some((Severity::Critical, self.threshold.critical))
        } else if value >= self.threshold.warning {
            Some((Severity::Warning, self.threshold.warning))
        } else {
            None
        }
    }
}

fn latest<'a>(samples: &'a [MetricSample], metric: MetricType) -> Option<&'a MetricSample> {
    samples
        .iter()
        .filter(|s| s.metric_type == metric && s.context.is_empty())
        .max_by_key(|s| s.timestamp)
}

impl AlertRule for ThresholdRule {
    fn name(&self) -> &'static str {
        self.alert_type
    }

    fn hysteresis(&self) -> u32 {
        self.threshold.hysteresis
    }

    fn evaluate(
        &self,
        device: &Device,
        _kind: CycleKind,
        outcome: &PollOutcome,
    ) -> Result<Vec<Observation>, RuleError> {
        let Some(sample) = latest(outcome.samples(), self.metric) else {
            return Ok(Vec::new());
        };

        let value = sample.value;
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(RuleError::MalformedSample {
                metric: self.metric,
                context: String::new(),
                reason: format!("{value} is not a percentage"),
            });
        }

        let Some((severity, level)) = self.severity_for(value) else {
            return Ok(vec![Observation::clear(self.alert_type, "")]);
        };

        let firing = Firing {
            severity,
            title: format!("High {} on {}", self.label, device.name),
            message: format!(
                "{} is at {:.1}% (threshold {:.0}%)",
                self.label, value, level
            ),
            details: json!({
                "metric": self.metric,
                "value": value,
                "threshold": level,
            }),
        };
        Ok(vec![Observation::firing(self.alert_type, "", firing)])
    }
}

/// Per-interface error rate, using the worse of the in and out direction
pub struct InterfaceErrorRule {
    threshold: Threshold,
}

impl InterfaceErrorRule {
    pub fn new(threshold: Threshold) -> Self {
        Self { threshold }
    }
}

impl AlertRule for InterfaceErrorRule {
    fn name(&self) -> &'static str {
        INTERFACE_ERRORS
    }

    fn hysteresis(&self) -> u32 {
        self.threshold.hysteresis
    }

    fn evaluate(
        &self,
        device: &Device,
        _kind: CycleKind,
        outcome: &PollOutcome,
    ) -> Result<Vec<Observation>, RuleError> {
        let mut worst: BTreeMap<&str, f64> = BTreeMap::new();

        for sample in outcome.samples().iter().filter(|s| {
            matches!(
                s.metric_type,
                MetricType::InterfaceInErrorRate | MetricType::InterfaceOutErrorRate
            )
        }) {
            if !is_monitored_interface(&sample.context) {
                continue;
            }
            if !sample.value.is_finite() || sample.value < 0.0 {
                return Err(RuleError::MalformedSample {
                    metric: sample.metric_type,
                    context: sample.context.clone(),
                    reason: format!("{} is not a valid rate", sample.value),
                });
            }
            let entry = worst.entry(sample.context.as_str()).or_insert(0.0);
            *entry = entry.max(sample.value);
        }

        Ok(worst
            .into_iter()
            .map(|(interface, rate)| {
                let severity = if rate >= self.threshold.critical {
                    Severity::Critical
                } else if rate >= self.threshold.warning {
                    Severity::Warning
                } else {
                    return Observation::clear(INTERFACE_ERRORS, interface);
                };

                Observation::firing(
                    INTERFACE_ERRORS,
                    interface,
                    Firing {
                        severity,
                        title: format!("Interface Errors: {interface}"),
                        message: format!(
                            "Interface {} on {} is seeing {:.2} errors/s",
                            interface, device.name, rate
                        ),
                        details: json!({ "interface": interface, "errors_per_second": rate }),
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ProbeResult;
    use crate::rules::{CPU_UTILIZATION, Condition};
    use crate::DeviceClass;
    use chrono::Utc;

    fn device() -> Device {
        Device {
            id: "r1".to_string(),
            name: "core-r1".to_string(),
            address: "10.0.0.1".parse().unwrap(),
            class: DeviceClass::Router,
            credentials_ref: None,
            is_reachable: true,
            last_seen: None,
        }
    }

    fn collected(samples: Vec<MetricSample>) -> PollOutcome {
        PollOutcome::Collected {
            probe: ProbeResult::reachable(Some(1.0), Some(0.0)),
            samples,
        }
    }

    fn cpu_rule() -> ThresholdRule {
        ThresholdRule::utilization(
            CPU_UTILIZATION,
            MetricType::CpuUtilization,
            "CPU",
            Threshold::new(70.0, 90.0),
        )
    }

    fn cpu(value: f64) -> MetricSample {
        MetricSample::new("r1", MetricType::CpuUtilization, value, Utc::now())
    }

    fn severity(observation: &Observation) -> Option<Severity> {
        match &observation.condition {
            Condition::Firing(f) => Some(f.severity),
            Condition::Clear { .. } => None,
        }
    }

    #[test]
    fn test_threshold_levels() {
        let rule = cpu_rule();
        let eval = |v| {
            rule.evaluate(&device(), CycleKind::Fast, &collected(vec![cpu(v)]))
                .unwrap()
        };

        assert_eq!(severity(&eval(50.0)[0]), None);
        assert_eq!(severity(&eval(70.0)[0]), Some(Severity::Warning));
        assert_eq!(severity(&eval(92.0)[0]), Some(Severity::Critical));
    }

    #[test]
    fn test_message_mentions_value_and_level() {
        let observations = cpu_rule()
            .evaluate(&device(), CycleKind::Fast, &collected(vec![cpu(92.0)]))
            .unwrap();
        let Condition::Firing(firing) = &observations[0].condition else {
            panic!("expected firing");
        };
        assert_eq!(firing.title, "High CPU on core-r1");
        assert_eq!(firing.message, "CPU is at 92.0% (threshold 90%)");
    }

    #[test]
    fn test_no_sample_means_no_opinion() {
        let rule = cpu_rule();
        assert!(
            rule.evaluate(&device(), CycleKind::Slow, &collected(vec![]))
                .unwrap()
                .is_empty()
        );
        assert!(
            rule.evaluate(&device(), CycleKind::Fast, &PollOutcome::Unreachable)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_out_of_range_sample_is_an_error() {
        let result = cpu_rule().evaluate(&device(), CycleKind::Fast, &collected(vec![cpu(f64::NAN)]));
        assert!(matches!(result, Err(RuleError::MalformedSample { .. })));

        let result = cpu_rule().evaluate(&device(), CycleKind::Fast, &collected(vec![cpu(140.0)]));
        assert!(result.is_err());
    }

    #[test]
    fn test_interface_errors_use_worst_direction() {
        let rule = InterfaceErrorRule::new(Threshold::new(1.0, 10.0));
        let now = Utc::now();
        let samples = vec![
            MetricSample::new("r1", MetricType::InterfaceInErrorRate, 0.5, now)
                .with_context("GigabitEthernet0/1"),
            MetricSample::new("r1", MetricType::InterfaceOutErrorRate, 12.0, now)
                .with_context("GigabitEthernet0/1"),
            MetricSample::new("r1", MetricType::InterfaceInErrorRate, 0.0, now)
                .with_context("GigabitEthernet0/2"),
            MetricSample::new("r1", MetricType::InterfaceInErrorRate, 50.0, now)
                .with_context("Loopback0"),
        ];

        let observations = rule
            .evaluate(&device(), CycleKind::Fast, &collected(samples))
            .unwrap();

        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].context, "GigabitEthernet0/1");
        assert_eq!(severity(&observations[0]), Some(Severity::Critical));
        assert_eq!(observations[1].context, "GigabitEthernet0/2");
        assert!(!observations[1].is_firing());
    }
}
