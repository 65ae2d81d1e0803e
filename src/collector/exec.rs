//! Collector backed by external programs
//!
//! Reachability uses the system `ping`. Metric collection and command
//! execution are delegated to a helper program that speaks the device
//! protocols and prints JSON on stdout:
//!
//! ```text
//! <helper> collect <fast|slow> <address> --device-id <id> --class <class> [--credentials <ref>]
//!     stdout: [{"metric_type": "cpu_utilization", "value": 42.0, ...}, ...]
//!
//! <helper> execute <address> --device-id <id> --class <class> [--credentials <ref>]
//!     stdin:  one command per line
//!     stdout: {"issued": [...], "output": "...", "failed_command": null, "error": null}
//! ```
//!
//! Exit code 77 means the device rejected the credentials.

use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, trace};

use crate::Device;
use crate::actors::messages::CycleKind;
use crate::config::CollectorConfig;
use crate::storage::{MetricSample, MetricType};

use super::{CollectError, DeviceCollector, ExecutionResult, ProbeResult};

const EXIT_AUTH_FAILURE: i32 = 77;
const PING_COUNT: u32 = 3;

/// Spacing between echo requests sent by `ping`
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Process start-up and output parsing
const PING_MARGIN: Duration = Duration::from_secs(1);

static PACKET_LOSS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d.]+)% packet loss").expect("valid regex"));

static RTT_AVG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = [\d.]+/([\d.]+)/")
        .expect("valid regex")
});

/// One metric as printed by the helper
#[derive(Debug, Deserialize)]
struct CollectedMetric {
    metric_type: MetricType,
    #[serde(default)]
    context: String,
    value: f64,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct ExecutionReport {
    #[serde(default)]
    issued: Vec<String>,
    #[serde(default)]
    output: String,
    #[serde(default)]
    failed_command: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct ExecCollector {
    helper: PathBuf,
    ping: PathBuf,
}

impl ExecCollector {
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            helper: config.helper.clone(),
            ping: config.ping.clone(),
        }
    }

    fn helper_command(&self, action: &str, device: &Device) -> Command {
        let mut command = Command::new(&self.helper);
        command
            .arg(action)
            .env("NETPULSE_DEVICE_ID", &device.id)
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    fn device_args(command: &mut Command, device: &Device) {
        command
            .arg(device.address.to_string())
            .arg("--device-id")
            .arg(&device.id)
            .arg("--class")
            .arg(device.class.to_string());
        if let Some(credentials) = &device.credentials_ref {
            command.arg("--credentials").arg(credentials);
        }
    }

    async fn run(mut command: Command, stdin: Option<String>) -> anyhow::Result<Output> {
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }
        let mut child = command.spawn().context("failed to spawn collector helper")?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .context("failed to write commands to helper")?;
        }

        child
            .wait_with_output()
            .await
            .context("failed to wait for collector helper")
    }
}

fn stderr_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("helper exited with {}", output.status)
    } else {
        stderr
    }
}

/// Worst case for `ping -c PING_COUNT -W reply_wait`: every request but
/// the last is sent one interval apart, then the last reply is waited for.
fn ping_deadline(reply_wait: Duration) -> Duration {
    PING_INTERVAL * (PING_COUNT - 1) + reply_wait + PING_MARGIN
}

fn parse_ping_output(stdout: &str) -> (Option<f64>, Option<f64>) {
    let loss = PACKET_LOSS
        .captures(stdout)
        .and_then(|c| c[1].parse().ok());
    let latency = RTT_AVG.captures(stdout).and_then(|c| c[1].parse().ok());
    (latency, loss)
}

fn parse_samples(
    device: &Device,
    stdout: &[u8],
    collected_at: DateTime<Utc>,
) -> Result<Vec<MetricSample>, CollectError> {
    let metrics: Vec<CollectedMetric> = serde_json::from_slice(stdout)
        .map_err(|e| CollectError::Protocol(format!("malformed helper output: {e}")))?;

    Ok(metrics
        .into_iter()
        .map(|m| MetricSample {
            device_id: device.id.clone(),
            metric_type: m.metric_type,
            context: m.context,
            value: m.value,
            unit: m.unit,
            timestamp: m.timestamp.unwrap_or(collected_at),
            metadata: m.metadata,
        })
        .collect())
}

#[async_trait]
impl DeviceCollector for ExecCollector {
    #[instrument(skip(self, device), fields(device = %device.display()))]
    async fn probe(&self, device: &Device, reply_timeout: Duration) -> ProbeResult {
        let reply_wait = Duration::from_secs(reply_timeout.as_secs().max(1));
        let mut command = Command::new(&self.ping);
        command
            .arg("-c")
            .arg(PING_COUNT.to_string())
            .arg("-W")
            .arg(reply_wait.as_secs().to_string())
            .arg(device.address.to_string())
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let deadline = ping_deadline(reply_wait);
        let output = match tokio::time::timeout(deadline, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!("failed to run ping: {}", e);
                return ProbeResult::unreachable();
            }
            Err(_) => {
                debug!("ping did not finish within {:?}", deadline);
                return ProbeResult::unreachable();
            }
        };

        let (latency, loss) = parse_ping_output(&String::from_utf8_lossy(&output.stdout));
        trace!("ping latency={:?} loss={:?}", latency, loss);

        // some pings exit non-zero on partial loss
        let answered = loss.is_some_and(|loss| loss < 100.0);
        if !output.status.success() && !answered {
            return ProbeResult::unreachable();
        }
        ProbeResult::reachable(latency, loss)
    }

    #[instrument(skip(self, device), fields(device = %device.display()))]
    async fn collect(
        &self,
        device: &Device,
        kind: CycleKind,
        timeout: Duration,
    ) -> Result<Vec<MetricSample>, CollectError> {
        let mut command = self.helper_command("collect", device);
        command.arg(kind.to_string());
        Self::device_args(&mut command, device);

        let output = tokio::time::timeout(timeout, Self::run(command, None))
            .await
            .map_err(|_| CollectError::Timeout(timeout))?
            .map_err(|e| CollectError::Protocol(format!("{e:#}")))?;

        match output.status.code() {
            Some(0) => parse_samples(device, &output.stdout, Utc::now()),
            Some(EXIT_AUTH_FAILURE) => Err(CollectError::AuthFailure(stderr_message(&output))),
            _ => Err(CollectError::Protocol(stderr_message(&output))),
        }
    }

    #[instrument(skip(self, device, commands), fields(device = %device.display(), count = commands.len()))]
    async fn execute_commands(
        &self,
        device: &Device,
        commands: &[String],
    ) -> Result<ExecutionResult, CollectError> {
        let mut command = self.helper_command("execute", device);
        Self::device_args(&mut command, device);

        let output = Self::run(command, Some(commands.join("\n") + "\n"))
            .await
            .map_err(|e| CollectError::Protocol(format!("{e:#}")))?;

        if output.status.code() == Some(EXIT_AUTH_FAILURE) {
            return Err(CollectError::AuthFailure(stderr_message(&output)));
        }

        let report: Option<ExecutionReport> = serde_json::from_slice(&output.stdout).ok();

        match (output.status.success(), report) {
            (true, Some(report)) => Ok(ExecutionResult {
                issued: report.issued,
                output: report.output,
            }),
            (true, None) => Err(CollectError::Protocol(
                "malformed helper output for execute".to_string(),
            )),
            (false, Some(report)) => Err(CollectError::CommandFailed {
                command: report.failed_command.unwrap_or_default(),
                issued: report.issued,
                message: report.error.unwrap_or_else(|| stderr_message(&output)),
            }),
            (false, None) => Err(CollectError::Protocol(stderr_message(&output))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceClass;
    use crate::config::{PROBE_SLACK, PollingConfig};

    fn device() -> Device {
        Device {
            id: "sw1".to_string(),
            name: "sw1".to_string(),
            address: "10.0.0.2".parse().unwrap(),
            class: DeviceClass::Switch,
            credentials_ref: None,
            is_reachable: true,
            last_seen: None,
        }
    }

    /// Collector whose `ping` is a shell script printing `stdout` after `delay`
    #[cfg(unix)]
    fn scripted_ping(dir: &tempfile::TempDir, delay: &str, stdout: &str, code: i32) -> ExecCollector {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("ping");
        let script = format!("#!/bin/sh\nsleep {delay}\ncat <<'EOF'\n{stdout}EOF\nexit {code}\n");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        ExecCollector {
            helper: PathBuf::from("netpulse-collect"),
            ping: path,
        }
    }

    const LOSSY_PING: &str = "\
--- 10.0.0.2 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
rtt min/avg/max/mdev = 0.398/0.405/0.412/0.007 ms
";

    #[test]
    fn test_ping_deadline_fits_the_attempt_limit() {
        let polling = PollingConfig::default();
        let worst_case = ping_deadline(polling.probe_timeout());

        // two send intervals plus the final reply wait
        assert!(worst_case > polling.probe_timeout() + Duration::from_secs(2));
        assert!(worst_case < polling.probe_timeout() + PROBE_SLACK);
        assert_eq!(polling.probe_deadline(), polling.probe_timeout() + PROBE_SLACK);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ping_with_lost_last_reply_is_reachable() {
        let dir = tempfile::tempdir().unwrap();
        // sending takes ~2s, then the lost reply is waited for
        let collector = scripted_ping(&dir, "4.5", LOSSY_PING, 0);

        let result = collector
            .probe(&device(), PollingConfig::default().probe_timeout())
            .await;

        assert!(result.reachable);
        assert_eq!(result.packet_loss, Some(33.3333));
        assert_eq!(result.latency_ms, Some(0.405));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ping_partial_loss_with_nonzero_exit_is_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let collector = scripted_ping(&dir, "0", LOSSY_PING, 1);

        let result = collector.probe(&device(), Duration::from_secs(1)).await;
        assert!(result.reachable);
        assert_eq!(result.packet_loss, Some(33.3333));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ping_without_replies_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let stdout = "3 packets transmitted, 0 received, 100% packet loss, time 2040ms\n";
        let collector = scripted_ping(&dir, "0", stdout, 1);

        let result = collector.probe(&device(), Duration::from_secs(1)).await;
        assert!(!result.reachable);
    }

    #[test]
    fn test_parse_linux_ping_output() {
        let stdout = "\
PING 10.0.0.1 (10.0.0.1) 56(84) bytes of data.
64 bytes from 10.0.0.1: icmp_seq=1 ttl=64 time=0.412 ms

--- 10.0.0.1 ping statistics ---
3 packets transmitted, 2 received, 33.3333% packet loss, time 2003ms
rtt min/avg/max/mdev = 0.398/0.405/0.412/0.007 ms
";
        let (latency, loss) = parse_ping_output(stdout);
        assert_eq!(latency, Some(0.405));
        assert_eq!(loss, Some(33.3333));
    }

    #[test]
    fn test_parse_bsd_ping_output() {
        let stdout = "3 packets transmitted, 3 packets received, 0.0% packet loss\n\
round-trip min/avg/max/stddev = 1.1/2.2/3.3/0.4 ms\n";
        assert_eq!(parse_ping_output(stdout), (Some(2.2), Some(0.0)));
    }

    #[test]
    fn test_parse_helper_samples() {
        let device = device();
        let stdout = br#"[
            {"metric_type": "cpu_utilization", "value": 12.5, "unit": "percent"},
            {"metric_type": "interface_in_octets", "context": "Gi0/1", "value": 1000,
             "metadata": {"counter_bits": 64, "if_index": 1}}
        ]"#;
        let now = Utc::now();

        let samples = parse_samples(&device, stdout, now).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].metric_type, MetricType::CpuUtilization);
        assert_eq!(samples[0].timestamp, now);
        assert_eq!(samples[1].context, "Gi0/1");
        assert_eq!(samples[1].meta_u64("counter_bits"), Some(64));
        assert!(samples.iter().all(|s| s.device_id == "sw1"));

        assert!(matches!(
            parse_samples(&device, b"not json", now),
            Err(CollectError::Protocol(_))
        ));
    }
}
