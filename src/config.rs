use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::trace;

use crate::actors::messages::CycleKind;
use crate::{Device, DeviceClass};

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub thresholds: ThresholdsConfig,

    #[serde(default)]
    pub rates: RatesConfig,

    #[serde(default)]
    pub remediation: RemediationConfig,

    /// Storage configuration (defaults to SQLite)
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub notifications: NotificationsConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    /// Static device inventory
    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_fast_interval")]
    pub fast_interval_secs: u64,

    #[serde(default = "default_slow_interval")]
    pub slow_interval_secs: u64,

    /// Upper bound on devices being polled at once, across both cadences
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// How long a probe waits for each reply
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Extra probe attempts before a device is declared unreachable
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,

    #[serde(default = "default_collect_timeout")]
    pub collect_timeout_secs: u64,

    /// Collection timeout for the slow (routing) cadence
    #[serde(default = "default_routing_timeout")]
    pub routing_timeout_secs: u64,

    /// How long in-flight device tasks get after a cancellation request
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_interval_secs: default_fast_interval(),
            slow_interval_secs: default_slow_interval(),
            max_concurrent: default_max_concurrent(),
            probe_timeout_secs: default_probe_timeout(),
            probe_retries: default_probe_retries(),
            collect_timeout_secs: default_collect_timeout(),
            routing_timeout_secs: default_routing_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self, kind: CycleKind) -> Duration {
        match kind {
            CycleKind::Fast => Duration::from_secs(self.fast_interval_secs),
            CycleKind::Slow => Duration::from_secs(self.slow_interval_secs),
        }
    }

    pub fn collect_timeout(&self, kind: CycleKind) -> Duration {
        match kind {
            CycleKind::Fast => Duration::from_secs(self.collect_timeout_secs),
            CycleKind::Slow => Duration::from_secs(self.routing_timeout_secs),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Hard limit on one probe attempt: the reply wait plus the time a
    /// multi-packet probe spends sending
    pub fn probe_deadline(&self) -> Duration {
        self.probe_timeout() + PROBE_SLACK
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Allowance on top of the reply wait for one probe attempt
pub const PROBE_SLACK: Duration = Duration::from_secs(5);

fn default_fast_interval() -> u64 {
    30
}

fn default_slow_interval() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    5
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_probe_retries() -> u32 {
    1
}

fn default_collect_timeout() -> u64 {
    30
}

fn default_routing_timeout() -> u64 {
    120
}

fn default_shutdown_grace() -> u64 {
    10
}

/// Warning/critical levels for one metric
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,

    /// Consecutive cycles a breach (or recovery) must hold before the alert
    /// opens (or clears)
    #[serde(default = "default_hysteresis")]
    pub hysteresis: u32,
}

impl Threshold {
    pub fn new(warning: f64, critical: f64) -> Self {
        Self {
            warning,
            critical,
            hysteresis: default_hysteresis(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_cpu_threshold")]
    pub cpu: Threshold,

    #[serde(default = "default_memory_threshold")]
    pub memory: Threshold,

    #[serde(default = "default_packet_loss_threshold")]
    pub packet_loss: Threshold,

    /// Errors per second on a single interface
    #[serde(default = "default_interface_errors_threshold")]
    pub interface_errors: Threshold,

    #[serde(default = "default_hysteresis")]
    pub poll_failure_hysteresis: u32,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            cpu: default_cpu_threshold(),
            memory: default_memory_threshold(),
            packet_loss: default_packet_loss_threshold(),
            interface_errors: default_interface_errors_threshold(),
            poll_failure_hysteresis: default_hysteresis(),
        }
    }
}

fn default_hysteresis() -> u32 {
    2
}

fn default_cpu_threshold() -> Threshold {
    Threshold::new(70.0, 90.0)
}

fn default_memory_threshold() -> Threshold {
    Threshold::new(75.0, 95.0)
}

fn default_packet_loss_threshold() -> Threshold {
    Threshold::new(10.0, 50.0)
}

fn default_interface_errors_threshold() -> Threshold {
    Threshold::new(1.0, 10.0)
}

/// Plausibility ceilings for derived rates
#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct RatesConfig {
    /// Used when an interface does not report its speed
    #[serde(default = "default_absolute_ceiling")]
    pub absolute_ceiling_bps: f64,

    #[serde(default = "default_error_rate_ceiling")]
    pub error_rate_ceiling: f64,
}

impl Default for RatesConfig {
    fn default() -> Self {
        Self {
            absolute_ceiling_bps: default_absolute_ceiling(),
            error_rate_ceiling: default_error_rate_ceiling(),
        }
    }
}

fn default_absolute_ceiling() -> f64 {
    400_000_000_000.0
}

fn default_error_rate_ceiling() -> f64 {
    1_000_000.0
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RemediationConfig {
    #[serde(default = "default_remediation_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_true")]
    pub use_builtin_playbooks: bool,

    /// Additional (or overriding) playbooks
    #[serde(default)]
    pub playbooks: Vec<PlaybookConfig>,

    /// alert_type -> playbook name
    #[serde(default)]
    pub mappings: HashMap<String, String>,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_remediation_timeout(),
            use_builtin_playbooks: true,
            playbooks: Vec::new(),
            mappings: HashMap::new(),
        }
    }
}

impl RemediationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PlaybookConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Command templates; `{name}` is replaced from the alert context
    pub commands: Vec<String>,

    /// Device classes the playbook may run on; empty means all
    #[serde(default)]
    pub device_classes: Vec<DeviceClass>,
}

fn default_remediation_timeout() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days (samples older than this are deleted)
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./netpulse.db")
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NotificationsConfig {
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct WebhookConfig {
    pub url: String,

    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

/// External programs used by the process-backed collector
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CollectorConfig {
    /// Helper invoked as `<helper> collect|execute ...`; prints JSON on stdout
    #[serde(default = "default_helper")]
    pub helper: PathBuf,

    #[serde(default = "default_ping")]
    pub ping: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            helper: default_helper(),
            ping: default_ping(),
        }
    }
}

fn default_helper() -> PathBuf {
    PathBuf::from("netpulse-collect")
}

fn default_ping() -> PathBuf {
    PathBuf::from("ping")
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let polling = &self.polling;
        if polling.fast_interval_secs == 0 || polling.slow_interval_secs == 0 {
            bail!("polling intervals must be greater than zero");
        }
        if polling.max_concurrent == 0 {
            bail!("polling.max_concurrent must be greater than zero");
        }
        if polling.probe_timeout_secs >= polling.collect_timeout_secs {
            bail!(
                "polling.probe_timeout_secs ({}) must be below polling.collect_timeout_secs ({})",
                polling.probe_timeout_secs,
                polling.collect_timeout_secs
            );
        }

        for (name, threshold) in [
            ("cpu", &self.thresholds.cpu),
            ("memory", &self.thresholds.memory),
            ("packet_loss", &self.thresholds.packet_loss),
            ("interface_errors", &self.thresholds.interface_errors),
        ] {
            if threshold.warning > threshold.critical {
                bail!("thresholds.{name}: warning level is above critical level");
            }
            if threshold.hysteresis == 0 {
                bail!("thresholds.{name}: hysteresis must be at least one cycle");
            }
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if !seen.insert(&device.id) {
                bail!("duplicate device id '{}'", device.id);
            }
        }

        Ok(())
    }
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read configuration file '{path}'"))?;
    let config: Config = serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file '{path}'"))?;
    config.validate()?;
    trace!("loaded config: {config:?}");
    Ok(config)
}
