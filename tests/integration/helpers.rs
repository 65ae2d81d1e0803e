//! Helper functions for integration tests

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use netpulse::actors::messages::CycleKind;
use netpulse::collector::{CollectError, DeviceCollector, ExecutionResult, ProbeResult};
use netpulse::config::{Config, PollingConfig, StorageConfig};
use netpulse::engine::MonitoringEngine;
use netpulse::inventory::StaticInventory;
use netpulse::storage::{MemoryBackend, MetricSample, MetricType};
use netpulse::{Device, DeviceClass};
use serde_json::json;

#[derive(Default)]
struct Script {
    down: bool,
    batches: VecDeque<Vec<MetricSample>>,
    collect_error: Option<CollectError>,
    exec_error: Option<CollectError>,
}

/// Scripted stand-in for real devices.
///
/// Every device is reachable and returns no samples until told otherwise.
/// Queued sample batches are handed out one per collect call.
#[derive(Default)]
pub struct MockCollector {
    scripts: Mutex<HashMap<String, Script>>,
    collect_delay: Mutex<Duration>,
    exec_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    collect_calls: AtomicUsize,
    executed: Mutex<Vec<(String, Vec<String>)>>,
}

impl MockCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script<R>(&self, device: &str, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut scripts = self.scripts.lock().unwrap();
        f(scripts.entry(device.to_string()).or_default())
    }

    pub fn set_reachable(&self, device: &str, reachable: bool) {
        self.script(device, |s| s.down = !reachable);
    }

    pub fn push_samples(&self, device: &str, samples: Vec<MetricSample>) {
        self.script(device, |s| s.batches.push_back(samples));
    }

    pub fn fail_collect(&self, device: &str, error: Option<CollectError>) {
        self.script(device, |s| s.collect_error = error);
    }

    pub fn fail_exec(&self, device: &str, error: Option<CollectError>) {
        self.script(device, |s| s.exec_error = error);
    }

    pub fn set_collect_delay(&self, delay: Duration) {
        *self.collect_delay.lock().unwrap() = delay;
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock().unwrap() = delay;
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn collect_calls(&self) -> usize {
        self.collect_calls.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<(String, Vec<String>)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceCollector for MockCollector {
    async fn probe(&self, device: &Device, _timeout: Duration) -> ProbeResult {
        if self.script(&device.id, |s| s.down) {
            ProbeResult::unreachable()
        } else {
            ProbeResult::reachable(Some(2.0), Some(0.0))
        }
    }

    async fn collect(
        &self,
        device: &Device,
        _kind: CycleKind,
        _timeout: Duration,
    ) -> Result<Vec<MetricSample>, CollectError> {
        self.collect_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.collect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = self.script(&device.id, |s| match &s.collect_error {
            Some(error) => Err(error.clone()),
            None => Ok(s.batches.pop_front().unwrap_or_default()),
        });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn execute_commands(
        &self,
        device: &Device,
        commands: &[String],
    ) -> Result<ExecutionResult, CollectError> {
        let delay = *self.exec_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.executed
            .lock()
            .unwrap()
            .push((device.id.clone(), commands.to_vec()));

        match self.script(&device.id, |s| s.exec_error.clone()) {
            Some(error) => Err(error),
            None => Ok(ExecutionResult {
                issued: commands.to_vec(),
                output: format!("{} commands applied", commands.len()),
            }),
        }
    }
}

pub fn device(id: &str, class: DeviceClass) -> Device {
    Device {
        id: id.to_string(),
        name: format!("{id}.lab"),
        address: "192.0.2.10".parse().unwrap(),
        class,
        credentials_ref: Some(format!("vault:{id}")),
        is_reachable: true,
        last_seen: None,
    }
}

pub fn routers(count: usize) -> Vec<Device> {
    (1..=count)
        .map(|i| device(&format!("r{i}"), DeviceClass::Router))
        .collect()
}

/// In-memory configuration with short timeouts and no probe retries
pub fn test_config(devices: Vec<Device>) -> Config {
    Config {
        polling: PollingConfig {
            probe_timeout_secs: 1,
            probe_retries: 0,
            collect_timeout_secs: 2,
            routing_timeout_secs: 2,
            shutdown_grace_secs: 1,
            ..Default::default()
        },
        storage: StorageConfig::None,
        devices,
        ..Default::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryBackend>,
    pub inventory: Arc<StaticInventory>,
    pub collector: Arc<MockCollector>,
    pub engine: MonitoringEngine,
}

pub fn harness(config: Config) -> Harness {
    let store = Arc::new(MemoryBackend::new());
    let inventory = Arc::new(StaticInventory::new(config.devices.clone()));
    let collector = MockCollector::new();
    let engine = MonitoringEngine::new(
        config,
        store.clone(),
        inventory.clone(),
        collector.clone(),
    )
    .unwrap();

    Harness {
        store,
        inventory,
        collector,
        engine,
    }
}

pub fn cpu(device: &str, value: f64, at: DateTime<Utc>) -> MetricSample {
    MetricSample::new(device, MetricType::CpuUtilization, value, at).with_unit("%")
}

pub fn interface_status(device: &str, interface: &str, up: bool) -> MetricSample {
    MetricSample::new(
        device,
        MetricType::InterfaceStatus,
        if up { 1.0 } else { 0.0 },
        Utc::now(),
    )
    .with_context(interface)
    .with_metadata(json!({ "admin_status": "up", "if_index": 3 }))
}

pub fn in_octets(device: &str, interface: &str, value: u64, at: DateTime<Utc>) -> MetricSample {
    MetricSample::new(device, MetricType::InterfaceInOctets, value as f64, at)
        .with_context(interface)
        .with_metadata(json!({ "counter_bits": 32, "if_index": 3 }))
}
