//! PollingOrchestrator - runs polling cycles over the device inventory
//!
//! ## Per-device check
//!
//! ```text
//!  wait for permit ──▶ probe (retries) ──┬─ unreachable ──────────────┐
//!                                        └─ reachable ─▶ collect ─────┤
//!                                                                     ▼
//!                                   commit: store samples, update inventory,
//!                                           evaluate alert rules
//! ```
//!
//! Everything up to the commit is cancellable and writes nothing. The commit
//! runs as its own task, so a cycle that gives up on a device never leaves
//! it half-written.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, info, instrument, trace, warn};

use crate::collector::{CollectError, DeviceCollector, ProbeResult};
use crate::config::PollingConfig;
use crate::error::EngineError;
use crate::inventory::Inventory;
use crate::rules::AlertEngine;
use crate::storage::{MetricIngestor, MetricSample, MetricType};
use crate::Device;

use super::messages::{CycleKind, CycleReport, DeviceReport, PollFailure, PollOutcome};

const PROBE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Result of the cancellable half of a device check
enum Gathered {
    Unreachable,
    Collected {
        probe: ProbeResult,
        samples: Vec<MetricSample>,
    },
    Failed {
        probe: ProbeResult,
        error: CollectError,
    },
}

struct Inner {
    inventory: Arc<dyn Inventory>,
    collector: Arc<dyn DeviceCollector>,
    ingestor: MetricIngestor,
    alerts: Arc<AlertEngine>,
    config: PollingConfig,

    /// Worker pool ceiling. Tokio semaphores are fair, so waiting checks
    /// are served in arrival order.
    permits: Arc<Semaphore>,
    generation: AtomicU64,
    fast_running: Mutex<()>,
    slow_running: Mutex<()>,
    cancel: watch::Sender<bool>,
}

/// Cheap to clone; all clones drive the same pool and counters.
#[derive(Clone)]
pub struct PollingOrchestrator {
    inner: Arc<Inner>,
}

impl PollingOrchestrator {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        collector: Arc<dyn DeviceCollector>,
        ingestor: MetricIngestor,
        alerts: Arc<AlertEngine>,
        config: PollingConfig,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                inventory,
                collector,
                ingestor,
                alerts,
                permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
                config,
                generation: AtomicU64::new(0),
                fast_running: Mutex::new(()),
                slow_running: Mutex::new(()),
                cancel,
            }),
        }
    }

    /// Number of cycles started so far, across both cadences
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    /// Cancel the running cycles and refuse new ones. Device checks that
    /// already started get the shutdown grace period.
    pub fn cancel(&self) {
        debug!("cancelling polling");
        self.inner.cancel.send_replace(true);
    }

    /// Poll every device in the inventory once.
    ///
    /// A second call for the same cadence waits until the first one has
    /// drained.
    #[instrument(skip(self), fields(generation = tracing::field::Empty))]
    pub async fn run_cycle(&self, kind: CycleKind) -> Result<CycleReport, EngineError> {
        let inner = &self.inner;
        let _running = match kind {
            CycleKind::Fast => inner.fast_running.lock().await,
            CycleKind::Slow => inner.slow_running.lock().await,
        };

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::Span::current().record("generation", generation);

        let started_at = Utc::now();
        let started = Instant::now();
        let mut report = CycleReport {
            kind,
            generation,
            started_at,
            duration: Duration::ZERO,
            devices: Vec::new(),
            abandoned: 0,
            cancelled: false,
        };

        let mut cancel = inner.cancel.subscribe();
        if *cancel.borrow() {
            report.cancelled = true;
            return Ok(report);
        }

        let devices = inner.inventory.list_devices().await?;
        debug!("starting {} cycle over {} devices", kind, devices.len());

        let mut tasks = JoinSet::new();
        for device in devices {
            tasks.spawn(check(inner.clone(), device, kind, cancel.clone()));
        }

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(Some(device))) => report.devices.push(device),
                    Some(Ok(None)) => report.abandoned += 1,
                    Some(Err(e)) => {
                        warn!("device task failed: {}", e);
                        report.abandoned += 1;
                    }
                    None => break,
                },
                _ = cancelled(&mut cancel) => {
                    report.cancelled = true;
                    break;
                }
            }
        }

        if report.cancelled {
            let deadline = Instant::now() + inner.config.shutdown_grace();
            loop {
                match timeout_at(deadline, tasks.join_next()).await {
                    Ok(Some(Ok(Some(device)))) => report.devices.push(device),
                    Ok(Some(_)) => report.abandoned += 1,
                    Ok(None) => break,
                    Err(_) => {
                        warn!("abandoning {} device checks after grace period", tasks.len());
                        report.abandoned += tasks.len();
                        tasks.abort_all();
                        break;
                    }
                }
            }
        }

        report.duration = started.elapsed();
        Ok(report)
    }

    /// Check one device right away, outside the cadences. Shares the worker
    /// pool with running cycles.
    #[instrument(skip(self))]
    pub async fn check_device(
        &self,
        device_id: &str,
        kind: CycleKind,
    ) -> Result<DeviceReport, EngineError> {
        let device = self
            .inner
            .inventory
            .get_device(device_id)
            .await?
            .ok_or_else(|| EngineError::DeviceNotFound(device_id.to_string()))?;

        check(self.inner.clone(), device, kind, self.inner.cancel.subscribe())
            .await
            .ok_or(EngineError::Cancelled)
    }
}

/// Resolves once cancellation has been requested
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        // Sender gone: the orchestrator is being dropped, nothing will cancel us.
        std::future::pending::<()>().await;
    }
}

/// One device check. `None` means the check was cancelled before it
/// committed anything.
async fn check(
    inner: Arc<Inner>,
    device: Device,
    kind: CycleKind,
    mut cancel: watch::Receiver<bool>,
) -> Option<DeviceReport> {
    let permit = tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => {
            trace!("{} cancelled while queued", device.id);
            return None;
        }
        permit = inner.permits.clone().acquire_owned() => permit.ok()?,
    };

    let gathered = inner.gather(&device, kind).await;

    // Detached so that aborting this task cannot interrupt the writes.
    let committing = tokio::spawn(commit(inner, device, kind, gathered, permit));
    match committing.await {
        Ok(report) => Some(report),
        Err(e) => {
            warn!("commit task failed: {}", e);
            None
        }
    }
}

impl Inner {
    #[instrument(skip_all, fields(device = %device.id, kind = %kind))]
    async fn gather(&self, device: &Device, kind: CycleKind) -> Gathered {
        let probe = self.probe(device).await;
        if !probe.reachable {
            debug!("{} is unreachable, skipping collection", device.display());
            return Gathered::Unreachable;
        }

        let limit = self.config.collect_timeout(kind);
        let collected = match timeout(limit, self.collector.collect(device, kind, limit)).await {
            Ok(result) => result,
            Err(_) => Err(CollectError::Timeout(limit)),
        };

        match collected {
            Ok(samples) => {
                trace!("collected {} samples", samples.len());
                Gathered::Collected { probe, samples }
            }
            Err(error) => Gathered::Failed { probe, error },
        }
    }

    async fn probe(&self, device: &Device) -> ProbeResult {
        let reply_timeout = self.config.probe_timeout();
        let deadline = self.config.probe_deadline();
        let mut attempt = 0;

        loop {
            let result = timeout(deadline, self.collector.probe(device, reply_timeout))
                .await
                .unwrap_or_else(|_| ProbeResult::unreachable());

            if result.reachable || attempt >= self.config.probe_retries {
                return result;
            }

            attempt += 1;
            trace!("probe of {} failed, retry {}", device.id, attempt);
            sleep(PROBE_RETRY_DELAY).await;
        }
    }

    async fn mark(&self, device: &Device, reachable: bool, at: DateTime<Utc>) {
        if let Err(e) = self
            .inventory
            .update_reachability(&device.id, reachable, at)
            .await
        {
            warn!("failed to update reachability of {}: {}", device.id, e);
        }
    }
}

fn probe_samples(device: &Device, probe: &ProbeResult, at: DateTime<Utc>) -> Vec<MetricSample> {
    let mut samples = Vec::with_capacity(2);
    if let Some(latency) = probe.latency_ms {
        samples.push(
            MetricSample::new(&device.id, MetricType::PingLatency, latency, at).with_unit("ms"),
        );
    }
    if let Some(loss) = probe.packet_loss {
        samples.push(MetricSample::new(&device.id, MetricType::PingLoss, loss, at).with_unit("%"));
    }
    samples
}

#[instrument(skip_all, fields(device = %device.id, kind = %kind))]
async fn commit(
    inner: Arc<Inner>,
    device: Device,
    kind: CycleKind,
    gathered: Gathered,
    _permit: OwnedSemaphorePermit,
) -> DeviceReport {
    let checked_at = Utc::now();

    let outcome = match gathered {
        Gathered::Unreachable => {
            inner.mark(&device, false, checked_at).await;
            PollOutcome::Unreachable
        }
        Gathered::Failed { probe, error } => {
            warn!("collection from {} failed: {}", device.display(), error);
            inner.mark(&device, true, checked_at).await;
            PollOutcome::Failed {
                probe,
                failure: PollFailure::Collect(error),
            }
        }
        Gathered::Collected { probe, mut samples } => {
            if kind == CycleKind::Fast {
                samples.extend(probe_samples(&device, &probe, checked_at));
            }
            let mut written: Vec<MetricSample> = samples
                .iter()
                .filter(|s| !s.metric_type.is_derived())
                .cloned()
                .collect();

            match inner.ingestor.ingest(samples).await {
                Ok(ingested) => {
                    trace!(
                        "stored {} samples, derived {} rates",
                        ingested.raw,
                        ingested.derived.len()
                    );
                    written.extend(ingested.derived);
                    inner.mark(&device, true, checked_at).await;
                    PollOutcome::Collected {
                        probe,
                        samples: written,
                    }
                }
                Err(e) => {
                    warn!("failed to store samples for {}: {}", device.id, e);
                    inner.mark(&device, true, checked_at).await;
                    PollOutcome::Failed {
                        probe,
                        failure: PollFailure::Storage(e.to_string()),
                    }
                }
            }
        }
    };

    let alerts = inner.alerts.evaluate(&device, kind, &outcome).await;
    if !alerts.opened.is_empty() || !alerts.resolved.is_empty() {
        info!(
            "{}: {} alerts opened, {} resolved",
            device.display(),
            alerts.opened.len(),
            alerts.resolved.len()
        );
    }

    DeviceReport {
        device_id: device.id,
        kind,
        checked_at,
        outcome,
        alerts,
    }
}
