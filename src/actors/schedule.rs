//! Cadence tasks that trigger the fast and slow polling cycles

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, warn};

use crate::config::PollingConfig;

use super::messages::CycleKind;
use super::orchestrator::PollingOrchestrator;

/// Handle for the running cadences
pub struct ScheduleHandle {
    orchestrator: PollingOrchestrator,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ScheduleHandle {
    /// Start one task per cadence. The first cycle of each runs immediately.
    pub fn spawn(orchestrator: PollingOrchestrator, config: &PollingConfig) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let tasks = [CycleKind::Fast, CycleKind::Slow]
            .into_iter()
            .map(|kind| {
                tokio::spawn(run_cadence(
                    orchestrator.clone(),
                    kind,
                    config.interval(kind),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Self {
            orchestrator,
            shutdown,
            tasks,
        }
    }

    /// Stop triggering cycles, cancel the running ones and wait for both
    /// cadences to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.orchestrator.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                error!("cadence task failed: {}", e);
            }
        }
    }
}

#[instrument(skip(orchestrator, shutdown), fields(kind = %kind))]
async fn run_cadence(
    orchestrator: PollingOrchestrator,
    kind: CycleKind,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("starting {} cadence every {:?}", kind, period);

    let mut ticker = interval(period);
    // A late cycle pushes the schedule back instead of bursting to catch up.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                match orchestrator.run_cycle(kind).await {
                    Ok(report) => {
                        if report.duration > period {
                            warn!(
                                "{} cycle {} overran its interval ({:?} > {:?})",
                                kind, report.generation, report.duration, period
                            );
                        }
                        info!(
                            "{} cycle {}: {} devices, {} unreachable, {} failed, {} abandoned in {:?}",
                            kind,
                            report.generation,
                            report.devices.len(),
                            report.unreachable(),
                            report.failed(),
                            report.abandoned,
                            report.duration
                        );
                    }
                    Err(e) => error!("{} cycle failed: {}", kind, e),
                }
            }

            _ = shutdown.changed() => break,
        }
    }

    debug!("{} cadence stopped", kind);
}
