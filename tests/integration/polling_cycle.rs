//! End-to-end polling: orchestrator, ingestion, rules and alert lifecycle

use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use netpulse::DeviceClass;
use netpulse::actors::messages::{CycleKind, PollFailure, PollOutcome};
use netpulse::collector::CollectError;
use netpulse::config::Threshold;
use netpulse::error::EngineError;
use netpulse::inventory::Inventory;
use netpulse::storage::{AlertFilter, AlertStatus, MetricType, Severity, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::{cpu, device, harness, in_octets, interface_status, routers, test_config};

#[tokio::test]
async fn test_unreachable_device_alerts_then_auto_resolves() {
    let h = harness(test_config(routers(1)));
    h.collector.set_reachable("r1", false);

    let report = h.engine.trigger_check_all().await.unwrap();
    assert_matches!(report.device("r1").unwrap().outcome, PollOutcome::Unreachable);
    assert_eq!(h.collector.collect_calls(), 0);

    for metric in [MetricType::CpuUtilization, MetricType::PingLatency, MetricType::PingLoss] {
        assert!(h.store.query_latest("r1", metric, "", 10).await.unwrap().is_empty());
    }
    assert!(!h.inventory.get_device("r1").await.unwrap().unwrap().is_reachable);

    let active = h.engine.list_active_alerts().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].alert_type, "device_unreachable");
    assert_eq!(active[0].severity, Severity::Critical);
    let id = active[0].id;

    h.collector.set_reachable("r1", true);
    h.collector.push_samples("r1", vec![cpu("r1", 20.0, Utc::now())]);
    h.engine.trigger_check_all().await.unwrap();

    let alert = h.store.get_alert(id).await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert!(alert.resolved_at.is_some());
    assert!(h.engine.list_active_alerts().await.unwrap().is_empty());

    let r1 = h.inventory.get_device("r1").await.unwrap().unwrap();
    assert!(r1.is_reachable);
    assert!(r1.last_seen.is_some());
}

#[tokio::test]
async fn test_persistent_condition_creates_one_alert() {
    let h = harness(test_config(routers(1)));

    for _ in 0..6 {
        h.collector.push_samples("r1", vec![cpu("r1", 97.0, Utc::now())]);
        h.engine.trigger_check_all().await.unwrap();
    }

    let alerts = h
        .engine
        .list_alerts(AlertFilter {
            device_id: Some("r1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, "cpu_utilization");
    assert_eq!(alerts[0].status, AlertStatus::Active);
}

#[tokio::test]
async fn test_cpu_alert_opens_on_second_cycle() {
    let mut config = test_config(routers(1));
    config.thresholds.cpu = Threshold {
        warning: 70.0,
        critical: 80.0,
        hysteresis: 2,
    };
    let h = harness(config);

    let mut opened_per_cycle = Vec::new();
    for _ in 0..3 {
        h.collector.push_samples("r1", vec![cpu("r1", 92.0, Utc::now())]);
        let report = h.engine.trigger_check_all().await.unwrap();
        opened_per_cycle.push(report.device("r1").unwrap().alerts.opened.len());
    }

    assert_eq!(opened_per_cycle, vec![0, 1, 0]);

    let active = h.engine.list_active_alerts().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].severity, Severity::Critical);
    assert_eq!(active[0].message, "CPU is at 92.0% (threshold 80%)");
}

#[tokio::test]
async fn test_interface_rate_is_derived_from_octets() {
    let h = harness(test_config(routers(1)));
    let t0 = Utc::now() - chrono::Duration::seconds(60);
    let t1 = t0 + chrono::Duration::seconds(10);

    h.collector
        .push_samples("r1", vec![in_octets("r1", "GigabitEthernet0/3", 1_000_000, t0)]);
    h.collector
        .push_samples("r1", vec![in_octets("r1", "GigabitEthernet0/3", 1_256_000, t1)]);

    h.engine.trigger_check_all().await.unwrap();
    let report = h.engine.trigger_check_all().await.unwrap();

    let rates = h
        .store
        .query_latest("r1", MetricType::InterfaceInRate, "GigabitEthernet0/3", 10)
        .await
        .unwrap();
    assert_eq!(rates.len(), 1);
    assert_eq!(rates[0].value, 204_800.0);
    assert_eq!(rates[0].timestamp, t1);
    assert_eq!(rates[0].unit.as_deref(), Some("bps"));

    // the outcome handed to the rules includes the derived sample
    let samples = report.device("r1").unwrap().outcome.samples();
    assert!(samples.iter().any(|s| s.metric_type == MetricType::InterfaceInRate));
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let h = harness(test_config(routers(12)));
    h.collector.set_collect_delay(Duration::from_millis(100));

    let report = h.engine.trigger_check_all().await.unwrap();

    assert_eq!(report.devices.len(), 12);
    assert_eq!(report.reachable(), 12);
    assert!(h.collector.max_in_flight() <= 5, "max in flight: {}", h.collector.max_in_flight());
    assert!(h.collector.max_in_flight() >= 2);
}

#[tokio::test]
async fn test_collect_failure_is_isolated() {
    let h = harness(test_config(routers(2)));
    h.collector.push_samples("r1", vec![cpu("r1", 10.0, Utc::now())]);
    h.engine.trigger_check_all().await.unwrap();

    h.collector
        .fail_collect("r1", Some(CollectError::AuthFailure("bad community".to_string())));

    let mut reports = Vec::new();
    for _ in 0..2 {
        h.collector.push_samples("r2", vec![cpu("r2", 15.0, Utc::now())]);
        reports.push(h.engine.trigger_check_all().await.unwrap());
    }

    let last = reports.last().unwrap();
    assert_matches!(
        &last.device("r1").unwrap().outcome,
        PollOutcome::Failed { failure: PollFailure::Collect(CollectError::AuthFailure(_)), .. }
    );
    assert_matches!(last.device("r2").unwrap().outcome, PollOutcome::Collected { .. });
    assert_eq!(last.failed(), 1);

    // r1 keeps its last good sample, r2 kept polling
    let r1_cpu = h
        .store
        .query_latest("r1", MetricType::CpuUtilization, "", 10)
        .await
        .unwrap();
    assert_eq!(r1_cpu.len(), 1);
    assert_eq!(r1_cpu[0].value, 10.0);
    let r2_cpu = h
        .store
        .query_latest("r2", MetricType::CpuUtilization, "", 10)
        .await
        .unwrap();
    assert_eq!(r2_cpu.len(), 2);

    // reachable, but failing twice in a row raises a poll failure
    assert!(h.inventory.get_device("r1").await.unwrap().unwrap().is_reachable);
    let active = h.engine.list_active_alerts().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].alert_type, "poll_failure");
    assert_eq!(active[0].device_id, "r1");
    assert_eq!(active[0].context, "fast");
}

#[tokio::test]
async fn test_collect_timeout_is_a_poll_failure() {
    let h = harness(test_config(routers(1)));
    h.collector.set_collect_delay(Duration::from_secs(4));

    let report = h.engine.trigger_check("r1").await.unwrap();

    assert_matches!(
        report.outcome,
        PollOutcome::Failed { failure: PollFailure::Collect(CollectError::Timeout(_)), .. }
    );
}

#[tokio::test]
async fn test_trigger_check_unknown_device() {
    let h = harness(test_config(routers(1)));
    assert_matches!(
        h.engine.trigger_check("missing").await,
        Err(EngineError::DeviceNotFound(_))
    );
}

#[tokio::test]
async fn test_cancelled_cycle_writes_nothing() {
    let h = harness(test_config(vec![
        device("sw1", DeviceClass::Switch),
        device("sw2", DeviceClass::Switch),
    ]));
    h.collector.set_collect_delay(Duration::from_secs(5));
    for id in ["sw1", "sw2"] {
        h.collector.push_samples(id, vec![cpu(id, 50.0, Utc::now())]);
    }

    let (report, _) = tokio::join!(h.engine.trigger_check_all(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.engine.shutdown().await;
    });
    let report = report.unwrap();

    assert!(report.cancelled);
    assert!(report.devices.is_empty());
    assert_eq!(report.abandoned, 2);

    for id in ["sw1", "sw2"] {
        assert!(
            h.store
                .query_latest(id, MetricType::CpuUtilization, "", 1)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(h.inventory.get_device(id).await.unwrap().unwrap().last_seen.is_none());
    }
    assert!(h.engine.list_active_alerts().await.unwrap().is_empty());

    assert_matches!(h.engine.trigger_check("sw1").await, Err(EngineError::Cancelled));

    // later cycles report the cancellation instead of polling
    let later = h.engine.trigger_check_all().await.unwrap();
    assert!(later.cancelled);
    assert!(later.devices.is_empty());
    assert_eq!(later.abandoned, 0);
}

#[tokio::test]
async fn test_slow_cycle_evaluates_routing_state() {
    let h = harness(test_config(routers(1)));
    h.collector.push_samples(
        "r1",
        vec![
            netpulse::storage::MetricSample::new("r1", MetricType::BgpNeighborState, 0.0, Utc::now())
                .with_context("10.0.0.2")
                .with_metadata(serde_json::json!({ "state": "Active" })),
        ],
    );

    let report = h.engine.trigger_cycle(CycleKind::Slow).await.unwrap();
    assert_eq!(report.kind, CycleKind::Slow);

    let active = h.engine.list_active_alerts().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].alert_type, "bgp_neighbor_down");
    assert_eq!(active[0].context, "10.0.0.2");
}

#[tokio::test]
async fn test_acknowledged_alert_is_not_duplicated() {
    let h = harness(test_config(routers(1)));
    h.collector.push_samples("r1", vec![interface_status("r1", "GigabitEthernet0/1", false)]);
    h.engine.trigger_check_all().await.unwrap();

    let id = h.engine.list_active_alerts().await.unwrap()[0].id;
    let acked = h.engine.acknowledge_alert(id, "noc-oncall").await.unwrap();
    assert_eq!(acked.acknowledged_by.as_deref(), Some("noc-oncall"));

    h.collector.push_samples("r1", vec![interface_status("r1", "GigabitEthernet0/1", false)]);
    h.engine.trigger_check_all().await.unwrap();

    let open = h.engine.list_alerts(AlertFilter::open()).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, AlertStatus::Acknowledged);

    h.collector.push_samples("r1", vec![interface_status("r1", "GigabitEthernet0/1", true)]);
    h.engine.trigger_check_all().await.unwrap();
    assert_eq!(
        h.store.get_alert(id).await.unwrap().unwrap().status,
        AlertStatus::Resolved
    );
}
