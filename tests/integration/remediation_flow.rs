//! Remediation dispatch against alerts raised by real polling cycles

use std::time::Duration;

use assert_matches::assert_matches;
use netpulse::DeviceClass;
use netpulse::collector::CollectError;
use netpulse::error::EngineError;
use netpulse::storage::{AlertStatus, RemediationFilter, RemediationStatus, StorageBackend};
use pretty_assertions::assert_eq;

use crate::helpers::{Harness, device, harness, interface_status, routers, test_config};

/// Run one cycle with Gi0/1 down on r1 and return the alert id
async fn interface_down_alert(h: &Harness) -> i64 {
    h.collector
        .push_samples("r1", vec![interface_status("r1", "GigabitEthernet0/1", false)]);
    h.engine.trigger_check_all().await.unwrap();

    let active = h.engine.list_active_alerts().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].alert_type, "interface_down");
    active[0].id
}

async fn logs_for(h: &Harness, device: &str) -> usize {
    h.engine
        .list_remediation_logs(RemediationFilter {
            device_id: Some(device.to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_auto_remediation_success_resolves_alert() {
    let h = harness(test_config(routers(1)));
    let alert_id = interface_down_alert(&h).await;

    let task = h.engine.auto_remediate(alert_id).await.unwrap();
    let log = h.engine.wait_for_remediation(task).await.unwrap();

    assert_eq!(log.status, RemediationStatus::Success);
    assert_eq!(log.playbook_name, "interface_enable");
    assert_eq!(
        log.commands_executed,
        vec!["interface GigabitEthernet0/1", "no shutdown"]
    );
    assert_eq!(log.alert_id, Some(alert_id));
    assert!(log.duration_ms.unwrap() >= 0);

    let alert = h.store.get_alert(alert_id).await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert_eq!(
        alert.resolution_notes.as_deref(),
        Some("Auto-remediated by playbook: interface_enable")
    );

    assert_eq!(
        h.collector.executed(),
        vec![(
            "r1".to_string(),
            vec!["interface GigabitEthernet0/1".to_string(), "no shutdown".to_string()]
        )]
    );
}

#[tokio::test]
async fn test_auto_remediation_failure_keeps_alert_active() {
    let h = harness(test_config(routers(1)));
    let alert_id = interface_down_alert(&h).await;
    h.collector.fail_exec(
        "r1",
        Some(CollectError::CommandFailed {
            command: "no shutdown".to_string(),
            issued: vec!["interface GigabitEthernet0/1".to_string(), "no shutdown".to_string()],
            message: "% Invalid input detected".to_string(),
        }),
    );

    let task = h.engine.auto_remediate(alert_id).await.unwrap();
    let log = h.engine.wait_for_remediation(task).await.unwrap();

    assert_eq!(log.status, RemediationStatus::Failed);
    assert_eq!(log.commands_executed.len(), 2);
    assert!(log.error_message.unwrap().contains("Invalid input"));

    let alert = h.store.get_alert(alert_id).await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Active);

    let failed = h
        .engine
        .list_remediation_logs(RemediationFilter {
            status: Some(RemediationStatus::Failed),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn test_second_remediation_on_device_is_rejected() {
    let h = harness(test_config(vec![
        device("r1", DeviceClass::Router),
        device("r2", DeviceClass::Router),
    ]));
    h.collector.set_exec_delay(Duration::from_millis(300));

    let first = h.engine.run_playbook("r1", "save_config").await.unwrap();

    assert_matches!(
        h.engine.run_playbook("r1", "clear_arp_cache").await,
        Err(EngineError::RemediationInProgress(id)) if id == "r1"
    );
    assert_eq!(logs_for(&h, "r1").await, 1);

    // other devices are not blocked
    let other = h.engine.run_playbook("r2", "save_config").await.unwrap();

    let status = h.engine.get_remediation_status(first).await.unwrap();
    assert_eq!(status.status, RemediationStatus::InProgress);

    assert_eq!(
        h.engine.wait_for_remediation(first).await.unwrap().status,
        RemediationStatus::Success
    );
    assert_eq!(
        h.engine.wait_for_remediation(other).await.unwrap().status,
        RemediationStatus::Success
    );

    // the slot is free again
    let again = h.engine.run_playbook("r1", "clear_arp_cache").await.unwrap();
    h.engine.wait_for_remediation(again).await.unwrap();
    assert_eq!(logs_for(&h, "r1").await, 2);
}

#[tokio::test]
async fn test_unmapped_alert_type_creates_no_log() {
    let h = harness(test_config(routers(1)));
    h.collector.set_reachable("r1", false);
    h.engine.trigger_check_all().await.unwrap();

    let alert = &h.engine.list_active_alerts().await.unwrap()[0];
    assert_matches!(
        h.engine.auto_remediate(alert.id).await,
        Err(EngineError::NoPlaybookMapped(t)) if t == "device_unreachable"
    );
    assert_eq!(logs_for(&h, "r1").await, 0);

    assert_matches!(
        h.engine.auto_remediate(4242).await,
        Err(EngineError::AlertNotFound(4242))
    );
}

#[tokio::test]
async fn test_remediation_timeout_marks_log_failed() {
    let mut config = test_config(routers(1));
    config.remediation.timeout_secs = 1;
    let h = harness(config);
    h.collector.set_exec_delay(Duration::from_secs(3));

    let task = h.engine.run_playbook("r1", "save_config").await.unwrap();
    let log = h.engine.wait_for_remediation(task).await.unwrap();

    assert_eq!(log.status, RemediationStatus::Failed);
    assert!(log.error_message.unwrap().contains("timed out"));
    assert!(log.duration_ms.unwrap() >= 1000);
}

#[tokio::test]
async fn test_firewall_playbooks() {
    let h = harness(test_config(vec![device("fw1", DeviceClass::Firewall)]));

    let task = h.engine.run_playbook("fw1", "clear_xlate").await.unwrap();
    let log = h.engine.wait_for_remediation(task).await.unwrap();
    assert_eq!(log.commands_executed, vec!["clear xlate"]);

    assert_matches!(
        h.engine.run_playbook("fw1", "clear_bgp_session").await,
        Err(EngineError::PlaybookNotApplicable { class: DeviceClass::Firewall, .. })
    );
}
