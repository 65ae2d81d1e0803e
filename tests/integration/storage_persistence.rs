//! Integration tests for the SQLite store
//!
//! These tests verify that:
//! - A full engine run persists samples, alerts and remediation logs
//! - Data survives reopening the database
//! - The per-device remediation slot holds across two connections to one file
//! - A restart never leaves a device locked by an unfinished remediation

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use netpulse::collector::DeviceCollector;
use netpulse::engine::MonitoringEngine;
use netpulse::error::EngineError;
use netpulse::inventory::StaticInventory;
use netpulse::remediation::INTERRUPTED;
use netpulse::storage::sqlite::SqliteBackend;
use netpulse::storage::{
    AlertStatus, MetricType, NewRemediation, RemediationFilter, RemediationStatus, StorageBackend,
    StorageError,
};
use tempfile::tempdir;
use uuid::Uuid;

use crate::helpers::{MockCollector, cpu, interface_status, routers, test_config};

#[tokio::test]
async fn test_engine_state_survives_restart() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("netpulse.db");
    let config = test_config(routers(1));
    let collector = MockCollector::new();

    let alert_id = {
        let store = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
        let engine = MonitoringEngine::new(
            config.clone(),
            store.clone(),
            Arc::new(StaticInventory::new(config.devices.clone())),
            collector.clone() as Arc<dyn DeviceCollector>,
        )
        .unwrap();

        collector.push_samples(
            "r1",
            vec![
                cpu("r1", 42.0, Utc::now()),
                interface_status("r1", "GigabitEthernet0/1", false),
            ],
        );
        engine.trigger_check_all().await.unwrap();

        let alert = engine.list_active_alerts().await.unwrap().remove(0);
        let task = engine.auto_remediate(alert.id).await.unwrap();
        engine.wait_for_remediation(task).await.unwrap();
        engine.shutdown().await;
        alert.id
    };

    let store = SqliteBackend::new(&db_path).await.unwrap();

    let samples = store
        .query_latest("r1", MetricType::CpuUtilization, "", 10)
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, 42.0);

    let alert = store.get_alert(alert_id).await.unwrap().unwrap();
    assert_eq!(alert.status, AlertStatus::Resolved);
    assert_eq!(alert.context, "GigabitEthernet0/1");

    let logs = store
        .list_remediations(RemediationFilter::default())
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RemediationStatus::Success);
    assert_eq!(logs[0].commands_executed.len(), 2);
}

#[tokio::test]
async fn test_remediation_slot_is_shared_between_connections() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("netpulse.db");

    let first = SqliteBackend::new(&db_path).await.unwrap();
    let second = SqliteBackend::new(&db_path).await.unwrap();

    let request = NewRemediation {
        task_id: Uuid::new_v4(),
        device_id: "r1".to_string(),
        playbook_name: "save_config".to_string(),
        alert_id: None,
    };

    first.claim_remediation(request.clone(), Utc::now()).await.unwrap();
    assert_matches!(
        second
            .claim_remediation(
                NewRemediation {
                    task_id: Uuid::new_v4(),
                    ..request
                },
                Utc::now()
            )
            .await,
        Err(StorageError::Conflict(_))
    );

    assert_eq!(
        second
            .list_remediations(RemediationFilter::default())
            .await
            .unwrap()
            .len(),
        1
    );
}

async fn sqlite_engine(
    db_path: &std::path::Path,
    collector: &Arc<MockCollector>,
) -> (Arc<SqliteBackend>, MonitoringEngine) {
    let config = test_config(routers(1));
    let store = Arc::new(SqliteBackend::new(db_path).await.unwrap());
    let engine = MonitoringEngine::new(
        config.clone(),
        store.clone(),
        Arc::new(StaticInventory::new(config.devices.clone())),
        collector.clone() as Arc<dyn DeviceCollector>,
    )
    .unwrap();
    (store, engine)
}

#[tokio::test]
async fn test_shutdown_finishes_running_remediation() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("netpulse.db");
    let collector = MockCollector::new();
    collector.set_exec_delay(Duration::from_millis(500));

    let task = {
        let (_store, engine) = sqlite_engine(&db_path, &collector).await;
        let task = engine.run_playbook("r1", "save_config").await.unwrap();
        engine.shutdown().await;
        task
    };

    let (store, engine) = sqlite_engine(&db_path, &collector).await;

    // the task id resolves from a fresh process
    let log = engine.get_remediation_status(task).await.unwrap();
    assert_eq!(log.status, RemediationStatus::Success);
    assert!(log.duration_ms.unwrap() >= 500);
    assert_eq!(
        store
            .get_remediation_by_task(task)
            .await
            .unwrap()
            .unwrap()
            .id,
        log.id
    );

    collector.set_exec_delay(Duration::ZERO);
    let again = engine.run_playbook("r1", "save_config").await.unwrap();
    assert_eq!(
        engine.wait_for_remediation(again).await.unwrap().status,
        RemediationStatus::Success
    );
}

#[tokio::test]
async fn test_start_fails_remediation_left_by_crashed_process() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("netpulse.db");
    let collector = MockCollector::new();

    // a process that claimed the slot and died without finishing
    let stranded = Uuid::new_v4();
    {
        let crashed = SqliteBackend::new(&db_path).await.unwrap();
        crashed
            .claim_remediation(
                NewRemediation {
                    task_id: stranded,
                    device_id: "r1".to_string(),
                    playbook_name: "save_config".to_string(),
                    alert_id: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();
    }

    let (_store, engine) = sqlite_engine(&db_path, &collector).await;
    assert_matches!(
        engine.run_playbook("r1", "save_config").await,
        Err(EngineError::RemediationInProgress(_))
    );

    engine.start().await.unwrap();

    let log = engine.get_remediation_status(stranded).await.unwrap();
    assert_eq!(log.status, RemediationStatus::Failed);
    assert_eq!(log.error_message.as_deref(), Some(INTERRUPTED));
    assert!(log.completed_at.is_some());

    let task = engine.run_playbook("r1", "save_config").await.unwrap();
    assert_eq!(
        engine.wait_for_remediation(task).await.unwrap().status,
        RemediationStatus::Success
    );
    engine.shutdown().await;
}
