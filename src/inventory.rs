//! Device inventory provider
//!
//! The inventory is the source of truth for which devices exist. The engine
//! reads from it at the start of every cycle and writes back reachability
//! after each probe.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::storage::StorageResult;
use crate::{Device, DeviceId};

#[async_trait]
pub trait Inventory: Send + Sync {
    /// All devices, in a stable order
    async fn list_devices(&self) -> StorageResult<Vec<Device>>;

    async fn get_device(&self, id: &str) -> StorageResult<Option<Device>>;

    /// Record the outcome of a probe. `last_seen` only moves when the device
    /// answered.
    async fn update_reachability(
        &self,
        id: &str,
        reachable: bool,
        at: DateTime<Utc>,
    ) -> StorageResult<()>;
}

/// Inventory backed by the configuration file
pub struct StaticInventory {
    order: Vec<DeviceId>,
    devices: RwLock<HashMap<DeviceId, Device>>,
}

impl StaticInventory {
    pub fn new(devices: Vec<Device>) -> Self {
        let order = devices.iter().map(|d| d.id.clone()).collect();
        let devices = devices.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self {
            order,
            devices: RwLock::new(devices),
        }
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn list_devices(&self) -> StorageResult<Vec<Device>> {
        let devices = self.devices.read().await;
        Ok(self
            .order
            .iter()
            .filter_map(|id| devices.get(id).cloned())
            .collect())
    }

    async fn get_device(&self, id: &str) -> StorageResult<Option<Device>> {
        Ok(self.devices.read().await.get(id).cloned())
    }

    async fn update_reachability(
        &self,
        id: &str,
        reachable: bool,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut devices = self.devices.write().await;
        match devices.get_mut(id) {
            Some(device) => {
                device.is_reachable = reachable;
                if reachable {
                    device.last_seen = Some(at);
                }
            }
            None => debug!("reachability update for unknown device {}", id),
        }
        Ok(())
    }
}
