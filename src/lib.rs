pub mod actors;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod rate;
pub mod remediation;
pub mod rules;
pub mod storage;

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque device identifier, assigned by the inventory.
pub type DeviceId = String;

/// A monitored network device
///
/// The inventory owns these records. The engine only ever writes back
/// `is_reachable` and `last_seen` after a poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub address: IpAddr,
    pub class: DeviceClass,

    /// Reference to the credentials the collector should use (never the secret itself)
    #[serde(default)]
    pub credentials_ref: Option<String>,

    #[serde(default)]
    pub is_reachable: bool,

    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    /// Name used in log lines and alert messages
    pub fn display(&self) -> String {
        format!("{} ({})", self.name, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Router,
    Switch,
    Firewall,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Router => write!(f, "router"),
            DeviceClass::Switch => write!(f, "switch"),
            DeviceClass::Firewall => write!(f, "firewall"),
        }
    }
}
