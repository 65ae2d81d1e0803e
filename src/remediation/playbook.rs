//! Playbook registry
//!
//! Playbooks are resolved by name once, at startup. Every alert-type mapping
//! must point at a registered playbook; alert types without a mapping are
//! reported then, so an auto-remediation request for one fails predictably.

use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::DeviceClass;
use crate::config::{PlaybookConfig, RemediationConfig};
use crate::error::EngineError;
use crate::rules::{self, ALERT_TYPES};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").expect("valid placeholder regex"));

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RenderError {
    #[error("playbook '{playbook}' needs '{variable}', which is not known for this run")]
    MissingVariable { playbook: String, variable: String },
}

/// A named list of command templates
#[derive(Debug, Clone, PartialEq)]
pub struct Playbook {
    pub name: String,
    pub description: String,
    pub commands: Vec<String>,

    /// Empty means every class
    pub device_classes: Vec<DeviceClass>,
}

impl Playbook {
    fn builtin(name: &str, description: &str, commands: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            device_classes: Vec::new(),
        }
    }

    fn only(mut self, classes: &[DeviceClass]) -> Self {
        self.device_classes = classes.to_vec();
        self
    }

    pub fn applies_to(&self, class: DeviceClass) -> bool {
        self.device_classes.is_empty() || self.device_classes.contains(&class)
    }

    /// Substitute `{variable}` placeholders in every command
    pub fn render(&self, variables: &HashMap<String, String>) -> Result<Vec<String>, RenderError> {
        self.commands
            .iter()
            .map(|template| {
                let mut missing = None;
                let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
                    match variables.get(&caps[1]) {
                        Some(value) => value.clone(),
                        None => {
                            missing.get_or_insert_with(|| caps[1].to_string());
                            String::new()
                        }
                    }
                });

                match missing {
                    Some(variable) => Err(RenderError::MissingVariable {
                        playbook: self.name.clone(),
                        variable,
                    }),
                    None => Ok(rendered.into_owned()),
                }
            })
            .collect()
    }
}

impl From<&PlaybookConfig> for Playbook {
    fn from(config: &PlaybookConfig) -> Self {
        Self {
            name: config.name.clone(),
            description: config.description.clone(),
            commands: config.commands.clone(),
            device_classes: config.device_classes.clone(),
        }
    }
}

fn builtin_playbooks() -> Vec<Playbook> {
    vec![
        Playbook::builtin(
            "interface_enable",
            "Bring an interface back up",
            &["interface {interface}", "no shutdown"],
        )
        .only(&[DeviceClass::Router, DeviceClass::Switch]),
        Playbook::builtin(
            "clear_bgp_session",
            "Soft-reset a BGP session",
            &["clear ip bgp {neighbor} soft"],
        )
        .only(&[DeviceClass::Router]),
        Playbook::builtin(
            "clear_caches",
            "Clear ARP and routing caches to free memory",
            &["clear arp-cache", "clear ip route *"],
        )
        .only(&[DeviceClass::Router, DeviceClass::Switch]),
        Playbook::builtin("clear_arp_cache", "Clear the ARP cache", &["clear arp-cache"]),
        Playbook::builtin(
            "clear_ip_route_cache",
            "Clear the IP route cache",
            &["clear ip route *"],
        ),
        Playbook::builtin("save_config", "Save the running configuration", &["write memory"]),
        Playbook::builtin("clear_conn", "Clear all connections", &["clear conn all"])
            .only(&[DeviceClass::Firewall]),
        Playbook::builtin("clear_xlate", "Clear translation slots", &["clear xlate"])
            .only(&[DeviceClass::Firewall]),
    ]
}

fn builtin_mappings() -> [(&'static str, &'static str); 3] {
    [
        (rules::INTERFACE_DOWN, "interface_enable"),
        (rules::MEMORY_UTILIZATION, "clear_caches"),
        (rules::BGP_NEIGHBOR_DOWN, "clear_bgp_session"),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct PlaybookRegistry {
    playbooks: HashMap<String, Playbook>,

    /// alert_type -> playbook name
    mappings: HashMap<String, String>,
}

impl PlaybookRegistry {
    /// Build the registry, failing on a mapping that names an unknown playbook
    pub fn from_config(config: &RemediationConfig) -> Result<Self, EngineError> {
        let mut registry = Self::default();

        if config.use_builtin_playbooks {
            for playbook in builtin_playbooks() {
                registry.playbooks.insert(playbook.name.clone(), playbook);
            }
            for (alert_type, playbook) in builtin_mappings() {
                registry
                    .mappings
                    .insert(alert_type.to_string(), playbook.to_string());
            }
        }

        for playbook in &config.playbooks {
            debug!("registering playbook '{}'", playbook.name);
            registry
                .playbooks
                .insert(playbook.name.clone(), Playbook::from(playbook));
        }
        for (alert_type, playbook) in &config.mappings {
            registry
                .mappings
                .insert(alert_type.clone(), playbook.clone());
        }

        for playbook in registry.mappings.values() {
            if !registry.playbooks.contains_key(playbook) {
                return Err(EngineError::UnknownPlaybook(playbook.clone()));
            }
        }

        let unmapped: BTreeSet<&str> = ALERT_TYPES
            .iter()
            .copied()
            .filter(|t| !registry.mappings.contains_key(*t))
            .collect();
        if !unmapped.is_empty() {
            warn!(
                "no remediation playbook for alert types: {}",
                unmapped.into_iter().collect::<Vec<_>>().join(", ")
            );
        }

        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Playbook> {
        self.playbooks.get(name)
    }

    pub fn for_alert_type(&self, alert_type: &str) -> Option<&Playbook> {
        self.mappings
            .get(alert_type)
            .and_then(|name| self.playbooks.get(name))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.playbooks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
