// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host inventory
//!
//! Hosts are declared once, before a run, and never change during it.
//! Group lookups keep the declaration order so rolling operations are
//! deterministic.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::{FleetError, Result};
use crate::host::{CommandHost, HostSystem};

/// Name of the implicit group containing every host
pub const ALL_GROUP: &str = "all";

/// The set of managed hosts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    /// Hosts in declaration order
    #[serde(default)]
    pub hosts: Vec<HostEntry>,
}

/// A single managed machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostEntry {
    /// Inventory name, e.g. splunk01
    pub name: String,

    /// Address used to reach the host; defaults to the name
    #[serde(default)]
    pub address: Option<String>,

    /// Groups this host belongs to
    #[serde(default)]
    pub groups: Vec<String>,

    /// How commands reach the host
    #[serde(default)]
    pub connection: Connection,

    /// Run privileged commands through sudo
    #[serde(default, rename = "become")]
    pub become_root: bool,
}

/// Transport used to run commands on a host
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Connection {
    /// Commands run on the controller itself
    #[default]
    Local,

    /// Commands run over ssh
    Ssh {
        /// Remote login user
        user: String,
        /// ssh port
        #[serde(default = "default_ssh_port")]
        port: u16,
        /// Private key file
        #[serde(default)]
        identity_file: Option<String>,
    },
}

impl HostEntry {
    /// Address to connect to
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Whether the host is a member of `group`
    pub fn in_group(&self, group: &str) -> bool {
        group == ALL_GROUP || self.name == group || self.groups.iter().any(|g| g == group)
    }
}

impl Inventory {
    /// Load an inventory from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(FleetError::InvalidInventory {
                path: path.display().to_string(),
                message: "file not found".to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let inventory: Inventory =
            toml::from_str(&contents).map_err(|e| FleetError::InvalidInventory {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        inventory
            .validate()
            .map_err(|message| FleetError::InvalidInventory {
                path: path.display().to_string(),
                message,
            })?;

        Ok(inventory)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err("host name cannot be empty".to_string());
            }
            if !seen.insert(host.name.as_str()) {
                return Err(format!("duplicate host '{}'", host.name));
            }
        }
        Ok(())
    }

    /// Hosts matching a group or host name, in declaration order
    pub fn select(&self, pattern: &str) -> Result<Vec<&HostEntry>> {
        let selected: Vec<&HostEntry> = self.hosts.iter().filter(|h| h.in_group(pattern)).collect();

        if selected.is_empty() {
            return Err(FleetError::UnknownHost {
                name: pattern.to_string(),
            });
        }

        Ok(selected)
    }

    /// Sorted list of every group name mentioned in the inventory
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .hosts
            .iter()
            .flat_map(|h| h.groups.iter().cloned())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    /// Build command-backed host handles for a selection
    pub fn connect(&self, pattern: &str) -> Result<Vec<Arc<dyn HostSystem>>> {
        Ok(self
            .select(pattern)?
            .into_iter()
            .map(|entry| Arc::new(CommandHost::new(entry.clone())) as Arc<dyn HostSystem>)
            .collect())
    }
}

fn default_ssh_port() -> u16 {
    22
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
        [[hosts]]
        name = "h2"
        groups = ["splunk_servers", "indexers"]

        [[hosts]]
        name = "h1"
        address = "10.0.0.1"
        groups = ["splunk_servers"]
        become = true
        [hosts.connection]
        type = "ssh"
        user = "deploy"

        [[hosts]]
        name = "h3"
        groups = ["splunk_servers", "indexers"]
    "#;

    #[test]
    fn test_select_preserves_declaration_order() {
        let inventory: Inventory = toml::from_str(INVENTORY).unwrap();
        let names: Vec<&str> = inventory
            .select("splunk_servers")
            .unwrap()
            .iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(names, vec!["h2", "h1", "h3"]);
    }

    #[test]
    fn test_select_single_host_and_all() {
        let inventory: Inventory = toml::from_str(INVENTORY).unwrap();
        assert_eq!(inventory.select("h3").unwrap().len(), 1);
        assert_eq!(inventory.select(ALL_GROUP).unwrap().len(), 3);
        assert!(inventory.select("search_heads").is_err());
    }

    #[test]
    fn test_connection_parsing() {
        let inventory: Inventory = toml::from_str(INVENTORY).unwrap();
        let h1 = &inventory.hosts[1];
        assert_eq!(h1.address(), "10.0.0.1");
        assert!(h1.become_root);
        assert_eq!(
            h1.connection,
            Connection::Ssh {
                user: "deploy".to_string(),
                port: 22,
                identity_file: None,
            }
        );
        assert_eq!(inventory.hosts[0].connection, Connection::Local);
    }

    #[test]
    fn test_groups_listing() {
        let inventory: Inventory = toml::from_str(INVENTORY).unwrap();
        assert_eq!(inventory.groups(), vec!["indexers", "splunk_servers"]);
    }

    #[test]
    fn test_duplicate_hosts_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("inventory.toml");
        std::fs::write(
            &path,
            "[[hosts]]\nname = \"a\"\n\n[[hosts]]\nname = \"a\"\n",
        )
        .unwrap();
        assert!(Inventory::from_file(&path).is_err());
    }
}
