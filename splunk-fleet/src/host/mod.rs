// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host boundary
//!
//! Everything the units need from a target machine goes through
//! [`HostSystem`]: file access, account database, init system, firewall and
//! archive handling. [`CommandHost`] drives a real machine through shell
//! commands; [`MemoryHost`] keeps the same state in memory for rehearsals and
//! tests.

mod command;
mod memory;

pub use command::CommandHost;
pub use memory::MemoryHost;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{FleetError, Result};

/// Operating system family of a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsFamily {
    RedHat,
    Debian,
    Other(String),
}

impl OsFamily {
    /// Derive the family from `/etc/os-release` ID and ID_LIKE values
    pub fn from_os_release(id: &str, id_like: &str) -> Self {
        let candidates = std::iter::once(id).chain(id_like.split_whitespace());
        for candidate in candidates {
            match candidate {
                "rhel" | "centos" | "fedora" | "rocky" | "almalinux" | "ol" | "amzn" => {
                    return OsFamily::RedHat
                }
                "debian" | "ubuntu" => return OsFamily::Debian,
                _ => {}
            }
        }
        OsFamily::Other(id.to_string())
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, OsFamily::Other(_))
    }
}

/// Facts gathered from a host before acting on it
#[derive(Debug, Clone, PartialEq)]
pub struct HostFacts {
    pub os_family: OsFamily,
    pub distribution: String,
    pub distribution_version: String,
    /// Whether privileged commands can be run
    pub privileged: bool,
}

/// Desired local group
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSpec {
    pub name: String,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub system: bool,
}

/// Observed local group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub name: String,
    pub gid: u32,
}

/// Desired local user account
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserSpec {
    pub name: String,
    #[serde(default)]
    pub uid: Option<u32>,
    /// Primary group
    pub group: String,
    /// Supplementary groups
    #[serde(default)]
    pub groups: Vec<String>,
    pub home: String,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default)]
    pub system: bool,
}

/// Observed local user account
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub group: String,
    pub groups: Vec<String>,
    pub home: String,
    pub shell: String,
}

/// Observed systemd unit state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitState {
    pub enabled: bool,
    pub active: bool,
}

/// systemctl verbs used by the units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    DaemonReload,
    Enable,
    Start,
    Stop,
    Restart,
}

impl UnitAction {
    pub fn verb(&self) -> &'static str {
        match self {
            UnitAction::DaemonReload => "daemon-reload",
            UnitAction::Enable => "enable",
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
        }
    }
}

/// Transport protocol of a firewall port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// A firewall port opening such as `8089/tcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortSpec {
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(formatter, "{}/{}", self.port, protocol)
    }
}

impl FromStr for PortSpec {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || FleetError::InvalidConfig {
            message: format!("invalid port specification '{}'", s),
        };
        let (port, protocol) = s.split_once('/').unwrap_or((s, "tcp"));
        let port = port.trim().parse::<u16>().map_err(|_| invalid())?;
        let protocol = match protocol.trim() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            _ => return Err(invalid()),
        };
        Ok(Self { port, protocol })
    }
}

/// Output of a command run on a host
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Operations a unit may perform on a target machine
///
/// Implementations serialize their own work; callers never issue two
/// mutating calls against the same host concurrently.
#[async_trait]
pub trait HostSystem: Send + Sync {
    /// Inventory name of the host
    fn name(&self) -> &str;

    /// Gather OS and privilege facts
    async fn facts(&self) -> Result<HostFacts>;

    /// Read a file, `None` when it does not exist
    async fn read_file(&self, path: &str) -> Result<Option<String>>;

    /// Replace a file's contents and mode
    async fn write_file(&self, path: &str, contents: &str, mode: u32) -> Result<()>;

    /// Remove a file; returns whether it existed
    async fn remove_file(&self, path: &str) -> Result<bool>;

    /// Change ownership of a path
    async fn chown(&self, path: &str, user: &str, group: &str, recursive: bool) -> Result<()>;

    async fn group(&self, name: &str) -> Result<Option<GroupInfo>>;

    async fn create_group(&self, spec: &GroupSpec) -> Result<()>;

    async fn user(&self, name: &str) -> Result<Option<UserInfo>>;

    async fn create_user(&self, spec: &UserSpec) -> Result<()>;

    async fn modify_user(&self, spec: &UserSpec) -> Result<()>;

    async fn unit_state(&self, unit: &str) -> Result<UnitState>;

    /// Run a systemctl verb; `unit` is ignored for daemon-reload
    async fn systemctl(&self, action: UnitAction, unit: &str) -> Result<()>;

    /// Ports currently opened permanently in the host firewall
    async fn firewall_ports(&self) -> Result<Vec<PortSpec>>;

    /// Open a port permanently and in the running firewall
    async fn open_port(&self, port: &PortSpec) -> Result<()>;

    /// Copy a controller-side file to the host
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Unpack a gzip tarball already present on the host
    async fn extract_archive(&self, archive: &str, dest_dir: &str) -> Result<()>;

    /// Run an arbitrary command
    async fn run(&self, argv: &[String]) -> Result<CommandOutput>;
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_family_detection() {
        assert_eq!(OsFamily::from_os_release("rocky", "rhel centos fedora"), OsFamily::RedHat);
        assert_eq!(OsFamily::from_os_release("ubuntu", "debian"), OsFamily::Debian);
        assert_eq!(OsFamily::from_os_release("linuxmint", "ubuntu"), OsFamily::Debian);
        assert!(!OsFamily::from_os_release("alpine", "").is_supported());
    }

    #[test]
    fn test_port_spec_parsing() {
        assert_eq!("8089/tcp".parse::<PortSpec>().unwrap(), PortSpec::tcp(8089));
        assert_eq!("9997".parse::<PortSpec>().unwrap(), PortSpec::tcp(9997));
        let syslog: PortSpec = "514/udp".parse().unwrap();
        assert_eq!(syslog.protocol, Protocol::Udp);
        assert_eq!(syslog.to_string(), "514/udp");
        assert!("http/tcp".parse::<PortSpec>().is_err());
        assert!("8000/sctp".parse::<PortSpec>().is_err());
    }
}
