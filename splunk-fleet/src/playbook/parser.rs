// SPDX-License-Identifier: AGPL-3.0-or-later
//! Playbook file parser
//!
//! A playbook is a list of plays. Each play targets one inventory group and
//! invokes roles with an optional task override and role variables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::enterprise::SplunkVersion;
use crate::error::{FleetError, Result};
use crate::linux::LinuxOptions;
use crate::operations::{flatten, AccountSpec, ConfGroup, ConfSetting, PendingFlags, ServiceAction};

/// A playbook definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    /// Unique identifier for the playbook
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Version of the playbook
    #[serde(default = "default_version")]
    pub version: String,

    /// Plays, run in order
    #[serde(default)]
    pub plays: Vec<Play>,
}

/// Roles applied to one inventory group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Play {
    #[serde(default)]
    pub name: String,

    /// Inventory group or host name
    pub hosts: String,

    pub roles: Vec<RoleInvocation>,
}

/// The three units, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Linux,
    Enterprise,
    Core,
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Linux => write!(formatter, "linux"),
            Role::Enterprise => write!(formatter, "enterprise"),
            Role::Core => write!(formatter, "core"),
        }
    }
}

/// One role applied within a play
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInvocation {
    pub role: Role,

    /// Task file override; each role has a default
    #[serde(default)]
    pub tasks_from: Option<String>,

    /// Role variables, in declaration order
    #[serde(default)]
    pub vars: toml::Table,
}

/// A role invocation with its variables checked and decoded
#[derive(Debug, Clone, PartialEq)]
pub enum RoleTask {
    /// `None` means the standard Splunk baseline from the configuration
    LinuxConverge(Option<LinuxOptions>),
    LinuxPlan(Option<LinuxOptions>),
    EnterpriseInstall {
        version: SplunkVersion,
        seed_admin: bool,
    },
    EnterpriseUpgrade {
        version: SplunkVersion,
    },
    CoreLogin,
    CoreUsers(Vec<AccountSpec>),
    CoreBundle {
        expected_generation: Option<u64>,
    },
    CoreShcStatus,
    CoreShcRollingRestart,
    CoreDeploymentServerReload,
    CoreService(ServiceAction),
    CoreConf {
        settings: Vec<ConfSetting>,
        flags: PendingFlags,
    },
}

#[derive(Deserialize)]
struct InstallVars {
    version: String,
    #[serde(default)]
    seed_admin: bool,
}

#[derive(Deserialize)]
struct UpgradeVars {
    version: String,
}

#[derive(Deserialize)]
struct UsersVars {
    users: Vec<AccountSpec>,
}

#[derive(Deserialize, Default)]
struct BundleVars {
    #[serde(default)]
    expected_generation: Option<u64>,
}

#[derive(Deserialize)]
struct ServiceVars {
    action: ServiceAction,
}

#[derive(Deserialize)]
struct ConfVars {
    settings: Vec<ConfGroup>,
    #[serde(default)]
    flags: PendingFlags,
}

impl RoleInvocation {
    /// Task name after applying the role default
    pub fn task_name(&self) -> &str {
        match (&self.tasks_from, self.role) {
            (Some(task), _) => task.as_str(),
            (None, Role::Linux) => "converge",
            (None, Role::Enterprise) => "install",
            (None, Role::Core) => "",
        }
    }

    fn vars<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        toml::Value::Table(self.vars.clone())
            .try_into()
            .map_err(|e| FleetError::InvalidRoleVars {
                role: format!("{}/{}", self.role, self.task_name()),
                message: e.to_string(),
            })
    }

    fn linux_vars(&self) -> Result<Option<LinuxOptions>> {
        if self.vars.is_empty() {
            Ok(None)
        } else {
            self.vars().map(Some)
        }
    }

    fn version(&self, raw: &str) -> Result<SplunkVersion> {
        raw.parse().map_err(|_| FleetError::InvalidRoleVars {
            role: self.role.to_string(),
            message: format!("invalid version '{}'", raw),
        })
    }

    /// Decode the role variables for the selected task
    pub fn task(&self) -> Result<RoleTask> {
        let task = match (self.role, self.task_name()) {
            (Role::Linux, "converge") => RoleTask::LinuxConverge(self.linux_vars()?),
            (Role::Linux, "plan") => RoleTask::LinuxPlan(self.linux_vars()?),
            (Role::Enterprise, "install") => {
                let vars: InstallVars = self.vars()?;
                RoleTask::EnterpriseInstall {
                    version: self.version(&vars.version)?,
                    seed_admin: vars.seed_admin,
                }
            }
            (Role::Enterprise, "upgrade") => {
                let vars: UpgradeVars = self.vars()?;
                RoleTask::EnterpriseUpgrade {
                    version: self.version(&vars.version)?,
                }
            }
            (Role::Core, "login") => RoleTask::CoreLogin,
            (Role::Core, "users") => RoleTask::CoreUsers(self.vars::<UsersVars>()?.users),
            (Role::Core, "bundle") => {
                let vars: BundleVars = self.vars()?;
                RoleTask::CoreBundle {
                    expected_generation: vars.expected_generation,
                }
            }
            (Role::Core, "shc_status") => RoleTask::CoreShcStatus,
            (Role::Core, "shc_rolling_restart") => RoleTask::CoreShcRollingRestart,
            (Role::Core, "deployment_server_reload") => RoleTask::CoreDeploymentServerReload,
            (Role::Core, "service") => RoleTask::CoreService(self.vars::<ServiceVars>()?.action),
            (Role::Core, "conf") => {
                let vars: ConfVars = self.vars()?;
                RoleTask::CoreConf {
                    settings: flatten(&vars.settings),
                    flags: vars.flags,
                }
            }
            (role, task) => {
                return Err(FleetError::InvalidRoleVars {
                    role: role.to_string(),
                    message: if task.is_empty() {
                        "tasks_from is required".to_string()
                    } else {
                        format!("unknown task '{}'", task)
                    },
                })
            }
        };
        Ok(task)
    }
}

impl Playbook {
    /// Parse a playbook from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(FleetError::PlaybookNotFound {
                name: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match extension {
            "toml" => Self::from_toml(&contents, path),
            _ => Err(FleetError::PlaybookParseError {
                path: path.display().to_string(),
                message: format!("Unsupported file extension: {}", extension),
            }),
        }
    }

    fn from_toml(contents: &str, path: &Path) -> Result<Self> {
        toml::from_str(contents).map_err(|e| FleetError::PlaybookParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Validate structure, role order and role variables
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FleetError::InvalidConfig {
                message: "Playbook name cannot be empty".to_string(),
            });
        }

        if self.plays.is_empty() {
            return Err(FleetError::InvalidConfig {
                message: format!("Playbook '{}' has no plays defined", self.name),
            });
        }

        for (index, play) in self.plays.iter().enumerate() {
            let label = if play.name.is_empty() {
                format!("#{}", index + 1)
            } else {
                play.name.clone()
            };

            if play.roles.is_empty() {
                return Err(FleetError::InvalidConfig {
                    message: format!("Play '{}' has no roles", label),
                });
            }

            for pair in play.roles.windows(2) {
                if pair[1].role < pair[0].role {
                    return Err(FleetError::InvalidConfig {
                        message: format!(
                            "Play '{}' runs role '{}' after '{}', which depends on it",
                            label, pair[1].role, pair[0].role
                        ),
                    });
                }
            }

            for invocation in &play.roles {
                invocation.task()?;
            }
        }

        Ok(())
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const SITE: &str = r#"
        name = "site-build"
        description = "Prepare, install and configure"

        [[plays]]
        name = "Build indexers"
        hosts = "indexers"

        [[plays.roles]]
        role = "linux"

        [[plays.roles]]
        role = "enterprise"
        vars = { version = "9.2.1", seed_admin = true }

        [[plays]]
        hosts = "cluster_manager"

        [[plays.roles]]
        role = "core"
        tasks_from = "users"

        [[plays.roles.vars.users]]
        name = "analyst"
        password = "s3cret!"
        roles = ["user"]

        [[plays.roles]]
        role = "core"
        tasks_from = "bundle"
        vars = { expected_generation = 4 }
    "#;

    #[test]
    fn test_parse_toml_playbook() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("site.toml");
        fs::write(&file_path, SITE).unwrap();

        let playbook = Playbook::from_file(&file_path).unwrap();
        assert_eq!(playbook.name, "site-build");
        assert_eq!(playbook.plays.len(), 2);
        assert!(playbook.validate().is_ok());

        let install = playbook.plays[0].roles[1].task().unwrap();
        match install {
            RoleTask::EnterpriseInstall {
                version,
                seed_admin,
            } => {
                assert_eq!(version.to_string(), "9.2.1");
                assert!(seed_admin);
            }
            other => panic!("Expected EnterpriseInstall, got {other:?}"),
        }
        assert_eq!(
            playbook.plays[0].roles[0].task().unwrap(),
            RoleTask::LinuxConverge(None)
        );
        assert_eq!(
            playbook.plays[1].roles[1].task().unwrap(),
            RoleTask::CoreBundle {
                expected_generation: Some(4)
            }
        );
    }

    #[test]
    fn test_roles_out_of_dependency_order() {
        let playbook: Playbook = toml::from_str(
            r#"
            name = "backwards"
            [[plays]]
            hosts = "all"
            [[plays.roles]]
            role = "enterprise"
            vars = { version = "9.2.1" }
            [[plays.roles]]
            role = "linux"
            "#,
        )
        .unwrap();
        let error = playbook.validate().unwrap_err();
        assert!(error.to_string().contains("depends on it"));
    }

    #[test]
    fn test_core_requires_task() {
        let invocation = RoleInvocation {
            role: Role::Core,
            tasks_from: None,
            vars: toml::Table::new(),
        };
        assert!(matches!(
            invocation.task(),
            Err(FleetError::InvalidRoleVars { .. })
        ));
    }

    #[test]
    fn test_core_login_task() {
        let invocation = RoleInvocation {
            role: Role::Core,
            tasks_from: Some("login".to_string()),
            vars: toml::Table::new(),
        };
        assert_eq!(invocation.task().unwrap(), RoleTask::CoreLogin);
    }

    #[test]
    fn test_bad_role_vars_rejected() {
        let invocation = RoleInvocation {
            role: Role::Enterprise,
            tasks_from: Some("upgrade".to_string()),
            vars: toml::from_str("version = \"nine\"").unwrap(),
        };
        assert!(invocation.task().is_err());

        let unknown = RoleInvocation {
            role: Role::Linux,
            tasks_from: Some("reboot".to_string()),
            vars: toml::Table::new(),
        };
        assert!(unknown.task().unwrap_err().to_string().contains("reboot"));
    }

    #[test]
    fn test_conf_task_flattens_settings() {
        let invocation: RoleInvocation = toml::from_str(
            r#"
            role = "core"
            tasks_from = "conf"

            [vars.flags]
            force_bundle_push = true

            [[vars.settings]]
            filepath = "/opt/splunk/etc/system/local"
            filename = "server.conf"

            [[vars.settings.sections]]
            section = "general"
            options = [{ option = "serverName", value = "idx01" }]
            "#,
        )
        .unwrap();

        match invocation.task().unwrap() {
            RoleTask::CoreConf { settings, flags } => {
                assert_eq!(settings.len(), 1);
                assert_eq!(settings[0].path, "/opt/splunk/etc/system/local/server.conf");
                assert!(flags.force_bundle_push);
            }
            other => panic!("Expected CoreConf, got {other:?}"),
        }
    }

    #[test]
    fn test_playbook_validation_no_plays() {
        let playbook = Playbook {
            name: "empty".to_string(),
            description: String::new(),
            version: "1.0".to_string(),
            plays: vec![],
        };
        assert!(playbook.validate().is_err());
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("site.yml");
        fs::write(&file_path, "name: x").unwrap();
        assert!(matches!(
            Playbook::from_file(&file_path),
            Err(FleetError::PlaybookParseError { .. })
        ));
    }
}
