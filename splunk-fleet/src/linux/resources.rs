// SPDX-License-Identifier: AGPL-3.0-or-later
//! Convergent resources
//!
//! Each resource compares desired with observed state (`diff`) and only acts
//! when they differ (`apply`).

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;
use crate::host::{GroupSpec, HostSystem, PortSpec, UnitAction, UserSpec};

/// Kind of correction a resource needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftAction {
    Create,
    Update,
}

impl fmt::Display for DriftAction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriftAction::Create => write!(formatter, "create"),
            DriftAction::Update => write!(formatter, "update"),
        }
    }
}

/// Difference between desired and observed state of one resource
#[derive(Debug, Clone, PartialEq)]
pub struct Drift {
    pub resource: String,
    pub action: DriftAction,
    pub detail: String,
}

impl Drift {
    fn new(resource: String, action: DriftAction, detail: impl Into<String>) -> Self {
        Self {
            resource,
            action,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait Resource: Send + Sync {
    /// Stable identifier such as `user:splunk` or `firewall:8089/tcp`
    fn id(&self) -> String;

    /// Observe the host and describe what must change, if anything
    async fn diff(&self, host: &dyn HostSystem) -> Result<Option<Drift>>;

    /// Correct the drift reported by `diff`
    async fn apply(&self, host: &dyn HostSystem, drift: &Drift) -> Result<()>;
}

pub struct GroupResource(pub GroupSpec);

#[async_trait]
impl Resource for GroupResource {
    fn id(&self) -> String {
        format!("group:{}", self.0.name)
    }

    async fn diff(&self, host: &dyn HostSystem) -> Result<Option<Drift>> {
        Ok(match host.group(&self.0.name).await? {
            Some(_) => None,
            None => Some(Drift::new(self.id(), DriftAction::Create, "group missing")),
        })
    }

    async fn apply(&self, host: &dyn HostSystem, _drift: &Drift) -> Result<()> {
        host.create_group(&self.0).await
    }
}

pub struct UserResource(pub UserSpec);

#[async_trait]
impl Resource for UserResource {
    fn id(&self) -> String {
        format!("user:{}", self.0.name)
    }

    async fn diff(&self, host: &dyn HostSystem) -> Result<Option<Drift>> {
        let Some(observed) = host.user(&self.0.name).await? else {
            return Ok(Some(Drift::new(self.id(), DriftAction::Create, "user missing")));
        };

        let desired = &self.0;
        let mut differences = Vec::new();
        if observed.group != desired.group {
            differences.push(format!("group {} -> {}", observed.group, desired.group));
        }
        let mut observed_groups = observed.groups.clone();
        let mut desired_groups = desired.groups.clone();
        observed_groups.sort();
        desired_groups.sort();
        if observed_groups != desired_groups {
            differences.push(format!(
                "groups [{}] -> [{}]",
                observed_groups.join(","),
                desired_groups.join(",")
            ));
        }
        if observed.home != desired.home {
            differences.push(format!("home {} -> {}", observed.home, desired.home));
        }
        if observed.shell != desired.shell {
            differences.push(format!("shell {} -> {}", observed.shell, desired.shell));
        }

        if differences.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Drift::new(
                self.id(),
                DriftAction::Update,
                differences.join("; "),
            )))
        }
    }

    async fn apply(&self, host: &dyn HostSystem, drift: &Drift) -> Result<()> {
        match drift.action {
            DriftAction::Create => host.create_user(&self.0).await,
            DriftAction::Update => host.modify_user(&self.0).await,
        }
    }
}

/// A systemd unit file that must exist with exact contents and be enabled
pub struct UnitFileResource {
    pub unit: String,
    pub contents: String,
}

impl UnitFileResource {
    fn path(&self) -> String {
        format!("/etc/systemd/system/{}.service", self.unit)
    }
}

#[async_trait]
impl Resource for UnitFileResource {
    fn id(&self) -> String {
        format!("unit:{}", self.unit)
    }

    async fn diff(&self, host: &dyn HostSystem) -> Result<Option<Drift>> {
        let current = host.read_file(&self.path()).await?;
        let state = host.unit_state(&self.unit).await?;

        Ok(match current {
            None => Some(Drift::new(self.id(), DriftAction::Create, "unit file missing")),
            Some(contents) if contents != self.contents => Some(Drift::new(
                self.id(),
                DriftAction::Update,
                "unit file differs",
            )),
            Some(_) if !state.enabled => {
                Some(Drift::new(self.id(), DriftAction::Update, "unit disabled"))
            }
            Some(_) => None,
        })
    }

    async fn apply(&self, host: &dyn HostSystem, _drift: &Drift) -> Result<()> {
        let path = self.path();
        if host.read_file(&path).await?.as_deref() != Some(self.contents.as_str()) {
            host.write_file(&path, &self.contents, 0o644).await?;
            host.systemctl(UnitAction::DaemonReload, &self.unit).await?;
        }
        if !host.unit_state(&self.unit).await?.enabled {
            host.systemctl(UnitAction::Enable, &self.unit).await?;
        }
        Ok(())
    }
}

pub struct PortResource(pub PortSpec);

#[async_trait]
impl Resource for PortResource {
    fn id(&self) -> String {
        format!("firewall:{}", self.0)
    }

    async fn diff(&self, host: &dyn HostSystem) -> Result<Option<Drift>> {
        let open = host.firewall_ports().await?;
        Ok(if open.contains(&self.0) {
            None
        } else {
            Some(Drift::new(self.id(), DriftAction::Create, "port closed"))
        })
    }

    async fn apply(&self, host: &dyn HostSystem, _drift: &Drift) -> Result<()> {
        host.open_port(&self.0).await
    }
}

/// One runtime knob under /sys/kernel/mm/transparent_hugepage
pub struct ThpResource {
    pub knob: &'static str,
}

impl ThpResource {
    const DESIRED: &'static str = "never";

    fn path(&self) -> String {
        format!("/sys/kernel/mm/transparent_hugepage/{}", self.knob)
    }
}

/// Selected value of a sysfs choice file, e.g. `always madvise [never]`
pub fn selected_choice(contents: &str) -> &str {
    let trimmed = contents.trim();
    match (trimmed.find('['), trimmed.find(']')) {
        (Some(start), Some(end)) if start < end => &trimmed[start + 1..end],
        _ => trimmed,
    }
}

#[async_trait]
impl Resource for ThpResource {
    fn id(&self) -> String {
        format!("thp:{}", self.knob)
    }

    async fn diff(&self, host: &dyn HostSystem) -> Result<Option<Drift>> {
        let Some(contents) = host.read_file(&self.path()).await? else {
            // Kernel built without THP support
            return Ok(None);
        };
        let current = selected_choice(&contents);
        Ok(if current == Self::DESIRED {
            None
        } else {
            Some(Drift::new(
                self.id(),
                DriftAction::Update,
                format!("{} -> {}", current, Self::DESIRED),
            ))
        })
    }

    async fn apply(&self, host: &dyn HostSystem, _drift: &Drift) -> Result<()> {
        host.write_file(&self.path(), Self::DESIRED, 0o644).await
    }
}

/// A file with exact contents, used for polkit rules
pub struct FileResource {
    pub label: String,
    pub path: String,
    pub contents: String,
    pub mode: u32,
}

#[async_trait]
impl Resource for FileResource {
    fn id(&self) -> String {
        self.label.clone()
    }

    async fn diff(&self, host: &dyn HostSystem) -> Result<Option<Drift>> {
        Ok(match host.read_file(&self.path).await? {
            None => Some(Drift::new(self.id(), DriftAction::Create, "file missing")),
            Some(current) if current != self.contents => {
                Some(Drift::new(self.id(), DriftAction::Update, "contents differ"))
            }
            Some(_) => None,
        })
    }

    async fn apply(&self, host: &dyn HostSystem, _drift: &Drift) -> Result<()> {
        host.write_file(&self.path, &self.contents, self.mode).await
    }
}
