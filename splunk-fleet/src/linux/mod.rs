// SPDX-License-Identifier: AGPL-3.0-or-later
//! Linux host preparation
//!
//! Converges a host to the baseline Splunk needs: service account, systemd
//! unit, firewall openings, transparent huge pages off and a polkit rule
//! letting the service account manage its own unit. Running it twice with
//! the same options changes nothing the second time.

mod render;
mod resources;

pub use render::{polkit_rule, splunkd_unit, thp_unit, THP_UNIT};
pub use resources::{selected_choice, Drift, DriftAction, Resource};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{FleetError, Result};
use crate::host::{GroupSpec, HostSystem, PortSpec, UserSpec};
use resources::{
    FileResource, GroupResource, PortResource, ThpResource, UnitFileResource, UserResource,
};

/// Desired host baseline
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LinuxOptions {
    #[serde(default)]
    pub groups: Vec<GroupSpec>,

    #[serde(default)]
    pub users: Vec<UserSpec>,

    /// splunkd service units
    #[serde(default)]
    pub units: Vec<SplunkUnit>,

    /// Ports to open in the host firewall
    #[serde(default)]
    pub firewall: Vec<PortSpec>,

    #[serde(default)]
    pub thp: ThpOptions,

    #[serde(default)]
    pub polkit: Vec<PolkitRule>,
}

/// Parameters of a splunkd systemd unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplunkUnit {
    #[serde(default = "default_unit_name")]
    pub name: String,
    #[serde(default = "default_unit_description")]
    pub description: String,
    pub splunk_home: String,
    pub user: String,
    pub group: String,
    #[serde(default = "default_limit_nofile")]
    pub limit_nofile: u64,
    #[serde(default = "default_limit_nproc")]
    pub limit_nproc: u64,
    #[serde(default = "default_timeout_stop")]
    pub timeout_stop_secs: u64,
    /// systemd MemoryMax value, e.g. `12G`
    #[serde(default)]
    pub memory_max: Option<String>,
}

/// Transparent huge pages handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThpOptions {
    /// Turn THP off at runtime
    #[serde(default = "default_true")]
    pub disable: bool,
    /// Install a boot-time unit keeping THP off
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for ThpOptions {
    fn default() -> Self {
        Self {
            disable: true,
            persist: true,
        }
    }
}

/// polkit rule allowing a user to manage specific units
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolkitRule {
    /// File name stem under /etc/polkit-1/rules.d
    pub name: String,
    #[serde(default = "default_polkit_priority")]
    pub priority: u8,
    pub user: String,
    pub units: Vec<String>,
    #[serde(default = "default_polkit_verbs")]
    pub verbs: Vec<String>,
}

impl PolkitRule {
    pub fn path(&self) -> String {
        format!("/etc/polkit-1/rules.d/{}-{}.rules", self.priority, self.name)
    }
}

impl LinuxOptions {
    /// Baseline for a standard Splunk Enterprise host
    pub fn for_splunk(config: &Config) -> Self {
        let splunk = &config.splunk;
        Self {
            groups: vec![GroupSpec {
                name: splunk.group.clone(),
                gid: None,
                system: false,
            }],
            users: vec![UserSpec {
                name: splunk.user.clone(),
                uid: None,
                group: splunk.group.clone(),
                groups: vec![],
                home: splunk.home.clone(),
                shell: "/bin/bash".to_string(),
                system: false,
            }],
            units: vec![SplunkUnit {
                name: splunk.service.clone(),
                description: default_unit_description(),
                splunk_home: splunk.home.clone(),
                user: splunk.user.clone(),
                group: splunk.group.clone(),
                limit_nofile: default_limit_nofile(),
                limit_nproc: default_limit_nproc(),
                timeout_stop_secs: default_timeout_stop(),
                memory_max: None,
            }],
            firewall: vec![PortSpec::tcp(8000), PortSpec::tcp(8089), PortSpec::tcp(9997)],
            thp: ThpOptions::default(),
            polkit: vec![PolkitRule {
                name: "splunk".to_string(),
                priority: default_polkit_priority(),
                user: splunk.user.clone(),
                units: vec![splunk.service.clone()],
                verbs: default_polkit_verbs(),
            }],
        }
    }

    /// Resources in application order
    pub fn resources(&self) -> Vec<Box<dyn Resource>> {
        let mut resources: Vec<Box<dyn Resource>> = Vec::new();

        for group in &self.groups {
            resources.push(Box::new(GroupResource(group.clone())));
        }
        for user in &self.users {
            resources.push(Box::new(UserResource(user.clone())));
        }
        for unit in &self.units {
            resources.push(Box::new(UnitFileResource {
                unit: unit.name.clone(),
                contents: splunkd_unit(unit),
            }));
        }
        for port in &self.firewall {
            resources.push(Box::new(PortResource(*port)));
        }
        if self.thp.disable {
            let services: Vec<String> = self.units.iter().map(|u| u.name.clone()).collect();
            resources.push(Box::new(ThpResource { knob: "enabled" }));
            resources.push(Box::new(ThpResource { knob: "defrag" }));
            if self.thp.persist {
                resources.push(Box::new(UnitFileResource {
                    unit: THP_UNIT.to_string(),
                    contents: thp_unit(&services),
                }));
            }
        }
        for rule in &self.polkit {
            resources.push(Box::new(FileResource {
                label: format!("polkit:{}", rule.name),
                path: rule.path(),
                contents: polkit_rule(rule),
                mode: 0o644,
            }));
        }

        resources
    }
}

/// Outcome for one resource
#[derive(Debug, Clone)]
pub struct ResourceResult {
    pub resource: String,
    pub changed: bool,
    pub detail: Option<String>,
}

/// Outcome of converging one host
#[derive(Debug, Clone)]
pub struct ConvergeReport {
    pub host: String,
    pub resources: Vec<ResourceResult>,
}

impl ConvergeReport {
    pub fn changed(&self) -> usize {
        self.resources.iter().filter(|r| r.changed).count()
    }
}

async fn check_supported(host: &dyn HostSystem) -> Result<()> {
    let facts = host.facts().await?;
    if !facts.os_family.is_supported() {
        return Err(FleetError::precondition(
            host.name(),
            format!(
                "unsupported distribution '{} {}'",
                facts.distribution, facts.distribution_version
            ),
        ));
    }
    Ok(())
}

/// Report what `converge` would change without touching the host
#[instrument(skip_all, fields(host = %host.name()))]
pub async fn plan(host: &dyn HostSystem, options: &LinuxOptions) -> Result<Vec<Drift>> {
    check_supported(host).await?;

    let mut drifts = Vec::new();
    for resource in options.resources() {
        if let Some(drift) = resource.diff(host).await? {
            debug!(resource = %drift.resource, detail = %drift.detail, "Drift detected");
            drifts.push(drift);
        }
    }
    Ok(drifts)
}

/// Bring the host in line with `options`
///
/// Preconditions are checked before any change. If a resource fails, the
/// resources applied before it are left in place and the error names the
/// failing resource.
#[instrument(skip_all, fields(host = %host.name()))]
pub async fn converge(host: &dyn HostSystem, options: &LinuxOptions) -> Result<ConvergeReport> {
    check_supported(host).await?;
    if !host.facts().await?.privileged {
        return Err(FleetError::precondition(
            host.name(),
            "insufficient privilege: root or passwordless sudo required",
        ));
    }

    let mut results = Vec::new();
    let mut applied: Vec<String> = Vec::new();

    for resource in options.resources() {
        let id = resource.id();
        let partial = |e: FleetError, applied: &[String]| FleetError::PartialApplication {
            target: host.name().to_string(),
            step: id.clone(),
            applied: applied.to_vec(),
            message: e.to_string(),
        };

        let drift = resource.diff(host).await.map_err(|e| partial(e, &applied))?;
        match drift {
            None => results.push(ResourceResult {
                resource: id.clone(),
                changed: false,
                detail: None,
            }),
            Some(drift) => {
                info!(resource = %id, action = %drift.action, detail = %drift.detail, "Applying");
                if let Err(e) = resource.apply(host, &drift).await {
                    warn!(resource = %id, error = %e, "Resource failed");
                    return Err(partial(e, &applied));
                }
                applied.push(id.clone());
                results.push(ResourceResult {
                    resource: id.clone(),
                    changed: true,
                    detail: Some(drift.detail),
                });
            }
        }
    }

    let report = ConvergeReport {
        host: host.name().to_string(),
        resources: results,
    };
    info!(changed = report.changed(), total = report.resources.len(), "Host converged");
    Ok(report)
}

fn default_unit_name() -> String {
    "Splunkd".to_string()
}

fn default_unit_description() -> String {
    "Systemd service file for Splunk, generated by splunk-fleet".to_string()
}

fn default_limit_nofile() -> u64 {
    65536
}

fn default_limit_nproc() -> u64 {
    16000
}

fn default_timeout_stop() -> u64 {
    360
}

fn default_true() -> bool {
    true
}

fn default_polkit_priority() -> u8 {
    10
}

fn default_polkit_verbs() -> Vec<String> {
    vec!["start".to_string(), "stop".to_string(), "restart".to_string()]
}
