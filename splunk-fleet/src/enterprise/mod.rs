// SPDX-License-Identifier: AGPL-3.0-or-later
//! Splunk Enterprise lifecycle
//!
//! Installs a version where none is present and rolls upgrades across a
//! group one host at a time. Every host must be healthy before it is touched
//! and healthy again before the next one is started. The installed-version
//! marker never moves backwards unless downgrades are explicitly allowed.

mod package;
mod version;

pub use package::{PackageArtifact, PackageResolver};
pub use version::{SplunkVersion, VersionMarker};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::config::{Config, SplunkConfig};
use crate::error::{FleetError, Result};
use crate::host::{HostSystem, UnitAction};
use crate::operations::Credentials;
use crate::rolling::{
    wait_healthy, BatchPolicy, HealthProbe, RollingDriver, RollingReport, RollingStep,
    ServiceProbe, StepOutcome,
};

/// Result of an install request on one host
#[derive(Debug, Clone, PartialEq)]
pub enum InstallOutcome {
    /// The requested version was already present
    AlreadyInstalled(SplunkVersion),
    Installed(SplunkVersion),
}

/// Install and upgrade driver bound to one fleet configuration
pub struct EnterpriseUnit {
    splunk: SplunkConfig,
    minimum: Option<SplunkVersion>,
    resolver: PackageResolver,
    policy: BatchPolicy,
    probe: Arc<dyn HealthProbe>,
}

impl EnterpriseUnit {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            splunk: config.splunk.clone(),
            minimum: config.minimum_version()?,
            resolver: PackageResolver::new(&config.splunk),
            policy: config.rolling.clone(),
            probe: Arc::new(ServiceProbe::new(config.splunk.service.clone())),
        })
    }

    /// Replace the rolling policy
    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the health probe used around upgrades
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Read the installed-version marker
    pub async fn installed_version(&self, host: &dyn HostSystem) -> Result<Option<VersionMarker>> {
        let path = VersionMarker::path(&self.splunk.home);
        match host.read_file(&path).await? {
            Some(contents) => Ok(Some(VersionMarker::parse(&contents)?)),
            None => Ok(None),
        }
    }

    fn check_minimum(&self, target: &SplunkVersion) -> Result<()> {
        if let Some(minimum) = &self.minimum {
            if target < minimum {
                return Err(FleetError::precondition(
                    "fleet",
                    format!("version {} is below the required minimum {}", target, minimum),
                ));
            }
        }
        Ok(())
    }

    fn install_parent(&self) -> String {
        let home = self.splunk.home.trim_end_matches('/');
        match home.rsplit_once('/') {
            Some(("", _)) | None => "/".to_string(),
            Some((parent, _)) => parent.to_string(),
        }
    }

    fn splunk_bin(&self) -> String {
        format!("{}/bin/splunk", self.splunk.home.trim_end_matches('/'))
    }

    /// Stage, unpack and hand the archive over to the service account
    async fn deploy(&self, host: &dyn HostSystem, artifact: &PackageArtifact) -> Result<()> {
        let staged = format!(
            "{}/{}",
            self.splunk.staging_dir.trim_end_matches('/'),
            artifact.file_name
        );
        host.upload(&artifact.local_path, &staged).await?;
        host.extract_archive(&staged, &self.install_parent()).await?;
        host.remove_file(&staged).await?;
        host.chown(&self.splunk.home, &self.splunk.user, &self.splunk.group, true)
            .await?;

        let accept = vec![
            "sudo".to_string(),
            "-u".to_string(),
            self.splunk.user.clone(),
            self.splunk_bin(),
            "version".to_string(),
            "--accept-license".to_string(),
            "--answer-yes".to_string(),
            "--no-prompt".to_string(),
        ];
        let output = host.run(&accept).await?;
        if !output.success() {
            return Err(FleetError::command(
                host.name(),
                "splunk version --accept-license",
                output.stderr.trim(),
            ));
        }
        Ok(())
    }

    async fn verify_marker(&self, host: &dyn HostSystem, expected: &SplunkVersion) -> Result<()> {
        match self.installed_version(host).await? {
            Some(marker) if &marker.version == expected => Ok(()),
            Some(marker) => Err(FleetError::command(
                host.name(),
                "verify version",
                format!("marker reads {} after deploying {}", marker.version, expected),
            )),
            None => Err(FleetError::command(
                host.name(),
                "verify version",
                "no version marker after deployment",
            )),
        }
    }

    /// Install `version` on a host where Splunk is absent
    ///
    /// The host must already carry the service account from host preparation.
    /// When `seed` is given, the admin account is seeded and the service started.
    #[instrument(skip_all, fields(host = %host.name(), version = %version))]
    pub async fn install(
        &self,
        version: &SplunkVersion,
        host: &dyn HostSystem,
        seed: Option<&Credentials>,
    ) -> Result<InstallOutcome> {
        self.check_minimum(version)?;

        if let Some(marker) = self.installed_version(host).await? {
            if &marker.version == version {
                info!("Requested version already installed");
                return Ok(InstallOutcome::AlreadyInstalled(marker.version));
            }
            return Err(FleetError::precondition(
                host.name(),
                format!(
                    "Splunk {} is already installed; use upgrade to move to {}",
                    marker.version, version
                ),
            ));
        }

        if host.user(&self.splunk.user).await?.is_none() {
            return Err(FleetError::precondition(
                host.name(),
                format!(
                    "service account '{}' missing; run host preparation first",
                    self.splunk.user
                ),
            ));
        }

        let artifact = self.resolver.resolve(version).await?;
        self.deploy(host, &artifact).await?;
        self.verify_marker(host, version).await?;

        if let Some(credentials) = seed {
            let path = format!(
                "{}/etc/system/local/user-seed.conf",
                self.splunk.home.trim_end_matches('/')
            );
            let contents = format!(
                "[user_info]\nUSERNAME = {}\nPASSWORD = {}\n",
                credentials.username(),
                credentials.password()
            );
            host.write_file(&path, &contents, 0o600).await?;
            host.chown(&path, &self.splunk.user, &self.splunk.group, false)
                .await?;

            host.systemctl(UnitAction::Start, &self.splunk.service).await?;
            if !wait_healthy(self.probe.as_ref(), host, &self.policy).await? {
                return Err(FleetError::command(
                    host.name(),
                    "start",
                    "splunkd did not become healthy after installation",
                ));
            }
        }

        info!("Installation complete");
        Ok(InstallOutcome::Installed(version.clone()))
    }

    /// Roll `target` across `hosts` in the given order
    ///
    /// Controller-side preconditions (version floor, package presence) fail
    /// the call before any host is touched. Per-host failures halt the run
    /// and are reported in the returned report.
    #[instrument(skip_all, fields(target = %target, hosts = hosts.len()))]
    pub async fn upgrade(
        &self,
        target: &SplunkVersion,
        hosts: &[Arc<dyn HostSystem>],
    ) -> Result<RollingReport> {
        self.check_minimum(target)?;
        let artifact = self.resolver.resolve(target).await?;

        let step = UpgradeStep {
            unit: self,
            target: target.clone(),
            artifact,
        };
        let report = RollingDriver::new(self.policy.clone())
            .run(hosts, &step)
            .await;

        if let Some(host) = &report.halted_at {
            warn!(host = %host, "Rolling upgrade halted");
        }
        Ok(report)
    }
}

struct UpgradeStep<'a> {
    unit: &'a EnterpriseUnit,
    target: SplunkVersion,
    artifact: PackageArtifact,
}

#[async_trait]
impl RollingStep for UpgradeStep<'_> {
    fn name(&self) -> &str {
        "upgrade"
    }

    async fn run(&self, host: &dyn HostSystem) -> Result<StepOutcome> {
        let unit = self.unit;
        let service = &unit.splunk.service;

        if !unit.probe.is_healthy(host).await? {
            return Err(FleetError::precondition(
                host.name(),
                "service is not healthy before upgrade",
            ));
        }

        let Some(marker) = unit.installed_version(host).await? else {
            return Err(FleetError::precondition(host.name(), "Splunk is not installed"));
        };
        let current = marker.version;

        if current == self.target {
            return Ok(StepOutcome {
                changed: false,
                detail: Some(format!("already at {}", current)),
            });
        }

        if self.target < current && !unit.policy.allow_downgrade {
            return Err(FleetError::precondition(
                host.name(),
                format!(
                    "refusing to downgrade from {} to {} without allow_downgrade",
                    current, self.target
                ),
            ));
        }

        info!(host = %host.name(), from = %current, to = %self.target, "Upgrading");
        host.systemctl(UnitAction::Stop, service).await?;
        unit.deploy(host, &self.artifact).await?;
        host.systemctl(UnitAction::Start, service).await?;

        if !wait_healthy(unit.probe.as_ref(), host, &unit.policy).await? {
            return Err(FleetError::command(
                host.name(),
                "start",
                format!("splunkd did not become healthy after upgrading to {}", self.target),
            ));
        }
        unit.verify_marker(host, &self.target).await?;

        Ok(StepOutcome {
            changed: true,
            detail: Some(format!("{} -> {}", current, self.target)),
        })
    }
}
