// SPDX-License-Identifier: AGPL-3.0-or-later
//! Search-head cluster status and rolling restart

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

use super::api::{ManagementApi, Session};
use crate::error::{FleetError, Result};
use crate::host::{HostSystem, UnitAction};
use crate::rolling::{
    wait_healthy, BatchPolicy, HealthProbe, RollingDriver, RollingReport, RollingStep, StepOutcome,
};

/// Healthy when the cluster reports the member named like the host as `Up`
pub struct MemberProbe<'a> {
    api: &'a dyn ManagementApi,
    session: &'a Session,
}

impl<'a> MemberProbe<'a> {
    pub fn new(api: &'a dyn ManagementApi, session: &'a Session) -> Self {
        Self { api, session }
    }
}

#[async_trait]
impl HealthProbe for MemberProbe<'_> {
    async fn is_healthy(&self, host: &dyn HostSystem) -> Result<bool> {
        let status = self.api.shc_status(self.session).await?;
        Ok(status
            .members
            .iter()
            .any(|member| member.label == host.name() && member.is_up()))
    }
}

struct RestartStep<'a> {
    probe: MemberProbe<'a>,
    service: String,
    policy: BatchPolicy,
}

#[async_trait]
impl RollingStep for RestartStep<'_> {
    fn name(&self) -> &str {
        "shc-rolling-restart"
    }

    async fn run(&self, host: &dyn HostSystem) -> Result<StepOutcome> {
        if !self.probe.is_healthy(host).await? {
            return Err(FleetError::precondition(
                host.name(),
                "member is not Up before restart",
            ));
        }

        host.systemctl(UnitAction::Restart, &self.service).await?;

        if !wait_healthy(&self.probe, host, &self.policy).await? {
            return Err(FleetError::command(
                host.name(),
                "restart",
                "member did not report Up after restart",
            ));
        }

        Ok(StepOutcome {
            changed: true,
            detail: Some("restarted".to_string()),
        })
    }
}

/// Restart every member in `hosts`, one at a time
///
/// Every host must be a known cluster member; otherwise nothing is restarted.
#[instrument(skip_all, fields(endpoint = %api.endpoint(), hosts = hosts.len()))]
pub async fn rolling_restart(
    api: &dyn ManagementApi,
    session: &Session,
    hosts: &[Arc<dyn HostSystem>],
    service: &str,
    policy: &BatchPolicy,
) -> Result<RollingReport> {
    let status = api.shc_status(session).await?;
    for host in hosts {
        if !status.members.iter().any(|m| m.label == host.name()) {
            return Err(FleetError::precondition(
                host.name(),
                "host is not a search-head cluster member",
            ));
        }
    }
    info!(captain = ?status.captain, members = status.members.len(), "Starting rolling restart");

    let step = RestartStep {
        probe: MemberProbe::new(api, session),
        service: service.to_string(),
        policy: policy.clone(),
    };
    Ok(RollingDriver::new(policy.clone()).run(hosts, &step).await)
}
