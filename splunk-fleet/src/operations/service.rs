// SPDX-License-Identifier: AGPL-3.0-or-later
//! splunkd service control with a post-action check

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{FleetError, Result};
use crate::host::{HostSystem, UnitAction};
use crate::rolling::BatchPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
}

impl ServiceAction {
    fn unit_action(self) -> UnitAction {
        match self {
            ServiceAction::Start => UnitAction::Start,
            ServiceAction::Stop => UnitAction::Stop,
            ServiceAction::Restart => UnitAction::Restart,
        }
    }

    /// Whether the unit must be active once the action completed
    fn wants_active(self) -> bool {
        self != ServiceAction::Stop
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.unit_action().verb())
    }
}

impl FromStr for ServiceAction {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(ServiceAction::Start),
            "stop" => Ok(ServiceAction::Stop),
            "restart" => Ok(ServiceAction::Restart),
            other => Err(FleetError::InvalidConfig {
                message: format!("unknown service action '{}'", other),
            }),
        }
    }
}

/// Apply `action` to `unit` and wait for the unit to settle
///
/// Start and stop are no-ops when the unit is already in the wanted state;
/// restart always acts. Returns whether anything was done.
#[instrument(skip_all, fields(host = %host.name(), action = %action, unit = %unit))]
pub async fn control(
    host: &dyn HostSystem,
    action: ServiceAction,
    unit: &str,
    policy: &BatchPolicy,
) -> Result<bool> {
    let wanted = action.wants_active();
    let before = host.unit_state(unit).await?;
    if action != ServiceAction::Restart && before.active == wanted {
        info!("Service already in the requested state");
        return Ok(false);
    }

    host.systemctl(action.unit_action(), unit).await?;

    let attempts = policy.health_retries.max(1);
    for attempt in 1..=attempts {
        if host.unit_state(unit).await?.active == wanted {
            info!("Service action verified");
            return Ok(true);
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_secs(policy.health_interval_secs)).await;
        }
    }

    Err(FleetError::command(
        host.name(),
        format!("systemctl {} {}", action, unit),
        format!(
            "unit is {} after {} check(s)",
            if wanted { "inactive" } else { "still active" },
            attempts
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryHost, UnitState};

    fn policy() -> BatchPolicy {
        BatchPolicy {
            health_retries: 2,
            health_interval_secs: 0,
            ..Default::default()
        }
    }

    fn running(name: &str) -> MemoryHost {
        MemoryHost::new(name).with_unit(
            "Splunkd",
            UnitState {
                enabled: true,
                active: true,
            },
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let host = running("splunk01");
        assert!(!control(&host, ServiceAction::Start, "Splunkd", &policy())
            .await
            .unwrap());
        assert!(host.journal().is_empty());
    }

    #[tokio::test]
    async fn test_stop_then_start() {
        let host = running("splunk01");
        assert!(control(&host, ServiceAction::Stop, "Splunkd", &policy())
            .await
            .unwrap());
        assert!(control(&host, ServiceAction::Start, "Splunkd", &policy())
            .await
            .unwrap());
        assert_eq!(
            host.journal(),
            vec!["systemctl:stop:Splunkd", "systemctl:start:Splunkd"]
        );
    }

    #[tokio::test]
    async fn test_restart_of_broken_unit_fails_check() {
        let host = running("splunk01");
        host.break_unit("Splunkd");
        let error = control(&host, ServiceAction::Restart, "Splunkd", &policy())
            .await
            .unwrap_err();
        assert!(matches!(error, FleetError::CommandFailed { .. }));
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("restart".parse::<ServiceAction>().unwrap(), ServiceAction::Restart);
        assert!("reload".parse::<ServiceAction>().is_err());
    }
}
