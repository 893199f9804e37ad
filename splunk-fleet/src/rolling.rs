// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rolling batch driver
//!
//! Applies one step to a list of hosts strictly one at a time, in the order
//! given, and halts on the first failure. Hosts already processed keep their
//! new state; hosts after the failure stay `Pending`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::error::Result;
use crate::host::HostSystem;

/// Pacing and safety knobs shared by rolling upgrades and restarts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchPolicy {
    /// Pause after each healthy host before touching the next
    #[serde(default)]
    pub pause_between_secs: u64,

    /// Health polls before a host is declared failed
    #[serde(default = "default_health_retries")]
    pub health_retries: u32,

    /// Delay between health polls
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,

    /// Permit moving a host to a lower version
    #[serde(default)]
    pub allow_downgrade: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            pause_between_secs: 0,
            health_retries: default_health_retries(),
            health_interval_secs: default_health_interval(),
            allow_downgrade: false,
        }
    }
}

/// Per-host position in a rolling run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostState {
    Pending,
    InProgress,
    Healthy,
    Failed,
}

impl fmt::Display for HostState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Pending => write!(formatter, "pending"),
            HostState::InProgress => write!(formatter, "in-progress"),
            HostState::Healthy => write!(formatter, "healthy"),
            HostState::Failed => write!(formatter, "failed"),
        }
    }
}

/// What a successful step did on one host
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub changed: bool,
    pub detail: Option<String>,
}

/// Final record for one host
#[derive(Debug, Clone)]
pub struct HostProgress {
    pub host: String,
    pub state: HostState,
    pub changed: bool,
    pub detail: Option<String>,
    pub error: Option<String>,
}

/// Result of a complete rolling run
#[derive(Debug, Clone)]
pub struct RollingReport {
    pub operation: String,
    pub hosts: Vec<HostProgress>,
    /// Host whose failure stopped the run
    pub halted_at: Option<String>,
}

impl RollingReport {
    pub fn success(&self) -> bool {
        self.halted_at.is_none()
    }

    pub fn count(&self, state: HostState) -> usize {
        self.hosts.iter().filter(|h| h.state == state).count()
    }

    pub fn changed(&self) -> usize {
        self.hosts.iter().filter(|h| h.changed).count()
    }
}

/// A unit of work applied to one host during a rolling run
#[async_trait]
pub trait RollingStep: Send + Sync {
    /// Operation name used in logs and reports
    fn name(&self) -> &str;

    /// Apply the step to `host`, returning once it is healthy again
    async fn run(&self, host: &dyn HostSystem) -> Result<StepOutcome>;
}

/// Decides whether a host is serving
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn is_healthy(&self, host: &dyn HostSystem) -> Result<bool>;
}

/// Healthy when the given systemd unit is active
pub struct ServiceProbe {
    unit: String,
}

impl ServiceProbe {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }
}

#[async_trait]
impl HealthProbe for ServiceProbe {
    async fn is_healthy(&self, host: &dyn HostSystem) -> Result<bool> {
        Ok(host.unit_state(&self.unit).await?.active)
    }
}

/// Poll `probe` until it reports healthy or the policy's retries run out
pub async fn wait_healthy(
    probe: &dyn HealthProbe,
    host: &dyn HostSystem,
    policy: &BatchPolicy,
) -> Result<bool> {
    let attempts = policy.health_retries.max(1);
    for attempt in 1..=attempts {
        if probe.is_healthy(host).await? {
            return Ok(true);
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_secs(policy.health_interval_secs)).await;
        }
    }
    warn!(host = %host.name(), attempts, "Host did not become healthy");
    Ok(false)
}

/// Sequential driver over a host list
pub struct RollingDriver {
    policy: BatchPolicy,
}

impl RollingDriver {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Run `step` on each host in order, halting on the first failure
    #[instrument(skip_all, fields(operation = %step.name(), hosts = hosts.len()))]
    pub async fn run(&self, hosts: &[Arc<dyn HostSystem>], step: &dyn RollingStep) -> RollingReport {
        let mut progress: Vec<HostProgress> = hosts
            .iter()
            .map(|host| HostProgress {
                host: host.name().to_string(),
                state: HostState::Pending,
                changed: false,
                detail: None,
                error: None,
            })
            .collect();
        let mut halted_at = None;

        for (index, host) in hosts.iter().enumerate() {
            progress[index].state = HostState::InProgress;
            info!(host = %host.name(), position = index + 1, "Rolling step started");

            match step.run(host.as_ref()).await {
                Ok(outcome) => {
                    let record = &mut progress[index];
                    record.state = HostState::Healthy;
                    record.changed = outcome.changed;
                    record.detail = outcome.detail;
                    info!(host = %host.name(), changed = outcome.changed, "Rolling step completed");
                }
                Err(e) => {
                    error!(host = %host.name(), error = %e, "Rolling step failed, halting");
                    let record = &mut progress[index];
                    record.state = HostState::Failed;
                    record.error = Some(e.to_string());
                    halted_at = Some(host.name().to_string());
                    break;
                }
            }

            let last = index + 1 == hosts.len();
            if !last && progress[index].changed && self.policy.pause_between_secs > 0 {
                tokio::time::sleep(Duration::from_secs(self.policy.pause_between_secs)).await;
            }
        }

        RollingReport {
            operation: step.name().to_string(),
            hosts: progress,
            halted_at,
        }
    }
}

fn default_health_retries() -> u32 {
    30
}

fn default_health_interval() -> u64 {
    10
}
