// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations sequence against one management endpoint
//!
//! A sequence logs in once, runs its operations in order on that session and
//! logs out on every exit path. Authentication failures end the sequence;
//! other failures are recorded per operation and the sequence moves on
//! unless `abort_on_error` is set.

use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use super::api::{AccountSpec, Credentials, ManagementApi, Session};
use super::bundle::push_bundle;
use super::retry::{with_retry, RetryPolicy};
use super::shc::rolling_restart;
use super::users::ensure_user;
use crate::config::ApiConfig;
use crate::error::{FleetError, Result};
use crate::host::HostSystem;
use crate::rolling::{BatchPolicy, HostState};

/// One step of a sequence
pub enum Operation {
    /// Confirm the credentials open a session; nothing else is touched
    VerifyLogin,
    EnsureUser(AccountSpec),
    PushBundle { expected_generation: Option<u64> },
    ShcStatus,
    ShcRollingRestart {
        hosts: Vec<Arc<dyn HostSystem>>,
        service: String,
    },
    ReloadDeploymentServer,
}

impl Operation {
    /// Short name used as the target in results and logs
    pub fn label(&self) -> String {
        match self {
            Operation::VerifyLogin => "login".to_string(),
            Operation::EnsureUser(spec) => format!("user:{}", spec.name),
            Operation::PushBundle { .. } => "bundle".to_string(),
            Operation::ShcStatus => "shc-status".to_string(),
            Operation::ShcRollingRestart { .. } => "shc-rolling-restart".to_string(),
            Operation::ReloadDeploymentServer => "deployment-server-reload".to_string(),
        }
    }
}

/// Outcome of one operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResult {
    pub target: String,
    pub changed: bool,
    pub detail: Option<String>,
    pub error: Option<String>,
}

impl OperationResult {
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SequenceReport {
    pub endpoint: String,
    pub results: Vec<OperationResult>,
    /// Set when `abort_on_error` stopped the sequence early
    pub aborted: bool,
}

impl SequenceReport {
    pub fn success(&self) -> bool {
        !self.aborted && self.results.iter().all(|r| !r.failed())
    }

    pub fn changed(&self) -> usize {
        self.results.iter().filter(|r| r.changed).count()
    }
}

pub struct Sequence {
    api: Arc<dyn ManagementApi>,
    credentials: Credentials,
    retry: RetryPolicy,
    abort_on_error: bool,
    policy: BatchPolicy,
}

impl Sequence {
    pub fn new(
        api: Arc<dyn ManagementApi>,
        credentials: Credentials,
        config: &ApiConfig,
        policy: BatchPolicy,
    ) -> Self {
        Self {
            api,
            credentials,
            retry: config.retry.clone(),
            abort_on_error: config.abort_on_error,
            policy,
        }
    }

    /// Log in, run `operations` in order, log out
    ///
    /// Returns `Err` only for failures that end the sequence as a whole:
    /// a rejected login or an authentication failure mid-sequence.
    #[instrument(skip_all, fields(endpoint = %self.api.endpoint(), operations = operations.len()))]
    pub async fn run(&self, operations: &[Operation]) -> Result<SequenceReport> {
        let api = self.api.as_ref();
        let session = with_retry(&self.retry, "login", || api.login(&self.credentials)).await?;
        info!(session = session.id(), "Logged in");

        let outcome = self.run_operations(&session, operations).await;

        let id = session.id();
        match api.logout(session).await {
            Ok(()) => info!(session = id, "Logged out"),
            Err(e) => warn!(session = id, error = %e, "Logout failed"),
        }

        outcome
    }

    async fn run_operations(
        &self,
        session: &Session,
        operations: &[Operation],
    ) -> Result<SequenceReport> {
        let mut results = Vec::with_capacity(operations.len());
        let mut aborted = false;

        for operation in operations {
            let target = operation.label();
            match self.execute(session, operation).await {
                Ok((changed, detail)) => {
                    info!(target = %target, changed, "Operation completed");
                    results.push(OperationResult {
                        target,
                        changed,
                        detail,
                        error: None,
                    });
                }
                Err(e) if e.is_fatal() => {
                    error!(target = %target, error = %e, "Operation failed fatally");
                    return Err(e);
                }
                Err(e) => {
                    error!(target = %target, error = %e, "Operation failed");
                    results.push(OperationResult {
                        target,
                        changed: false,
                        detail: None,
                        error: Some(e.to_string()),
                    });
                    if self.abort_on_error {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        Ok(SequenceReport {
            endpoint: self.api.endpoint().to_string(),
            results,
            aborted,
        })
    }

    async fn execute(
        &self,
        session: &Session,
        operation: &Operation,
    ) -> Result<(bool, Option<String>)> {
        let api = self.api.as_ref();
        match operation {
            Operation::VerifyLogin => Ok((false, Some("session verified".to_string()))),
            Operation::EnsureUser(spec) => {
                let change =
                    with_retry(&self.retry, "ensure user", || ensure_user(api, session, spec))
                        .await?;
                Ok((change.changed(), Some(change.to_string())))
            }
            Operation::PushBundle {
                expected_generation,
            } => {
                let outcome = push_bundle(
                    api,
                    session,
                    *expected_generation,
                    &self.policy,
                    &self.retry,
                )
                .await?;
                let detail = match &outcome {
                    super::bundle::BundleOutcome::Unchanged { checksum } => {
                        format!("active bundle {} unchanged", checksum)
                    }
                    super::bundle::BundleOutcome::Applied { previous, active } => {
                        format!("{} -> {}", previous, active)
                    }
                };
                Ok((outcome.changed(), Some(detail)))
            }
            Operation::ShcStatus => {
                let status =
                    with_retry(&self.retry, "shc status", || api.shc_status(session)).await?;
                let members: Vec<String> = status
                    .members
                    .iter()
                    .map(|m| format!("{}={}", m.label, m.status))
                    .collect();
                Ok((
                    false,
                    Some(format!(
                        "captain {}; {}",
                        status.captain.as_deref().unwrap_or("none"),
                        members.join(", ")
                    )),
                ))
            }
            Operation::ShcRollingRestart { hosts, service } => {
                let report = rolling_restart(api, session, hosts, service, &self.policy).await?;
                if let Some(host) = &report.halted_at {
                    let reason = report
                        .hosts
                        .iter()
                        .find(|h| h.state == HostState::Failed)
                        .and_then(|h| h.error.clone())
                        .unwrap_or_default();
                    return Err(FleetError::command(
                        host.clone(),
                        "rolling restart",
                        format!(
                            "halted after {} member(s): {}",
                            report.count(HostState::Healthy),
                            reason
                        ),
                    ));
                }
                Ok((
                    report.changed() > 0,
                    Some(format!("{} member(s) restarted", report.changed())),
                ))
            }
            Operation::ReloadDeploymentServer => {
                with_retry(&self.retry, "reload deployment server", || {
                    api.reload_deployment_server(session)
                })
                .await?;
                Ok((true, Some("reloaded".to_string())))
            }
        }
    }
}
