// SPDX-License-Identifier: AGPL-3.0-or-later
//! Playbook executor
//!
//! Plays run in order and roles within a play run in order. A role that
//! fails on any target stops the playbook, so later roles never run against
//! hosts whose prerequisites are missing. Host-parallel roles use up to
//! `forks` hosts at once; upgrades and restarts roll one host at a time.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Playbook, Role, RoleTask};
use crate::config::Config;
use crate::enterprise::{EnterpriseUnit, InstallOutcome, SplunkVersion};
use crate::error::Result;
use crate::host::HostSystem;
use crate::inventory::Inventory;
use crate::linux::{self, LinuxOptions};
use crate::operations::{
    analyze_changes, apply_settings, control, ChangeResult, ConfSetting, ManagementApi, Operation,
    PendingFlags, RestApi, Sequence, ServiceAction,
};
use crate::rolling::HostState;

/// Resolves a play's `hosts` pattern to host handles
pub trait HostSource: Send + Sync {
    fn hosts(&self, pattern: &str) -> Result<Vec<Arc<dyn HostSystem>>>;
}

impl HostSource for Inventory {
    fn hosts(&self, pattern: &str) -> Result<Vec<Arc<dyn HostSystem>>> {
        self.connect(pattern)
    }
}

/// Result of one role task on one target
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub play: String,
    pub role: Role,
    pub task: String,
    /// Host name, operation label or API endpoint
    pub target: String,
    pub success: bool,
    pub changed: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Result of executing a complete playbook
#[derive(Debug)]
pub struct PlaybookResult {
    pub playbook_name: String,
    pub success: bool,
    pub task_results: Vec<TaskResult>,
    pub total_duration_ms: u64,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
}

impl PlaybookResult {
    pub fn changed(&self) -> usize {
        self.task_results.iter().filter(|r| r.changed).count()
    }
}

struct TaskContext {
    play: String,
    role: Role,
    task: String,
}

impl TaskContext {
    fn result(
        &self,
        target: impl Into<String>,
        outcome: Result<(bool, Option<String>)>,
        duration_ms: u64,
    ) -> TaskResult {
        let (success, changed, output, error) = match outcome {
            Ok((changed, output)) => (true, changed, output, None),
            Err(e) => (false, false, None, Some(e.to_string())),
        };
        TaskResult {
            play: self.play.clone(),
            role: self.role,
            task: self.task.clone(),
            target: target.into(),
            success,
            changed,
            output,
            error,
            duration_ms,
        }
    }

    fn failure(
        &self,
        target: impl Into<String>,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> TaskResult {
        let mut result = self.result(target, Ok((false, None)), duration_ms);
        result.success = false;
        result.error = Some(message.into());
        result
    }
}

struct HostRun {
    host: String,
    outcome: Result<(bool, Option<String>)>,
    duration_ms: u64,
}

/// Executor for playbooks
pub struct PlaybookExecutor {
    config: Config,
    /// Whether to run in dry-run mode (observe only, never mutate)
    dry_run: bool,
    api: Option<Arc<dyn ManagementApi>>,
}

impl PlaybookExecutor {
    pub fn new(config: Config, dry_run: bool) -> Self {
        Self {
            config,
            dry_run,
            api: None,
        }
    }

    /// Use `api` instead of a REST client built from the configuration
    pub fn with_api(mut self, api: Arc<dyn ManagementApi>) -> Self {
        self.api = Some(api);
        self
    }

    fn api(&self) -> Result<Arc<dyn ManagementApi>> {
        match &self.api {
            Some(api) => Ok(api.clone()),
            None => Ok(Arc::new(RestApi::new(&self.config.api)?)),
        }
    }

    /// Execute a playbook
    pub async fn execute(&self, playbook: &Playbook, source: &dyn HostSource) -> Result<PlaybookResult> {
        playbook.validate()?;

        let start_time = Instant::now();
        let mut task_results = Vec::new();
        let mut overall_success = true;

        info!(
            playbook = %playbook.name,
            plays = playbook.plays.len(),
            dry_run = self.dry_run,
            "Starting playbook execution"
        );

        'plays: for (index, play) in playbook.plays.iter().enumerate() {
            let play_name = if play.name.is_empty() {
                format!("play {}", index + 1)
            } else {
                play.name.clone()
            };
            let hosts = source.hosts(&play.hosts)?;
            info!(play = %play_name, hosts = hosts.len(), "Starting play");

            for invocation in &play.roles {
                let context = TaskContext {
                    play: play_name.clone(),
                    role: invocation.role,
                    task: invocation.task_name().to_string(),
                };
                debug!(role = %context.role, task = %context.task, "Running role");

                let results = self.run_task(&context, &invocation.task()?, &hosts).await;
                let failed = results.iter().filter(|r| !r.success).count();
                task_results.extend(results);

                if failed > 0 {
                    overall_success = false;
                    error!(role = %context.role, task = %context.task, failed, "Role failed");
                    warn!("Stopping playbook execution due to role failure");
                    break 'plays;
                }
            }
        }

        let total_duration_ms = start_time.elapsed().as_millis() as u64;
        let tasks_succeeded = task_results.iter().filter(|r| r.success).count();
        let tasks_failed = task_results.len() - tasks_succeeded;

        info!(
            playbook = %playbook.name,
            success = overall_success,
            duration_ms = total_duration_ms,
            succeeded = tasks_succeeded,
            failed = tasks_failed,
            "Playbook execution completed"
        );

        Ok(PlaybookResult {
            playbook_name: playbook.name.clone(),
            success: overall_success,
            task_results,
            total_duration_ms,
            tasks_succeeded,
            tasks_failed,
        })
    }

    async fn run_task(
        &self,
        context: &TaskContext,
        task: &RoleTask,
        hosts: &[Arc<dyn HostSystem>],
    ) -> Vec<TaskResult> {
        match task {
            RoleTask::LinuxConverge(options) => {
                let options = self.linux_options(options);
                self.linux(context, hosts, &options, self.dry_run).await
            }
            RoleTask::LinuxPlan(options) => {
                let options = self.linux_options(options);
                self.linux(context, hosts, &options, true).await
            }
            RoleTask::EnterpriseInstall {
                version,
                seed_admin,
            } => self.install(context, hosts, version, *seed_admin).await,
            RoleTask::EnterpriseUpgrade { version } => self.upgrade(context, hosts, version).await,
            RoleTask::CoreService(action) => self.service(context, hosts, *action).await,
            RoleTask::CoreConf { settings, flags } => {
                self.conf(context, hosts, settings, *flags).await
            }
            RoleTask::CoreLogin => self.sequence(context, vec![Operation::VerifyLogin]).await,
            RoleTask::CoreUsers(users) => {
                let operations = users.iter().cloned().map(Operation::EnsureUser).collect();
                self.sequence(context, operations).await
            }
            RoleTask::CoreBundle {
                expected_generation,
            } => {
                let operations = vec![Operation::PushBundle {
                    expected_generation: *expected_generation,
                }];
                self.sequence(context, operations).await
            }
            RoleTask::CoreShcStatus => self.sequence(context, vec![Operation::ShcStatus]).await,
            RoleTask::CoreShcRollingRestart => {
                let operations = vec![Operation::ShcRollingRestart {
                    hosts: hosts.to_vec(),
                    service: self.config.splunk.service.clone(),
                }];
                self.sequence(context, operations).await
            }
            RoleTask::CoreDeploymentServerReload => {
                self.sequence(context, vec![Operation::ReloadDeploymentServer])
                    .await
            }
        }
    }

    fn linux_options(&self, options: &Option<LinuxOptions>) -> LinuxOptions {
        options
            .clone()
            .unwrap_or_else(|| LinuxOptions::for_splunk(&self.config))
    }

    /// Run `run` on every host, at most `forks` at a time, results in host order
    async fn per_host<F, Fut>(&self, hosts: &[Arc<dyn HostSystem>], run: F) -> Vec<HostRun>
    where
        F: Fn(Arc<dyn HostSystem>) -> Fut,
        Fut: Future<Output = Result<(bool, Option<String>)>>,
    {
        let mut runs: Vec<(usize, HostRun)> = stream::iter(hosts.iter().cloned().enumerate())
            .map(|(index, host)| {
                let future = run(host.clone());
                async move {
                    let start = Instant::now();
                    let outcome = future.await;
                    let run = HostRun {
                        host: host.name().to_string(),
                        outcome,
                        duration_ms: start.elapsed().as_millis() as u64,
                    };
                    (index, run)
                }
            })
            .buffer_unordered(self.config.forks.max(1))
            .collect()
            .await;
        runs.sort_by_key(|(index, _)| *index);
        runs.into_iter().map(|(_, run)| run).collect()
    }

    fn collect(context: &TaskContext, runs: Vec<HostRun>) -> Vec<TaskResult> {
        runs.into_iter()
            .map(|run| context.result(run.host, run.outcome, run.duration_ms))
            .collect()
    }

    async fn linux(
        &self,
        context: &TaskContext,
        hosts: &[Arc<dyn HostSystem>],
        options: &LinuxOptions,
        observe_only: bool,
    ) -> Vec<TaskResult> {
        let runs = self
            .per_host(hosts, move |host| async move {
                if observe_only {
                    let drifts = linux::plan(host.as_ref(), options).await?;
                    let detail: Vec<String> = drifts
                        .iter()
                        .map(|d| format!("{} {}", d.action, d.resource))
                        .collect();
                    Ok((
                        false,
                        Some(format!(
                            "[DRY RUN] {} change(s) pending{}{}",
                            drifts.len(),
                            if detail.is_empty() { "" } else { ": " },
                            detail.join(", ")
                        )),
                    ))
                } else {
                    let report = linux::converge(host.as_ref(), options).await?;
                    Ok((
                        report.changed() > 0,
                        Some(format!(
                            "{} of {} resource(s) changed",
                            report.changed(),
                            report.resources.len()
                        )),
                    ))
                }
            })
            .await;
        Self::collect(context, runs)
    }

    async fn install(
        &self,
        context: &TaskContext,
        hosts: &[Arc<dyn HostSystem>],
        version: &SplunkVersion,
        seed_admin: bool,
    ) -> Vec<TaskResult> {
        let prepared = EnterpriseUnit::new(&self.config).and_then(|unit| {
            let seed = if seed_admin && !self.dry_run {
                Some(self.config.credentials()?)
            } else {
                None
            };
            Ok((unit, seed))
        });
        let (unit, seed) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return vec![context.result("controller", Err(e), 0)],
        };
        let unit = &unit;
        let seed = seed.as_ref();
        let dry_run = self.dry_run;

        let runs = self
            .per_host(hosts, move |host| async move {
                if dry_run {
                    let detail = match unit.installed_version(host.as_ref()).await? {
                        Some(marker) if &marker.version == version => {
                            format!("[DRY RUN] {} already installed", version)
                        }
                        Some(marker) => format!(
                            "[DRY RUN] {} installed; install of {} would be refused",
                            marker.version, version
                        ),
                        None => format!("[DRY RUN] Would install {}", version),
                    };
                    return Ok((false, Some(detail)));
                }
                match unit.install(version, host.as_ref(), seed).await? {
                    InstallOutcome::AlreadyInstalled(v) => {
                        Ok((false, Some(format!("{} already installed", v))))
                    }
                    InstallOutcome::Installed(v) => Ok((true, Some(format!("installed {}", v)))),
                }
            })
            .await;
        Self::collect(context, runs)
    }

    async fn upgrade(
        &self,
        context: &TaskContext,
        hosts: &[Arc<dyn HostSystem>],
        version: &SplunkVersion,
    ) -> Vec<TaskResult> {
        let unit = match EnterpriseUnit::new(&self.config) {
            Ok(unit) => unit,
            Err(e) => return vec![context.result("controller", Err(e), 0)],
        };

        if self.dry_run {
            let unit = &unit;
            let runs = self
                .per_host(hosts, move |host| async move {
                    let detail = match unit.installed_version(host.as_ref()).await? {
                        Some(marker) if &marker.version == version => {
                            format!("[DRY RUN] already at {}", version)
                        }
                        Some(marker) => {
                            format!("[DRY RUN] Would upgrade {} -> {}", marker.version, version)
                        }
                        None => "[DRY RUN] Splunk is not installed".to_string(),
                    };
                    Ok((false, Some(detail)))
                })
                .await;
            return Self::collect(context, runs);
        }

        let start = Instant::now();
        let report = match unit.upgrade(version, hosts).await {
            Ok(report) => report,
            Err(e) => {
                return vec![context.result(
                    "controller",
                    Err(e),
                    start.elapsed().as_millis() as u64,
                )]
            }
        };

        let halted_at = report.halted_at.clone().unwrap_or_default();
        report
            .hosts
            .into_iter()
            .map(|progress| {
                let elapsed = start.elapsed().as_millis() as u64;
                match progress.state {
                    HostState::Healthy => context.result(
                        progress.host,
                        Ok((progress.changed, progress.detail)),
                        elapsed,
                    ),
                    HostState::Failed => context.failure(
                        progress.host,
                        progress.error.unwrap_or_default(),
                        elapsed,
                    ),
                    HostState::Pending | HostState::InProgress => context.failure(
                        progress.host,
                        format!("not attempted after failure on {}", halted_at),
                        0,
                    ),
                }
            })
            .collect()
    }

    async fn service(
        &self,
        context: &TaskContext,
        hosts: &[Arc<dyn HostSystem>],
        action: ServiceAction,
    ) -> Vec<TaskResult> {
        let unit = self.config.splunk.service.as_str();
        let policy = &self.config.rolling;
        let dry_run = self.dry_run;

        let runs = self
            .per_host(hosts, move |host| async move {
                if dry_run {
                    let state = host.unit_state(unit).await?;
                    return Ok((
                        false,
                        Some(format!(
                            "[DRY RUN] Would {} {} (currently {})",
                            action,
                            unit,
                            if state.active { "active" } else { "inactive" }
                        )),
                    ));
                }
                let changed = control(host.as_ref(), action, unit, policy).await?;
                Ok((changed, Some(format!("{} {}", action, unit))))
            })
            .await;
        Self::collect(context, runs)
    }

    async fn conf(
        &self,
        context: &TaskContext,
        hosts: &[Arc<dyn HostSystem>],
        settings: &[ConfSetting],
        flags: PendingFlags,
    ) -> Vec<TaskResult> {
        let owner = &self.config.splunk;
        let dry_run = self.dry_run;

        let runs = self
            .per_host(hosts, move |host| async move {
                if dry_run {
                    let mut paths: Vec<&str> = settings.iter().map(|s| s.path.as_str()).collect();
                    paths.sort();
                    paths.dedup();
                    return Ok((
                        false,
                        Some(format!(
                            "[DRY RUN] Would apply {} setting(s) to {} file(s)",
                            settings.len(),
                            paths.len()
                        )),
                    ));
                }
                let changes = apply_settings(host.as_ref(), settings, owner).await?;
                let results: Vec<ChangeResult> = changes
                    .iter()
                    .map(|c| ChangeResult {
                        changed: c.changed,
                        path: c.path.clone(),
                    })
                    .collect();
                let actions = analyze_changes(&results, flags);
                let changed = changes.iter().any(|c| c.changed);
                Ok((changed, Some(serde_json::to_string(&actions)?)))
            })
            .await;
        Self::collect(context, runs)
    }

    async fn sequence(&self, context: &TaskContext, operations: Vec<Operation>) -> Vec<TaskResult> {
        let endpoint = self.config.api.endpoint.clone();
        if self.dry_run {
            let labels: Vec<String> = operations.iter().map(Operation::label).collect();
            return vec![context.result(
                endpoint,
                Ok((
                    false,
                    Some(format!("[DRY RUN] Would run: {}", labels.join(", "))),
                )),
                0,
            )];
        }

        let start = Instant::now();
        let prepared = self
            .api()
            .and_then(|api| Ok((api, self.config.credentials()?)));
        let (api, credentials) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return vec![context.result(endpoint, Err(e), 0)],
        };

        let sequence = Sequence::new(api, credentials, &self.config.api, self.config.rolling.clone());
        match sequence.run(&operations).await {
            Ok(report) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let mut results: Vec<TaskResult> = report
                    .results
                    .into_iter()
                    .map(|r| match r.error {
                        None => context.result(r.target, Ok((r.changed, r.detail)), elapsed),
                        Some(message) => context.failure(r.target, message, elapsed),
                    })
                    .collect();
                if report.aborted {
                    results.push(context.failure(
                        report.endpoint,
                        "sequence aborted after a failed operation",
                        elapsed,
                    ));
                }
                results
            }
            Err(e) => vec![context.result(endpoint, Err(e), start.elapsed().as_millis() as u64)],
        }
    }
}
