// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory host
//!
//! Holds the same state a real machine would expose through
//! [`HostSystem`]. Used to rehearse plans and in tests; failures can be
//! injected per operation to exercise error paths.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::{
    CommandOutput, GroupInfo, GroupSpec, HostFacts, HostSystem, OsFamily, PortSpec, UnitAction,
    UnitState, UserInfo, UserSpec,
};
use crate::error::{FleetError, Result};

/// A simulated host
pub struct MemoryHost {
    name: String,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    facts: Option<HostFacts>,
    files: BTreeMap<String, String>,
    groups: BTreeMap<String, GroupInfo>,
    users: BTreeMap<String, UserInfo>,
    units: BTreeMap<String, UnitState>,
    ports: BTreeSet<PortSpec>,
    /// Archive file name -> files it unpacks to
    archives: BTreeMap<String, BTreeMap<String, String>>,
    /// Units that stay inactive after start/restart
    broken_units: BTreeSet<String>,
    /// Operation keys that fail when attempted
    failures: BTreeSet<String>,
    journal: Vec<String>,
    next_id: u32,
}

impl MemoryHost {
    /// A privileged RHEL-like host with nothing configured
    pub fn new(name: impl Into<String>) -> Self {
        let state = MemoryState {
            facts: Some(HostFacts {
                os_family: OsFamily::RedHat,
                distribution: "rocky".to_string(),
                distribution_version: "9.3".to_string(),
                privileged: true,
            }),
            next_id: 1001,
            ..Default::default()
        };
        Self {
            name: name.into(),
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-operation
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_facts(self, facts: HostFacts) -> Self {
        self.state().facts = Some(facts);
        self
    }

    /// Seed a file
    pub fn with_file(self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.state().files.insert(path.into(), contents.into());
        self
    }

    /// Seed a unit state
    pub fn with_unit(self, unit: impl Into<String>, state: UnitState) -> Self {
        self.state().units.insert(unit.into(), state);
        self
    }

    /// Register what unpacking an archive with this file name produces
    pub fn with_archive(self, file_name: impl Into<String>, files: BTreeMap<String, String>) -> Self {
        self.state().archives.insert(file_name.into(), files);
        self
    }

    /// Make the operation identified by `key` fail, e.g. `open_port:9997/tcp`
    pub fn fail_on(&self, key: impl Into<String>) {
        self.state().failures.insert(key.into());
    }

    /// Keep `unit` inactive after start or restart
    pub fn break_unit(&self, unit: impl Into<String>) {
        self.state().broken_units.insert(unit.into());
    }

    /// Mutating operations performed so far, in order
    pub fn journal(&self) -> Vec<String> {
        self.state().journal.clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    pub fn ports(&self) -> Vec<PortSpec> {
        self.state().ports.iter().copied().collect()
    }

    fn mutate(&self, key: String) -> Result<MutexGuard<'_, MemoryState>> {
        let mut state = self.state();
        if state.failures.contains(&key) {
            return Err(FleetError::command(&self.name, key, "injected failure"));
        }
        state.journal.push(key);
        Ok(state)
    }
}

#[async_trait]
impl HostSystem for MemoryHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn facts(&self) -> Result<HostFacts> {
        self.state()
            .facts
            .clone()
            .ok_or_else(|| FleetError::command(&self.name, "facts", "facts unavailable"))
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        Ok(self.state().files.get(path).cloned())
    }

    async fn write_file(&self, path: &str, contents: &str, _mode: u32) -> Result<()> {
        let mut state = self.mutate(format!("write:{}", path))?;
        state.files.insert(path.to_string(), contents.to_string());
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<bool> {
        let mut state = self.mutate(format!("remove:{}", path))?;
        Ok(state.files.remove(path).is_some())
    }

    async fn chown(&self, path: &str, user: &str, group: &str, _recursive: bool) -> Result<()> {
        self.mutate(format!("chown:{}:{}:{}", path, user, group))?;
        Ok(())
    }

    async fn group(&self, name: &str) -> Result<Option<GroupInfo>> {
        Ok(self.state().groups.get(name).cloned())
    }

    async fn create_group(&self, spec: &GroupSpec) -> Result<()> {
        let mut state = self.mutate(format!("groupadd:{}", spec.name))?;
        let gid = spec.gid.unwrap_or(state.next_id);
        state.next_id += 1;
        state.groups.insert(
            spec.name.clone(),
            GroupInfo {
                name: spec.name.clone(),
                gid,
            },
        );
        Ok(())
    }

    async fn user(&self, name: &str) -> Result<Option<UserInfo>> {
        Ok(self.state().users.get(name).cloned())
    }

    async fn create_user(&self, spec: &UserSpec) -> Result<()> {
        let mut state = self.mutate(format!("useradd:{}", spec.name))?;
        let uid = spec.uid.unwrap_or(state.next_id);
        state.next_id += 1;
        state.users.insert(
            spec.name.clone(),
            UserInfo {
                name: spec.name.clone(),
                uid,
                group: spec.group.clone(),
                groups: spec.groups.clone(),
                home: spec.home.clone(),
                shell: spec.shell.clone(),
            },
        );
        Ok(())
    }

    async fn modify_user(&self, spec: &UserSpec) -> Result<()> {
        let mut state = self.mutate(format!("usermod:{}", spec.name))?;
        let Some(user) = state.users.get_mut(&spec.name) else {
            return Err(FleetError::command(&self.name, "usermod", "no such user"));
        };
        user.group = spec.group.clone();
        user.groups = spec.groups.clone();
        user.home = spec.home.clone();
        user.shell = spec.shell.clone();
        Ok(())
    }

    async fn unit_state(&self, unit: &str) -> Result<UnitState> {
        Ok(self.state().units.get(unit).copied().unwrap_or_default())
    }

    async fn systemctl(&self, action: UnitAction, unit: &str) -> Result<()> {
        let key = match action {
            UnitAction::DaemonReload => "systemctl:daemon-reload".to_string(),
            _ => format!("systemctl:{}:{}", action.verb(), unit),
        };
        let mut state = self.mutate(key)?;
        let broken = state.broken_units.contains(unit);
        let entry = state.units.entry(unit.to_string()).or_default();
        match action {
            UnitAction::DaemonReload => {}
            UnitAction::Enable => entry.enabled = true,
            UnitAction::Start | UnitAction::Restart => entry.active = !broken,
            UnitAction::Stop => entry.active = false,
        }
        Ok(())
    }

    async fn firewall_ports(&self) -> Result<Vec<PortSpec>> {
        Ok(self.state().ports.iter().copied().collect())
    }

    async fn open_port(&self, port: &PortSpec) -> Result<()> {
        let mut state = self.mutate(format!("open_port:{}", port))?;
        state.ports.insert(*port);
        Ok(())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let mut state = self.mutate(format!("upload:{}", remote))?;
        let size = std::fs::metadata(local).map(|m| m.len()).unwrap_or(0);
        state
            .files
            .insert(remote.to_string(), format!("<archive {} bytes>", size));
        Ok(())
    }

    async fn extract_archive(&self, archive: &str, dest_dir: &str) -> Result<()> {
        let mut state = self.mutate(format!("extract:{}:{}", archive, dest_dir))?;
        if !state.files.contains_key(archive) {
            return Err(FleetError::command(&self.name, "tar", "archive not found"));
        }
        let file_name = archive.rsplit('/').next().unwrap_or(archive);
        let files = state.archives.get(file_name).cloned().unwrap_or_default();
        state.files.extend(files);
        Ok(())
    }

    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        self.mutate(format!("run:{}", argv.join(" ")))?;
        Ok(CommandOutput::default())
    }
}
