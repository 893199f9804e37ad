// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory management API for unit tests

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::api::{
    Account, AccountSpec, BundleStatus, Credentials, ManagementApi, Session, ShcStatus,
};
use crate::error::{FleetError, Result};

#[derive(Default)]
pub struct FakeState {
    pub password: String,
    pub users: BTreeMap<String, Account>,
    pub passwords_set: Vec<String>,
    pub bundle: BundleStatus,
    /// Checksum and validity the next validation produces
    pub staged: Option<(String, bool)>,
    /// Whether apply moves the active checksum
    pub apply_takes_effect: bool,
    pub shc: ShcStatus,
    pub calls: Vec<String>,
    pub issued: Vec<u64>,
    pub open: BTreeSet<u64>,
    pub failing: BTreeSet<String>,
    /// Calls that time out this many times before answering
    pub timeouts: BTreeMap<String, u32>,
    /// Applies that take effect but whose reply is lost
    pub lost_apply_replies: u32,
}

pub struct FakeApi {
    endpoint: String,
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new(password: &str) -> Self {
        Self {
            endpoint: "https://cm01:8089".to_string(),
            state: Mutex::new(FakeState {
                password: password.to_string(),
                apply_takes_effect: true,
                ..Default::default()
            }),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn call(&self, session: &Session, name: &str) -> Result<MutexGuard<'_, FakeState>> {
        let mut state = self.state();
        if !state.open.contains(&session.id()) {
            return Err(FleetError::Authentication {
                endpoint: self.endpoint.clone(),
                message: "session not valid".to_string(),
            });
        }
        state.calls.push(name.to_string());
        if let Some(remaining) = state.timeouts.get_mut(name).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(self.timeout(name));
        }
        if state.failing.contains(name) {
            return Err(FleetError::Api {
                target: self.endpoint.clone(),
                status: 500,
                message: format!("{} failed", name),
            });
        }
        Ok(state)
    }

    fn timeout(&self, name: &str) -> FleetError {
        FleetError::Transient {
            target: self.endpoint.clone(),
            operation: name.to_string(),
            message: "timed out".to_string(),
        }
    }
}

#[async_trait]
impl ManagementApi for FakeApi {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session> {
        let mut state = self.state();
        state.calls.push("login".to_string());
        if credentials.password() != state.password {
            return Err(FleetError::Authentication {
                endpoint: self.endpoint.clone(),
                message: "Login failed".to_string(),
            });
        }
        let session = Session::new(&self.endpoint, format!("token-{}", state.issued.len()));
        state.issued.push(session.id());
        state.open.insert(session.id());
        Ok(session)
    }

    async fn logout(&self, session: Session) -> Result<()> {
        let mut state = self.call(&session, "logout")?;
        state.open.remove(&session.id());
        Ok(())
    }

    async fn get_user(&self, session: &Session, name: &str) -> Result<Option<Account>> {
        let state = self.call(session, "get_user")?;
        Ok(state.users.get(name).cloned())
    }

    async fn create_user(&self, session: &Session, spec: &AccountSpec) -> Result<()> {
        let mut state = self.call(session, &format!("create_user:{}", spec.name))?;
        if spec.password.is_some() {
            state.passwords_set.push(spec.name.clone());
        }
        state.users.insert(
            spec.name.clone(),
            Account {
                name: spec.name.clone(),
                roles: spec.roles.clone(),
                email: spec.email.clone(),
                realname: spec.realname.clone(),
            },
        );
        Ok(())
    }

    async fn update_user(&self, session: &Session, spec: &AccountSpec) -> Result<()> {
        let mut state = self.call(session, &format!("update_user:{}", spec.name))?;
        if spec.update_password && spec.password.is_some() {
            state.passwords_set.push(spec.name.clone());
        }
        let account = state.users.entry(spec.name.clone()).or_default();
        account.name = spec.name.clone();
        account.roles = spec.roles.clone();
        if spec.email.is_some() {
            account.email = spec.email.clone();
        }
        if spec.realname.is_some() {
            account.realname = spec.realname.clone();
        }
        Ok(())
    }

    async fn delete_user(&self, session: &Session, name: &str) -> Result<()> {
        let mut state = self.call(session, &format!("delete_user:{}", name))?;
        state.users.remove(name);
        Ok(())
    }

    async fn bundle_status(&self, session: &Session) -> Result<BundleStatus> {
        let state = self.call(session, "bundle_status")?;
        Ok(state.bundle.clone())
    }

    async fn validate_bundle(&self, session: &Session) -> Result<()> {
        let mut state = self.call(session, "validate_bundle")?;
        if let Some((checksum, valid)) = state.staged.clone() {
            state.bundle.latest_checksum = checksum.clone();
            state.bundle.validated_checksum = Some(checksum);
            state.bundle.validated_ok = Some(valid);
        }
        Ok(())
    }

    async fn apply_bundle(&self, session: &Session) -> Result<()> {
        let mut state = self.call(session, "apply_bundle")?;
        if state.apply_takes_effect {
            if let Some(checksum) = state.bundle.validated_checksum.clone() {
                state.bundle.active_checksum = checksum;
                state.bundle.generation += 1;
            }
        }
        if state.lost_apply_replies > 0 {
            state.lost_apply_replies -= 1;
            return Err(self.timeout("apply_bundle"));
        }
        Ok(())
    }

    async fn shc_status(&self, session: &Session) -> Result<ShcStatus> {
        let state = self.call(session, "shc_status")?;
        Ok(state.shc.clone())
    }

    async fn reload_deployment_server(&self, session: &Session) -> Result<()> {
        self.call(session, "reload_deployment_server")?;
        Ok(())
    }
}
