// SPDX-License-Identifier: AGPL-3.0-or-later
//! Splunk application users

use serde::Serialize;
use std::fmt;
use tracing::{debug, info};

use super::api::{Account, AccountSpec, ManagementApi, Presence, Session};
use crate::error::{FleetError, Result};

/// What `ensure_user` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UserChange {
    Unchanged,
    Created,
    Updated,
    Deleted,
}

impl UserChange {
    pub fn changed(self) -> bool {
        self != UserChange::Unchanged
    }
}

impl fmt::Display for UserChange {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UserChange::Unchanged => "unchanged",
            UserChange::Created => "created",
            UserChange::Updated => "updated",
            UserChange::Deleted => "deleted",
        };
        write!(formatter, "{}", text)
    }
}

fn needs_update(spec: &AccountSpec, current: &Account) -> bool {
    let mut wanted = spec.roles.clone();
    wanted.sort();
    let mut actual = current.roles.clone();
    actual.sort();

    wanted != actual
        || (spec.email.is_some() && spec.email != current.email)
        || (spec.realname.is_some() && spec.realname != current.realname)
        || (spec.update_password && spec.password.is_some())
}

/// Bring one user to the desired state
pub async fn ensure_user(
    api: &dyn ManagementApi,
    session: &Session,
    spec: &AccountSpec,
) -> Result<UserChange> {
    let current = api.get_user(session, &spec.name).await?;

    match (spec.state, current) {
        (Presence::Absent, None) => Ok(UserChange::Unchanged),
        (Presence::Absent, Some(_)) => {
            api.delete_user(session, &spec.name).await?;
            info!(user = %spec.name, "User deleted");
            Ok(UserChange::Deleted)
        }
        (Presence::Present, None) => {
            if spec.password.is_none() {
                return Err(FleetError::precondition(
                    api.endpoint(),
                    format!("user '{}' does not exist and no password was given", spec.name),
                ));
            }
            api.create_user(session, spec).await?;
            info!(user = %spec.name, "User created");
            Ok(UserChange::Created)
        }
        (Presence::Present, Some(current)) if needs_update(spec, &current) => {
            api.update_user(session, spec).await?;
            info!(user = %spec.name, "User updated");
            Ok(UserChange::Updated)
        }
        (Presence::Present, Some(_)) => {
            debug!(user = %spec.name, "User already matches");
            Ok(UserChange::Unchanged)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::fake::FakeApi;
    use crate::operations::Credentials;

    fn spec(name: &str, roles: &[&str]) -> AccountSpec {
        AccountSpec {
            name: name.to_string(),
            password: Some("s3cret!".to_string()),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            email: None,
            realname: None,
            state: Presence::Present,
            update_password: false,
        }
    }

    #[tokio::test]
    async fn test_create_then_unchanged() {
        let api = FakeApi::new("changeme");
        let session = api.login(&Credentials::new("admin", "changeme")).await.unwrap();
        let analyst = spec("analyst", &["user", "power"]);

        assert_eq!(
            ensure_user(&api, &session, &analyst).await.unwrap(),
            UserChange::Created
        );
        let mut reordered = analyst.clone();
        reordered.roles.reverse();
        assert_eq!(
            ensure_user(&api, &session, &reordered).await.unwrap(),
            UserChange::Unchanged
        );
        assert_eq!(api.state().passwords_set, vec!["analyst"]);
    }

    #[tokio::test]
    async fn test_password_only_set_when_requested() {
        let api = FakeApi::new("changeme");
        let session = api.login(&Credentials::new("admin", "changeme")).await.unwrap();
        let mut analyst = spec("analyst", &["user"]);
        ensure_user(&api, &session, &analyst).await.unwrap();

        analyst.roles.push("power".to_string());
        assert_eq!(
            ensure_user(&api, &session, &analyst).await.unwrap(),
            UserChange::Updated
        );
        assert_eq!(api.state().passwords_set.len(), 1);

        analyst.update_password = true;
        assert_eq!(
            ensure_user(&api, &session, &analyst).await.unwrap(),
            UserChange::Updated
        );
        assert_eq!(api.state().passwords_set.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_absent_user() {
        let api = FakeApi::new("changeme");
        let session = api.login(&Credentials::new("admin", "changeme")).await.unwrap();
        let mut analyst = spec("analyst", &["user"]);
        ensure_user(&api, &session, &analyst).await.unwrap();

        analyst.state = Presence::Absent;
        assert_eq!(
            ensure_user(&api, &session, &analyst).await.unwrap(),
            UserChange::Deleted
        );
        assert_eq!(
            ensure_user(&api, &session, &analyst).await.unwrap(),
            UserChange::Unchanged
        );
    }

    #[tokio::test]
    async fn test_create_requires_password() {
        let api = FakeApi::new("changeme");
        let session = api.login(&Credentials::new("admin", "changeme")).await.unwrap();
        let mut analyst = spec("analyst", &["user"]);
        analyst.password = None;
        let error = ensure_user(&api, &session, &analyst).await.unwrap_err();
        assert!(matches!(error, FleetError::Precondition { .. }));
    }
}
