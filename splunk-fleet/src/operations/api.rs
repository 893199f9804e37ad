// SPDX-License-Identifier: AGPL-3.0-or-later
//! Management API contract
//!
//! The Splunk management port is the only network peer. [`ManagementApi`]
//! is the seam between the operations and the HTTP client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Admin credentials for the management API
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// An authenticated session
///
/// Not `Clone`: a session belongs to exactly one operations sequence and is
/// consumed by [`ManagementApi::logout`].
pub struct Session {
    id: u64,
    endpoint: String,
    token: String,
}

impl Session {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    /// Process-unique identifier, for logs
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Whether an object should exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Present,
    Absent,
}

/// Desired Splunk application user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountSpec {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    #[serde(default)]
    pub state: Presence,
    /// Reset the password on existing users too
    #[serde(default)]
    pub update_password: bool,
}

/// Splunk application user as reported by the API
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Account {
    pub name: String,
    pub roles: Vec<String>,
    pub email: Option<String>,
    pub realname: Option<String>,
}

/// Cluster manager bundle state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleStatus {
    pub generation: u64,
    pub active_checksum: String,
    pub latest_checksum: String,
    pub validated_checksum: Option<String>,
    pub validated_ok: Option<bool>,
}

/// One search-head cluster member
#[derive(Debug, Clone, PartialEq)]
pub struct ShcMember {
    pub label: String,
    pub status: String,
}

impl ShcMember {
    pub fn is_up(&self) -> bool {
        self.status.eq_ignore_ascii_case("up")
    }
}

/// Search-head cluster overview
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShcStatus {
    pub captain: Option<String>,
    pub members: Vec<ShcMember>,
}

#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Endpoint this client talks to
    fn endpoint(&self) -> &str;

    async fn login(&self, credentials: &Credentials) -> Result<Session>;

    /// Invalidate the session token on the server
    async fn logout(&self, session: Session) -> Result<()>;

    async fn get_user(&self, session: &Session, name: &str) -> Result<Option<Account>>;

    async fn create_user(&self, session: &Session, spec: &AccountSpec) -> Result<()>;

    async fn update_user(&self, session: &Session, spec: &AccountSpec) -> Result<()>;

    async fn delete_user(&self, session: &Session, name: &str) -> Result<()>;

    async fn bundle_status(&self, session: &Session) -> Result<BundleStatus>;

    async fn validate_bundle(&self, session: &Session) -> Result<()>;

    async fn apply_bundle(&self, session: &Session) -> Result<()>;

    async fn shc_status(&self, session: &Session) -> Result<ShcStatus>;

    async fn reload_deployment_server(&self, session: &Session) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_are_distinct() {
        let a = Session::new("https://cm01:8089", "token");
        let b = Session::new("https://cm01:8089", "token");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let credentials = Credentials::new("admin", "hunter2");
        assert!(!format!("{:?}", credentials).contains("hunter2"));
        let session = Session::new("https://cm01:8089", "secret-token");
        assert!(!format!("{:?}", session).contains("secret-token"));
    }

    #[test]
    fn test_account_spec_defaults() {
        let spec: AccountSpec = toml::from_str("name = \"analyst\"\nroles = [\"user\"]").unwrap();
        assert_eq!(spec.state, Presence::Present);
        assert!(!spec.update_password);
    }
}
