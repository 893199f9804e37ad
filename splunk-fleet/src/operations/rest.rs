// SPDX-License-Identifier: AGPL-3.0-or-later
//! reqwest-backed management API client

use async_trait::async_trait;
use reqwest::{IntoUrl, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::api::{
    Account, AccountSpec, BundleStatus, Credentials, ManagementApi, Session, ShcMember, ShcStatus,
};
use crate::config::ApiConfig;
use crate::error::{FleetError, Result};

/// Client for one Splunk management endpoint
pub struct RestApi {
    client: reqwest::Client,
    endpoint: String,
    base: Url,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(rename = "sessionKey")]
    session_key: String,
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    messages: Vec<ErrorMessage>,
}

#[derive(Deserialize)]
struct ErrorMessage {
    #[serde(default)]
    text: String,
}

impl RestApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Self::with_endpoint(config, &config.endpoint)
    }

    /// Client for a different endpoint with the same settings
    pub fn with_endpoint(config: &ApiConfig, endpoint: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| FleetError::InvalidConfig {
                message: format!("cannot build HTTP client: {}", e),
            })?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        let base = Url::parse(&endpoint)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| FleetError::InvalidConfig {
                message: format!("invalid API endpoint '{}'", endpoint),
            })?;

        Ok(Self {
            client,
            endpoint,
            base,
        })
    }

    /// Endpoint URL with each segment percent-encoded onto the base path
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, path: &str, session: Option<&Session>) -> RequestBuilder {
        self.request_to(method, format!("{}{}", self.endpoint, path), session)
    }

    fn request_to(
        &self,
        method: Method,
        url: impl IntoUrl,
        session: Option<&Session>,
    ) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .query(&[("output_mode", "json")]);
        match session {
            Some(session) => builder.header("Authorization", format!("Splunk {}", session.token())),
            None => builder,
        }
    }

    async fn send(&self, operation: &str, builder: RequestBuilder) -> Result<Response> {
        debug!(endpoint = %self.endpoint, operation, "Calling management API");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                FleetError::Transient {
                    target: self.endpoint.clone(),
                    operation: operation.to_string(),
                    message: e.to_string(),
                }
            } else {
                FleetError::Api {
                    target: self.endpoint.clone(),
                    status: 0,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .unwrap_or_default()
            .messages
            .into_iter()
            .map(|m| m.text)
            .collect::<Vec<_>>()
            .join("; ");

        if status == StatusCode::UNAUTHORIZED {
            return Err(FleetError::Authentication {
                endpoint: self.endpoint.clone(),
                message,
            });
        }
        if status == StatusCode::SERVICE_UNAVAILABLE || status == StatusCode::GATEWAY_TIMEOUT {
            return Err(FleetError::Transient {
                target: self.endpoint.clone(),
                operation: operation.to_string(),
                message: format!("{}: {}", status, message),
            });
        }
        Err(FleetError::Api {
            target: self.endpoint.clone(),
            status: status.as_u16(),
            message,
        })
    }

    async fn json(&self, operation: &str, builder: RequestBuilder) -> Result<Value> {
        let response = self.send(operation, builder).await?;
        response.json::<Value>().await.map_err(|e| FleetError::Api {
            target: self.endpoint.clone(),
            status: 0,
            message: format!("{}: invalid response body: {}", operation, e),
        })
    }

    async fn first_entry(&self, operation: &str, builder: RequestBuilder) -> Result<Value> {
        let body = self.json(operation, builder).await?;
        body.pointer("/entry/0/content")
            .cloned()
            .ok_or_else(|| FleetError::Api {
                target: self.endpoint.clone(),
                status: 0,
                message: format!("{}: response has no entries", operation),
            })
    }
}

fn string_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bool_at(value: &Value, pointer: &str) -> Option<bool> {
    match value.pointer(pointer)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(matches!(s.as_str(), "1" | "true")),
        Value::Number(n) => Some(n.as_u64() == Some(1)),
        _ => None,
    }
}

fn account_form(spec: &AccountSpec, include_password: bool) -> Vec<(&'static str, String)> {
    let mut form: Vec<(&'static str, String)> =
        spec.roles.iter().map(|r| ("roles", r.clone())).collect();
    if let Some(email) = &spec.email {
        form.push(("email", email.clone()));
    }
    if let Some(realname) = &spec.realname {
        form.push(("realname", realname.clone()));
    }
    if include_password {
        if let Some(password) = &spec.password {
            form.push(("password", password.clone()));
        }
    }
    form
}

#[async_trait]
impl ManagementApi for RestApi {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn login(&self, credentials: &Credentials) -> Result<Session> {
        let builder = self
            .request(Method::POST, "/services/auth/login", None)
            .form(&[
                ("username", credentials.username()),
                ("password", credentials.password()),
            ]);
        let response = self.send("login", builder).await?;
        let login: LoginResponse = response.json().await.map_err(|e| FleetError::Authentication {
            endpoint: self.endpoint.clone(),
            message: format!("no session key in login response: {}", e),
        })?;
        Ok(Session::new(&self.endpoint, login.session_key))
    }

    async fn logout(&self, session: Session) -> Result<()> {
        let url = self.url(&["services", "authentication", "httpauth-tokens", session.token()]);
        let builder = self.request_to(Method::DELETE, url, Some(&session));
        self.send("logout", builder).await.map(|_| ())
    }

    async fn get_user(&self, session: &Session, name: &str) -> Result<Option<Account>> {
        let url = self.url(&["services", "authentication", "users", name]);
        let builder = self.request_to(Method::GET, url, Some(session));
        let content = match self.first_entry("get user", builder).await {
            Ok(content) => content,
            Err(FleetError::Api { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        let roles = content
            .get("roles")
            .and_then(Value::as_array)
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Some(Account {
            name: name.to_string(),
            roles,
            email: string_at(&content, "/email").filter(|s| !s.is_empty()),
            realname: string_at(&content, "/realname").filter(|s| !s.is_empty()),
        }))
    }

    async fn create_user(&self, session: &Session, spec: &AccountSpec) -> Result<()> {
        let mut form = account_form(spec, true);
        form.push(("name", spec.name.clone()));
        let builder = self
            .request(Method::POST, "/services/authentication/users", Some(session))
            .form(&form);
        self.send("create user", builder).await.map(|_| ())
    }

    async fn update_user(&self, session: &Session, spec: &AccountSpec) -> Result<()> {
        let url = self.url(&["services", "authentication", "users", &spec.name]);
        let form = account_form(spec, spec.update_password);
        let builder = self.request_to(Method::POST, url, Some(session)).form(&form);
        self.send("update user", builder).await.map(|_| ())
    }

    async fn delete_user(&self, session: &Session, name: &str) -> Result<()> {
        let url = self.url(&["services", "authentication", "users", name]);
        let builder = self.request_to(Method::DELETE, url, Some(session));
        self.send("delete user", builder).await.map(|_| ())
    }

    async fn bundle_status(&self, session: &Session) -> Result<BundleStatus> {
        let info = self
            .first_entry(
                "cluster info",
                self.request(Method::GET, "/services/cluster/manager/info", Some(session)),
            )
            .await?;
        let generation = self
            .first_entry(
                "cluster generation",
                self.request(Method::GET, "/services/cluster/manager/generation", Some(session)),
            )
            .await?;

        Ok(BundleStatus {
            generation: string_at(&generation, "/generation_id")
                .and_then(|g| g.parse().ok())
                .unwrap_or_default(),
            active_checksum: string_at(&info, "/active_bundle/checksum").unwrap_or_default(),
            latest_checksum: string_at(&info, "/latest_bundle/checksum").unwrap_or_default(),
            validated_checksum: string_at(&info, "/last_validated_bundle/checksum")
                .filter(|c| !c.is_empty()),
            validated_ok: bool_at(&info, "/last_validated_bundle/is_valid_bundle"),
        })
    }

    async fn validate_bundle(&self, session: &Session) -> Result<()> {
        let builder = self
            .request(
                Method::POST,
                "/services/cluster/manager/control/default/validate_bundle",
                Some(session),
            )
            .form(&[("check-restart", "true")]);
        self.send("validate bundle", builder).await.map(|_| ())
    }

    async fn apply_bundle(&self, session: &Session) -> Result<()> {
        let builder = self.request(
            Method::POST,
            "/services/cluster/manager/control/default/apply",
            Some(session),
        );
        self.send("apply bundle", builder).await.map(|_| ())
    }

    async fn shc_status(&self, session: &Session) -> Result<ShcStatus> {
        let content = self
            .first_entry(
                "shc status",
                self.request(Method::GET, "/services/shcluster/status", Some(session)),
            )
            .await?;

        let mut members: Vec<ShcMember> = content
            .get("peers")
            .and_then(Value::as_object)
            .map(|peers| {
                peers
                    .values()
                    .map(|peer| ShcMember {
                        label: string_at(peer, "/label").unwrap_or_default(),
                        status: string_at(peer, "/status").unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.label.cmp(&b.label));

        Ok(ShcStatus {
            captain: string_at(&content, "/captain/label"),
            members,
        })
    }

    async fn reload_deployment_server(&self, session: &Session) -> Result<()> {
        let builder = self.request(
            Method::POST,
            "/services/deployment/server/config/_reload",
            Some(session),
        );
        self.send("reload deployment server", builder)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn api(server: &MockServer) -> RestApi {
        let config = ApiConfig {
            timeout_secs: 5,
            ..Default::default()
        };
        RestApi::with_endpoint(&config, &server.base_url()).unwrap()
    }

    #[tokio::test]
    async fn test_login_and_logout() {
        let server = MockServer::start_async().await;
        let login = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/services/auth/login")
                    .body_contains("username=admin");
                then.status(200).json_body(json!({ "sessionKey": "abc123" }));
            })
            .await;
        let logout = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/services/authentication/httpauth-tokens/abc123")
                    .header("Authorization", "Splunk abc123");
                then.status(200).json_body(json!({}));
            })
            .await;

        let api = api(&server);
        let session = api
            .login(&Credentials::new("admin", "changeme"))
            .await
            .unwrap();
        assert_eq!(session.token(), "abc123");
        api.logout(session).await.unwrap();

        login.assert_async().await;
        logout.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/services/auth/login");
                then.status(401).json_body(json!({
                    "messages": [{ "type": "WARN", "text": "Login failed" }]
                }));
            })
            .await;

        let error = api(&server)
            .login(&Credentials::new("admin", "wrong"))
            .await
            .unwrap_err();
        match error {
            FleetError::Authentication { message, .. } => assert_eq!(message, "Login failed"),
            other => panic!("Expected Authentication, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_get_user_missing_and_present() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/services/authentication/users/ghost");
                then.status(404).json_body(json!({
                    "messages": [{ "type": "ERROR", "text": "User does not exist" }]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/services/authentication/users/analyst");
                then.status(200).json_body(json!({
                    "entry": [{
                        "name": "analyst",
                        "content": { "roles": ["user", "power"], "email": "a@example.com", "realname": "" }
                    }]
                }));
            })
            .await;

        let api = api(&server);
        let session = Session::new(api.endpoint(), "t");
        assert!(api.get_user(&session, "ghost").await.unwrap().is_none());
        let account = api.get_user(&session, "analyst").await.unwrap().unwrap();
        assert_eq!(account.roles, vec!["user", "power"]);
        assert_eq!(account.email.as_deref(), Some("a@example.com"));
        assert_eq!(account.realname, None);
    }

    #[tokio::test]
    async fn test_user_names_are_encoded_as_one_segment() {
        let server = MockServer::start_async().await;
        let lookup = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/services/authentication/users/jane%20doe");
                then.status(404).json_body(json!({ "messages": [] }));
            })
            .await;
        let remove = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/services/authentication/users/ops%2Fjane");
                then.status(200).json_body(json!({}));
            })
            .await;

        let api = api(&server);
        let session = Session::new(api.endpoint(), "t");
        assert!(api.get_user(&session, "jane doe").await.unwrap().is_none());
        api.delete_user(&session, "ops/jane").await.unwrap();

        lookup.assert_async().await;
        remove.assert_async().await;
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let error = RestApi::with_endpoint(&ApiConfig::default(), "cm01:8089")
            .err()
            .unwrap();
        assert!(matches!(error, FleetError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_bundle_status_parsing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/services/cluster/manager/info");
                then.status(200).json_body(json!({
                    "entry": [{ "content": {
                        "active_bundle": { "checksum": "AAA" },
                        "latest_bundle": { "checksum": "BBB" },
                        "last_validated_bundle": { "checksum": "BBB", "is_valid_bundle": "1" }
                    }}]
                }));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/services/cluster/manager/generation");
                then.status(200).json_body(json!({
                    "entry": [{ "content": { "generation_id": "42" } }]
                }));
            })
            .await;

        let api = api(&server);
        let session = Session::new(api.endpoint(), "t");
        let status = api.bundle_status(&session).await.unwrap();
        assert_eq!(status.generation, 42);
        assert_eq!(status.active_checksum, "AAA");
        assert_eq!(status.validated_checksum.as_deref(), Some("BBB"));
        assert_eq!(status.validated_ok, Some(true));
    }

    #[tokio::test]
    async fn test_shc_status_parsing() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/services/shcluster/status");
                then.status(200).json_body(json!({
                    "entry": [{ "content": {
                        "captain": { "label": "sh1" },
                        "peers": {
                            "B": { "label": "sh2", "status": "Up" },
                            "A": { "label": "sh1", "status": "Up" },
                            "C": { "label": "sh3", "status": "Restarting" }
                        }
                    }}]
                }));
            })
            .await;

        let api = api(&server);
        let session = Session::new(api.endpoint(), "t");
        let status = api.shc_status(&session).await.unwrap();
        assert_eq!(status.captain.as_deref(), Some("sh1"));
        let labels: Vec<&str> = status.members.iter().map(|m| m.label.as_str()).collect();
        assert_eq!(labels, vec!["sh1", "sh2", "sh3"]);
        assert!(!status.members[2].is_up());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let config = ApiConfig {
            timeout_secs: 1,
            ..Default::default()
        };
        let api = RestApi::with_endpoint(&config, "http://127.0.0.1:9").unwrap();
        let error = api
            .login(&Credentials::new("admin", "changeme"))
            .await
            .unwrap_err();
        assert!(error.is_transient());
    }
}
