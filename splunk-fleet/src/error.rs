// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for splunk-fleet
//!
//! Failures fall into four operator-facing classes: preconditions checked
//! before anything is mutated, transient network failures, partially applied
//! convergence runs, and fatal authentication failures. The remaining
//! variants wrap configuration and IO problems.

use thiserror::Error;

/// Result type alias for splunk-fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Errors that can occur during fleet operations
#[derive(Error, Debug)]
pub enum FleetError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Invalid configuration format
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Inventory file could not be used
    #[error("Invalid inventory '{path}': {message}")]
    InvalidInventory { path: String, message: String },

    /// Playbook parsing error
    #[error("Failed to parse playbook '{path}': {message}")]
    PlaybookParseError { path: String, message: String },

    /// Playbook not found
    #[error("Playbook not found: {name}")]
    PlaybookNotFound { name: String },

    /// Role variables did not match the role's option schema
    #[error("Invalid variables for role '{role}': {message}")]
    InvalidRoleVars { role: String, message: String },

    /// A requirement was not met; nothing has been changed on the target
    #[error("Precondition failed on {target}: {message}")]
    Precondition { target: String, message: String },

    /// Network timeout or connection failure; may be retried
    #[error("Transient failure on {target} during {operation}: {message}")]
    Transient {
        target: String,
        operation: String,
        message: String,
    },

    /// Convergence stopped midway; steps listed in `applied` remain in place
    #[error("Step '{step}' failed on {target} after {} applied step(s): {message}", applied.len())]
    PartialApplication {
        target: String,
        step: String,
        applied: Vec<String>,
        message: String,
    },

    /// Login to the management API was rejected
    #[error("Authentication failed against {endpoint}: {message}")]
    Authentication { endpoint: String, message: String },

    /// Management API answered with an unexpected status
    #[error("Management API error on {target} ({status}): {message}")]
    Api {
        target: String,
        status: u16,
        message: String,
    },

    /// A cluster bundle push referenced an outdated cluster generation
    #[error("Stale cluster bundle on {target}: expected generation {expected}, manager is at {actual}")]
    StaleBundle {
        target: String,
        expected: u64,
        actual: u64,
    },

    /// A host-level command failed
    #[error("Command '{command}' failed on {target}: {message}")]
    CommandFailed {
        target: String,
        command: String,
        message: String,
    },

    /// Host not present in the inventory
    #[error("Unknown host or group: {name}")]
    UnknownHost { name: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl FleetError {
    /// Whether a retry with backoff may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::Transient { .. })
    }

    /// Whether the failure must abort the whole operations sequence
    pub fn is_fatal(&self) -> bool {
        matches!(self, FleetError::Authentication { .. })
    }

    pub(crate) fn precondition(target: impl Into<String>, message: impl Into<String>) -> Self {
        FleetError::Precondition {
            target: target.into(),
            message: message.into(),
        }
    }

    pub(crate) fn command(
        target: impl Into<String>,
        command: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        FleetError::CommandFailed {
            target: target.into(),
            command: command.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let error = FleetError::Transient {
            target: "splunk01".to_string(),
            operation: "login".to_string(),
            message: "timed out".to_string(),
        };
        assert!(error.is_transient());
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_authentication_is_fatal() {
        let error = FleetError::Authentication {
            endpoint: "https://cm01:8089".to_string(),
            message: "Login failed".to_string(),
        };
        assert!(error.is_fatal());
        assert!(!FleetError::precondition("splunk01", "not root").is_fatal());
    }

    #[test]
    fn test_partial_application_message_names_step() {
        let error = FleetError::PartialApplication {
            target: "splunk01".to_string(),
            step: "firewall:9997/tcp".to_string(),
            applied: vec!["group:splunk".to_string(), "user:splunk".to_string()],
            message: "firewall-cmd not running".to_string(),
        };
        let text = error.to_string();
        assert!(text.contains("firewall:9997/tcp"));
        assert!(text.contains("2 applied step(s)"));
    }
}
