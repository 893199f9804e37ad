// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration management for splunk-fleet
//!
//! One `Config` value carries every collection-wide option (install layout,
//! version requirements, API access, rolling policy) and is passed explicitly
//! into each unit.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::enterprise::SplunkVersion;
use crate::error::{FleetError, Result};
use crate::operations::{Credentials, RetryPolicy};
use crate::rolling::BatchPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Fleet name, used in log output
    pub name: String,

    /// Version of the configuration format
    #[serde(default = "default_version")]
    pub version: String,

    /// Inventory file path
    #[serde(default = "default_inventory")]
    pub inventory: PathBuf,

    /// Playbook directory path
    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: PathBuf,

    /// Number of hosts converged concurrently by host-parallel units
    #[serde(default = "default_forks")]
    pub forks: usize,

    /// Splunk installation layout
    #[serde(default)]
    pub splunk: SplunkConfig,

    /// Management API access
    #[serde(default)]
    pub api: ApiConfig,

    /// Rolling upgrade and restart policy
    #[serde(default)]
    pub rolling: BatchPolicy,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where and how Splunk Enterprise is installed on managed hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplunkConfig {
    /// Installation directory (SPLUNK_HOME)
    #[serde(default = "default_splunk_home")]
    pub home: String,

    /// Service account owning the installation
    #[serde(default = "default_splunk_user")]
    pub user: String,

    /// Primary group of the service account
    #[serde(default = "default_splunk_user")]
    pub group: String,

    /// systemd unit name of splunkd
    #[serde(default = "default_service")]
    pub service: String,

    /// Local directory holding installation archives
    #[serde(default = "default_package_dir")]
    pub package_dir: PathBuf,

    /// Archive file name pattern; `{version}` is substituted
    #[serde(default = "default_package_pattern")]
    pub package_pattern: String,

    /// Directory on the target where archives are staged before unpacking
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    /// Lowest version this fleet may run
    #[serde(default)]
    pub minimum_version: Option<String>,
}

/// Management API connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the management port, e.g. https://cm01:8089
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Admin user name
    #[serde(default = "default_admin")]
    pub username: String,

    /// Password in clear text (prefer `password_env`)
    #[serde(default, skip_serializing)]
    pub password: Option<String>,

    /// Environment variable holding the password
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Verify the management port certificate
    #[serde(default)]
    pub verify_tls: bool,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Stop the sequence on the first per-target failure
    #[serde(default)]
    pub abort_on_error: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for SplunkConfig {
    fn default() -> Self {
        Self {
            home: default_splunk_home(),
            user: default_splunk_user(),
            group: default_splunk_user(),
            service: default_service(),
            package_dir: default_package_dir(),
            package_pattern: default_package_pattern(),
            staging_dir: default_staging_dir(),
            minimum_version: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            username: default_admin(),
            password: None,
            password_env: default_password_env(),
            timeout_secs: default_api_timeout(),
            verify_tls: false,
            retry: RetryPolicy::default(),
            abort_on_error: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "splunk-fleet".to_string(),
            version: default_version(),
            inventory: default_inventory(),
            playbook_dir: default_playbook_dir(),
            forks: default_forks(),
            splunk: SplunkConfig::default(),
            api: ApiConfig::default(),
            rolling: BatchPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The parsed configuration or an error
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(FleetError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(FleetError::InvalidConfig {
                message: "Fleet name cannot be empty".to_string(),
            });
        }

        if self.forks == 0 {
            return Err(FleetError::InvalidConfig {
                message: "forks must be at least 1".to_string(),
            });
        }

        if !self.splunk.home.starts_with('/') {
            return Err(FleetError::InvalidConfig {
                message: format!("splunk.home must be absolute, got '{}'", self.splunk.home),
            });
        }

        if !self.splunk.package_pattern.contains("{version}") {
            return Err(FleetError::InvalidConfig {
                message: "splunk.package_pattern must contain '{version}'".to_string(),
            });
        }

        if let Some(minimum) = &self.splunk.minimum_version {
            minimum.parse::<SplunkVersion>()?;
        }

        if !self.api.endpoint.starts_with("http://") && !self.api.endpoint.starts_with("https://")
        {
            return Err(FleetError::InvalidConfig {
                message: format!("api.endpoint must be an http(s) URL, got '{}'", self.api.endpoint),
            });
        }

        Ok(())
    }

    /// Parsed minimum version, if one is configured
    pub fn minimum_version(&self) -> Result<Option<SplunkVersion>> {
        self.splunk
            .minimum_version
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    /// Resolve API credentials from the file or the configured environment variable
    pub fn credentials(&self) -> Result<Credentials> {
        let password = match &self.api.password {
            Some(password) => password.clone(),
            None => std::env::var(&self.api.password_env).map_err(|_| {
                FleetError::InvalidConfig {
                    message: format!(
                        "No API password configured; set {} or api.password",
                        self.api.password_env
                    ),
                }
            })?,
        };

        Ok(Credentials::new(self.api.username.clone(), password))
    }
}

// Default value functions

fn default_version() -> String {
    "1.0".to_string()
}

fn default_inventory() -> PathBuf {
    PathBuf::from("inventory.toml")
}

fn default_playbook_dir() -> PathBuf {
    PathBuf::from("playbooks")
}

fn default_forks() -> usize {
    5
}

fn default_splunk_home() -> String {
    "/opt/splunk".to_string()
}

fn default_splunk_user() -> String {
    "splunk".to_string()
}

fn default_service() -> String {
    "Splunkd".to_string()
}

fn default_package_dir() -> PathBuf {
    PathBuf::from("packages")
}

fn default_package_pattern() -> String {
    "splunk-{version}-Linux-x86_64.tgz".to_string()
}

fn default_staging_dir() -> String {
    "/tmp".to_string()
}

fn default_endpoint() -> String {
    "https://127.0.0.1:8089".to_string()
}

fn default_admin() -> String {
    "admin".to_string()
}

fn default_password_env() -> String {
    "SPLUNK_PASSWORD".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}
