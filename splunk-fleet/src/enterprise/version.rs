// SPDX-License-Identifier: AGPL-3.0-or-later
//! Splunk version numbers and the installed-version marker

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{FleetError, Result};

/// Dotted Splunk release number such as `9.2.1` or `9.0.0.1`
#[derive(Debug, Clone, Eq)]
pub struct SplunkVersion {
    parts: Vec<u32>,
}

impl SplunkVersion {
    pub fn parts(&self) -> &[u32] {
        &self.parts
    }
}

impl FromStr for SplunkVersion {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let parts = trimmed
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<u32>, _>>()
            .map_err(|_| FleetError::InvalidConfig {
                message: format!("invalid Splunk version '{}'", trimmed),
            })?;

        if parts.len() < 2 || parts.len() > 4 {
            return Err(FleetError::InvalidConfig {
                message: format!("invalid Splunk version '{}'", trimmed),
            });
        }

        Ok(Self { parts })
    }
}

impl Ord for SplunkVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for SplunkVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SplunkVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for SplunkVersion {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.parts.iter().map(u32::to_string).collect();
        write!(formatter, "{}", parts.join("."))
    }
}

/// Contents of `$SPLUNK_HOME/etc/splunk.version`
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMarker {
    pub version: SplunkVersion,
    pub build: Option<String>,
    pub product: Option<String>,
    pub platform: Option<String>,
}

impl VersionMarker {
    pub fn path(splunk_home: &str) -> String {
        format!("{}/etc/splunk.version", splunk_home.trim_end_matches('/'))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut version = None;
        let mut build = None;
        let mut product = None;
        let mut platform = None;

        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                "VERSION" => version = Some(value),
                "BUILD" => build = Some(value),
                "PRODUCT" => product = Some(value),
                "PLATFORM" => platform = Some(value),
                _ => {}
            }
        }

        let version = version.ok_or_else(|| FleetError::InvalidConfig {
            message: "splunk.version has no VERSION line".to_string(),
        })?;

        Ok(Self {
            version: version.parse()?,
            build,
            product,
            platform,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> SplunkVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_ordering() {
        assert!(v("9.2.1") > v("9.1.10"));
        assert!(v("9.0.0.1") > v("9.0.0"));
        assert_eq!(v("9.2"), v("9.2.0"));
        assert!(v("10.0.0") > v("9.4.3"));
    }

    #[test]
    fn test_version_rejects_garbage() {
        assert!("9".parse::<SplunkVersion>().is_err());
        assert!("9.x.1".parse::<SplunkVersion>().is_err());
        assert!("".parse::<SplunkVersion>().is_err());
    }

    #[test]
    fn test_marker_parsing() {
        let marker = VersionMarker::parse(
            "VERSION=9.2.1\nBUILD=78803f08aabb\nPRODUCT=splunk\nPLATFORM=Linux-x86_64\n",
        )
        .unwrap();
        assert_eq!(marker.version, v("9.2.1"));
        assert_eq!(marker.build.as_deref(), Some("78803f08aabb"));
        assert_eq!(marker.platform.as_deref(), Some("Linux-x86_64"));
        assert!(VersionMarker::parse("BUILD=abc\n").is_err());
    }

    #[test]
    fn test_marker_path() {
        assert_eq!(VersionMarker::path("/opt/splunk/"), "/opt/splunk/etc/splunk.version");
    }
}
