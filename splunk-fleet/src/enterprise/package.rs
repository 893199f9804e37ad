// SPDX-License-Identifier: AGPL-3.0-or-later
//! Installation archives on the controller

use sha2::{Digest, Sha512};
use std::path::PathBuf;
use tracing::debug;

use super::SplunkVersion;
use crate::config::SplunkConfig;
use crate::error::{FleetError, Result};

/// A resolved, verified installation archive
#[derive(Debug, Clone)]
pub struct PackageArtifact {
    pub version: SplunkVersion,
    pub local_path: PathBuf,
    pub file_name: String,
}

/// Finds archives by version in the configured package directory
pub struct PackageResolver {
    package_dir: PathBuf,
    pattern: String,
}

impl PackageResolver {
    pub fn new(config: &SplunkConfig) -> Self {
        Self {
            package_dir: config.package_dir.clone(),
            pattern: config.package_pattern.clone(),
        }
    }

    pub fn file_name(&self, version: &SplunkVersion) -> String {
        self.pattern.replace("{version}", &version.to_string())
    }

    /// Locate the archive for `version` and check it against a `.sha512`
    /// sidecar file when one is present
    pub async fn resolve(&self, version: &SplunkVersion) -> Result<PackageArtifact> {
        let file_name = self.file_name(version);
        let local_path = self.package_dir.join(&file_name);

        if !tokio::fs::try_exists(&local_path).await? {
            return Err(FleetError::precondition(
                "controller",
                format!("package {} not found", local_path.display()),
            ));
        }

        let sidecar = self.package_dir.join(format!("{}.sha512", file_name));
        if tokio::fs::try_exists(&sidecar).await? {
            let expected = tokio::fs::read_to_string(&sidecar).await?;
            let expected = expected
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_lowercase();
            let bytes = tokio::fs::read(&local_path).await?;
            let actual = format!("{:x}", Sha512::digest(&bytes));
            if actual != expected {
                return Err(FleetError::precondition(
                    "controller",
                    format!("checksum mismatch for {}", file_name),
                ));
            }
            debug!(package = %file_name, "Checksum verified");
        }

        Ok(PackageArtifact {
            version: version.clone(),
            local_path,
            file_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(dir: &std::path::Path) -> PackageResolver {
        let config = SplunkConfig {
            package_dir: dir.to_path_buf(),
            ..Default::default()
        };
        PackageResolver::new(&config)
    }

    #[tokio::test]
    async fn test_resolve_with_matching_checksum() {
        let temp_dir = tempfile::tempdir().unwrap();
        let version: SplunkVersion = "9.2.1".parse().unwrap();
        let resolver = resolver(temp_dir.path());
        let name = resolver.file_name(&version);
        assert_eq!(name, "splunk-9.2.1-Linux-x86_64.tgz");

        std::fs::write(temp_dir.path().join(&name), b"archive bytes").unwrap();
        let digest = format!("{:x}", Sha512::digest(b"archive bytes"));
        std::fs::write(
            temp_dir.path().join(format!("{}.sha512", name)),
            format!("{}  {}\n", digest, name),
        )
        .unwrap();

        let artifact = resolver.resolve(&version).await.unwrap();
        assert_eq!(artifact.file_name, name);
    }

    #[tokio::test]
    async fn test_resolve_checksum_mismatch() {
        let temp_dir = tempfile::tempdir().unwrap();
        let version: SplunkVersion = "9.2.1".parse().unwrap();
        let resolver = resolver(temp_dir.path());
        let name = resolver.file_name(&version);
        std::fs::write(temp_dir.path().join(&name), b"archive bytes").unwrap();
        std::fs::write(temp_dir.path().join(format!("{}.sha512", name)), "00ff").unwrap();

        assert!(resolver.resolve(&version).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_missing_package() {
        let temp_dir = tempfile::tempdir().unwrap();
        let version: SplunkVersion = "9.2.1".parse().unwrap();
        let error = resolver(temp_dir.path()).resolve(&version).await.unwrap_err();
        assert!(matches!(error, FleetError::Precondition { .. }));
    }
}
