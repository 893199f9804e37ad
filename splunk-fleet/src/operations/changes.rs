// SPDX-License-Identifier: AGPL-3.0-or-later
//! Follow-up actions implied by changed configuration files

use serde::{Deserialize, Serialize};

/// Sub-trees of `etc` that are distributed rather than read by the local splunkd
const DISTRIBUTED: [&str; 4] = ["deployment-apps", "shcluster", "master-apps", "manager-apps"];

/// One configuration result to classify
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeResult {
    #[serde(default)]
    pub changed: bool,
    #[serde(default)]
    pub path: String,
}

/// Flags carried in from earlier steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFlags {
    #[serde(default)]
    pub rolling_restart_pending: bool,
    #[serde(default)]
    pub splunkd_restart_pending: bool,
    #[serde(default)]
    pub force_splunkd_restart: bool,
    #[serde(default)]
    pub force_bundle_push: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredActions {
    pub splunkd_restart_pending: bool,
    pub deploymentserver_reload: bool,
    pub deployer_push: bool,
    pub cluster_manager_push: bool,
    /// Only set when a rolling restart was already pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splunkd_restart: Option<bool>,
}

impl RequiredActions {
    pub fn any(&self) -> bool {
        self.splunkd_restart_pending
            || self.deploymentserver_reload
            || self.deployer_push
            || self.cluster_manager_push
            || self.splunkd_restart == Some(true)
    }
}

/// Whether `path` lies under some `/etc/` that is not a distributed sub-tree
fn is_local_config(path: &str) -> bool {
    path.match_indices("/etc/").any(|(index, marker)| {
        let rest = &path[index + marker.len()..];
        !DISTRIBUTED.iter().any(|tree| rest.starts_with(tree))
    })
}

/// Classify changed paths into the actions they require
///
/// The first matching rule wins per path: local configuration needs a splunkd
/// restart, then deployment apps, deployer bundles and cluster manager
/// bundles each need their own distribution step.
pub fn analyze_changes(results: &[ChangeResult], flags: PendingFlags) -> RequiredActions {
    let mut actions = RequiredActions {
        splunkd_restart_pending: flags.force_splunkd_restart || flags.splunkd_restart_pending,
        deploymentserver_reload: false,
        deployer_push: flags.force_bundle_push,
        cluster_manager_push: false,
        splunkd_restart: flags.rolling_restart_pending.then_some(true),
    };

    for result in results.iter().filter(|r| r.changed) {
        let path = result.path.as_str();
        if is_local_config(path) {
            actions.splunkd_restart_pending = true;
        } else if path.contains("deployment-apps") {
            actions.deploymentserver_reload = true;
        } else if path.contains("shcluster") {
            actions.deployer_push = true;
        } else if path.contains("master-apps") || path.contains("manager-apps") {
            actions.cluster_manager_push = true;
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(path: &str) -> ChangeResult {
        ChangeResult {
            changed: true,
            path: path.to_string(),
        }
    }

    #[test]
    fn test_local_config_needs_restart() {
        let actions = analyze_changes(
            &[changed("/opt/splunk/etc/system/local/server.conf")],
            PendingFlags::default(),
        );
        assert!(actions.splunkd_restart_pending);
        assert!(!actions.deploymentserver_reload);
        assert_eq!(actions.splunkd_restart, None);
    }

    #[test]
    fn test_distributed_trees() {
        let actions = analyze_changes(
            &[
                changed("/opt/splunk/etc/deployment-apps/outputs/local/outputs.conf"),
                changed("/opt/splunk/etc/shcluster/apps/search/local/props.conf"),
                changed("/opt/splunk/etc/manager-apps/_cluster/local/indexes.conf"),
            ],
            PendingFlags::default(),
        );
        assert_eq!(
            actions,
            RequiredActions {
                splunkd_restart_pending: false,
                deploymentserver_reload: true,
                deployer_push: true,
                cluster_manager_push: true,
                splunkd_restart: None,
            }
        );
    }

    #[test]
    fn test_unchanged_results_ignored() {
        let results = vec![ChangeResult {
            changed: false,
            path: "/opt/splunk/etc/apps/search/local/props.conf".to_string(),
        }];
        assert!(!analyze_changes(&results, PendingFlags::default()).any());
    }

    #[test]
    fn test_nested_etc_still_counts_as_local() {
        // the second /etc/ is not followed by a distributed tree
        assert!(is_local_config("/opt/splunk/etc/deployment-apps/x/etc/y.conf"));
        assert!(!is_local_config("/opt/splunk/etc/master-apps/x/local/y.conf"));
        assert!(!is_local_config("relative/server.conf"));
    }

    #[test]
    fn test_flags_seed_result() {
        let actions = analyze_changes(
            &[],
            PendingFlags {
                rolling_restart_pending: true,
                force_splunkd_restart: true,
                force_bundle_push: true,
                ..Default::default()
            },
        );
        assert!(actions.splunkd_restart_pending);
        assert!(actions.deployer_push);
        assert_eq!(actions.splunkd_restart, Some(true));

        let json = serde_json::to_value(&analyze_changes(&[], PendingFlags::default())).unwrap();
        assert!(json.get("splunkd_restart").is_none());
    }
}
