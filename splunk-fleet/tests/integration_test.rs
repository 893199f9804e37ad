// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for splunk-fleet

use assert_cmd::prelude::*;
use httpmock::prelude::*;
use predicates::prelude::*;
use serde_json::json;
use std::path::Path;
use std::process::Command;
use tempfile::tempdir;

fn fleet() -> Command {
    let mut cmd = Command::cargo_bin("splunk-fleet").unwrap();
    cmd.env_remove("SPLUNK_PASSWORD").env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let config_path = dir.join("splunk-fleet.toml");
    let config_content = format!(
        r#"name = "test"
playbook_dir = "{}"
inventory = "{}"
{}
"#,
        dir.join("playbooks").display(),
        dir.join("inventory.toml").display(),
        extra
    );
    std::fs::write(&config_path, config_content).unwrap();
    config_path
}

/// Test the version command
#[test]
fn test_version_command() {
    fleet()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("splunk-fleet v"))
        .stdout(predicate::str::contains("Splunk Enterprise lifecycle"));
}

/// Test the help output
#[test]
fn test_help_command() {
    fleet()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("prepare"))
        .stdout(predicate::str::contains("upgrade"))
        .stdout(predicate::str::contains("analyze"))
        .stdout(predicate::str::contains("run"));
}

/// Test listing playbooks in empty directory
#[test]
fn test_list_empty() {
    let temp_dir = tempdir().unwrap();
    let config_path = write_config(temp_dir.path(), "");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No playbooks found"));
}

/// Test listing playbooks with files
#[test]
fn test_list_with_playbooks() {
    let temp_dir = tempdir().unwrap();
    let playbook_dir = temp_dir.path().join("playbooks");
    std::fs::create_dir_all(&playbook_dir).unwrap();
    std::fs::write(playbook_dir.join("site.toml"), "name = \"site\"").unwrap();
    std::fs::write(playbook_dir.join("site.yml"), "").unwrap();
    let config_path = write_config(temp_dir.path(), "");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("- site"))
        .stdout(predicate::str::contains("site.yml").not());
}

/// Test validating a playbook
#[test]
fn test_validate_playbook() {
    let temp_dir = tempdir().unwrap();
    let playbook_path = temp_dir.path().join("site.toml");

    std::fs::write(
        &playbook_path,
        r#"
name = "site"
description = "Full build of the indexer tier"

[[plays]]
name = "indexers"
hosts = "indexers"

[[plays.roles]]
role = "linux"

[[plays.roles]]
role = "enterprise"
vars = { version = "9.1.2", seed_admin = true }

[[plays.roles]]
role = "core"
tasks_from = "service"
vars = { action = "restart" }
"#,
    )
    .unwrap();

    fleet()
        .arg("validate")
        .arg(&playbook_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("'site' is valid"))
        .stdout(predicate::str::contains("linux/converge, enterprise/install, core/service"));
}

/// Roles out of dependency order are rejected
#[test]
fn test_validate_rejects_role_order() {
    let temp_dir = tempdir().unwrap();
    let playbook_path = temp_dir.path().join("backwards.toml");

    std::fs::write(
        &playbook_path,
        r#"
name = "backwards"

[[plays]]
hosts = "all"

[[plays.roles]]
role = "enterprise"
vars = { version = "9.1.2" }

[[plays.roles]]
role = "linux"
"#,
    )
    .unwrap();

    fleet()
        .arg("validate")
        .arg(&playbook_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("depends on it"));
}

/// Core invocations need a task
#[test]
fn test_validate_rejects_core_without_task() {
    let temp_dir = tempdir().unwrap();
    let playbook_path = temp_dir.path().join("core.toml");

    std::fs::write(
        &playbook_path,
        r#"
name = "core"

[[plays]]
hosts = "all"

[[plays.roles]]
role = "core"
"#,
    )
    .unwrap();

    fleet()
        .arg("validate")
        .arg(&playbook_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("tasks_from is required"));
}

/// Test init command creates config file
#[test]
fn test_init_creates_config() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("splunk-fleet.toml");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created configuration file"));

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(content.contains("SPDX-License-Identifier"));
    assert!(content.contains("[api]"));
    assert!(content.contains("password_env = \"SPLUNK_PASSWORD\""));

    // the generated file loads as-is
    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Splunkd"));
}

/// Test init refuses to overwrite and --force does
#[test]
fn test_init_force() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("splunk-fleet.toml");
    std::fs::write(&config_path, "old content").unwrap();

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("init")
        .arg("--force")
        .assert()
        .success();

    let content = std::fs::read_to_string(&config_path).unwrap();
    assert!(!content.contains("old content"));
    assert!(content.contains("name = \"splunk-fleet\""));
}

/// Test config command shows defaults when no file exists
#[test]
fn test_config_defaults() {
    let temp_dir = tempdir().unwrap();
    let config_path = temp_dir.path().join("nonexistent.toml");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Using defaults"))
        .stdout(predicate::str::contains("/opt/splunk"));
}

/// Inline passwords never appear in the printed configuration
#[test]
fn test_config_hides_password() {
    let temp_dir = tempdir().unwrap();
    let config_path = write_config(temp_dir.path(), "[api]\npassword = \"hunter2\"");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("hunter2").not());
}

fn write_inventory(dir: &Path) {
    std::fs::write(
        dir.join("inventory.toml"),
        r#"
[[hosts]]
name = "splunk01"
address = "10.0.0.11"
groups = ["indexers"]

[[hosts]]
name = "splunk02"
groups = ["indexers"]

[[hosts]]
name = "sh01"
groups = ["search_heads"]
connection = { type = "ssh", user = "ops" }
"#,
    )
    .unwrap();
}

/// Test inventory listing by group
#[test]
fn test_inventory_group() {
    let temp_dir = tempdir().unwrap();
    write_inventory(temp_dir.path());
    let config_path = write_config(temp_dir.path(), "");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("inventory")
        .arg("indexers")
        .assert()
        .success()
        .stdout(predicate::str::contains("splunk01 (10.0.0.11)"))
        .stdout(predicate::str::contains("splunk02 (splunk02)"))
        .stdout(predicate::str::contains("sh01 (").not())
        .stdout(predicate::str::contains("Groups: indexers, search_heads"));
}

#[test]
fn test_inventory_unknown_group() {
    let temp_dir = tempdir().unwrap();
    write_inventory(temp_dir.path());
    let config_path = write_config(temp_dir.path(), "");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("inventory")
        .arg("forwarders")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown host or group: forwarders"));
}

/// Test change analysis over a results file
#[test]
fn test_analyze_changes() {
    let temp_dir = tempdir().unwrap();
    let results_path = temp_dir.path().join("results.json");
    std::fs::write(
        &results_path,
        json!([
            { "changed": true, "path": "/opt/splunk/etc/system/local/server.conf" },
            { "changed": true, "path": "/opt/splunk/etc/deployment-apps/outputs/local/outputs.conf" },
            { "changed": false, "path": "/opt/splunk/etc/shcluster/apps/search/local/props.conf" }
        ])
        .to_string(),
    )
    .unwrap();

    let output = fleet().arg("analyze").arg(&results_path).output().unwrap();
    assert!(output.status.success());
    let actions: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(
        actions,
        json!({
            "splunkd_restart_pending": true,
            "deploymentserver_reload": true,
            "deployer_push": false,
            "cluster_manager_push": false
        })
    );
}

#[test]
fn test_analyze_pending_rolling_restart() {
    let temp_dir = tempdir().unwrap();
    let results_path = temp_dir.path().join("results.json");
    std::fs::write(&results_path, "[]").unwrap();

    fleet()
        .arg("analyze")
        .arg(&results_path)
        .arg("--rolling-restart-pending")
        .arg("--force-bundle-push")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"splunkd_restart\": true"))
        .stdout(predicate::str::contains("\"deployer_push\": true"));
}

/// Test running a missing playbook
#[test]
fn test_run_missing_playbook() {
    let temp_dir = tempdir().unwrap();
    let config_path = write_config(temp_dir.path(), "");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .arg("nonexistent")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Playbook 'nonexistent' not found"));
}

/// Dry-run API commands never contact the endpoint
#[test]
fn test_bundle_dry_run() {
    let temp_dir = tempdir().unwrap();
    let config_path = write_config(temp_dir.path(), "");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("--dry-run")
        .arg("bundle")
        .arg("--generation")
        .arg("7")
        .assert()
        .success()
        .stdout(predicate::str::contains("[DRY RUN] Would run: bundle"))
        .stdout(predicate::str::contains("completed successfully"));
}

/// Without a password the core role fails and the exit status says so
#[test]
fn test_reload_without_password_fails() {
    let temp_dir = tempdir().unwrap();
    let config_path = write_config(temp_dir.path(), "");

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("reload")
        .assert()
        .failure()
        .stdout(predicate::str::contains("No API password configured"))
        .stdout(predicate::str::contains("completed with errors"));
}

/// Users are created over the management API in one logged-in session
#[test]
fn test_users_against_management_api() {
    let server = MockServer::start();
    let login = server.mock(|when, then| {
        when.method(POST).path("/services/auth/login");
        then.status(200).json_body(json!({ "sessionKey": "tok" }));
    });
    let lookup = server.mock(|when, then| {
        when.method(GET).path("/services/authentication/users/analyst");
        then.status(404).json_body(json!({
            "messages": [{ "type": "ERROR", "text": "User does not exist" }]
        }));
    });
    let create = server.mock(|when, then| {
        when.method(POST)
            .path("/services/authentication/users")
            .header("Authorization", "Splunk tok")
            .body_contains("name=analyst");
        then.status(201).json_body(json!({}));
    });
    let logout = server.mock(|when, then| {
        when.method(DELETE)
            .path("/services/authentication/httpauth-tokens/tok");
        then.status(200).json_body(json!({}));
    });

    let temp_dir = tempdir().unwrap();
    let config_path = write_config(
        temp_dir.path(),
        &format!(
            "[api]\nendpoint = \"{}\"\npassword = \"changeme\"",
            server.base_url()
        ),
    );
    let users_path = temp_dir.path().join("users.toml");
    std::fs::write(
        &users_path,
        r#"
[[users]]
name = "analyst"
password = "s3cret!"
roles = ["user"]
"#,
    )
    .unwrap();

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("users")
        .arg(&users_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("[changed] users core/users user:analyst: created"));

    login.assert();
    lookup.assert();
    create.assert();
    logout.assert();
}

/// The login command opens one session and closes it again
#[test]
fn test_login_against_management_api() {
    let server = MockServer::start();
    let login = server.mock(|when, then| {
        when.method(POST).path("/services/auth/login");
        then.status(200).json_body(json!({ "sessionKey": "tok" }));
    });
    let logout = server.mock(|when, then| {
        when.method(DELETE)
            .path("/services/authentication/httpauth-tokens/tok");
        then.status(200).json_body(json!({}));
    });

    let temp_dir = tempdir().unwrap();
    let config_path = write_config(
        temp_dir.path(),
        &format!(
            "[api]\nendpoint = \"{}\"\npassword = \"changeme\"",
            server.base_url()
        ),
    );

    fleet()
        .arg("--config")
        .arg(&config_path)
        .arg("login")
        .assert()
        .success()
        .stdout(predicate::str::contains("[ok] login core/login login: session verified"));

    login.assert_hits(1);
    logout.assert_hits(1);
}
