// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command-backed host
//!
//! Drives a machine through standard tools (getent, useradd, systemctl,
//! firewall-cmd/ufw, tar), either locally or over ssh.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::{
    CommandOutput, GroupInfo, GroupSpec, HostFacts, HostSystem, OsFamily, PortSpec, UnitAction,
    UnitState, UserInfo, UserSpec,
};
use crate::error::{FleetError, Result};
use crate::inventory::{Connection, HostEntry};

const COMMAND_TIMEOUT_SECS: u64 = 300;

/// A host reached by running commands locally or through ssh
pub struct CommandHost {
    entry: HostEntry,
    facts: OnceCell<HostFacts>,
}

impl CommandHost {
    pub fn new(entry: HostEntry) -> Self {
        Self {
            entry,
            facts: OnceCell::new(),
        }
    }

    /// Build the process for `argv`, wrapping it in sudo and ssh as configured
    fn build(&self, argv: &[String], privileged: bool) -> Command {
        let mut full: Vec<String> = Vec::with_capacity(argv.len() + 2);
        if privileged && self.entry.become_root {
            full.push("sudo".to_string());
            full.push("-n".to_string());
        }
        full.extend(argv.iter().cloned());

        match &self.entry.connection {
            Connection::Local => {
                let mut command = Command::new(&full[0]);
                command.args(&full[1..]);
                command
            }
            Connection::Ssh {
                user,
                port,
                identity_file,
            } => {
                let mut command = Command::new("ssh");
                command.arg("-p").arg(port.to_string());
                if let Some(key) = identity_file {
                    command.arg("-i").arg(key);
                }
                command
                    .arg("-o")
                    .arg("BatchMode=yes")
                    .arg(format!("{}@{}", user, self.entry.address()))
                    .arg("--")
                    .arg(
                        full.iter()
                            .map(|a| shell_quote(a))
                            .collect::<Vec<_>>()
                            .join(" "),
                    );
                command
            }
        }
    }

    async fn exec(
        &self,
        argv: &[String],
        input: Option<&[u8]>,
        privileged: bool,
    ) -> Result<CommandOutput> {
        let rendered = argv.join(" ");
        trace!(host = %self.entry.name, command = %rendered, "Running command");

        let mut command = self.build(argv, privileged);
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| FleetError::command(&self.entry.name, &rendered, e.to_string()))?;

        if let Some(bytes) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes).await?;
                stdin.shutdown().await?;
            }
        }

        let duration = Duration::from_secs(COMMAND_TIMEOUT_SECS);
        match timeout(duration, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(FleetError::command(&self.entry.name, &rendered, e.to_string())),
            Err(_) => Err(FleetError::Transient {
                target: self.entry.name.clone(),
                operation: rendered,
                message: format!("timed out after {} seconds", COMMAND_TIMEOUT_SECS),
            }),
        }
    }

    /// Run a privileged command and fail on a non-zero exit status
    async fn checked(&self, argv: &[String]) -> Result<CommandOutput> {
        let output = self.exec(argv, None, true).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(FleetError::command(
                &self.entry.name,
                argv.join(" "),
                format!("exit status {}: {}", output.status, output.stderr.trim()),
            ))
        }
    }

    async fn is_privileged(&self) -> Result<bool> {
        let output = self.exec(&args(&["id", "-u"]), None, false).await?;
        if output.stdout.trim() == "0" {
            return Ok(true);
        }
        if self.entry.become_root {
            let output = self.exec(&args(&["true"]), None, true).await?;
            return Ok(output.success());
        }
        Ok(false)
    }

    async fn family(&self) -> Result<OsFamily> {
        Ok(self.facts().await?.os_family)
    }
}

#[async_trait]
impl HostSystem for CommandHost {
    fn name(&self) -> &str {
        &self.entry.name
    }

    async fn facts(&self) -> Result<HostFacts> {
        self.facts
            .get_or_try_init(|| async {
                let release = self.read_file("/etc/os-release").await?.unwrap_or_default();
                let values = parse_os_release(&release);
                let get = |key: &str| values.get(key).cloned().unwrap_or_default();
                let facts = HostFacts {
                    os_family: OsFamily::from_os_release(&get("ID"), &get("ID_LIKE")),
                    distribution: get("ID"),
                    distribution_version: get("VERSION_ID"),
                    privileged: self.is_privileged().await?,
                };
                debug!(host = %self.entry.name, facts = ?facts, "Gathered facts");
                Ok::<_, FleetError>(facts)
            })
            .await
            .cloned()
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let output = self.exec(&args(&["cat", "--", path]), None, true).await?;
        if output.success() {
            Ok(Some(output.stdout))
        } else if output.stderr.contains("No such file") {
            Ok(None)
        } else {
            Err(FleetError::command(
                &self.entry.name,
                format!("cat {}", path),
                output.stderr.trim(),
            ))
        }
    }

    async fn write_file(&self, path: &str, contents: &str, mode: u32) -> Result<()> {
        let script = format!("cat > \"$1\" && chmod {:o} \"$1\"", mode);
        let argv = args(&["sh", "-c", &script, "sh", path]);
        let output = self.exec(&argv, Some(contents.as_bytes()), true).await?;
        if output.success() {
            Ok(())
        } else {
            Err(FleetError::command(
                &self.entry.name,
                format!("write {}", path),
                output.stderr.trim(),
            ))
        }
    }

    async fn remove_file(&self, path: &str) -> Result<bool> {
        let script = "if [ -e \"$1\" ]; then rm -f -- \"$1\" && echo removed; fi";
        let output = self.checked(&args(&["sh", "-c", script, "sh", path])).await?;
        Ok(output.stdout.trim() == "removed")
    }

    async fn chown(&self, path: &str, user: &str, group: &str, recursive: bool) -> Result<()> {
        let owner = format!("{}:{}", user, group);
        let mut argv = args(&["chown"]);
        if recursive {
            argv.push("-R".to_string());
        }
        argv.push(owner);
        argv.push(path.to_string());
        self.checked(&argv).await.map(|_| ())
    }

    async fn group(&self, name: &str) -> Result<Option<GroupInfo>> {
        let output = self.exec(&args(&["getent", "group", name]), None, false).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(parse_group_line(output.stdout.trim()))
    }

    async fn create_group(&self, spec: &GroupSpec) -> Result<()> {
        let mut argv = args(&["groupadd"]);
        if spec.system {
            argv.push("--system".to_string());
        }
        if let Some(gid) = spec.gid {
            argv.push("--gid".to_string());
            argv.push(gid.to_string());
        }
        argv.push(spec.name.clone());
        self.checked(&argv).await.map(|_| ())
    }

    async fn user(&self, name: &str) -> Result<Option<UserInfo>> {
        let output = self.exec(&args(&["getent", "passwd", name]), None, false).await?;
        if !output.success() {
            return Ok(None);
        }
        let Some((uid, home, shell)) = parse_passwd_line(output.stdout.trim()) else {
            return Ok(None);
        };

        let primary = self.exec(&args(&["id", "-gn", name]), None, false).await?;
        let all = self.exec(&args(&["id", "-Gn", name]), None, false).await?;
        let group = primary.stdout.trim().to_string();
        let groups = all
            .stdout
            .split_whitespace()
            .filter(|g| *g != group)
            .map(str::to_string)
            .collect();

        Ok(Some(UserInfo {
            name: name.to_string(),
            uid,
            group,
            groups,
            home,
            shell,
        }))
    }

    async fn create_user(&self, spec: &UserSpec) -> Result<()> {
        let mut argv = args(&["useradd", "--create-home"]);
        if spec.system {
            argv.push("--system".to_string());
        }
        if let Some(uid) = spec.uid {
            argv.push("--uid".to_string());
            argv.push(uid.to_string());
        }
        argv.extend(user_flags(spec));
        self.checked(&argv).await.map(|_| ())
    }

    async fn modify_user(&self, spec: &UserSpec) -> Result<()> {
        let mut argv = args(&["usermod"]);
        argv.extend(user_flags(spec));
        self.checked(&argv).await.map(|_| ())
    }

    async fn unit_state(&self, unit: &str) -> Result<UnitState> {
        let enabled = self
            .exec(&args(&["systemctl", "is-enabled", unit]), None, false)
            .await?;
        let active = self
            .exec(&args(&["systemctl", "is-active", unit]), None, false)
            .await?;
        Ok(UnitState {
            enabled: enabled.stdout.trim() == "enabled",
            active: active.stdout.trim() == "active",
        })
    }

    async fn systemctl(&self, action: UnitAction, unit: &str) -> Result<()> {
        let argv = match action {
            UnitAction::DaemonReload => args(&["systemctl", "daemon-reload"]),
            _ => args(&["systemctl", action.verb(), unit]),
        };
        self.checked(&argv).await.map(|_| ())
    }

    async fn firewall_ports(&self) -> Result<Vec<PortSpec>> {
        let mut ports = match self.family().await? {
            OsFamily::Debian => {
                // Added rules are listed whether or not ufw is enabled
                let output = self.checked(&args(&["ufw", "show", "added"])).await?;
                parse_ufw_added(&output.stdout)
            }
            _ => {
                let output = self
                    .checked(&args(&["firewall-cmd", "--permanent", "--list-ports"]))
                    .await?;
                output
                    .stdout
                    .split_whitespace()
                    .filter_map(|p| p.parse().ok())
                    .collect()
            }
        };
        ports.sort();
        ports.dedup();
        Ok(ports)
    }

    async fn open_port(&self, port: &PortSpec) -> Result<()> {
        let spec = port.to_string();
        match self.family().await? {
            OsFamily::Debian => {
                self.checked(&args(&["ufw", "allow", &spec])).await?;
            }
            _ => {
                let flag = format!("--add-port={}", spec);
                self.checked(&args(&["firewall-cmd", "--permanent", &flag]))
                    .await?;
                self.checked(&args(&["firewall-cmd", &flag])).await?;
            }
        }
        Ok(())
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        match &self.entry.connection {
            Connection::Local => {
                let source = local.display().to_string();
                self.checked(&args(&["cp", "--", &source, remote])).await?;
            }
            Connection::Ssh {
                user,
                port,
                identity_file,
            } => {
                let mut command = Command::new("scp");
                command.arg("-P").arg(port.to_string());
                if let Some(key) = identity_file {
                    command.arg("-i").arg(key);
                }
                command
                    .arg("-o")
                    .arg("BatchMode=yes")
                    .arg(local)
                    .arg(format!("{}@{}:{}", user, self.entry.address(), remote));
                let output = command.output().await?;
                if !output.status.success() {
                    return Err(FleetError::command(
                        &self.entry.name,
                        format!("scp {}", local.display()),
                        String::from_utf8_lossy(&output.stderr).trim(),
                    ));
                }
            }
        }
        Ok(())
    }

    async fn extract_archive(&self, archive: &str, dest_dir: &str) -> Result<()> {
        self.checked(&args(&["tar", "-xzf", archive, "-C", dest_dir]))
            .await
            .map(|_| ())
    }

    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        self.exec(argv, None, true).await
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

fn user_flags(spec: &UserSpec) -> Vec<String> {
    vec![
        "--gid".to_string(),
        spec.group.clone(),
        "--groups".to_string(),
        spec.groups.join(","),
        "--home".to_string(),
        spec.home.clone(),
        "--shell".to_string(),
        spec.shell.clone(),
        spec.name.clone(),
    ]
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn parse_os_release(contents: &str) -> std::collections::HashMap<String, String> {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

fn parse_group_line(line: &str) -> Option<GroupInfo> {
    let mut fields = line.split(':');
    let name = fields.next()?.to_string();
    let _password = fields.next()?;
    let gid = fields.next()?.parse().ok()?;
    Some(GroupInfo { name, gid })
}

fn parse_passwd_line(line: &str) -> Option<(u32, String, String)> {
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 7 {
        return None;
    }
    let uid = fields[2].parse().ok()?;
    Some((uid, fields[5].to_string(), fields[6].to_string()))
}

/// Bare `ufw allow <port>/<proto>` rules from `ufw show added`
fn parse_ufw_added(output: &str) -> Vec<PortSpec> {
    output
        .lines()
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next(), words.next(), words.next()) {
                (Some("ufw"), Some("allow"), Some(port), None) => port.parse().ok(),
                _ => None,
            }
        })
        .collect()
}
