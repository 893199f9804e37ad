// SPDX-License-Identifier: AGPL-3.0-or-later
//! splunk-fleet: prepare hosts, manage Splunk Enterprise and run day-2
//! operations from the command line

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use splunk_fleet::{
    host::HostSystem,
    inventory::Inventory,
    operations::{analyze_changes, ChangeResult, PendingFlags, ServiceAction},
    playbook::{
        self, HostSource, Play, Playbook, PlaybookExecutor, PlaybookResult, Role, RoleInvocation,
    },
    Config,
};

/// splunk-fleet: Splunk fleet management
///
/// Converges Linux hosts to the Splunk baseline, installs and rolls
/// upgrades of Splunk Enterprise, and drives the management API.
#[derive(Parser, Debug)]
#[command(name = "splunk-fleet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "splunk-fleet.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Dry run mode (observe only, never change a host or the cluster)
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a playbook
    #[command(alias = "exec")]
    Run {
        /// Name or path of the playbook
        playbook: String,
    },

    /// List available playbooks
    #[command(alias = "ls")]
    List,

    /// Validate a playbook file
    Validate {
        /// Path to the playbook file
        playbook: PathBuf,
    },

    /// Show hosts of the inventory
    Inventory {
        /// Group or host name
        #[arg(default_value = "all")]
        pattern: String,
    },

    /// Converge hosts to the Splunk Linux baseline
    Prepare {
        /// Group or host name
        #[arg(short = 'H', long, default_value = "all")]
        hosts: String,

        /// Only report pending changes
        #[arg(long)]
        check: bool,
    },

    /// Install Splunk Enterprise where it is absent
    Install {
        /// Version to install, e.g. 9.1.2
        #[arg(long = "splunk-version")]
        splunk_version: String,

        /// Group or host name
        #[arg(short = 'H', long, default_value = "all")]
        hosts: String,

        /// Seed the admin account and start splunkd
        #[arg(long)]
        seed_admin: bool,
    },

    /// Rolling upgrade, one host at a time
    Upgrade {
        /// Target version
        #[arg(long = "splunk-version")]
        splunk_version: String,

        /// Group or host name
        #[arg(short = 'H', long, default_value = "all")]
        hosts: String,
    },

    /// Log in to the management API and log out again
    Login,

    /// Reconcile application users from a TOML file with `[[users]]` entries
    Users {
        file: PathBuf,
    },

    /// Validate and push the cluster manager bundle
    Bundle {
        /// Refuse the push unless the manager is at this generation
        #[arg(long)]
        generation: Option<u64>,
    },

    /// Search-head cluster operations
    Shc {
        #[command(subcommand)]
        command: ShcCommand,
    },

    /// Start, stop or restart splunkd
    Service {
        /// start, stop or restart
        action: ServiceAction,

        /// Group or host name
        #[arg(short = 'H', long, default_value = "all")]
        hosts: String,
    },

    /// Reload the deployment server
    Reload,

    /// Derive required follow-up actions from a JSON list of change results
    Analyze {
        /// File holding `[{"changed": true, "path": "..."}]`
        results: PathBuf,

        #[arg(long)]
        rolling_restart_pending: bool,

        #[arg(long)]
        splunkd_restart_pending: bool,

        #[arg(long)]
        force_splunkd_restart: bool,

        #[arg(long)]
        force_bundle_push: bool,
    },

    /// Show configuration
    Config,

    /// Initialize a new splunk-fleet configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug)]
enum ShcCommand {
    /// Show the captain and member states
    Status,

    /// Restart members one at a time, waiting for each to rejoin
    RollingRestart {
        /// Group or host name of the members
        #[arg(short = 'H', long, default_value = "search_heads")]
        hosts: String,
    },
}

/// Host source for API-only roles
struct NoHosts;

impl HostSource for NoHosts {
    fn hosts(&self, _pattern: &str) -> splunk_fleet::Result<Vec<Arc<dyn HostSystem>>> {
        Ok(Vec::new())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Commands::Version => {
            println!("splunk-fleet v{}", env!("CARGO_PKG_VERSION"));
            println!("Host preparation, Splunk Enterprise lifecycle and day-2 operations");
            Ok(())
        }

        Commands::Init { force } => init_config(&cli.config, force),

        Commands::Config => show_config(&cli.config),

        Commands::List => list_playbooks(&cli.config),

        Commands::Validate { ref playbook } => validate_playbook(playbook),

        Commands::Inventory { ref pattern } => show_inventory(&cli.config, pattern),

        Commands::Analyze {
            ref results,
            rolling_restart_pending,
            splunkd_restart_pending,
            force_splunkd_restart,
            force_bundle_push,
        } => analyze(
            results,
            PendingFlags {
                rolling_restart_pending,
                splunkd_restart_pending,
                force_splunkd_restart,
                force_bundle_push,
            },
        ),

        Commands::Run { ref playbook } => run_playbook(&cli.config, playbook, cli.dry_run).await,

        Commands::Prepare { ref hosts, check } => {
            let task = if check { "plan" } else { "converge" };
            let invocation = invocation(Role::Linux, task, toml::Table::new());
            run_adhoc(&cli, "prepare", hosts, invocation).await
        }

        Commands::Install {
            ref splunk_version,
            ref hosts,
            seed_admin,
        } => {
            let mut vars = toml::Table::new();
            vars.insert("version".into(), splunk_version.clone().into());
            vars.insert("seed_admin".into(), seed_admin.into());
            let invocation = invocation(Role::Enterprise, "install", vars);
            run_adhoc(&cli, "install", hosts, invocation).await
        }

        Commands::Upgrade {
            ref splunk_version,
            ref hosts,
        } => {
            let mut vars = toml::Table::new();
            vars.insert("version".into(), splunk_version.clone().into());
            let invocation = invocation(Role::Enterprise, "upgrade", vars);
            run_adhoc(&cli, "upgrade", hosts, invocation).await
        }

        Commands::Login => {
            let invocation = invocation(Role::Core, "login", toml::Table::new());
            run_api(&cli, "login", invocation).await
        }

        Commands::Users { ref file } => {
            let contents = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let vars: toml::Table = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", file.display()))?;
            run_api(&cli, "users", invocation(Role::Core, "users", vars)).await
        }

        Commands::Bundle { generation } => {
            let mut vars = toml::Table::new();
            if let Some(generation) = generation {
                let generation =
                    i64::try_from(generation).context("Generation out of range")?;
                vars.insert("expected_generation".into(), generation.into());
            }
            run_api(&cli, "bundle", invocation(Role::Core, "bundle", vars)).await
        }

        Commands::Shc {
            command: ShcCommand::Status,
        } => {
            let invocation = invocation(Role::Core, "shc_status", toml::Table::new());
            run_api(&cli, "shc-status", invocation).await
        }

        Commands::Shc {
            command: ShcCommand::RollingRestart { ref hosts },
        } => {
            let invocation = invocation(Role::Core, "shc_rolling_restart", toml::Table::new());
            run_adhoc(&cli, "shc-rolling-restart", hosts, invocation).await
        }

        Commands::Service { action, ref hosts } => {
            let mut vars = toml::Table::new();
            vars.insert("action".into(), action.to_string().into());
            run_adhoc(&cli, "service", hosts, invocation(Role::Core, "service", vars)).await
        }

        Commands::Reload => {
            let invocation = invocation(Role::Core, "deployment_server_reload", toml::Table::new());
            run_api(&cli, "deployment-server-reload", invocation).await
        }
    }
}

/// Install the subscriber; logs go to stderr so command output stays parseable
fn init_logging(cli: &Cli) {
    let logging = load_config(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();

    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let directive = filter_directive(cli, env, &logging.level);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(cli.debug)
                    .with_writer(io::stderr),
            )
            .init();
    }
}

/// Flags win over `RUST_LOG`, which wins over the configured level
fn filter_directive(cli: &Cli, env: Option<String>, configured: &str) -> String {
    if cli.debug {
        "debug".to_string()
    } else if cli.verbose {
        "info".to_string()
    } else {
        env.filter(|value| !value.is_empty())
            .unwrap_or_else(|| configured.to_string())
    }
}

/// Load the configuration, falling back to defaults when the file is absent
fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    if !config_path.exists() {
        return Ok(Config::default());
    }
    Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

fn load_inventory(config: &Config) -> anyhow::Result<Inventory> {
    Inventory::from_file(&config.inventory)
        .with_context(|| format!("Failed to load inventory {}", config.inventory.display()))
}

fn invocation(role: Role, task: &str, vars: toml::Table) -> RoleInvocation {
    RoleInvocation {
        role,
        tasks_from: Some(task.to_string()),
        vars,
    }
}

fn single_play(name: &str, hosts: &str, invocation: RoleInvocation) -> Playbook {
    Playbook {
        name: name.to_string(),
        description: String::new(),
        version: "1.0".to_string(),
        plays: vec![Play {
            name: name.to_string(),
            hosts: hosts.to_string(),
            roles: vec![invocation],
        }],
    }
}

/// Run one role invocation against inventory hosts
async fn run_adhoc(
    cli: &Cli,
    name: &str,
    hosts: &str,
    invocation: RoleInvocation,
) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;
    let inventory = load_inventory(&config)?;
    let playbook = single_play(name, hosts, invocation);
    execute(config, &playbook, &inventory, cli.dry_run).await
}

/// Run one management API role invocation
async fn run_api(cli: &Cli, name: &str, invocation: RoleInvocation) -> anyhow::Result<()> {
    let config = load_config(&cli.config)?;
    let playbook = single_play(name, &config.api.endpoint, invocation);
    execute(config, &playbook, &NoHosts, cli.dry_run).await
}

async fn execute(
    config: Config,
    playbook: &Playbook,
    source: &dyn HostSource,
    dry_run: bool,
) -> anyhow::Result<()> {
    playbook
        .validate()
        .with_context(|| format!("Playbook '{}' is invalid", playbook.name))?;

    if dry_run {
        println!("[DRY RUN] Would execute playbook: {}", playbook.name);
    } else {
        println!("Executing playbook: {}", playbook.name);
    }

    let executor = PlaybookExecutor::new(config, dry_run);
    let result = executor.execute(playbook, source).await?;
    print_result(&result);

    if !result.success {
        std::process::exit(1);
    }

    Ok(())
}

fn print_result(result: &PlaybookResult) {
    println!();
    for task in &result.task_results {
        let status = if !task.success {
            "failed"
        } else if task.changed {
            "changed"
        } else {
            "ok"
        };
        let message = task
            .error
            .as_deref()
            .or(task.output.as_deref())
            .unwrap_or("");
        println!(
            "  [{}] {} {}/{} {}: {}",
            status, task.play, task.role, task.task, task.target, message
        );
    }

    println!();
    if result.success {
        println!("Playbook completed successfully");
    } else {
        println!("Playbook completed with errors");
    }

    println!();
    println!("Results:");
    println!("  Duration: {} ms", result.total_duration_ms);
    println!("  Tasks succeeded: {}", result.tasks_succeeded);
    println!("  Tasks failed: {}", result.tasks_failed);
    println!("  Changed: {}", result.changed());
}

/// Initialize a new configuration file
fn init_config(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let default_config = r#"# SPDX-License-Identifier: AGPL-3.0-or-later
# splunk-fleet configuration

name = "splunk-fleet"
version = "1.0"
inventory = "inventory.toml"
playbook_dir = "playbooks"
forks = 5

[splunk]
home = "/opt/splunk"
user = "splunk"
group = "splunk"
service = "Splunkd"
package_dir = "packages"
package_pattern = "splunk-{version}-Linux-x86_64.tgz"
staging_dir = "/tmp"
# minimum_version = "9.0.0"

[api]
endpoint = "https://127.0.0.1:8089"
username = "admin"
# Read the password from this environment variable
password_env = "SPLUNK_PASSWORD"
timeout_secs = 30
verify_tls = false
abort_on_error = false

[api.retry]
attempts = 0
backoff_ms = 500

[rolling]
pause_between_secs = 0
health_retries = 30
health_interval_secs = 10
allow_downgrade = false

[logging]
level = "info"
format = "text"
"#;

    std::fs::write(config_path, default_config)?;
    info!("Created configuration file: {}", config_path.display());
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

/// Show the current configuration
fn show_config(config_path: &Path) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("No configuration file found. Using defaults:");
        println!();
    }
    let config = load_config(config_path)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// List available playbooks
fn list_playbooks(config_path: &Path) -> anyhow::Result<()> {
    let playbook_dir = load_config(config_path)?.playbook_dir;
    let playbooks = playbook::list_playbooks(&playbook_dir)?;

    if playbooks.is_empty() {
        println!("No playbooks found in {}", playbook_dir.display());
        println!();
        println!("Create a playbook file (*.toml) in the playbook directory.");
    } else {
        println!("Available playbooks in {}:", playbook_dir.display());
        println!();
        for name in playbooks {
            println!("  - {}", name);
        }
    }

    Ok(())
}

/// Validate a playbook file
fn validate_playbook(playbook_path: &Path) -> anyhow::Result<()> {
    info!("Validating playbook: {}", playbook_path.display());

    let playbook = playbook::load_playbook(playbook_path)
        .with_context(|| format!("Failed to parse playbook: {}", playbook_path.display()))?;

    playbook
        .validate()
        .with_context(|| "Playbook validation failed")?;

    println!("Playbook '{}' is valid", playbook.name);
    println!();
    println!("  Description: {}", playbook.description);
    println!("  Version: {}", playbook.version);
    println!("  Plays: {}", playbook.plays.len());
    for play in &playbook.plays {
        let roles: Vec<String> = play
            .roles
            .iter()
            .map(|r| format!("{}/{}", r.role, r.task_name()))
            .collect();
        println!("    {} -> {}: {}", play.name, play.hosts, roles.join(", "));
    }

    Ok(())
}

/// Show inventory hosts matching a pattern
fn show_inventory(config_path: &Path, pattern: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let inventory = load_inventory(&config)?;
    let hosts = inventory.select(pattern)?;

    println!("Hosts matching '{}':", pattern);
    println!();
    for host in hosts {
        println!(
            "  - {} ({}) groups: {}",
            host.name,
            host.address(),
            host.groups.join(", ")
        );
    }

    let groups = inventory.groups();
    if !groups.is_empty() {
        println!();
        println!("Groups: {}", groups.join(", "));
    }

    Ok(())
}

/// Classify changed paths and print the required actions as JSON
fn analyze(results_path: &Path, flags: PendingFlags) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(results_path)
        .with_context(|| format!("Failed to read {}", results_path.display()))?;
    let results: Vec<ChangeResult> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", results_path.display()))?;

    let actions = analyze_changes(&results, flags);
    if !actions.any() {
        warn!("No follow-up actions required");
    }
    println!("{}", serde_json::to_string_pretty(&actions)?);
    Ok(())
}

/// Resolve a playbook name to a file in the playbook directory
fn resolve_playbook(config: &Config, playbook_name: &str) -> anyhow::Result<PathBuf> {
    let direct = PathBuf::from(playbook_name);
    if direct.exists() {
        return Ok(direct);
    }

    let toml_path = config.playbook_dir.join(format!("{}.toml", playbook_name));
    if toml_path.exists() {
        return Ok(toml_path);
    }

    anyhow::bail!(
        "Playbook '{}' not found. Tried:\n  - {}\n  - {}",
        playbook_name,
        direct.display(),
        toml_path.display()
    );
}

/// Run a playbook by name or path
async fn run_playbook(config_path: &Path, playbook_name: &str, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let playbook_path = resolve_playbook(&config, playbook_name)?;

    info!("Loading playbook: {}", playbook_path.display());
    let playbook = playbook::load_playbook(&playbook_path)?;
    let inventory = load_inventory(&config)?;

    execute(config, &playbook, &inventory, dry_run).await
}
