//! portwarden: port-forwarding control plane
//!
//! # Usage
//!
//! ```bash
//! # Run the background service in the foreground
//! portwarden daemon
//!
//! # Interactive instance: single-instance lock, daemon or embedded engine
//! portwarden run
//!
//! # Control a running daemon
//! portwarden rule list
//! portwarden rule start <id>
//! portwarden logs --count 20
//!
//! # Environment overrides
//! PORTWARDEN_LOG_LEVEL=debug portwarden daemon
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use portwarden::config::{apply_env_overrides, load_settings_with_env, Settings};
use portwarden::controller::{connect_or_embed, RemoteController, ServiceController};
use portwarden::ipc::IpcClient;
use portwarden::logbuf::format_bytes;
use portwarden::model::{AppData, Protocol, Rule, RuleType, Target};
use portwarden::{Daemon, Instance};

#[derive(Parser)]
#[command(name = "portwarden")]
#[command(author, version, about = "Port-forwarding control plane")]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background service in the foreground
    Daemon,

    /// Run an interactive instance until Ctrl-C
    Run,

    /// Show daemon status
    Status,

    /// Manage rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Manage proxy chains
    Chain {
        #[command(subcommand)]
        action: ChainAction,
    },

    /// Show traffic statistics
    Stats {
        /// Only this rule
        rule: Option<String>,
    },

    /// Show forwarding logs
    Logs {
        /// Number of most recent entries (0 = all)
        #[arg(short, long, default_value = "50")]
        count: usize,

        /// Only entries with an id greater than this
        #[arg(long, conflicts_with = "rule")]
        since: Option<u64>,

        /// Only entries for this rule
        #[arg(long)]
        rule: Option<String>,
    },

    /// Clear forwarding logs
    LogsClear,

    /// Export rules, chains and config as JSON
    Export {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a previously exported document
    Import {
        file: PathBuf,

        /// Upsert into existing data instead of replacing it
        #[arg(long)]
        merge: bool,
    },

    /// Remove every rule and chain, keeping the config
    ClearAll {
        /// Confirm the action
        #[arg(long)]
        yes: bool,
    },

    /// Print version information
    Version,
}

#[derive(Subcommand)]
enum RuleAction {
    List,
    Show { id: String },
    Start { id: String },
    Stop { id: String },
    Delete { id: String },
    StartAll,
    StopAll,
    /// Create a rule
    Create {
        #[arg(long)]
        name: String,

        /// Local listen port
        #[arg(short, long)]
        port: u16,

        /// Target `host:port`; repeat for weighted balancing
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// forward, reverse or chain
        #[arg(long = "type", default_value = "forward", value_parser = parse_enum::<RuleType>)]
        rule_type: RuleType,

        /// tcp, http, https or socks5
        #[arg(long, default_value = "tcp", value_parser = parse_enum::<Protocol>)]
        protocol: Protocol,

        /// Chain id for upstream dials
        #[arg(long)]
        chain: Option<String>,

        /// Start the rule right away
        #[arg(long)]
        start: bool,
    },
}

#[derive(Subcommand)]
enum ChainAction {
    List,
    Show { id: String },
    Delete { id: String },
}

/// Parse a lowercase model enum the way it is spelled in JSON
fn parse_enum<T: DeserializeOwned>(s: &str) -> std::result::Result<T, String> {
    serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
        .map_err(|_| format!("invalid value: {s}"))
}

fn parse_target(s: &str) -> Result<Target> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("target must be host:port: {s}"))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("invalid target port: {s}"))?;
    Ok(Target::new(host.trim_matches(['[', ']']), port))
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => load_settings_with_env(path)
            .map_err(|e| anyhow!("Failed to load settings from {:?}: {}", path, e))?,
        None => {
            let mut settings = Settings::default();
            apply_env_overrides(&mut settings)?;
            settings
        }
    };
    settings.validate()?;
    Ok(settings)
}

/// Initialize logging; diagnostics go to stderr so CLI output stays clean
fn init_logging(settings: &Settings) {
    let level = match settings.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(settings.log.target)
        .with_writer(std::io::stderr);

    if settings.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    if matches!(cli.command, Commands::Version) {
        println!("portwarden v{}", portwarden::VERSION);
        return Ok(());
    }

    let settings = load_settings(cli.config.as_deref())?;
    init_logging(&settings);

    match cli.command {
        Commands::Daemon => run_daemon(&settings).await,
        Commands::Run => run_interactive(&settings).await,
        command => {
            let remote = RemoteController::new(IpcClient::from_config(&settings.ipc));
            let result = run_cli(&remote, command).await;
            let _ = remote.shutdown().await;
            result
        }
    }
}

async fn run_daemon(settings: &Settings) -> Result<()> {
    info!("portwarden v{} starting daemon", portwarden::VERSION);
    let daemon = Daemon::new(settings)?;

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        trigger.cancel();
    });

    daemon.run(token).await;
    info!("Shutdown complete");
    Ok(())
}

async fn run_interactive(settings: &Settings) -> Result<()> {
    let instance = Instance::new(&settings.instance);
    if !instance.try_lock()? {
        info!("another instance is running, sending wake-up");
        if let Err(e) = instance.send_wakeup().await {
            warn!("{}", e);
        }
        println!("portwarden is already running");
        return Ok(());
    }

    instance.start_wakeup_listener(Arc::new(|| {
        info!("wake-up received, bringing instance to front");
    }));

    let handle = connect_or_embed(settings).await?;
    println!("portwarden running ({} mode)", handle.mode);
    if let Some(report) = &handle.init_report {
        println!(
            "{} rules started, {} failed",
            report.started.len(),
            report.failed.len()
        );
        for (rule_id, message) in &report.failed {
            println!("  {rule_id}: {message}");
        }
    }

    wait_for_shutdown().await;

    handle.controller.shutdown().await?;
    instance.unlock();
    info!("Shutdown complete");
    Ok(())
}

async fn run_cli(c: &dyn ServiceController, command: Commands) -> Result<()> {
    match command {
        Commands::Status => {
            let status = c.get_status().await?;
            println!("version:  {}", status.version);
            if let Some(pid) = status.pid {
                println!("pid:      {pid}");
            }
            if let Some(start) = &status.start_time {
                println!("started:  {start}");
            }
            println!("rules:    {} active / {} total", status.rules_active, status.rules_total);
        }

        Commands::Rule { action } => run_rule(c, action).await?,

        Commands::Chain { action } => match action {
            ChainAction::List => {
                for chain in c.get_chains().await? {
                    println!("{}  {}  ({} hops)", chain.id, chain.name, chain.hops.len());
                }
            }
            ChainAction::Show { id } => {
                println!("{}", serde_json::to_string_pretty(&c.get_chain(&id).await?)?);
            }
            ChainAction::Delete { id } => {
                c.delete_chain(&id).await?;
                println!("chain {id} deleted");
            }
        },

        Commands::Stats { rule } => {
            let mut stats: Vec<_> = match rule {
                Some(id) => vec![c.get_rule_stats(&id).await?],
                None => c.get_all_rule_stats().await?.into_values().collect(),
            };
            stats.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
            for s in stats {
                println!(
                    "{}  in {}  out {}  conns {} ({} active)  errors {}",
                    s.rule_id,
                    format_bytes(s.bytes_in),
                    format_bytes(s.bytes_out),
                    s.connections,
                    s.active_conns,
                    s.errors
                );
            }
        }

        Commands::Logs { count, since, rule } => {
            let logs = match (since, rule) {
                (Some(since), _) => c.get_logs_since(since).await?,
                (None, Some(rule)) => c.get_logs_by_rule(&rule).await?,
                (None, None) => c.get_logs(count).await?,
            };
            for entry in logs {
                println!(
                    "#{} {} [{}] {} {}",
                    entry.id, entry.timestamp, entry.level, entry.rule_name, entry.message
                );
            }
        }

        Commands::LogsClear => {
            c.clear_logs().await?;
            println!("logs cleared");
        }

        Commands::Export { output } => {
            let data = c.export_data().await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, data)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("exported to {}", path.display());
                }
                None => println!("{data}"),
            }
        }

        Commands::Import { file, merge } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let data: AppData = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid data file {}", file.display()))?;
            let (rules, chains) = (data.rules.len(), data.chains.len());
            c.import_data(data, merge).await?;
            println!("imported {rules} rules and {chains} chains");
        }

        Commands::ClearAll { yes } => {
            if !yes {
                bail!("refusing to clear all data without --yes");
            }
            c.clear_all_data().await?;
            println!("all rules and chains removed");
        }

        Commands::Daemon | Commands::Run | Commands::Version => {}
    }
    Ok(())
}

async fn run_rule(c: &dyn ServiceController, action: RuleAction) -> Result<()> {
    match action {
        RuleAction::List => {
            for rule in c.get_rules().await? {
                println!(
                    "{}  {:<20} {:<8} :{:<5} -> {:<22} {}",
                    rule.id,
                    rule.name,
                    rule.protocol,
                    rule.local_port,
                    rule.target_addr().unwrap_or_else(|| "-".into()),
                    rule.status
                );
            }
        }
        RuleAction::Show { id } => {
            println!("{}", serde_json::to_string_pretty(&c.get_rule(&id).await?)?);
        }
        RuleAction::Start { id } => {
            c.start_rule(&id).await?;
            println!("rule {id} started");
        }
        RuleAction::Stop { id } => {
            c.stop_rule(&id).await?;
            println!("rule {id} stopped");
        }
        RuleAction::Delete { id } => {
            c.delete_rule(&id).await?;
            println!("rule {id} deleted");
        }
        RuleAction::StartAll => {
            c.start_all_rules().await?;
            println!("all rules started");
        }
        RuleAction::StopAll => {
            c.stop_all_rules().await?;
            println!("all rules stopped");
        }
        RuleAction::Create {
            name,
            port,
            targets,
            rule_type,
            protocol,
            chain,
            start,
        } => {
            let mut rule = Rule::new(name, rule_type);
            rule.local_port = port;
            rule.protocol = protocol;
            rule.chain_id = chain;
            rule.targets = targets
                .iter()
                .map(|t| parse_target(t))
                .collect::<Result<Vec<_>>>()?;
            rule.validate()?;

            let rule = c.create_rule(rule).await?;
            println!("rule {} created", rule.id);
            if start {
                c.start_rule(&rule.id).await?;
                println!("rule {} started", rule.id);
            }
        }
    }
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM
async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT, initiating shutdown..."),
        () = wait_for_sigterm() => info!("Received SIGTERM, initiating shutdown..."),
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
