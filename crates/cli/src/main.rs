#![forbid(unsafe_code)]

mod config;
mod render;

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use zoneshift_cloud::Ec2Gateway;
use zoneshift_core::{PollIntervals, Step, TaskStatus};
use zoneshift_engine::{CancellationToken, Coordinator, CoordinatorError, Orchestrator, ScaleMode};
use zoneshift_kubehub::KubeGateway;

use crate::config::{FileConfig, Overrides, DEFAULT_CONFIG_FILE};

#[derive(Parser, Debug)]
#[command(name = "zoneshiftctl", version, about = "Move PVC-backed EBS volumes to another availability zone")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Snapshot, recreate and rebind PVCs in the target zone
    Migrate {
        /// YAML config file; flags override its values
        #[arg(short = 'c', long = "config", env = "ZONESHIFT_CONFIG")]
        config: Option<PathBuf>,
        #[command(flatten)]
        overrides: Overrides,
        /// Print the migration plan and exit without touching anything
        #[arg(long = "plan", action = ArgAction::SetTrue)]
        plan: bool,
        /// Do not ask for confirmation
        #[arg(short = 'y', long = "yes", action = ArgAction::SetTrue)]
        yes: bool,
    },
    /// Write an example config file
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("ZONESHIFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ZONESHIFT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ZONESHIFT_METRICS_ADDR; expected host:port");
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default)
}

fn poll_intervals() -> PollIntervals {
    let d = PollIntervals::default();
    PollIntervals {
        snapshot: Duration::from_secs(env_u64("ZONESHIFT_SNAPSHOT_POLL_SECS", d.snapshot.as_secs())),
        volume: Duration::from_secs(env_u64("ZONESHIFT_VOLUME_POLL_SECS", d.volume.as_secs())),
    }
}

fn load_config(path: Option<PathBuf>, overrides: &Overrides) -> Result<FileConfig> {
    let mut cfg = match path {
        Some(p) => FileConfig::load(&p)?,
        None => FileConfig::default(),
    };
    cfg.apply(overrides);
    cfg.validate()?;
    Ok(cfg)
}

async fn read_answer(prompt: &str) -> Result<String> {
    eprint!("{}", prompt);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await.context("reading stdin")?;
    Ok(line.trim().to_ascii_lowercase())
}

/// Print step changes until the run completes or `stop` fires.
async fn watch_progress(orch: Orchestrator, every: Duration, stop: CancellationToken) {
    let mut seen: HashMap<String, (Step, u8)> = HashMap::new();
    loop {
        let mut statuses: Vec<TaskStatus> = orch.statuses().into_values().collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        for s in statuses {
            let key = (s.step, s.progress);
            if s.step != Step::Pending && seen.get(&s.name) != Some(&key) {
                println!("{}", render::transition(&s));
                seen.insert(s.name.clone(), key);
            }
        }
        if orch.is_done() || stop.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(every) => {}
        }
    }
}

async fn migrate(output: Output, config: Option<PathBuf>, overrides: Overrides, plan_only: bool, yes: bool) -> Result<bool> {
    let cfg = load_config(config, &overrides)?;
    let human = output == Output::Human;
    info!(zone = %cfg.target_zone, namespaces = ?cfg.namespace_names(), dry_run = cfg.dry_run, "starting");

    let cluster = Arc::new(KubeGateway::connect(cfg.kube_context.as_deref()).await?);
    let coordinator = Coordinator::new(cluster.clone(), cfg.coordinator_settings());
    let tasks = coordinator.resolve_tasks().await?;
    let discovery = coordinator.discover().await?;
    if human {
        println!("{}", render::discovery(&tasks, &discovery, cfg.scale_mode, cfg.dry_run));
    }

    let volumes = Arc::new(Ec2Gateway::from_env().await);
    let orch = Orchestrator::new(cfg.migration_config(tasks, poll_intervals()), cluster, volumes);

    if plan_only {
        let plan = orch.generate_plan().await?;
        match output {
            Output::Human => print!("{}", render::plan(&plan)),
            Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        }
        return Ok(true);
    }

    if !cfg.dry_run {
        if cfg.scale_mode == ScaleMode::Manual && discovery.workload_count() > 0 {
            eprintln!("Manual scale mode. Auto-sync is paused first, then these must be run:");
            for cmd in render::manual_scale_commands(&discovery, cfg.kube_context.as_deref()) {
                eprintln!("  {}", cmd);
            }
            eprintln!("Pods get {}s to stop once the migration starts.", cfg.drain_timeout_secs);
            if read_answer("Press Enter to start, or 'q' to abort: ").await? == "q" {
                bail!("migration aborted by user");
            }
        } else if !yes {
            let answer = read_answer(&format!(
                "Migrate {} PVC(s) to {}? [y/N]: ",
                orch.config().tasks.len(),
                cfg.target_zone
            ))
            .await?;
            if answer != "y" && answer != "yes" {
                bail!("migration aborted by user");
            }
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling in-flight migrations");
                cancel.cancel();
            }
        });
    }

    let stop_watch = CancellationToken::new();
    let watcher = human.then(|| {
        let every = Duration::from_millis(env_u64("ZONESHIFT_PROGRESS_MS", 500));
        tokio::spawn(watch_progress(orch.clone(), every, stop_watch.clone()))
    });

    let result = coordinator.execute(&orch, &discovery, cancel).await;
    stop_watch.cancel();
    if let Some(handle) = watcher {
        if let Err(e) = handle.await {
            warn!(error = %e, "progress watcher aborted");
        }
    }

    let report = match result {
        Ok(report) => report,
        Err(CoordinatorError::Preflight { cause, restore }) => {
            eprint!("{}", render::restore_warnings(&restore));
            return Err(cause.context("pre-flight failed"));
        }
        Err(e) => return Err(e.into()),
    };

    let mut statuses: Vec<TaskStatus> = orch.statuses().into_values().collect();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    match output {
        Output::Human => print!("\n{}", render::summary(&statuses, &cfg.target_zone)),
        Output::Json => {
            let doc = serde_json::json!({
                "summary": report.summary,
                "tasks": statuses,
                "restore": report.restore,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    eprint!("{}", render::restore_warnings(&report.restore));
    Ok(report.succeeded())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();

    let cli = Cli::parse();
    match cli.command {
        Commands::InitConfig { path } => {
            config::write_example(&path)?;
            println!("Example configuration written to {}", path.display());
            Ok(())
        }
        Commands::Migrate { config, overrides, plan, yes } => {
            if !migrate(cli.output, config, overrides, plan, yes).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
