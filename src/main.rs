use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden::config::WardenConfig;
use warden::ratelimit::{NewRule, RequestContext, RuleSet, Scope, Strategy};
use warden::{spawn_janitor, AdmissionController, EngineConfig};

#[derive(Parser)]
#[command(name = "warden", version, about = "In-process admission control engine")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log filter, overrides logging.level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load rules and run until interrupted
    Run,
    /// Drive synthetic traffic through the configured rules and print a report
    Simulate {
        /// Number of requests to send
        #[arg(long, default_value_t = 1000)]
        requests: usize,
        /// Number of distinct users
        #[arg(long, default_value_t = 10)]
        users: usize,
        #[arg(long, default_value = "/api/orders")]
        endpoint: String,
    },
    /// Parse and validate a rule file
    Validate { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WardenConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_tracing(&level, cli.json_logs || config.logging.json);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Simulate {
            requests,
            users,
            endpoint,
        } => simulate(config, requests, users, endpoint).await,
        Command::Validate { file } => validate(file),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: WardenConfig) -> anyhow::Result<()> {
    info!("Starting Warden admission controller");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let controller = Arc::new(AdmissionController::from_config(&config)?);
    let stats = controller.get_stats();
    info!(
        rules = stats.total_rules,
        quotas = stats.total_quotas,
        policy = ?config.engine.no_match_policy,
        "Admission controller ready"
    );

    let janitor = spawn_janitor(controller.clone(), config.retention.clone());

    let mut events = BroadcastStream::new(controller.events().subscribe());
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(detail) => info!(event = event.name(), %detail, "Event"),
                    Err(e) => warn!(event = event.name(), error = %e, "Event not serializable"),
                },
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event log fell behind")
                }
            }
        }
    });

    shutdown_signal().await;

    janitor.abort();
    event_log.abort();
    info!("Warden stopped");
    Ok(())
}

async fn simulate(
    config: WardenConfig,
    requests: usize,
    users: usize,
    endpoint: String,
) -> anyhow::Result<()> {
    let controller = Arc::new(AdmissionController::from_config(&config)?);
    if controller.list_rules().is_empty() {
        info!("No rules configured, using demo rules");
        controller.load_rule_set(demo_rules())?;
    }

    let contexts: Vec<RequestContext> = {
        let mut rng = rand::thread_rng();
        (0..requests)
            .map(|_| {
                let user = rng.gen_range(0..users.max(1));
                RequestContext::new(endpoint.clone())
                    .with_user(format!("user-{}", user))
                    .with_ip(format!("10.0.0.{}", user % 254 + 1))
            })
            .collect()
    };

    let tasks: Vec<_> = contexts
        .into_iter()
        .map(|ctx| {
            let controller = controller.clone();
            tokio::spawn(async move { controller.evaluate(&ctx).allowed })
        })
        .collect();

    let mut allowed = 0usize;
    for result in futures::future::join_all(tasks).await {
        if result.context("Simulated request panicked")? {
            allowed += 1;
        }
    }

    let report = serde_json::json!({
        "requests": requests,
        "allowed": allowed,
        "denied": requests - allowed,
        "stats": controller.get_stats(),
        "analytics": controller.get_analytics(None),
        "top_violators": controller.get_top_violators(5),
        "rules": controller.statistics_summary(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn demo_rules() -> RuleSet {
    RuleSet {
        rules: vec![
            NewRule::new("per-user", Scope::User, Strategy::FixedWindow, 50, 60_000).with_priority(10),
            NewRule::new("per-ip burst", Scope::Ip, Strategy::TokenBucket, 20, 1000)
                .with_burst(40)
                .with_priority(20),
            NewRule::new("global", Scope::Global, Strategy::SlidingWindow, 500, 1000).with_priority(100),
        ],
        quotas: Vec::new(),
    }
}

fn validate(file: PathBuf) -> anyhow::Result<()> {
    let set = RuleSet::from_file(&file).with_context(|| format!("Failed to read {}", file.display()))?;
    set.validate()?;

    // Creating everything in a scratch controller also checks quotas.
    let scratch = AdmissionController::new(EngineConfig::default());
    scratch.load_rule_set(set.clone())?;

    println!(
        "{}: {} rules, {} quotas OK",
        file.display(),
        set.rules.len(),
        set.quotas.len()
    );
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
