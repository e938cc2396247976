use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use escalate::{
    admin,
    config::{self, AppConfig, Credentials},
    dispatch::Router,
    engine::{Engine, RunMode},
    history::HistoryStore,
    jira::JiraClient,
    telemetry::{self, SumoLogicSink},
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "escalate")]
#[command(version, about = "Escalate Jira issues that stay too long in one status")]
struct Cli {
    /// Config document (JSON, or TOML with a .toml extension)
    #[arg(short, long, global = true, default_value = "escalate.json")]
    config: PathBuf,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write logs to a daily-rotated file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate every rule and send due escalations (default)
    Run,
    /// Evaluate every rule and report what would be sent
    DryRun,
    /// List the configured rules grouped by level
    Rules,
    /// Show escalation history
    History {
        /// Only entries still on cooldown
        #[arg(long)]
        active: bool,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete escalation history
    Clear {
        /// Only this issue's records
        #[arg(long)]
        issue: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("escalate: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_dir = cli.log_dir.clone().or_else(|| cfg.log_dir.clone());
    let _guard  = telemetry::init_logging(cli.verbose, log_dir.as_deref());

    match execute(cli.command.unwrap_or(Command::Run), &cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("escalate: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command, cfg: &AppConfig) -> Result<()> {
    match command {
        Command::Run    => run(cfg, RunMode::Live).await,
        Command::DryRun => run(cfg, RunMode::DryRun).await,
        Command::Rules => {
            let rules = cfg.rules().context("invalid rule configuration")?;
            print!("{}", admin::format_rules(&rules));
            Ok(())
        }
        Command::History { active, json } => {
            let store = open_store(cfg)?;
            let now   = Utc::now();
            let records = if active {
                store.list_active(cfg.cooldown()?, now)?
            } else {
                store.list_all()?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if active {
                print!("{}", admin::format_active(&records, cfg.cooldown()?, now));
            } else {
                print!("{}", admin::format_history(&records));
            }
            Ok(())
        }
        Command::Clear { issue } => {
            let mut store = open_store(cfg)?;
            let removed = admin::clear(&mut store, issue.as_deref())?;
            println!("Removed {} history records", removed);
            Ok(())
        }
    }
}

fn open_store(cfg: &AppConfig) -> Result<HistoryStore> {
    HistoryStore::open(&cfg.history_file)
        .with_context(|| format!("failed to open history file {}", cfg.history_file.display()))
}

async fn run(cfg: &AppConfig, mode: RunMode) -> Result<()> {
    let rules    = cfg.rules().context("invalid rule configuration")?;
    let cooldown = cfg.cooldown()?;
    let creds    = Credentials::from_env();
    let jira     = JiraClient::new(creds.require_jira()?, cfg.http_timeout());
    let router   = Router::from_credentials(cfg, &creds, Some(&jira));
    let mut store = open_store(cfg)?;

    let mut engine = Engine::new(jira, router, cooldown);
    if let Some(url) = &creds.sumo_endpoint_url {
        engine = engine.with_sink(Arc::new(SumoLogicSink::new(url.clone(), cfg.http_timeout())));
    }

    let summary = engine.run(&rules, &mut store, Utc::now(), mode).await?;
    if summary.escalations_failed > 0 || summary.rules_failed > 0 {
        tracing::warn!(
            "{} rules could not be queried, {} escalations could not be delivered",
            summary.rules_failed, summary.escalations_failed
        );
    }
    Ok(())
}
