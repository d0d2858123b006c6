//! Skillflow CLI - Entry Point
//!
//! Commands:
//! - select: rank candidate skills for an intent
//! - run: execute a skill spec and record the outcome
//! - stats: rolling fidelity statistics for a skill
//! - record: append an externally scored outcome

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use serde_json::Value;
use skillflow::{
    AutoApprove, Confirmer, Context, EngineConfig, FidelityAggregator, FidelityStatsSource, HybridExecutor,
    SkillCatalog, SkillEngine, SkillSpecification, SqliteLedger,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

fn print_help() {
    println!("Skillflow v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: skillflow <COMMAND> [ARGS]");
    println!();
    println!("Commands:");
    println!("  select <skill>... [--intent TEXT] [--max-branches N]");
    println!("                             Rank candidate skills");
    println!("  run <spec|name> [key=value]... [--yes] [--timeout SECS]");
    println!("                             Execute a skill and record the outcome");
    println!("  stats <skill> [--window DAYS]");
    println!("                             Show fidelity statistics");
    println!("  record <skill> <fidelity>  Record an externally scored outcome");
    println!("  --help, -h                 Show this help");
    println!();
    println!("Environment variables:");
    println!("  SKILLFLOW_DB_PATH          Outcome ledger (default: <local data dir>/skillflow/outcomes.db)");
    println!("  SKILLFLOW_SKILLS_DIR       Skill specifications (default: ./skills)");
    println!("  SKILLFLOW_WINDOW_DAYS      Stats window (default: 30)");
    println!("  SKILLFLOW_MAX_BRANCHES     Candidates per selection (default: 5)");
    println!("  SKILLFLOW_MIN_EXECUTIONS   History for a confident lone pick (default: 5)");
    println!("  SKILLFLOW_DEFAULT_TIMEOUT  Shell action timeout in seconds (default: 30)");
    println!("  SKILLFLOW_WEIGHTS          fidelity,success,trend,context (default: 0.6,0.2,0.1,0.1)");
    println!("  SKILLFLOW_MAX_OUTPUT_BYTES Stdout capture cap (default: 1048576)");
    println!("  SKILLFLOW_LOG_JSON         Log as JSON when set to 1");
}

/// Asks on the terminal before a gated command runs
struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, command: &str) -> bool {
        eprint!("Run `{}`? [y/N] ", command);
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        match reader.read_line(&mut line).await {
            Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

/// Remove `--flag VALUE` from `args`, returning the value
fn take_option(args: &mut Vec<String>, flag: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{} needs a value", flag);
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

/// Remove a boolean `--flag` from `args`
fn take_flag(args: &mut Vec<String>, flag: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != flag);
    args.len() != before
}

/// `key=value` pairs; values that parse as JSON keep their type
fn parse_input(pairs: &[String]) -> Result<Context> {
    let mut input = Context::new();
    for pair in pairs {
        let (key, raw) = pair
            .split_once('=')
            .with_context(|| format!("Expected key=value, got '{}'", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        input.insert(key.to_string(), value);
    }
    Ok(input)
}

fn open_engine(config: &EngineConfig) -> Result<SkillEngine> {
    let ledger = Arc::new(SqliteLedger::open(&config.db_path)?);
    let catalog = if config.skills_dir.is_dir() {
        SkillCatalog::load_dir(&config.skills_dir)?
    } else {
        warn!("Skills directory {} not found", config.skills_dir.display());
        SkillCatalog::new()
    };

    Ok(SkillEngine::new(catalog, ledger).with_selector_config(config.selector_config()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    // stdout carries command output, so logs go to stderr
    if std::env::var("SKILLFLOW_LOG_JSON").map(|v| v == "1").unwrap_or(false) {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = EngineConfig::from_env()?;
    let command = args.remove(0);

    match command.as_str() {
        "select" => {
            let intent = take_option(&mut args, "--intent")?;
            let max_branches = take_option(&mut args, "--max-branches")?
                .map(|n| n.parse::<usize>().context("--max-branches must be a number"))
                .transpose()?;
            if args.is_empty() {
                bail!("select needs at least one skill name");
            }

            let engine = open_engine(&config)?;
            let mut context = Context::new();
            if let Some(intent) = intent {
                context.insert("intent".to_string(), Value::String(intent));
            }

            let selection = engine.selector().select_with_branches(
                args.as_slice(),
                &context,
                max_branches.unwrap_or(config.max_branches),
            )?;
            print_json(&selection)?;
        }
        "run" => {
            let yes = take_flag(&mut args, "--yes");
            let timeout = take_option(&mut args, "--timeout")?
                .map(|s| s.parse::<u64>().context("--timeout must be whole seconds"))
                .transpose()?;
            if args.is_empty() {
                bail!("run needs a spec file or skill name");
            }
            let target = args.remove(0);
            let input = parse_input(&args)?;

            let engine = open_engine(&config)?;
            let confirmer: Arc<dyn Confirmer> = if yes {
                Arc::new(AutoApprove)
            } else {
                Arc::new(StdinConfirmer)
            };
            let executor = HybridExecutor::new()
                .with_confirmer(confirmer)
                .with_shell_config(config.shell_config());
            let mut engine = engine.with_executor(executor);
            if let Some(secs) = timeout {
                engine = engine.with_deadline(Duration::from_secs(secs));
            }

            let path = Path::new(&target);
            let result = if path.is_file() {
                let spec = SkillSpecification::load(path)?;
                info!("Running {} from {}", spec.name, path.display());
                engine.execute(&spec, input).await?
            } else {
                engine.run_skill(&target, input).await?
            };

            print_json(&result)?;
            if !result.success {
                std::process::exit(1);
            }
        }
        "stats" => {
            let window = take_option(&mut args, "--window")?
                .map(|d| d.parse::<u32>().context("--window must be a number of days"))
                .transpose()?
                .unwrap_or(config.window_days);
            let Some(skill) = args.first() else {
                bail!("stats needs a skill name");
            };

            let ledger = Arc::new(SqliteLedger::open(&config.db_path)?);
            let stats = FidelityAggregator::new(ledger).stats(skill, window)?;
            print_json(&stats)?;
        }
        "record" => {
            let [skill, fidelity] = args.as_slice() else {
                bail!("usage: skillflow record <skill> <fidelity>");
            };
            let fidelity: f64 = fidelity.parse().context("fidelity must be a number")?;

            let engine = open_engine(&config)?;
            engine.record_feedback(skill, fidelity)?;
            info!("Recorded {:.2} for {}", fidelity, skill);
        }
        other => {
            print_help();
            bail!("Unknown command: {}", other);
        }
    }

    Ok(())
}
