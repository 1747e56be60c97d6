//! Thin CLI wrapper over the engine.
//!
//! Exit codes are the engine contract: 0 success, 2 lock held, 3 config
//! invalid, 4 verify failed during the run, 5 LM unavailable, 1 other.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use evonest::config::update_project_config;
use evonest::{
    AnalyzeOptions, Engine, EngineError, EvolveOptions, ImproveOptions, Level, ProjectState,
    RuntimeOverrides, RunSummary,
};

#[derive(Parser)]
#[command(name = "evonest", about = "Autonomous evolution engine", version)]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Level preset override (quick | standard | deep).
    #[arg(long, global = true)]
    level: Option<String>,

    /// Dotted-key config overrides for this run, e.g. --set verify.test="cargo test".
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    set: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create .evonest/ with starter state.
    Init,
    /// Observe-only cycles; improvements land as proposal files.
    Analyze {
        #[arg(long)]
        cycles: Option<u32>,
        /// Run one observe per enabled persona, in id order.
        #[arg(long)]
        all_personas: bool,
    },
    /// Execute an existing proposal (Execute + Verify only).
    Improve {
        /// Proposal filename or unique prefix; omits to auto-pick the oldest.
        #[arg(long)]
        proposal: Option<String>,
        /// Keep going until the pending proposal queue is empty.
        #[arg(long)]
        all: bool,
    },
    /// Full Observe → Plan → Execute → Verify cycles.
    Evolve {
        #[arg(long)]
        cycles: Option<u32>,
        /// Suspend after Plan for human review; resume with `resume`.
        #[arg(long)]
        cautious: bool,
        /// Deterministic persona sweep instead of weighted sampling.
        #[arg(long)]
        all_personas: bool,
    },
    /// Resume a cautious run paused after Plan.
    Resume,
    /// Read or write project configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set one dotted key, e.g. `config set verify.test "cargo test -q"`.
    Set { key: String, value: String },
    /// Print the resolved configuration.
    Show,
}

fn runtime_overrides(cli: &Cli) -> Result<RuntimeOverrides, EngineError> {
    let level = cli
        .level
        .as_deref()
        .map(str::parse::<Level>)
        .transpose()?;
    let mut set = BTreeMap::new();
    for entry in &cli.set {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            EngineError::config(format!("--set expects KEY=VALUE, got {entry:?}"))
        })?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        set.insert(key.to_string(), value);
    }
    Ok(RuntimeOverrides { level, set })
}

async fn run(cli: Cli) -> Result<Option<RunSummary>, EngineError> {
    let project = cli
        .project
        .clone()
        .unwrap_or(std::env::current_dir().map_err(EngineError::from)?);

    if matches!(cli.command, Command::Init) {
        ProjectState::init_project(&project)?;
        println!("initialized {}", project.join(".evonest").display());
        return Ok(None);
    }

    if let Command::Config { action } = &cli.command {
        let state = ProjectState::open(&project)?;
        match action {
            ConfigAction::Set { key, value } => {
                update_project_config(&state, key, value)?;
                println!("{key} updated");
            }
            ConfigAction::Show => {
                let config = evonest::EngineConfig::load(
                    &state,
                    &runtime_overrides(&cli)?,
                    &evonest::EnvOverrides::from_env(),
                )?;
                let rendered = serde_json::to_string_pretty(&config)
                    .map_err(|e| EngineError::config(e.to_string()))?;
                println!("{rendered}");
            }
        }
        return Ok(None);
    }

    let overrides = runtime_overrides(&cli)?;
    let engine = Engine::open(&project, &overrides)?;

    // SIGINT releases the lock by unwinding the run at the next phase
    // boundary; a mid-phase LM child is terminated by its runner.
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing at the next phase boundary");
            cancel.cancel();
        }
    });

    let summary = match cli.command {
        Command::Analyze {
            cycles,
            all_personas,
        } => {
            engine
                .analyze(AnalyzeOptions {
                    cycles,
                    all_personas,
                })
                .await?
        }
        Command::Improve { proposal, all } => {
            engine.improve(ImproveOptions { proposal, all }).await?
        }
        Command::Evolve {
            cycles,
            cautious,
            all_personas,
        } => {
            engine
                .evolve(EvolveOptions {
                    cycles,
                    cautious,
                    all_personas,
                })
                .await?
        }
        Command::Resume => engine.resume().await?,
        Command::Init | Command::Config { .. } => unreachable!("handled above"),
    };

    for line in &summary.status_lines {
        println!("{line}");
    }
    println!("{}", summary.headline());
    Ok(Some(summary))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(Some(summary)) if summary.any_failed() => ExitCode::from(4),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
