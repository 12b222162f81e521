//! Single-feature session orchestrator.
//!
//! Scope-checks a feature request, then drives one session through planning,
//! implementation and validation, logging every step to `.stint/log/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use stint::context_loader::{ContextBudget, ContextLoader};
use stint::core::relevance::KeywordRanker;
use stint::core::scope::{HeuristicScopeGuard, ScopeDecision, ScopeGuard};
use stint::core::types::{Feature, Outcome, SessionId};
use stint::error::OrchestratorError;
use stint::exit_codes;
use stint::io::config::{StintConfig, load_config};
use stint::io::init::{InitOptions, StintPaths, init_workspace};
use stint::io::log_store::{FileLogStore, LogStore};
use stint::logging;
use stint::looping::run_to_completion;
use stint::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "stint",
    version,
    about = "Single-feature session orchestrator for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.stint/` with a default config.
    Init {
        /// Overwrite the existing config. Session logs are kept.
        #[arg(short, long)]
        force: bool,
    },
    /// Check whether a request is a single feature, without starting a session.
    Scope(FeatureArgs),
    /// Start a session for the feature and drive it to a terminal state.
    Run(FeatureArgs),
    /// Print the log of a session, one JSON entry per line.
    Log {
        session_id: SessionId,
    },
    /// Print the memory bundle a new session for this feature would receive.
    Context(FeatureArgs),
}

#[derive(Args)]
struct FeatureArgs {
    /// Short description of the feature.
    description: String,
    /// Something the feature explicitly covers (repeatable).
    #[arg(long = "include")]
    includes: Vec<String>,
    /// Something the feature must not touch (repeatable).
    #[arg(long = "exclude")]
    excludes: Vec<String>,
    /// Tag used to recall related sessions (repeatable).
    #[arg(long = "tag")]
    tags: Vec<String>,
}

impl FeatureArgs {
    fn into_feature(self) -> Feature {
        Feature {
            description: self.description,
            includes: self.includes,
            excludes: self.excludes,
            tags: self.tags,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = workspace_root()?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Scope(args) => cmd_scope(&root, args.into_feature()),
        Command::Run(args) => cmd_run(&root, args.into_feature()),
        Command::Log { session_id } => cmd_log(&root, session_id),
        Command::Context(args) => cmd_context(&root, args.into_feature()),
    }
}

fn workspace_root() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("read current directory")?;
    cwd.canonicalize()
        .with_context(|| format!("resolve {}", cwd.display()))
}

fn load_workspace_config(root: &Path) -> Result<StintConfig> {
    load_config(&StintPaths::new(root).config_path)
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.stint_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_scope(root: &Path, feature: Feature) -> Result<i32> {
    let config = load_workspace_config(root)?;
    let guard = HeuristicScopeGuard {
        max_description_chars: config.scope.max_description_chars,
        max_split: config.scope.max_split,
    };
    let decision = guard.check(&feature);
    print_json(&decision)?;
    Ok(match decision {
        ScopeDecision::Approved => exit_codes::OK,
        ScopeDecision::Rejected(_) | ScopeDecision::Split(_) => exit_codes::SCOPE_REJECTED,
    })
}

#[derive(Serialize)]
struct Rejection<'a> {
    rejected: &'a str,
    split: &'a [Feature],
}

fn cmd_run(root: &Path, feature: Feature) -> Result<i32> {
    let config = load_workspace_config(root)?;
    let orchestrator = Orchestrator::from_config(root, &config)?;

    let handle = match orchestrator.start(feature) {
        Ok(handle) => handle,
        Err(OrchestratorError::ScopeRejected { reason, split }) => {
            print_json(&Rejection {
                rejected: &reason,
                split: &split,
            })?;
            return Ok(exit_codes::SCOPE_REJECTED);
        }
        Err(err) => return Err(err.into()),
    };
    eprintln!("session {}", handle.session_id);

    let outcome = run_to_completion(&orchestrator, handle.session_id, |status| {
        eprintln!("-> {} (attempt {})", status.state, status.attempts);
    })?;
    print_json(&outcome.status)?;
    Ok(match outcome.status.outcome {
        Outcome::Succeeded => exit_codes::OK,
        Outcome::Failed => exit_codes::FAILED,
        Outcome::Aborted => exit_codes::ABORTED,
        Outcome::Pending => exit_codes::INVALID,
    })
}

fn cmd_log(root: &Path, session_id: SessionId) -> Result<i32> {
    let store = FileLogStore::open(StintPaths::new(root).log_dir)?;
    let mut found = false;
    for entry in store.read_session(session_id)? {
        let entry = entry?;
        found = true;
        println!(
            "{}",
            serde_json::to_string(&entry).context("serialize log entry")?
        );
    }
    if !found {
        eprintln!("no log for session {session_id}");
        return Ok(exit_codes::INVALID);
    }
    Ok(exit_codes::OK)
}

fn cmd_context(root: &Path, feature: Feature) -> Result<i32> {
    let config = load_workspace_config(root)?;
    let store = FileLogStore::open(StintPaths::new(root).log_dir)?;
    let loader = ContextLoader::new(
        Arc::new(store),
        Arc::new(KeywordRanker::default()),
        ContextBudget {
            max_entries: config.context.max_entries,
            max_tokens: config.context.max_tokens,
        },
    );
    print_json(&loader.load(&feature)?)?;
    Ok(exit_codes::OK)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
