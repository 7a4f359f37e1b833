use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use repocast::ai::CommandGenerator;
use repocast::cancel::CancelToken;
use repocast::config::{ConfigError, SyncConfig};
use repocast::forge::gh::GhForge;
use repocast::git::CliGit;
use repocast::state::PrStateDiscoverer;
use repocast::sync::engine::{Engine, EngineError};

#[derive(Parser)]
#[command(name = "repocast")]
#[command(about = "Broadcast template files across a fleet of repositories via pull requests")]
#[command(version)]
struct Cli {
    /// Path to the sync manifest (YAML or TOML)
    #[arg(short, long, global = true, default_value = "repocast.yaml")]
    config: String,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every configured target and open/update PRs
    Sync {
        /// Only sync this target repository (owner/name)
        #[arg(long)]
        target: Option<String>,

        /// Only run these groups (repeatable)
        #[arg(long)]
        group: Vec<String>,

        /// Log planned operations without pushing or opening PRs
        #[arg(long)]
        dry_run: bool,

        /// Sync even when targets look up to date
        #[arg(long)]
        force: bool,

        /// Override max concurrent targets
        #[arg(long)]
        jobs: Option<usize>,

        /// Override the per-target file worker pool size
        #[arg(long)]
        workers: Option<usize>,

        /// Command used to generate commit messages and PR bodies (reads the
        /// prompt on stdin, prints the message)
        #[arg(long)]
        llm_command: Option<String>,
    },
    /// Load and validate the manifest, then print a summary
    Validate,
    /// Discover and print per-target sync status without changing anything
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    let config = match SyncConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::Validate => {
            let targets: usize = config.groups.iter().map(|g| g.targets.len()).sum();
            println!(
                "{}: {} groups, {} targets, ok",
                cli.config,
                config.groups.len(),
                targets
            );
            ExitCode::SUCCESS
        }
        Commands::Status => run_status(config),
        Commands::Sync {
            target,
            group,
            dry_run,
            force,
            jobs,
            workers,
            llm_command,
        } => run_sync(config, target, group, dry_run, force, jobs, workers, llm_command),
    }
}

fn build_engine(config: SyncConfig) -> Result<Engine, EngineError> {
    let forge = Arc::new(GhForge::new());
    let git = Arc::new(CliGit::new());
    let discoverer = Arc::new(PrStateDiscoverer::new(forge.clone()));
    Engine::new(config, forge, git, discoverer)
}

fn root_token(config: &SyncConfig) -> Result<CancelToken, ConfigError> {
    let token = CancelToken::with_timeout(config.settings.timeout()?);
    let handler = token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        log::warn!("interrupt received, cancelling");
        handler.cancel();
    }) {
        log::debug!("could not install interrupt handler: {e}");
    }
    Ok(token)
}

fn run_status(config: SyncConfig) -> ExitCode {
    let token = match root_token(&config) {
        Ok(token) => token,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };
    let engine = match build_engine(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    match engine.discover_state(&token) {
        Ok(state) => {
            for (repo, source) in &state.sources {
                println!(
                    "source {repo}@{}: {}",
                    source.branch,
                    &source.latest_commit[..source.latest_commit.len().min(8)]
                );
            }
            for (repo, target) in &state.targets {
                let last = target.last_sync_commit.as_deref().unwrap_or("-");
                println!("target {repo}: {} (last sync {last})", target.status);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_sync(
    mut config: SyncConfig,
    target: Option<String>,
    groups: Vec<String>,
    dry_run: bool,
    force: bool,
    jobs: Option<usize>,
    workers: Option<usize>,
    llm_command: Option<String>,
) -> ExitCode {
    config.settings.dry_run |= dry_run;
    config.settings.force |= force;
    if let Some(jobs) = jobs {
        config.settings.max_concurrency = jobs;
    }
    if let Some(workers) = workers {
        config.settings.worker_count = workers;
    }
    if !groups.is_empty() {
        config.settings.group_filter = groups;
    }

    let token = match root_token(&config) {
        Ok(token) => token,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    let mut engine = match build_engine(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    if let Some(command) = llm_command {
        let generator = Arc::new(CommandGenerator::new(command, Vec::new()));
        engine = engine
            .with_commit_generator(generator.clone())
            .with_pr_body_generator(generator);
    }

    match engine.sync(&token, target.as_deref()) {
        Ok(report) => {
            println!("{report}");
            for (task_id, error) in report.errors() {
                eprintln!("{task_id}: {error}");
            }
            if report.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(EngineError::Config(e)) => {
            eprintln!("{e}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
