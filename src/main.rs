use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, trace};

use prdforge::app::{handle_fatal_error, init_logging, AppConfig};
use prdforge::config::CoordinatorConfig;
use prdforge::coordinator::{render_status, Coordinator};
use prdforge::subprocess::SubprocessManager;
use prdforge::supervisor::worker::{run_worker, WorkerArgs};

/// Run autonomous coding agents over PRDs in parallel git worktrees
#[derive(Parser)]
#[command(name = "prdforge", version)]
#[command(about = "Parallel execution coordinator for PRD-driven coding agents", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Repository to operate on (default: current directory)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator until interrupted
    Start {
        /// Maximum number of units running at once
        #[arg(short = 'j', long)]
        max_parallel: Option<usize>,

        /// Maximum number of concurrent agent invocations
        #[arg(long)]
        api_limit: Option<usize>,
    },
    /// Queue one or more PRD files
    Submit {
        #[arg(required = true)]
        prds: Vec<PathBuf>,
    },
    /// Show active, queued and finished units
    Status {
        /// Print the raw registry document as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop a running or queued unit
    Stop {
        /// Unit id as shown by `status`
        id: String,
    },
    /// Run a single unit's agent loop (launched by the coordinator)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        state_dir: PathBuf,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        workspace: PathBuf,
        #[arg(long)]
        resume_from: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let app_config = match AppConfig::new(verbose) {
        Ok(config) => config,
        Err(e) => handle_fatal_error(e, verbose),
    };
    let app_config = match &cli.repo {
        Some(repo) => app_config.with_repo_root(repo.clone()),
        None => app_config,
    };
    init_logging(&app_config);

    debug!("prdforge started with verbosity level: {}", verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    match run(cli.command, &app_config).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => handle_fatal_error(e, verbose),
    }
}

/// Execute a subcommand, returning the process exit code
async fn run(command: Commands, app_config: &AppConfig) -> anyhow::Result<i32> {
    match command {
        Commands::Start {
            max_parallel,
            api_limit,
        } => {
            let mut config = load_config(app_config)?;
            if let Some(max_parallel) = max_parallel {
                config.max_parallel = max_parallel;
            }
            if let Some(api_limit) = api_limit {
                config.api_limit = api_limit;
            }
            config.validate()?;
            coordinator(config, app_config)?.run().await?;
        }
        Commands::Submit { prds } => {
            let coordinator = coordinator(load_config(app_config)?, app_config)?;
            for prd in prds {
                let id = coordinator
                    .submit(&prd)
                    .await
                    .with_context(|| format!("Failed to submit {}", prd.display()))?;
                println!("Queued {id}");
            }
        }
        Commands::Status { json } => {
            let doc = coordinator(load_config(app_config)?, app_config)?
                .status()
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print!("{}", render_status(&doc));
            }
        }
        Commands::Stop { id } => {
            coordinator(load_config(app_config)?, app_config)?
                .stop_unit(&id)
                .await?;
            println!("Stopped {id}");
        }
        Commands::Worker {
            state_dir,
            unit,
            workspace,
            resume_from,
        } => {
            let outcome = run_worker(WorkerArgs {
                state_dir,
                unit_id: unit,
                workspace,
                resume_from,
            })
            .await?;
            return Ok(outcome.exit_code());
        }
    }
    Ok(0)
}

fn load_config(app_config: &AppConfig) -> anyhow::Result<CoordinatorConfig> {
    let repo_root = &app_config.repo_root;
    CoordinatorConfig::load(repo_root)
        .with_context(|| format!("Failed to load configuration for {}", repo_root.display()))
}

fn coordinator(config: CoordinatorConfig, app_config: &AppConfig) -> anyhow::Result<Coordinator> {
    Ok(Coordinator::new(
        config,
        &app_config.repo_root,
        SubprocessManager::production(),
    )?)
}
