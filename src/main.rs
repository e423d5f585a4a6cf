use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pipewright::config::Settings;
use pipewright::logging::{LogFormat, init_logging};

mod cmd;

use cmd::approvals::ApprovalsAction;
use cmd::run::RunAction;
use cmd::toggles::TogglesAction;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version, about = "Durable, approval-gated orchestrator for an eight-phase content pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file (defaults to ./pipewright.toml when present)
    #[arg(long, global = true, env = "PIPEWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path; overrides [database] path
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database, seed phase toggles and write pipewright.toml
    Init,
    /// Serve the HTTP API (and, unless --no-workers, the dispatch workers)
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Allow cross-origin requests from any origin
        #[arg(long)]
        cors: bool,
        /// Only serve the API; run `pipewright worker` separately
        #[arg(long)]
        no_workers: bool,
    },
    /// Run dispatch workers until Ctrl+C
    Worker {
        #[arg(long)]
        workers: Option<usize>,
        /// Process every queued task once, then exit
        #[arg(long)]
        drain: bool,
    },
    /// Create, inspect and control pipeline runs
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Review phase outputs waiting for sign-off
    Approvals {
        #[command(subcommand)]
        command: ApprovalsCommands,
    },
    /// Per-phase approval toggles
    Toggles {
        #[command(subcommand)]
        command: TogglesCommands,
    },
}

#[derive(Subcommand)]
pub enum RunCommands {
    /// Create a pending run
    Create {
        subject: String,
        #[arg(long)]
        topic: Option<String>,
        /// Run config as a JSON object, e.g. '{"approval_overrides": {"2": false}}'
        #[arg(long = "config-json")]
        config_json: Option<String>,
        /// Queue the start immediately
        #[arg(long)]
        start: bool,
    },
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    Show {
        id: i64,
    },
    /// Queue (or with --inline, run here) the start of a pending run
    Start {
        id: i64,
        #[arg(long)]
        inline: bool,
    },
    /// Mark a run failed
    Stop {
        id: i64,
    },
    /// Return a failed run to pending
    Restart {
        id: i64,
    },
    /// Open a new attempt for a rejected phase of a paused run
    Retry {
        id: i64,
        phase: u32,
        #[arg(long)]
        inline: bool,
    },
}

#[derive(Subcommand)]
pub enum ApprovalsCommands {
    /// List pending approvals
    List,
    Show {
        id: i64,
    },
    /// Approve, reject or edit a phase output
    Resolve {
        id: i64,
        /// approved | rejected | edited
        decision: String,
        #[arg(long)]
        notes: Option<String>,
        /// Replacement output as JSON, or @path to a JSON file
        #[arg(long)]
        edited_output: Option<String>,
        /// Resume the run in this process instead of queueing it
        #[arg(long)]
        inline: bool,
    },
}

#[derive(Subcommand)]
pub enum TogglesCommands {
    List,
    Set {
        phase: u32,
        #[arg(long)]
        requires_approval: Option<bool>,
        #[arg(long)]
        enabled: Option<bool>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(path) = cli.db_path {
        settings.database.path = path;
    }
    if let Some(format) = cli.log_format {
        settings.logging.format = format;
    }
    settings.validate()?;
    init_logging(settings.logging.format, cli.verbose);

    match cli.command {
        Commands::Init => cmd::cmd_init(&settings)?,
        Commands::Serve {
            host,
            port,
            cors,
            no_workers,
        } => cmd::cmd_serve(settings, host, port, cors, no_workers).await?,
        Commands::Worker { workers, drain } => cmd::cmd_worker(settings, workers, drain).await?,
        Commands::Run { command } => {
            let action = match command {
                RunCommands::Create {
                    subject,
                    topic,
                    config_json,
                    start,
                } => RunAction::Create {
                    subject,
                    topic,
                    config: config_json,
                    start,
                },
                RunCommands::List { status, limit } => RunAction::List { status, limit },
                RunCommands::Show { id } => RunAction::Show { id },
                RunCommands::Start { id, inline } => RunAction::Start { id, inline },
                RunCommands::Stop { id } => RunAction::Stop { id },
                RunCommands::Restart { id } => RunAction::Restart { id },
                RunCommands::Retry { id, phase, inline } => RunAction::Retry { id, phase, inline },
            };
            cmd::cmd_run(&settings, action).await?
        }
        Commands::Approvals { command } => {
            let action = match command {
                ApprovalsCommands::List => ApprovalsAction::List,
                ApprovalsCommands::Show { id } => ApprovalsAction::Show { id },
                ApprovalsCommands::Resolve {
                    id,
                    decision,
                    notes,
                    edited_output,
                    inline,
                } => ApprovalsAction::Resolve {
                    id,
                    decision,
                    notes,
                    edited_output,
                    inline,
                },
            };
            cmd::cmd_approvals(&settings, action).await?
        }
        Commands::Toggles { command } => {
            let action = match command {
                TogglesCommands::List => TogglesAction::List,
                TogglesCommands::Set {
                    phase,
                    requires_approval,
                    enabled,
                } => TogglesAction::Set {
                    phase,
                    requires_approval,
                    enabled,
                },
            };
            cmd::cmd_toggles(&settings, action)?
        }
    }

    Ok(())
}
