//! Command-line utility for operating a spoolgate spool
//!
//! Works directly on the spool directories named in the config file, so it
//! can be used whether or not the daemon is running:
//! - Admitting a job from a JSON request file
//! - Listing jobs per state and showing counts
//! - Resubmitting failed jobs
//! - Running a retention sweep on demand

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use spoolgate_spool::{EmailRequest, EnqueueStatus, SpoolState};

/// Command-line utility for operating a spoolgate spool
#[derive(Parser, Debug)]
#[command(name = "spoolgatectl")]
#[command(about = "Manage a spoolgate spool", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the spoolgate config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show job counts per state
    Stats,
    /// Admit an email request read from a JSON file
    Enqueue {
        /// Request file, `-` for stdin
        file: PathBuf,

        /// Source address recorded with the job
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
    },
    /// List the jobs in one state, oldest first
    List {
        #[arg(value_enum)]
        state: StateArg,
    },
    /// Put a failed job back in the queue
    Resubmit {
        /// File name under failed/
        filename: String,
    },
    /// Run one retention pass now
    Sweep,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Queued,
    Sent,
    Failed,
}

impl From<StateArg> for SpoolState {
    fn from(state: StateArg) -> Self {
        match state {
            StateArg::Queued => Self::Queued,
            StateArg::Sent => Self::Sent,
            StateArg::Failed => Self::Failed,
        }
    }
}

fn read_request(file: &Path) -> anyhow::Result<EmailRequest> {
    let content = if file.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin()).context("Failed to read request from stdin")?
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read request from {}", file.display()))?
    };

    serde_json::from_str(&content).context("Request is not a valid email request")
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path =
        spoolgate::config::find_config_file(cli.config.as_deref(), |key| std::env::var(key).ok())?;
    let config = spoolgate::config::load(&config_path)?;
    let store = config.open_store().await?;

    match cli.command {
        Commands::Stats => print_json(&store.stats().await)?,
        Commands::Enqueue { file, ip } => {
            let request = read_request(&file)?.normalize();
            request
                .validate(&config.spool)
                .context("Request rejected")?;

            let outcome = store.enqueue(request, &ip).await?;
            print_json(&outcome)?;

            if outcome.status == EnqueueStatus::Duplicate {
                eprintln!("Request {} was already delivered", outcome.request_id);
            }
        }
        Commands::List { state } => {
            let jobs = store.list(state.into()).await?;
            for job in &jobs {
                println!("{}", job.id);
            }
            eprintln!("{} job(s)", jobs.len());
        }
        Commands::Resubmit { filename } => {
            let outcome = store
                .resubmit_failed(&filename)
                .await
                .with_context(|| format!("Cannot resubmit {filename}"))?;
            print_json(&outcome)?;
        }
        Commands::Sweep => {
            let report = config.sweeper(store).sweep_once(chrono::Utc::now()).await;
            print_json(&report)?;
        }
    }

    Ok(())
}
