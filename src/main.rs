use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use agentcore::config::LogFormat;
use agentcore_common::JobStatus;

mod cmd;

#[derive(Parser)]
#[command(name = "agentcore")]
#[command(version, about = "Run coding-agent jobs against cached repository clones")]
pub struct Cli {
    /// Path to config.toml (defaults to ~/.agentcore/config.toml)
    #[arg(long, global = true, env = "AGENTCORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(
        long,
        global = true,
        value_enum,
        env = "AGENTCORE_LOG_FORMAT",
        default_value = "compact"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST server and job runner
    Serve,
    /// Submit a job to a running server
    Run {
        /// Task prompt for the agent
        task: String,

        /// Repository URL to clone and work in
        #[arg(short, long)]
        repo: Option<String>,

        /// Profile name (server default when omitted)
        #[arg(short, long)]
        profile: Option<String>,

        /// Base branch for the pull request
        #[arg(long)]
        base_ref: Option<String>,

        /// Block until the job finishes
        #[arg(short, long)]
        wait: bool,

        /// Resume an earlier agent session
        #[arg(long)]
        session_id: Option<String>,

        /// Print the job record as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recent jobs
    Jobs {
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only jobs in this state (queued, running, succeeded, failed, cancelled, expired)
        #[arg(short, long)]
        status: Option<JobStatus>,
    },
    /// Show one job
    Job {
        id: String,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a queued or running job
    Cancel { id: String },
    /// List available profiles
    Profiles,
    /// Show server health
    Status,
    /// Stop accepting jobs on this worker and wait for running ones
    Drain {
        /// Seconds to wait for running jobs
        #[arg(long, default_value = "300")]
        timeout: u64,
    },
    /// Show the effective configuration
    Config,
    /// Prepare a shared filesystem layout with the bundled profiles
    InitSharedFs {
        /// Root of the shared volume (defaults to ~/.agentcore)
        #[arg(long)]
        shared_root: Option<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentcore=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if matches!(cli.command, Commands::Serve) {
        // Must happen before config reads the environment.
        dotenvy::dotenv().ok();
    }
    init_tracing(cli.log_format);

    let config_path = cli.config.as_deref();
    match &cli.command {
        Commands::Serve => cmd::cmd_serve(config_path).await?,
        Commands::Run {
            task,
            repo,
            profile,
            base_ref,
            wait,
            session_id,
            json,
        } => {
            let request = agentcore_common::SubmitJobRequest {
                task: task.clone(),
                repo_url: repo.clone(),
                profile: profile.clone(),
                base_ref: base_ref.clone(),
                wait: *wait,
                session_id: session_id.clone(),
            };
            cmd::cmd_run(request, *json).await?
        }
        Commands::Jobs { limit, status } => cmd::cmd_jobs(*limit, *status).await?,
        Commands::Job { id, json } => cmd::cmd_job(id, *json).await?,
        Commands::Cancel { id } => cmd::cmd_cancel(id).await?,
        Commands::Profiles => cmd::cmd_profiles().await?,
        Commands::Status => cmd::cmd_status().await?,
        Commands::Drain { timeout } => cmd::cmd_drain(config_path, *timeout).await?,
        Commands::Config => cmd::cmd_config(config_path)?,
        Commands::InitSharedFs { shared_root } => {
            cmd::cmd_init_shared_fs(shared_root.as_deref())?
        }
    }

    Ok(())
}
