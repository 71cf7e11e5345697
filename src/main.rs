//! Jobwright - process execution on Kubernetes Jobs

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jobwright::config::NotebookProcessorConfig;
use jobwright::manager::{DeleteOutcome, ExecutionMode, JobStatus, KubernetesManager};
use jobwright::processor::{NotebookProcessor, ProcessRequest};
use jobwright::progress::{ProgressReporter, UnitCompleteHandler};
use jobwright::results::ResultPayload;

/// Jobwright - submit, poll, fetch and cancel processes as Kubernetes Jobs
#[derive(Parser, Debug)]
#[command(name = "jobwright", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a process execution
    Submit(SubmitArgs),

    /// Show the current status of a job
    Status {
        /// Job identifier returned by submit
        job_id: String,
    },

    /// List managed jobs in the namespace
    List {
        /// Only jobs owned by this process
        #[arg(long)]
        process_id: Option<String>,

        /// Only jobs in this status (accepted, running, successful,
        /// failed, dismissed)
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Fetch the result of a finished job
    Result {
        /// Job identifier returned by submit
        job_id: String,

        /// Write the payload to this file instead of stdout.
        ///
        /// Required for binary results.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete a job and its output artifact
    Delete {
        /// Job identifier returned by submit
        job_id: String,
    },

    /// Report a completed unit of work for the surrounding job.
    ///
    /// Only meaningful inside a job pod: reads JOB_NAME and
    /// PROGRESS_ANNOTATION from the environment.
    ReportProgress {
        /// Units completed so far
        completed: usize,
        /// Total number of units
        total: usize,
    },
}

/// Submit mode arguments
#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Path to the processor YAML configuration file
    #[arg(short = 'f', long = "config", env = "JOBWRIGHT_CONFIG")]
    config_file: PathBuf,

    /// Input notebook path, relative to the container home
    #[arg(long)]
    notebook: String,

    /// Execution parameters as base64-encoded YAML
    #[arg(long)]
    parameters: Option<String>,

    /// Execution parameters as inline JSON
    #[arg(long, conflicts_with = "parameters")]
    parameters_json: Option<String>,

    /// Kernel override
    #[arg(long)]
    kernel: Option<String>,

    /// Explicit output filename
    #[arg(long)]
    output_filename: Option<String>,

    /// CPU limit, e.g. "2"
    #[arg(long)]
    cpu_limit: Option<String>,

    /// Memory limit, e.g. "4Gi"
    #[arg(long)]
    mem_limit: Option<String>,

    /// CPU request
    #[arg(long)]
    cpu_requests: Option<String>,

    /// Memory request
    #[arg(long)]
    mem_requests: Option<String>,

    /// Block until the job finishes instead of returning immediately
    #[arg(long)]
    wait: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit(args) => run_submit(args).await,
        Commands::Status { job_id } => run_status(&job_id).await,
        Commands::List { process_id, status } => run_list(process_id.as_deref(), status).await,
        Commands::Result { job_id, output } => run_result(&job_id, output).await,
        Commands::Delete { job_id } => run_delete(&job_id).await,
        Commands::ReportProgress { completed, total } => run_report_progress(completed, total).await,
    }
}

async fn manager() -> anyhow::Result<KubernetesManager> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    Ok(KubernetesManager::new(client))
}

async fn run_submit(args: SubmitArgs) -> anyhow::Result<()> {
    let config_content = tokio::fs::read_to_string(&args.config_file)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", args.config_file, e))?;
    let config: NotebookProcessorConfig = serde_yaml::from_str(&config_content)
        .map_err(|e| anyhow::anyhow!("Failed to parse processor config: {}", e))?;
    let processor = NotebookProcessor::new(config)?;

    let parameters_json = args
        .parameters_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid --parameters-json: {}", e))?;

    let request = ProcessRequest {
        notebook: args.notebook,
        parameters: args.parameters,
        parameters_json,
        kernel: args.kernel,
        output_filename: args.output_filename,
        cpu_limit: args.cpu_limit,
        mem_limit: args.mem_limit,
        cpu_requests: args.cpu_requests,
        mem_requests: args.mem_requests,
    };

    let mode = if args.wait {
        ExecutionMode::Sync
    } else {
        ExecutionMode::Async
    };

    let manager = manager().await?;
    let job = manager.execute(&processor, &request, mode).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn run_status(job_id: &str) -> anyhow::Result<()> {
    let job = manager().await?.get_job(job_id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn run_list(process_id: Option<&str>, status: Option<JobStatus>) -> anyhow::Result<()> {
    let jobs = manager().await?.get_jobs(process_id, status).await?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}

async fn run_result(job_id: &str, output: Option<PathBuf>) -> anyhow::Result<()> {
    let result = manager().await?.get_job_result(job_id).await?;
    match (result.payload, output) {
        (ResultPayload::Json(value), None) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        (ResultPayload::Json(value), Some(path)) => {
            tokio::fs::write(&path, serde_json::to_vec_pretty(&value)?).await?;
            eprintln!("result written to {}", path.display());
        }
        (ResultPayload::Binary(bytes), Some(path)) => {
            tokio::fs::write(&path, bytes).await?;
            if let Some(mime) = result.mime_type {
                eprintln!("result ({mime}) written to {}", path.display());
            }
        }
        (ResultPayload::Binary(_), None) => {
            anyhow::bail!("result is binary; use --output to write it to a file");
        }
    }
    Ok(())
}

async fn run_delete(job_id: &str) -> anyhow::Result<()> {
    match manager().await?.delete_job(job_id).await? {
        DeleteOutcome::Deleted => println!("deleted"),
        DeleteOutcome::AlreadyGone => println!("already gone"),
    }
    Ok(())
}

async fn run_report_progress(completed: usize, total: usize) -> anyhow::Result<()> {
    let mut reporter = ProgressReporter::from_env().await?;
    reporter.unit_complete(completed, total).await?;
    Ok(())
}
