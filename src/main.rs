use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mapred::config::JobConfig;
use mapred::coordinator::JobDriver;
use mapred::error::MapredErrorTrait;
use mapred::tasks::TaskFactory;
use mapred::worker::{WorkerServer, WorkerServerConfig};

#[derive(Parser)]
#[command(
    name = "mapred",
    version,
    about = "Fault-tolerant Map/Reduce coordinator and worker",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the job file
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job described by a TOML file
    Run {
        /// Job configuration file
        #[arg(short, long, default_value = "job.toml")]
        config: PathBuf,

        /// Print the job report as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Serve map/reduce calls
    Worker {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:50051")]
        listen: SocketAddr,

        /// Probability that a map task is artificially delayed
        #[arg(long, default_value = "0.0")]
        slow_probability: f64,

        /// Delay applied to a slowed map task
        #[arg(long, default_value = "10000")]
        slow_delay_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, json } => {
            let job = JobConfig::from_file(&config)?;
            let format = cli.log_format.as_deref().unwrap_or(&job.logging.format);
            setup_tracing(format, &job.logging.level, cli.verbose)?;
            init_metrics();

            tracing::info!(config = %config.display(), job_id = %job.job_id, "Starting run command");
            run(job, json).await?;
        }

        Commands::Worker {
            listen,
            slow_probability,
            slow_delay_ms,
        } => {
            setup_tracing(cli.log_format.as_deref().unwrap_or("text"), "info", cli.verbose)?;
            init_metrics();

            tracing::info!(
                listen = %listen,
                slow_probability = %slow_probability,
                slow_delay_ms = %slow_delay_ms,
                "Starting worker command"
            );
            worker(listen, slow_probability, Duration::from_millis(slow_delay_ms)).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let default_directives = if verbose {
        String::from("mapred=debug,info")
    } else {
        format!("mapred={level},warn")
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&default_directives))
        .with_context(|| format!("Invalid log filter: {default_directives}"))?;

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn init_metrics() {
    if let Err(e) = mapred::metrics::init_metrics() {
        tracing::warn!(error = %e, "Failed to initialize metrics");
    }
}

async fn run(job: JobConfig, json: bool) -> Result<()> {
    let mut driver = JobDriver::from_config(job).context("Failed to set up job")?;

    let report = tokio::select! {
        result = driver.run() => match result {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(
                    category = e.category().as_str(),
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Job failed"
                );
                return Err(anyhow::Error::new(e).context("Job failed"));
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, abandoning job");
            anyhow::bail!("job interrupted");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
        for path in &report.output_files {
            println!("  {}", path.display());
        }
    }
    Ok(())
}

async fn worker(listen: SocketAddr, slow_probability: f64, slow_delay: Duration) -> Result<()> {
    let config = WorkerServerConfig::new(listen).with_slow_worker(slow_probability, slow_delay);
    let server = WorkerServer::new(config, TaskFactory::with_builtins())?;

    server
        .start_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;
    Ok(())
}
