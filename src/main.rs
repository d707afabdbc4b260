use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use qspool::config::{DispatchStrategy, SpoolConfig, TemplateConfig};
use qspool::dispenser::request_job;
use qspool::shutdown::install_shutdown_handler;
use qspool::{Spool, SpoolStatus};

#[derive(Parser, Debug)]
#[command(name = "qspool")]
#[command(version)]
#[command(about = "Submit per-file batch jobs with throttling and limits")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Queue every file under a directory and run the target script on each
    Run(RunArgs),

    /// Claim one work item from a running spool and print its path
    Getjob {
        /// Dispenser address (host:port)
        #[arg(long, short = 'a', default_value = "127.0.0.1:8002")]
        addr: SocketAddr,
    },
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Script to run on each file; receives the file path as its only argument
    #[arg(long, short = 's')]
    script: Option<PathBuf>,

    /// Only queue files whose full path matches this regular expression
    #[arg(long, short = 'p')]
    pattern: Option<String>,

    /// Maximum number of concurrently running jobs
    #[arg(long, short = 'm', default_value = "50")]
    max_jobs: usize,

    /// Port the work dispenser listens on
    #[arg(long, short = 'P', default_value = "8002")]
    port: u16,

    /// Keep generated submission scripts
    #[arg(long, short = 'k')]
    keep: bool,

    /// Verbose logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// How jobs are launched
    #[arg(long, default_value = "array")]
    strategy: Strategy,

    /// Seconds to let the queue settle after a change (at least 1)
    #[arg(long, default_value = "3")]
    settle: u64,

    /// Seconds to pause between dispatch batches (at least 1)
    #[arg(long, default_value = "10")]
    pause: u64,

    /// Submission script template replacing the built-in one
    #[arg(long, short = 't')]
    template: Option<PathBuf>,

    /// Directory searched for templates before the built-in ones
    #[arg(long)]
    template_dir: Option<PathBuf>,

    /// Directory for generated scripts (defaults to the system temp dir)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Host name array tasks use to reach the dispenser
    #[arg(long)]
    host: Option<String>,

    /// Summary format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Directory searched recursively for files to process
    #[arg(default_value = ".")]
    dir: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Strategy {
    Array,
    Direct,
}

impl From<Strategy> for DispatchStrategy {
    fn from(s: Strategy) -> Self {
        match s {
            Strategy::Array => DispatchStrategy::Array,
            Strategy::Direct => DispatchStrategy::Direct,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn build_config(args: &RunArgs) -> Result<SpoolConfig, Box<dyn std::error::Error>> {
    let mut config = SpoolConfig {
        script: match &args.script {
            Some(script) => Some(std::path::absolute(script)?),
            None => None,
        },
        pattern: args.pattern.clone(),
        strategy: args.strategy.into(),
        port: args.port,
        keep_scripts: args.keep,
        templates: TemplateConfig {
            dir: args.template_dir.clone(),
            submission: args.template.clone(),
        },
        ..Default::default()
    }
    .with_max_concurrent(args.max_jobs)
    .with_delays(
        Duration::from_secs(args.settle),
        Duration::from_secs(args.pause),
    );

    if let Some(dir) = &args.scratch_dir {
        config = config.with_scratch_dir(dir);
    }
    if let Some(host) = &args.host {
        config.advertise_host = host.clone();
    }
    Ok(config)
}

/// Every regular file under `root`, as absolute paths.
fn discover_files(root: &Path) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
    let root = std::path::absolute(root)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(&root) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Skipping unreadable entry"),
        }
    }
    Ok(files)
}

fn print_summary(status: &SpoolStatus, queued: usize, format: &OutputFormat) {
    match format {
        OutputFormat::Json => match serde_json::to_string_pretty(status) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize status: {}", e),
        },
        OutputFormat::Table => {
            println!("{:<12} {}", "QUEUED", queued);
            println!("{:<12} {}", "REMAINING", status.size);
            println!("{:<12} {}", "WAITING", status.waiting);
            println!("{:<12} {}", "DISPATCHED", status.dispatched);
            println!("{:<12} {}", "PHASE", status.phase);
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn run_spool(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&args)?;
    let spool = Spool::start(config).await?;

    let files = discover_files(&args.dir)?;
    let mut queued = 0;
    for file in files {
        if spool.enqueue(file).await {
            queued += 1;
        }
    }
    tracing::info!(queued, dir = %args.dir.display(), "Files queued");

    let shutdown = install_shutdown_handler();
    let interrupted = tokio::select! {
        _ = spool.wait_drained() => false,
        _ = shutdown.cancelled() => true,
    };

    let status = spool.status().await;
    if interrupted {
        tracing::warn!("Interrupted, terminating dispatched jobs");
    } else {
        tracing::info!("Jobs complete, shutting down spool");
    }
    spool.stop(!interrupted).await;

    print_summary(&status, queued, &args.output);
    Ok(())
}

async fn getjob(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(path) = request_job(addr).await? {
        println!("{}", path.display());
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            init_logging(run_args.verbose);
            run_spool(run_args).await?;
        }
        Commands::Getjob { addr } => {
            init_logging(false);
            getjob(addr).await?;
        }
    }

    Ok(())
}
