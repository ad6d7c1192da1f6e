use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use workq_core::cluster::Cluster;
use workq_core::config::{
    ServerConfig, DEFAULT_PORT, DEFAULT_RESTART_DELAY_SECS, DEFAULT_SPOOL_WAIT_SECS,
    DEFAULT_TICK_SECS,
};
use workq_core::dispatch::Dispatcher;
use workq_core::liveness::ProcLiveness;
use workq_core::queue::JobQueue;
use workq_core::server::Server;
use workq_core::spool::Spool;
use workq_core::users::Users;

/// workqd - work-queue server for a small compute cluster
#[derive(Parser)]
#[command(name = "workqd")]
#[command(version)]
#[command(about = "Work-queue server for a small compute cluster", long_about = None)]
struct Cli {
    /// Cluster description file: one `hostname cores mem [group,...]` per line
    cluster_file: PathBuf,

    /// Port for the socket
    #[arg(short, long, env = "WORKQ_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Spool directory for job state and user limits (default: ~/wqspool)
    #[arg(short, long, env = "WORKQ_SPOOL_DIR")]
    spool_dir: Option<PathBuf>,

    /// Seconds of socket idle between queue refreshes
    #[arg(long, default_value_t = DEFAULT_TICK_SECS)]
    tick_interval: u64,

    /// Seconds clients should sleep between polls of their spool file
    #[arg(long, default_value_t = DEFAULT_SPOOL_WAIT_SECS)]
    spool_wait: u64,

    /// Seconds to wait before reopening the socket after a fatal error
    #[arg(long, default_value_t = DEFAULT_RESTART_DELAY_SECS)]
    restart_delay: u64,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        eprintln!("\nCaused by:");
        for cause in e.chain().skip(1) {
            eprintln!("  {}", cause);
        }
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let spool_dir = cli.spool_dir.unwrap_or_else(default_spool_dir);

    let mut config = ServerConfig::new(cli.cluster_file, spool_dir);
    config.port = cli.port;
    config.tick_interval = cli.tick_interval;
    config.spool_wait = cli.spool_wait;
    config.restart_delay = cli.restart_delay;

    let cluster = Cluster::from_file(&config.cluster_file).with_context(|| {
        format!(
            "failed to load cluster description {}",
            config.cluster_file.display()
        )
    })?;
    let spool = Spool::open(&config.spool_dir).with_context(|| {
        format!("failed to open spool directory {}", config.spool_dir.display())
    })?;
    let users = Users::load(&config.spool_dir).context("failed to load user limits")?;
    let queue = JobQueue::new(
        cluster,
        users,
        spool,
        Box::new(ProcLiveness::new()),
        config.spool_wait,
    )
    .context("failed to replay spooled jobs")?;

    info!("workqd {} starting", workq_core::VERSION);
    Server::new(config, Dispatcher::new(queue)).run().await?;
    Ok(())
}

fn default_spool_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join("wqspool"),
        None => PathBuf::from("wqspool"),
    }
}
