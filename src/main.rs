use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

use stream_queue::config;
use stream_queue::db;
use stream_queue::model::QueueType;
use stream_queue::StreamQueue;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sweep the queue every poll interval until interrupted
    Run,
    /// Run a single sweep and exit
    Sweep,
    /// Process every entry sharing a token, ignoring backoff
    ProcessToken { token: String },
    /// Create a standby entry
    Enqueue {
        /// Grouping token; a fresh one is generated when omitted
        #[arg(long)]
        token: Option<String>,
        #[arg(long = "type", default_value = QueueType::CACHE)]
        kind: String,
        #[arg(long)]
        stream_id: String,
    },
    /// Print entry counts per status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let queue = StreamQueue::from_config(pool.clone(), &cfg)?;

    match args.command {
        Command::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let poll = cfg.poll_interval();
            let worker = tokio::spawn(async move { queue.run_forever(poll, shutdown_rx).await });

            info!("queue worker started");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            let _ = shutdown_tx.send(true);
            if let Err(err) = worker.await {
                error!(?err, "queue worker panicked");
            }
        }
        Command::Sweep => {
            let report = queue.run_sweep().await?;
            info!(?report, "sweep complete");
        }
        Command::ProcessToken { token } => {
            let outcomes = queue.process_by_token(&token).await?;
            for outcome in outcomes {
                info!(?outcome, "entry processed");
            }
        }
        Command::Enqueue {
            token,
            kind,
            stream_id,
        } => {
            let token = token.unwrap_or_else(StreamQueue::new_token);
            let entry = queue.enqueue(&token, &kind, &stream_id).await?;
            println!("{} {}", entry.id, entry.token);
        }
        Command::Status => {
            let counts = db::count_by_status(&pool).await?;
            println!(
                "standby={} running={} success={} failure={}",
                counts.standby, counts.running, counts.success, counts.failure
            );
        }
    }

    Ok(())
}
