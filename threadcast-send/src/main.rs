//! threadcast-send - Background daemon that publishes scheduled post threads
//!
//! Builds the publication pipeline from the configuration file and runs the
//! scheduler until SIGINT or SIGTERM.

use clap::Parser;
use libthreadcast::config::Config;
use libthreadcast::coordinator::ThreadPublicationCoordinator;
use libthreadcast::db::Database;
use libthreadcast::error::{Result, ThreadcastError};
use libthreadcast::ingest::MediaIngestor;
use libthreadcast::logging::{LogFormat, LoggingConfig};
use libthreadcast::platforms::bluesky::BlueskyPostResolver;
use libthreadcast::platforms::HttpPublisherFactory;
use libthreadcast::resilience::RetryPolicy;
use libthreadcast::scheduler::{
    CleanUpMediaJobsJob, JobScheduler, ProcessMediaJobsJob, ProcessPostThreadsJob,
};
use libthreadcast::storage::{BlobStore, LocalBlobStore};
use libthreadcast::transcoder::MediaTranscoder;
use libthreadcast::webdriver::WebDriverQuoteRenderer;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const CLEAN_UP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const NOTIFICATION_BUFFER: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "threadcast-send")]
#[command(version)]
#[command(about = "Background daemon that publishes scheduled post threads")]
#[command(long_about = r#"threadcast-send - Background daemon that publishes scheduled post threads

DESCRIPTION:
    threadcast-send sweeps the thread store on a fixed interval and publishes
    every enqueued thread whose scheduled time has come to Twitter, Bluesky,
    Mastodon and Threads. Threads more than five minutes late are marked as
    missed instead of being published.

    It also processes uploaded media: images are shrunk and videos re-encoded
    to fit each platform's upload limits. Ready upload jobs are picked up by a
    periodic sweep, and immediately when their id is written as a line to
    [media] notify_addr.

USAGE:
    # Run in foreground (logs to stderr)
    threadcast-send

    # Sweep every 30 seconds with JSON logs
    threadcast-send --interval 30 --log-format json

    # Run every job once and exit
    threadcast-send --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the sweep in progress)

CONFIGURATION:
    Configuration file: $THREADCAST_CONFIG or ~/.config/threadcast/config.toml

    [scheduler]
    interval_secs = 60
    grace_window_secs = 300

    [media]
    notify_addr = "127.0.0.1:7070"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
    3 - Invalid input
"#)]
struct Cli {
    /// Seconds between thread sweeps (overrides config)
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,

    /// Run every job once and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format: text, json or pretty
    #[arg(long, env = "THREADCAST_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "THREADCAST_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::new(cli.log_format, cli.log_level.clone(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("threadcast-send failed: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let scheduler = build_scheduler(&config, cli.interval, !cli.once).await?;

    if cli.once {
        if !scheduler.run_all_once().await {
            warn!("One or more jobs failed");
        }
        info!("threadcast-send: ran every job once, exiting");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx)?;

    info!("threadcast-send daemon starting");
    scheduler.run_until(shutdown_rx).await;
    info!("threadcast-send daemon stopped");
    Ok(())
}

/// Construct the object graph and register every job
async fn build_scheduler(
    config: &Config,
    interval_override: Option<u64>,
    notifications: bool,
) -> Result<JobScheduler> {
    let db = Database::new(&config.database.path).await?;
    let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(
        &config.storage.root,
        &config.storage.public_base_url,
        &config.storage.signing_key,
    )?);

    let publishers = HttpPublisherFactory::new(&config.platforms)?;
    let http = publishers.http().clone();
    let renderer = Arc::new(WebDriverQuoteRenderer::new(http.clone(), &config.webdriver));
    let resolver = Arc::new(BlueskyPostResolver::new(http, &config.platforms.bluesky_appview));

    let coordinator = ThreadPublicationCoordinator::new(
        db.clone(),
        blobs.clone(),
        renderer,
        resolver,
        Arc::new(publishers),
    )
    .with_retry_policy(RetryPolicy::from(&config.retry))
    .with_grace_window(config.scheduler.grace_window())
    .with_presign_ttl(Duration::from_secs(config.storage.presign_ttl_secs));

    let ingestor = Arc::new(
        MediaIngestor::new(db.clone(), blobs, MediaTranscoder::new(&config.media))
            .with_retry_policy(RetryPolicy::from(&config.retry)),
    );
    if notifications {
        if let Some(addr) = &config.media.notify_addr {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                ThreadcastError::InvalidInput(format!("Cannot listen on {}: {}", addr, e))
            })?;
            info!("Listening for media job notifications on {}", addr);
            let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
            MediaIngestor::serve_notifications(listener, tx);
            ingestor.clone().listen(rx);
        }
    }

    let thread_interval = match interval_override {
        Some(0) => {
            return Err(ThreadcastError::InvalidInput(
                "--interval must be at least 1 second".to_string(),
            ))
        }
        Some(secs) => Duration::from_secs(secs),
        None => config.scheduler.interval(),
    };
    let retention = chrono::Duration::seconds(config.scheduler.media_job_retention_secs as i64);

    let mut scheduler = JobScheduler::new();
    scheduler.add_job(
        Arc::new(ProcessPostThreadsJob::new(Arc::new(coordinator))),
        thread_interval,
    );
    scheduler.add_job(
        Arc::new(ProcessMediaJobsJob::new(ingestor)),
        Duration::from_secs(config.scheduler.media_jobs_interval_secs.max(1)),
    );
    scheduler.add_job(
        Arc::new(CleanUpMediaJobsJob::new(db, retention)),
        CLEAN_UP_INTERVAL,
    );
    Ok(scheduler)
}

/// Flip `shutdown` on the first SIGINT or SIGTERM
#[cfg(unix)]
fn spawn_signal_handler(shutdown: watch::Sender<bool>) -> Result<()> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| ThreadcastError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    tokio::spawn(async move {
        if let Some(signal) = signals.next().await {
            info!("Received signal {}, stopping gracefully...", signal);
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handler(shutdown: watch::Sender<bool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            let _ = shutdown.send(true);
        }
    });
    Ok(())
}
