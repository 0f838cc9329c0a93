use crate::lock::SCHEDULED_DOWNLOADS_LOCK;
use crate::sweep::SweepState;
use crate::ytdlp::YtDlp;
use clap::Parser;
use tracing::{Level, event};
use tracing_subscriber::prelude::*;

mod channel_job;
mod cron;
mod db;
mod dedup;
mod errors;
mod lock;
mod metadata;
mod models;
mod nfo;
mod paths;
mod queue;
mod retention;
mod scheduler;
mod settings;
mod sweep;
mod ytdlp;

#[derive(Debug, Parser)]
#[command(about, author, version, next_line_help = true)]
struct Args {
    #[arg(long, env, default_value = "mirrortube.db")]
    /// File system path to the SQLite database holding channels, downloads,
    /// history, and settings.
    db_path: String,

    #[arg(long, env)]
    /// File system path to the root of the media library into which channel
    /// directories are mirrored.
    media_dir: String,

    #[arg(long, env)]
    /// File system path underneath which temporary directories for
    /// individual video download attempts are created. Must sit on the same
    /// file system as the media directory so finished downloads can be
    /// promoted with a rename.
    tmp_dir: String,

    #[arg(long, env, default_value = "mirrortube-jobs.json")]
    /// File system path of the scheduler's durable job store.
    jobs_file: String,

    #[arg(long, env)]
    /// Optional cookie file handed to the extraction tool, for channels with
    /// age-restricted content.
    cookie_file: Option<String>,

    #[arg(long, env, default_value = "4")]
    /// How many fragments the extraction tool may fetch concurrently within
    /// a single video download.
    fragment_concurrency: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the daemon: the cron engine plus the scheduled download sweeps.
    Run,

    /// Start following a channel so future sweeps mirror it.
    Follow {
        #[arg(long)]
        /// Stable provider id of the channel (e.g. "UC...").
        channel_id: String,

        #[arg(long)]
        /// Display name of the channel.
        name: String,

        #[arg(long)]
        /// URL of the channel page.
        url: String,

        #[arg(long, default_value = "10")]
        /// How many of the most recent videos to keep mirrored (1-100).
        limit: i64,
    },

    /// Request an immediate download run for one channel. Runs inline unless
    /// a scheduled sweep is active, in which case the request is queued and
    /// served right after the sweep.
    Trigger {
        #[arg(long)]
        /// Stable provider id of the channel.
        channel_id: String,

        #[arg(long, default_value = "cli")]
        /// Who asked, for the audit log.
        user: String,
    },

    /// Validate a cron expression, persist it as the sweep schedule, and
    /// show the upcoming fire times.
    Schedule {
        /// 5-field cron expression (minute hour day-of-month month
        /// day-of-week), evaluated in UTC.
        expression: String,
    },

    /// Show the scheduler's current state.
    Status,

    /// Show recent per-channel run records, newest first.
    History {
        #[arg(long)]
        /// Restrict the listing to one channel's provider id.
        channel_id: Option<String>,

        #[arg(long, default_value = "20")]
        /// How many records to show.
        limit: i64,
    },
}

// Wait to observe the ctrl+c signal and cause everything to shut down
// properly by dropping the sender half of a broadcast channel (all receivers
// will close upon this event).
async fn shutdown_upon_signal(send_shutdown: tokio::sync::broadcast::Sender<()>) {
    let _ = tokio::signal::ctrl_c().await;
    event!(Level::INFO, "Received signal to shut down gracefully");
    drop(send_shutdown);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI and ENV arguments.
    let args = Args::parse();

    // Configure our tracing/logger.
    let format_layer = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .compact();
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(format_layer)
        .init();

    // Initialize a connection to the SQLite database and create the tables
    // if they don't exist.
    let db_pool = db::init_db(&args.db_path).await?;

    let media_dir = std::path::PathBuf::from(&args.media_dir);
    let tmp_dir = std::path::PathBuf::from(&args.tmp_dir);
    let jobs_path = std::path::PathBuf::from(&args.jobs_file);
    let state = SweepState::new(&db_pool, media_dir.clone());
    let fetcher = YtDlp::new(
        media_dir,
        tmp_dir.clone(),
        args.cookie_file.map(std::path::PathBuf::from),
        args.fragment_concurrency,
    );

    match args.command {
        Command::Run => run_daemon(state, fetcher, &tmp_dir, jobs_path).await?,
        Command::Follow {
            channel_id,
            name,
            url,
            limit,
        } => follow_channel(&state, &channel_id, &name, &url, limit).await?,
        Command::Trigger { channel_id, user } => {
            trigger_channel(&state, &fetcher, &channel_id, &user).await?;
        }
        Command::Schedule { expression } => {
            let parsed =
                scheduler::update_schedule(&state.settings, &jobs_path, &expression).await?;
            println!("{}", parsed.describe());
            for run in parsed.next_runs(5, chrono::Utc::now()) {
                println!("  next: {run}");
            }
        }
        Command::Status => {
            let status = scheduler::read_status(&state.settings, &jobs_path).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::History { channel_id, limit } => {
            let rows = sqlx::query_as::<_, models::DownloadHistory>(
                "SELECT h.* FROM download_history h
                JOIN channels c ON c.id = h.channel_id
                WHERE ( $1 IS NULL OR c.channel_id = $1 )
                ORDER BY h.id DESC LIMIT $2;",
            )
            .bind(channel_id)
            .bind(limit)
            .fetch_all(&state.db_pool)
            .await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    db_pool.close().await;
    Ok(())
}

async fn run_daemon(
    state: SweepState,
    fetcher: YtDlp,
    tmp_dir: &std::path::Path,
    jobs_path: std::path::PathBuf,
) -> anyhow::Result<()> {
    // Error out early on if `yt-dlp` can't be called.
    ytdlp::preflight(tmp_dir)?;

    // Prepare ctrl+c signal handling: a background task waits for the
    // signal and then drops the sender side of a broadcast channel the
    // engine task is hooked up to as receiver.
    let (send_shutdown, _) = tokio::sync::broadcast::channel::<()>(1);

    let engine = scheduler::Scheduler::start(state, fetcher, jobs_path).await?;
    let engine_shutdown = send_shutdown.subscribe();
    let engine_handle = tokio::task::spawn(engine.run(engine_shutdown));

    event!(Level::INFO, "Scheduler running, press ctrl+c to stop");
    shutdown_upon_signal(send_shutdown).await;

    // Wait for the engine to finish any in-flight sweep and stop.
    engine_handle.await?;
    Ok(())
}

// The channel-management seam: record a channel row so sweeps pick it up.
async fn follow_channel(
    state: &SweepState,
    channel_id: &str,
    name: &str,
    url: &str,
    limit: i64,
) -> anyhow::Result<()> {
    if !(1..=100).contains(&limit) {
        return Err(anyhow::anyhow!("Limit must lie within 1-100, got {limit}"));
    }

    let directory_name = paths::channel_dir_name(name, channel_id);
    match sqlx::query(
        "INSERT INTO channels ( channel_id, name, url, video_limit, enabled, directory_name )
        VALUES ( $1, $2, $3, $4, 1, $5 );",
    )
    .bind(channel_id)
    .bind(name)
    .bind(url)
    .bind(limit)
    .bind(&directory_name)
    .execute(&state.db_pool)
    .await
    {
        Ok(_) => {
            println!("Now following '{name}' ({channel_id}), keeping {limit} videos");
            Ok(())
        }
        Err(e) => match e {
            sqlx::Error::Database(err_db) if err_db.is_unique_violation() => {
                Err(anyhow::anyhow!("Channel {channel_id} is already being followed"))
            }
            _ => Err(e.into()),
        },
    }
}

// The manual-trigger seam: an active sweep means the request is queued
// durably and served right after the sweep; otherwise the channel job runs
// inline.
async fn trigger_channel(
    state: &SweepState,
    fetcher: &YtDlp,
    channel_id: &str,
    user: &str,
) -> anyhow::Result<()> {
    let sweep_active = state
        .settings
        .get_or(&format!("{SCHEDULED_DOWNLOADS_LOCK}_running"), "false")
        .await?
        == "true";
    if sweep_active {
        let position = state.queue.enqueue(channel_id, user).await?;
        println!("queued at position {position}");
        return Ok(());
    }

    let channel = sqlx::query_as::<_, models::Channel>(
        "SELECT * FROM channels WHERE channel_id = $1;",
    )
    .bind(channel_id)
    .fetch_optional(&state.db_pool)
    .await?
    .ok_or_else(|| anyhow::anyhow!("Channel {channel_id} is not being followed"))?;
    if !channel.enabled {
        return Err(anyhow::anyhow!("Channel {channel_id} is disabled"));
    }

    let outcome = channel_job::process(state, fetcher, &channel).await?;
    println!(
        "completed: {} found, {} downloaded, {} skipped, {} failed",
        outcome.found, outcome.downloaded, outcome.skipped, outcome.failed
    );
    Ok(())
}
