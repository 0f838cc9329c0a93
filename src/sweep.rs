use crate::channel_job;
use crate::errors::LockHeldError;
use crate::lock::{SCHEDULED_DOWNLOADS_LOCK, SingleFlightLock};
use crate::models::Channel;
use crate::queue::{MANUAL_TRIGGER_MAX_AGE_MINUTES, ManualTriggerQueue};
use crate::settings::{KEY_LAST_RUN_SUMMARY, SettingsStore};
use crate::ytdlp::Fetcher;
use std::path::PathBuf;
use tracing::{Level, event};

#[derive(Clone, Debug)]
/// Everything a sweep and its channel jobs share: database access, the
/// settings-backed primitives, and the media tree location.
pub(crate) struct SweepState {
    pub(crate) db_pool: sqlx::sqlite::SqlitePool,
    pub(crate) settings: SettingsStore,
    pub(crate) lock: SingleFlightLock,
    pub(crate) queue: ManualTriggerQueue,
    pub(crate) media_dir: PathBuf,
    /// Pause between transient-failure retries. Shortened by tests.
    pub(crate) retry_delay: std::time::Duration,
}

impl SweepState {
    pub(crate) fn new(db_pool: &sqlx::sqlite::SqlitePool, media_dir: PathBuf) -> Self {
        let settings = SettingsStore::new(db_pool);
        SweepState {
            db_pool: db_pool.clone(),
            lock: SingleFlightLock::new(&settings),
            queue: ManualTriggerQueue::new(&settings),
            settings,
            media_dir,
            retry_delay: std::time::Duration::from_secs(channel_job::RETRY_DELAY_SECS),
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
/// Statistics of one sweep, persisted as JSON for the status surfaces.
pub(crate) struct SweepSummary {
    pub(crate) total_channels: i64,
    pub(crate) successful_channels: i64,
    pub(crate) failed_channels: i64,
    pub(crate) total_videos: i64,
    pub(crate) start_time: String,
    pub(crate) duration_seconds: i64,
}

/// One scheduled sweep: under the single-flight lock, process every enabled
/// channel, then drain the manual-trigger queue, then persist a summary.
///
/// A sweep that finds the lock taken is a no-op logged at warning level, not
/// an error; everything else the body fails on surfaces in the returned
/// result for the scheduler to log.
pub(crate) async fn run<F>(state: SweepState, fetcher: F) -> anyhow::Result<()>
where
    F: Fetcher + Send + Sync + 'static,
{
    let lock = state.lock.clone();
    let result = lock
        .with_lock(SCHEDULED_DOWNLOADS_LOCK, sweep_body(state, fetcher))
        .await;

    match result {
        Err(e) if e.downcast_ref::<LockHeldError>().is_some() => {
            event!(Level::WARN, "Skipping sweep: {e}");
            Ok(())
        }
        other => other,
    }
}

async fn sweep_body<F>(state: SweepState, fetcher: F) -> anyhow::Result<()>
where
    F: Fetcher + Send + Sync,
{
    let started = std::time::Instant::now();
    let start_time = crate::models::now_rfc3339();

    // Requests nobody is waiting for anymore are dropped before any work.
    state
        .queue
        .drain_stale(
            chrono::Utc::now(),
            chrono::Duration::minutes(MANUAL_TRIGGER_MAX_AGE_MINUTES),
        )
        .await?;

    // Stable iteration order: primary key ascending.
    let channels = sqlx::query_as::<_, Channel>(
        "SELECT * FROM channels WHERE enabled = 1 ORDER BY id ASC;",
    )
    .fetch_all(&state.db_pool)
    .await?;

    let mut summary = SweepSummary {
        total_channels: i64::try_from(channels.len()).unwrap_or(i64::MAX),
        successful_channels: 0,
        failed_channels: 0,
        total_videos: 0,
        start_time,
        duration_seconds: 0,
    };

    if channels.is_empty() {
        event!(Level::INFO, "No enabled channels to sweep");
    }

    for channel in &channels {
        event!(
            Level::INFO,
            "Sweeping channel '{}' ({})",
            channel.name,
            channel.channel_id
        );
        match channel_job::process(&state, &fetcher, channel).await {
            Ok(outcome) => {
                summary.successful_channels += 1;
                summary.total_videos += outcome.downloaded;
            }
            Err(e) => {
                summary.failed_channels += 1;
                event!(
                    Level::WARN,
                    "Channel '{}' failed during sweep: {e}",
                    channel.channel_id
                );
            }
        }
    }

    drain_manual_queue(&state, &fetcher).await;

    summary.duration_seconds = i64::try_from(started.elapsed().as_secs()).unwrap_or(i64::MAX);
    state
        .settings
        .put(
            KEY_LAST_RUN_SUMMARY,
            &serde_json::to_string(&summary)?,
            Some("Statistics of the most recent scheduled sweep"),
        )
        .await?;
    event!(
        Level::INFO,
        "Sweep finished: {}/{} channels succeeded, {} videos downloaded in {}s",
        summary.successful_channels,
        summary.total_channels,
        summary.total_videos,
        summary.duration_seconds,
    );

    Ok(())
}

// Serve the manual requests that queued up while the sweep held the lock,
// oldest first. Requests for unknown or disabled channels are skipped; a
// failed job never stops the drain.
async fn drain_manual_queue<F>(state: &SweepState, fetcher: &F)
where
    F: Fetcher + Send + Sync,
{
    loop {
        let entry = match state.queue.pop().await {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                event!(Level::WARN, "Failed to read manual trigger queue: {e}");
                return;
            }
        };

        let channel = match sqlx::query_as::<_, Channel>(
            "SELECT * FROM channels WHERE channel_id = $1;",
        )
        .bind(&entry.channel_id)
        .fetch_optional(&state.db_pool)
        .await
        {
            Ok(Some(channel)) if channel.enabled => channel,
            Ok(_) => {
                event!(
                    Level::WARN,
                    "Skipping manual trigger for unknown or disabled channel {}",
                    entry.channel_id
                );
                continue;
            }
            Err(e) => {
                event!(Level::WARN, "Failed to look up channel {}: {e}", entry.channel_id);
                continue;
            }
        };

        event!(
            Level::INFO,
            "Serving queued manual trigger for channel '{}' (requested by '{}')",
            channel.name,
            entry.user
        );
        if let Err(e) = channel_job::process(state, fetcher, &channel).await {
            event!(
                Level::WARN,
                "Manual run for channel '{}' failed: {e}",
                channel.channel_id
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::channel_job::testsupport::ScriptedFetcher;
    use crate::db::testutil::{insert_channel, temp_db};

    fn test_state(pool: &sqlx::sqlite::SqlitePool, media_dir: PathBuf) -> SweepState {
        let mut state = SweepState::new(pool, media_dir);
        state.retry_delay = std::time::Duration::ZERO;
        state
    }

    async fn read_summary(settings: &SettingsStore) -> SweepSummary {
        let raw = settings.get(KEY_LAST_RUN_SUMMARY).await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_empty_channel_set_writes_zero_summary() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path().to_path_buf());
        let settings = state.settings.clone();

        run(state, ScriptedFetcher::new(media.path())).await?;

        let summary = read_summary(&settings).await;
        assert_eq!(summary.total_channels, 0);
        assert_eq!(summary.successful_channels, 0);
        assert_eq!(summary.failed_channels, 0);
        assert_eq!(summary.total_videos, 0);
        assert_eq!(
            settings.get("scheduled_downloads_running").await?.as_deref(),
            Some("false")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_processes_channels_and_manual_queue() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path().to_path_buf());

        insert_channel(&pool, "UCsched", "Scheduled", 5, true).await?;
        let manual = insert_channel(&pool, "UCmanual", "Manual Only", 5, false).await?;
        // Disabled channels are not swept, but a manual trigger for an
        // *enabled* channel queued mid-run is served afterwards.
        sqlx::query("UPDATE channels SET enabled = 1 WHERE id = $1;")
            .bind(manual.id)
            .execute(&pool)
            .await?;

        let fetcher = ScriptedFetcher::new(media.path());
        fetcher.list_for("UCsched", &["vid_sched1", "vid_sched2"]);
        fetcher.list_for("UCmanual", &["vid_manual1"]);

        // Simulate the manual endpoint having queued during a previous hold.
        state.queue.enqueue("UCmanual", "operator").await?;
        // Manual triggers pointing nowhere are skipped quietly.
        state.queue.enqueue("UCmissing", "operator").await?;

        run(state.clone(), fetcher).await?;

        let summary = read_summary(&state.settings).await;
        assert_eq!(summary.total_channels, 2);
        assert_eq!(summary.successful_channels, 2);

        // Both the scheduled channels and the queued manual channel have
        // history rows; the queue is empty again.
        let history_count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM download_history;")
                .fetch_one(&pool)
                .await?;
        assert_eq!(history_count.0, 3);
        assert_eq!(state.queue.pop().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_is_noop_when_lock_held() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path().to_path_buf());
        insert_channel(&pool, "UCsched", "Scheduled", 5, true).await?;

        state
            .settings
            .put("scheduled_downloads_running", "true", None)
            .await?;

        let fetcher = ScriptedFetcher::new(media.path());
        fetcher.list_for("UCsched", &["vid_sched1"]);
        run(state.clone(), fetcher).await?;

        // Nothing ran and the foreign lock is untouched.
        let history_count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM download_history;")
                .fetch_one(&pool)
                .await?;
        assert_eq!(history_count.0, 0);
        assert_eq!(
            state.settings.get("scheduled_downloads_running").await?.as_deref(),
            Some("true")
        );
        Ok(())
    }
}
