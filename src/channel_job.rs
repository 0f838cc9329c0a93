use crate::dedup::{self, DiskIndex};
use crate::errors::truncate_error;
use crate::metadata::ChannelInfo;
use crate::models::{Channel, DownloadStatus, HistoryStatus, now_rfc3339};
use crate::nfo;
use crate::paths;
use crate::settings::{
    DEFAULT_VIDEO_LIMIT, KEY_DEFAULT_VIDEO_LIMIT, KEY_NFO_ENABLED, KEY_OVERWRITE_EXISTING_NFO,
};
use crate::sweep::SweepState;
use crate::ytdlp::{FetchedVideo, Fetcher};
use tracing::{Level, event};

/// How many times a transiently failing discovery or download is attempted.
pub(crate) const FETCH_ATTEMPTS: u32 = 2;

/// Pause between those attempts.
pub(crate) const RETRY_DELAY_SECS: u64 = 30;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ChannelOutcome {
    pub(crate) found: i64,
    pub(crate) downloaded: i64,
    pub(crate) skipped: i64,
    pub(crate) failed: i64,
}

/// Run one channel end to end: discover candidates, download what is
/// missing, write sidecar descriptors, enforce retention, and leave a
/// history row behind either way.
///
/// Individual video failures are recorded and skipped; only discovery
/// failing hard (or infrastructure errors) fail the whole job.
pub(crate) async fn process<F: Fetcher>(
    state: &SweepState,
    fetcher: &F,
    channel: &Channel,
) -> anyhow::Result<ChannelOutcome> {
    let history_id = open_history_row(state, channel).await?;

    let result = run_candidates(state, fetcher, channel).await;
    match &result {
        Ok(outcome) => {
            close_history_row(state, history_id, HistoryStatus::Completed, *outcome, None).await?;
        }
        Err(e) => {
            close_history_row(
                state,
                history_id,
                HistoryStatus::Failed,
                ChannelOutcome::default(),
                Some(truncate_error(&e.to_string())),
            )
            .await?;
        }
    }

    // Checked is checked, successful or not.
    sqlx::query("UPDATE channels SET last_check = $1 WHERE id = $2;")
        .bind(now_rfc3339())
        .bind(channel.id)
        .execute(&state.db_pool)
        .await?;

    result
}

async fn run_candidates<F: Fetcher>(
    state: &SweepState,
    fetcher: &F,
    channel: &Channel,
) -> anyhow::Result<ChannelOutcome> {
    let default_limit: i64 = state
        .settings
        .get_or(KEY_DEFAULT_VIDEO_LIMIT, &DEFAULT_VIDEO_LIMIT.to_string())
        .await?
        .parse()
        .unwrap_or(DEFAULT_VIDEO_LIMIT);
    let limit = channel.effective_limit(default_limit);

    // Discovery, with one retry for transient failures.
    let candidates = {
        let mut attempt = 1;
        loop {
            match fetcher.list_recent(&channel.url, limit).await {
                Ok(ids) => break ids,
                Err(e) if e.is_transient() && attempt < FETCH_ATTEMPTS => {
                    event!(
                        Level::WARN,
                        "Discovery for channel {} failed transiently (attempt {attempt}): {e}",
                        channel.channel_id
                    );
                    tokio::time::sleep(state.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let mut outcome = ChannelOutcome {
        found: i64::try_from(candidates.len()).unwrap_or(i64::MAX),
        ..ChannelOutcome::default()
    };

    // One walk of the channel's media directory serves every dedup query of
    // this job.
    let channel_dir = state.media_dir.join(channel.directory());
    let disk_index = DiskIndex::scan(&channel_dir);
    event!(
        Level::DEBUG,
        "Disk index for channel {} witnesses {} videos",
        channel.channel_id,
        disk_index.len()
    );

    let nfo_enabled = state.settings.get_or(KEY_NFO_ENABLED, "true").await? == "true";
    let overwrite_nfo =
        state.settings.get_or(KEY_OVERWRITE_EXISTING_NFO, "false").await? == "true";
    let mut channel_refreshed = false;

    // Candidates arrive newest first and are handled strictly one at a time.
    for video_id in &candidates {
        let (needed, existing) =
            dedup::should_download(&state.db_pool, channel, video_id, &disk_index).await?;
        if !needed {
            outcome.skipped += 1;
            continue;
        }

        let row_id = match existing {
            Some(row) => reset_row_pending(state, row.id).await?,
            None => insert_row_pending(state, channel, video_id).await?,
        };
        set_row_status(state, row_id, DownloadStatus::Downloading).await?;

        // Download, with one retry for transient failures.
        let fetched = {
            let mut attempt = 1;
            loop {
                match fetcher.fetch_video(video_id, channel).await {
                    Ok(fetched) => break Ok(fetched),
                    Err(e) if e.is_transient() && attempt < FETCH_ATTEMPTS => {
                        event!(
                            Level::WARN,
                            "Download of {video_id} failed transiently (attempt {attempt}): {e}"
                        );
                        tokio::time::sleep(state.retry_delay).await;
                        attempt += 1;
                    }
                    Err(e) => break Err(e),
                }
            }
        };

        match fetched {
            Ok(fetched) => {
                mark_row_completed(state, row_id, &fetched).await?;
                outcome.downloaded += 1;
                if nfo_enabled {
                    write_sidecars(
                        state,
                        fetcher,
                        channel,
                        &fetched,
                        overwrite_nfo,
                        &mut channel_refreshed,
                    )
                    .await;
                }
            }
            Err(e) => {
                event!(Level::WARN, "Download of {video_id} failed: {e}");
                mark_row_failed(state, row_id, &truncate_error(&e.to_string())).await?;
                outcome.failed += 1;
            }
        }
    }

    crate::retention::apply(&state.db_pool, channel, &state.media_dir).await?;

    Ok(outcome)
}

// Descriptors are conveniences for the library reader; any failure here is
// logged and the job moves on.
async fn write_sidecars<F: Fetcher>(
    state: &SweepState,
    fetcher: &F,
    channel: &Channel,
    fetched: &FetchedVideo,
    overwrite: bool,
    channel_refreshed: &mut bool,
) {
    let now = chrono::Utc::now();

    let episode_nfo = fetched.video_path.with_extension("nfo");
    if overwrite || !episode_nfo.exists() {
        let show_title = fetched
            .info
            .channel
            .clone()
            .unwrap_or_else(|| channel.name.clone());
        if let Err(e) = nfo::write_episode_nfo(&episode_nfo, &fetched.info, &show_title, now) {
            event!(Level::WARN, "Failed to write {episode_nfo:?}: {e}");
        }
    }

    let season_nfo = fetched.year_dir.join("season.nfo");
    if overwrite || !season_nfo.exists() {
        let year = fetched.info.upload_year().unwrap_or("0000");
        if let Err(e) = nfo::write_season_nfo(&fetched.year_dir, year, now) {
            event!(Level::WARN, "Failed to write {season_nfo:?}: {e}");
        }
    }

    // Channel-level metadata is refreshed at most once per job, and only
    // when the show descriptor is missing or regeneration is forced.
    let channel_dir = state.media_dir.join(channel.directory());
    let tvshow_nfo = channel_dir.join("tvshow.nfo");
    if *channel_refreshed || (!overwrite && tvshow_nfo.exists()) {
        return;
    }
    *channel_refreshed = true;

    let info = match fetcher.refresh_channel(channel).await {
        Ok(refresh) => {
            let info_sidecar = channel_dir.join(format!(
                "{}.info.json",
                paths::sanitize_component(&channel.name)
            ));
            if let Err(e) = paths::atomic_write(&info_sidecar, refresh.raw_json.as_bytes()) {
                event!(Level::WARN, "Failed to write {info_sidecar:?}: {e}");
            }
            refresh.info
        }
        Err(e) => {
            // The channel row still carries enough for a minimal descriptor.
            event!(
                Level::WARN,
                "Channel metadata refresh for {} failed: {e}",
                channel.channel_id
            );
            ChannelInfo::from_channel(channel)
        }
    };
    if let Err(e) = nfo::write_tvshow_nfo(&channel_dir, &info) {
        event!(Level::WARN, "Failed to write {tvshow_nfo:?}: {e}");
    }
}

async fn open_history_row(state: &SweepState, channel: &Channel) -> anyhow::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO download_history ( channel_id, run_at, status )
        VALUES ( $1, $2, $3 );",
    )
    .bind(channel.id)
    .bind(now_rfc3339())
    .bind(HistoryStatus::Running.as_str())
    .execute(&state.db_pool)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn close_history_row(
    state: &SweepState,
    history_id: i64,
    status: HistoryStatus,
    outcome: ChannelOutcome,
    error_message: Option<String>,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE download_history
        SET status = $1, videos_found = $2, videos_downloaded = $3, videos_skipped = $4,
            videos_failed = $5, error_message = $6, completed_at = $7
        WHERE id = $8;",
    )
    .bind(status.as_str())
    .bind(outcome.found)
    .bind(outcome.downloaded)
    .bind(outcome.skipped)
    .bind(outcome.failed)
    .bind(error_message)
    .bind(now_rfc3339())
    .bind(history_id)
    .execute(&state.db_pool)
    .await?;
    Ok(())
}

async fn insert_row_pending(
    state: &SweepState,
    channel: &Channel,
    video_id: &str,
) -> anyhow::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO downloads ( channel_id, video_id, title, status, created_at )
        VALUES ( $1, $2, '', $3, $4 );",
    )
    .bind(channel.id)
    .bind(video_id)
    .bind(DownloadStatus::Pending.as_str())
    .bind(now_rfc3339())
    .execute(&state.db_pool)
    .await?;
    Ok(result.last_insert_rowid())
}

async fn reset_row_pending(state: &SweepState, row_id: i64) -> anyhow::Result<i64> {
    sqlx::query(
        "UPDATE downloads SET status = $1, error_message = NULL WHERE id = $2;",
    )
    .bind(DownloadStatus::Pending.as_str())
    .bind(row_id)
    .execute(&state.db_pool)
    .await?;
    Ok(row_id)
}

async fn set_row_status(
    state: &SweepState,
    row_id: i64,
    status: DownloadStatus,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE downloads SET status = $1 WHERE id = $2;")
        .bind(status.as_str())
        .bind(row_id)
        .execute(&state.db_pool)
        .await?;
    Ok(())
}

async fn mark_row_completed(
    state: &SweepState,
    row_id: i64,
    fetched: &FetchedVideo,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE downloads
        SET title = $1, upload_date = $2, duration = $3, file_path = $4, file_size = $5,
            status = $6, error_message = NULL, file_exists = 1, completed_at = $7
        WHERE id = $8;",
    )
    .bind(&fetched.info.title)
    .bind(&fetched.info.upload_date)
    .bind(fetched.info.duration_secs())
    .bind(fetched.video_path.to_string_lossy().as_ref())
    .bind(fetched.file_size)
    .bind(DownloadStatus::Completed.as_str())
    .bind(now_rfc3339())
    .bind(row_id)
    .execute(&state.db_pool)
    .await?;
    Ok(())
}

async fn mark_row_failed(
    state: &SweepState,
    row_id: i64,
    error_message: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE downloads
        SET status = $1, error_message = $2, file_exists = 0
        WHERE id = $3;",
    )
    .bind(DownloadStatus::Failed.as_str())
    .bind(error_message)
    .bind(row_id)
    .execute(&state.db_pool)
    .await?;
    Ok(())
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::testsupport::ScriptedFetcher;
    use super::*;
    use crate::db::testutil::{insert_channel, temp_db};
    use crate::errors::FetchError;
    use crate::models::Download;
    use crate::sweep::SweepState;

    fn test_state(pool: &sqlx::sqlite::SqlitePool, media_dir: &std::path::Path) -> SweepState {
        let mut state = SweepState::new(pool, media_dir.to_path_buf());
        state.retry_delay = std::time::Duration::ZERO;
        state
    }

    async fn history_rows(
        pool: &sqlx::sqlite::SqlitePool,
    ) -> Vec<crate::models::DownloadHistory> {
        sqlx::query_as("SELECT * FROM download_history ORDER BY id ASC;")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    async fn download_row(pool: &sqlx::sqlite::SqlitePool, video_id: &str) -> Download {
        sqlx::query_as("SELECT * FROM downloads WHERE video_id = $1;")
            .bind(video_id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_downloads_and_writes_sidecars() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path());
        let channel = insert_channel(&pool, "UCx", "My Channel", 5, true).await?;

        let fetcher = ScriptedFetcher::new(media.path());
        fetcher.list_for("UCx", &["vid_aaa", "vid_bbb", "vid_ccc"]);

        let outcome = process(&state, &fetcher, &channel).await?;
        assert_eq!(outcome.found, 3);
        assert_eq!(outcome.downloaded, 3);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.failed, 0);

        // Download rows are completed and point at on-disk files carrying
        // the id token.
        for vid in ["vid_aaa", "vid_bbb", "vid_ccc"] {
            let row = download_row(&pool, vid).await;
            assert_eq!(row.status, "completed");
            assert!(row.file_exists);
            let path = row.file_path.unwrap();
            assert!(path.contains(&format!("[{vid}]")));
            assert!(std::path::Path::new(&path).is_file());
            // The episode descriptor sits next to the media file.
            assert!(std::path::Path::new(&path).with_extension("nfo").is_file());
        }

        let channel_dir = media.path().join(channel.directory());
        assert!(channel_dir.join("2024").join("season.nfo").is_file());
        assert!(channel_dir.join("tvshow.nfo").is_file());
        assert!(channel_dir.join("My Channel.info.json").is_file());

        let history = history_rows(&pool).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "completed");
        assert_eq!(history[0].videos_found, 3);
        assert_eq!(history[0].videos_downloaded, 3);
        assert!(history[0].completed_at.is_some());

        let channel_after: crate::models::Channel =
            sqlx::query_as("SELECT * FROM channels WHERE id = $1;")
                .bind(channel.id)
                .fetch_one(&pool)
                .await?;
        assert!(channel_after.last_check.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path());
        let channel = insert_channel(&pool, "UCx", "My Channel", 5, true).await?;

        let fetcher = ScriptedFetcher::new(media.path());
        fetcher.list_for("UCx", &["vid_aaa", "vid_bbb"]);

        process(&state, &fetcher, &channel).await?;
        let outcome = process(&state, &fetcher, &channel).await?;
        assert_eq!(outcome.found, 2);
        assert_eq!(outcome.downloaded, 0);
        assert_eq!(outcome.skipped, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_mixed_transient_and_permanent_failures() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path());
        let channel = insert_channel(&pool, "UCx", "My Channel", 10, true).await?;

        let fetcher = ScriptedFetcher::new(media.path());
        fetcher.list_for("UCx", &["v1", "v2", "v3", "v4", "v5"]);
        // v3 fails once with a retryable error and succeeds on the retry;
        // v4 fails permanently.
        fetcher.fail_once("v3", FetchError::Transient("connection reset".to_string()));
        fetcher.fail_once("v4", FetchError::Permanent("Video unavailable".to_string()));

        let outcome = process(&state, &fetcher, &channel).await?;
        assert_eq!(outcome.found, 5);
        assert_eq!(outcome.downloaded, 4);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.failed, 1);

        let v3 = download_row(&pool, "v3").await;
        assert_eq!(v3.status, "completed");
        let v4 = download_row(&pool, "v4").await;
        assert_eq!(v4.status, "failed");
        assert_eq!(v4.error_message.as_deref(), Some("Video unavailable"));
        assert!(!v4.file_exists);

        let history = history_rows(&pool).await;
        assert_eq!(history[0].videos_failed, 1);
        assert_eq!(history[0].videos_downloaded, 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_tombstone_resurrection() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path());
        let channel = insert_channel(&pool, "UCx", "My Channel", 5, true).await?;

        let fetcher = ScriptedFetcher::new(media.path());
        fetcher.list_for("UCx", &["vid_aaa"]);
        process(&state, &fetcher, &channel).await?;

        // Retention (or an operator) removed the file later.
        sqlx::query("UPDATE downloads SET file_exists = 0 WHERE video_id = 'vid_aaa';")
            .execute(&pool)
            .await?;

        let outcome = process(&state, &fetcher, &channel).await?;
        assert_eq!(outcome.downloaded, 1);
        let row = download_row(&pool, "vid_aaa").await;
        assert!(row.file_exists);
        assert_eq!(row.status, "completed");
        Ok(())
    }

    #[tokio::test]
    async fn test_discovery_hard_failure_marks_history() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path());
        let channel = insert_channel(&pool, "UCmissing", "Gone", 5, true).await?;

        struct FailingFetcher;
        impl crate::ytdlp::Fetcher for FailingFetcher {
            async fn list_recent(
                &self,
                _channel_url: &str,
                _limit: i64,
            ) -> Result<Vec<String>, FetchError> {
                Err(FetchError::Permanent("This channel does not exist".to_string()))
            }
            async fn fetch_video(
                &self,
                _video_id: &str,
                _channel: &crate::models::Channel,
            ) -> Result<crate::ytdlp::FetchedVideo, FetchError> {
                Err(FetchError::Permanent("unreachable".to_string()))
            }
            async fn refresh_channel(
                &self,
                _channel: &crate::models::Channel,
            ) -> Result<crate::ytdlp::ChannelRefresh, FetchError> {
                Err(FetchError::Permanent("unreachable".to_string()))
            }
        }

        let result = process(&state, &FailingFetcher, &channel).await;
        assert!(result.is_err());

        let history = history_rows(&pool).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, "failed");
        assert_eq!(
            history[0].error_message.as_deref(),
            Some("This channel does not exist")
        );

        let channel_after: crate::models::Channel =
            sqlx::query_as("SELECT * FROM channels WHERE id = $1;")
                .bind(channel.id)
                .fetch_one(&pool)
                .await?;
        assert!(channel_after.last_check.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_retention_runs_after_downloads() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let state = test_state(&pool, media.path());
        let channel = insert_channel(&pool, "UCx", "My Channel", 3, true).await?;

        let fetcher = ScriptedFetcher::new(media.path());
        fetcher.list_for("UCx", &["v1", "v2", "v3", "v4", "v5"]);
        for (vid, date) in [
            ("v1", "20240105"),
            ("v2", "20240104"),
            ("v3", "20240103"),
            ("v4", "20240102"),
            ("v5", "20240101"),
        ] {
            fetcher.upload_date_for(vid, date);
        }

        let outcome = process(&state, &fetcher, &channel).await?;
        assert_eq!(outcome.downloaded, 5);

        // Limit 3: the two oldest were retention-cleaned straight away.
        let on_disk: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM downloads WHERE file_exists = 1 AND channel_id = $1;",
        )
        .bind(channel.id)
        .fetch_one(&pool)
        .await?;
        assert_eq!(on_disk.0, 3);
        for vid in ["v4", "v5"] {
            let row = download_row(&pool, vid).await;
            assert!(!row.file_exists, "{vid} should have been cleaned");
        }
        Ok(())
    }
}
