use crate::models::{Channel, Download, DownloadStatus, now_rfc3339};
use crate::paths;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{Level, event};

// Extensions that mark a file as a sidecar rather than the media itself.
// Sidecars still witness a video id, but the media file is the preferred
// witness because its path is what the download row records.
const SIDECAR_EXTS: [&str; 8] = ["json", "nfo", "jpg", "jpeg", "png", "webp", "vtt", "srt"];

fn is_sidecar(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SIDECAR_EXTS.contains(&ext.to_lowercase().as_str()))
}

#[derive(Debug, Default)]
/// The set of video ids witnessed on disk below one channel directory,
/// built with a single walk and consulted in O(1) for every candidate of a
/// channel job. On-disk presence of a `[<video_id>]` token is a first-class
/// fact, equal in authority to a download row.
pub(crate) struct DiskIndex {
    witnesses: HashMap<String, PathBuf>,
}

impl DiskIndex {
    /// Walk `channel_dir` once, recording for every witnessed id the path
    /// that proves it. In-progress `.part` files do not count.
    pub(crate) fn scan(channel_dir: &Path) -> DiskIndex {
        let mut witnesses: HashMap<String, PathBuf> = HashMap::new();
        if !channel_dir.is_dir() {
            return DiskIndex { witnesses };
        }

        for entry in walkdir::WalkDir::new(channel_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".part") {
                continue;
            }
            let Some(video_id) = paths::witnessed_video_id(&name) else {
                continue;
            };

            match witnesses.get(&video_id) {
                // A media file beats a previously recorded sidecar.
                Some(existing)
                    if is_sidecar(&existing.to_string_lossy()) && !is_sidecar(&name) =>
                {
                    witnesses.insert(video_id, entry.path().to_path_buf());
                }
                Some(_) => {}
                None => {
                    witnesses.insert(video_id, entry.path().to_path_buf());
                }
            }
        }

        DiskIndex { witnesses }
    }

    pub(crate) fn witness(&self, video_id: &str) -> Option<&Path> {
        self.witnesses.get(video_id).map(PathBuf::as_path)
    }

    pub(crate) fn len(&self) -> usize {
        self.witnesses.len()
    }
}

/// Decide whether `video_id` must be downloaded for `channel`, reconciling
/// the downloads table with the on-disk index. Short-circuiting order:
///
/// 1. a completed row whose file still exists  -> no download
/// 2. a tombstone row (`file_exists = false`)  -> download (resurrection)
/// 3. a file on disk without a row             -> synthesize a completed row
/// 4. nothing anywhere                         -> download
pub(crate) async fn should_download(
    db_pool: &sqlx::sqlite::SqlitePool,
    channel: &Channel,
    video_id: &str,
    index: &DiskIndex,
) -> anyhow::Result<(bool, Option<Download>)> {
    let existing = sqlx::query_as::<_, Download>(
        "SELECT * FROM downloads WHERE channel_id = $1 AND video_id = $2;",
    )
    .bind(channel.id)
    .bind(video_id)
    .fetch_optional(db_pool)
    .await?;

    if let Some(row) = existing {
        if row.is_completed_on_disk() {
            return Ok((false, Some(row)));
        }
        if !row.file_exists {
            return Ok((true, Some(row)));
        }
        // A row claiming an existing file in a non-completed state is a
        // crash leftover; trust the disk.
        if let Some(witness) = index.witness(video_id) {
            let row = mark_found_on_disk(db_pool, row.id, witness).await?;
            return Ok((false, Some(row)));
        }
        return Ok((true, Some(row)));
    }

    if let Some(witness) = index.witness(video_id) {
        event!(
            Level::INFO,
            "Adopting {video_id} for channel {}: already on disk at {witness:?}",
            channel.channel_id
        );
        let row = synthesize_row(db_pool, channel, video_id, witness).await?;
        return Ok((false, Some(row)));
    }

    Ok((true, None))
}

// Record a video that exists on disk but was never entered into the table,
// so later sweeps skip it without touching the filesystem.
async fn synthesize_row(
    db_pool: &sqlx::sqlite::SqlitePool,
    channel: &Channel,
    video_id: &str,
    witness: &Path,
) -> anyhow::Result<Download> {
    let now = now_rfc3339();
    sqlx::query(
        "INSERT INTO downloads
            ( channel_id, video_id, title, file_path, status, file_exists, created_at, completed_at )
        VALUES ( $1, $2, $3, $4, $5, 1, $6, $6 );",
    )
    .bind(channel.id)
    .bind(video_id)
    .bind("Found on disk")
    .bind(witness.to_string_lossy().as_ref())
    .bind(DownloadStatus::Completed.as_str())
    .bind(&now)
    .execute(db_pool)
    .await?;

    let row = sqlx::query_as::<_, Download>(
        "SELECT * FROM downloads WHERE channel_id = $1 AND video_id = $2;",
    )
    .bind(channel.id)
    .bind(video_id)
    .fetch_one(db_pool)
    .await?;
    Ok(row)
}

async fn mark_found_on_disk(
    db_pool: &sqlx::sqlite::SqlitePool,
    row_id: i64,
    witness: &Path,
) -> anyhow::Result<Download> {
    sqlx::query(
        "UPDATE downloads
        SET status = $1, file_path = $2, file_exists = 1, completed_at = $3, error_message = NULL
        WHERE id = $4;",
    )
    .bind(DownloadStatus::Completed.as_str())
    .bind(witness.to_string_lossy().as_ref())
    .bind(now_rfc3339())
    .bind(row_id)
    .execute(db_pool)
    .await?;

    let row = sqlx::query_as::<_, Download>("SELECT * FROM downloads WHERE id = $1;")
        .bind(row_id)
        .fetch_one(db_pool)
        .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::{insert_channel, temp_db};

    fn seed_video_dir(root: &Path, video_id: &str) -> anyhow::Result<PathBuf> {
        let video_dir = root
            .join("2024")
            .join(format!("Chan - 20240101 - Title [{video_id}]"));
        std::fs::create_dir_all(&video_dir)?;
        let media = video_dir.join(format!("Chan - 20240101 - Title [{video_id}].mp4"));
        std::fs::write(&media, b"video bytes")?;
        std::fs::write(
            video_dir.join(format!("Chan - 20240101 - Title [{video_id}].info.json")),
            b"{}",
        )?;
        Ok(media)
    }

    #[test]
    fn test_disk_index_prefers_media_witness_and_skips_partials() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let media = seed_video_dir(dir.path(), "vid_aaaaaaa")?;

        // A partial download does not witness its id.
        std::fs::write(
            dir.path().join("2024").join("Chan - 20240102 - Later [vid_bbbbbbb].mp4.part"),
            b"partial",
        )?;

        let index = DiskIndex::scan(dir.path());
        assert_eq!(index.len(), 1);
        assert_eq!(index.witness("vid_aaaaaaa"), Some(media.as_path()));
        assert_eq!(index.witness("vid_bbbbbbb"), None);

        // A missing channel directory scans to an empty index.
        let empty = DiskIndex::scan(&dir.path().join("does-not-exist"));
        assert_eq!(empty.len(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_completed_row_short_circuits() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let channel = insert_channel(&pool, "UCx", "Chan", 5, true).await?;

        sqlx::query(
            "INSERT INTO downloads
                ( channel_id, video_id, title, file_path, status, file_exists, created_at )
            VALUES ( $1, $2, 'T', '/media/x [vid_aaaaaaa].mp4', 'completed', 1, $3 );",
        )
        .bind(channel.id)
        .bind("vid_aaaaaaa")
        .bind(now_rfc3339())
        .execute(&pool)
        .await?;

        let index = DiskIndex::default();
        let (needed, row) = should_download(&pool, &channel, "vid_aaaaaaa", &index).await?;
        assert!(!needed);
        assert!(row.is_some_and(|r| r.is_completed_on_disk()));
        Ok(())
    }

    #[tokio::test]
    async fn test_tombstone_is_resurrected() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let channel = insert_channel(&pool, "UCx", "Chan", 5, true).await?;

        sqlx::query(
            "INSERT INTO downloads
                ( channel_id, video_id, title, status, file_exists, created_at )
            VALUES ( $1, $2, 'T', 'completed', 0, $3 );",
        )
        .bind(channel.id)
        .bind("vid_aaaaaaa")
        .bind(now_rfc3339())
        .execute(&pool)
        .await?;

        let (needed, row) = should_download(&pool, &channel, "vid_aaaaaaa", &DiskIndex::default())
            .await?;
        assert!(needed);
        assert!(row.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_disk_witness_synthesizes_row() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let channel = insert_channel(&pool, "UCx", "Chan", 5, true).await?;

        let media_dir = tempfile::tempdir()?;
        let media = seed_video_dir(media_dir.path(), "vid_aaaaaaa")?;
        let index = DiskIndex::scan(media_dir.path());

        let (needed, row) = should_download(&pool, &channel, "vid_aaaaaaa", &index).await?;
        assert!(!needed);
        let row = row.ok_or_else(|| anyhow::anyhow!("expected synthesized row"))?;
        assert_eq!(row.title, "Found on disk");
        assert!(row.file_exists);
        assert_eq!(row.status, "completed");
        assert_eq!(row.file_path.as_deref(), media.to_str());

        // The synthesized row now short-circuits future queries.
        let (needed, _) = should_download(&pool, &channel, "vid_aaaaaaa", &index).await?;
        assert!(!needed);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_video_needs_download() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let channel = insert_channel(&pool, "UCx", "Chan", 5, true).await?;

        let (needed, row) =
            should_download(&pool, &channel, "vid_zzzzzzz", &DiskIndex::default()).await?;
        assert!(needed);
        assert!(row.is_none());
        Ok(())
    }
}
