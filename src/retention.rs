use crate::models::{Channel, Download, DownloadStatus};
use crate::nfo;
use crate::paths;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{Level, event};

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RetentionOutcome {
    pub(crate) removed: usize,
    pub(crate) bytes_freed: u64,
}

/// Enforce the channel's retention limit after a run: keep the newest
/// `max(1, limit)` completed-and-on-disk videos and delete the rest,
/// together with their sidecars and emptied folders. Deleted rows become
/// tombstones (`file_exists = 0`) so dedup history survives.
///
/// Individual deletion failures are logged and do not stop the pass.
pub(crate) async fn apply(
    db_pool: &sqlx::sqlite::SqlitePool,
    channel: &Channel,
    media_root: &Path,
) -> anyhow::Result<RetentionOutcome> {
    // Even a limit of zero preserves the most recent video; a channel that
    // should mirror nothing is a disabled channel, not an empty one.
    let keep = usize::try_from(channel.video_limit.max(1)).unwrap_or(1);

    // Lexicographic DESC on YYYYMMDD is newest-first; rows without an upload
    // date (adopted from disk) sort last and are cleaned first.
    let rows = sqlx::query_as::<_, Download>(
        "SELECT * FROM downloads
        WHERE channel_id = $1 AND status = $2 AND file_exists = 1
        ORDER BY upload_date DESC, id DESC;",
    )
    .bind(channel.id)
    .bind(DownloadStatus::Completed.as_str())
    .fetch_all(db_pool)
    .await?;

    if rows.len() <= keep {
        return Ok(RetentionOutcome::default());
    }

    let mut outcome = RetentionOutcome::default();
    let mut touched_year_dirs: BTreeSet<PathBuf> = BTreeSet::new();

    for row in &rows[keep..] {
        let Some(file_path) = row.file_path.as_deref() else {
            continue;
        };
        let file_path = PathBuf::from(file_path);
        let Some(video_dir) = file_path.parent().map(Path::to_path_buf) else {
            continue;
        };

        if !paths::is_under(media_root, &video_dir) {
            event!(
                Level::WARN,
                "Refusing to clean {video_dir:?}: outside media root {media_root:?}"
            );
            continue;
        }

        outcome.bytes_freed += delete_video_files(&video_dir, &row.video_id);

        if let Some(year_dir) = video_dir.parent() {
            touched_year_dirs.insert(year_dir.to_path_buf());
        }

        sqlx::query("UPDATE downloads SET file_exists = 0 WHERE id = $1;")
            .bind(row.id)
            .execute(db_pool)
            .await?;
        outcome.removed += 1;
    }

    // With the surplus videos gone, year folders left without any video
    // folder lose their descriptor and themselves.
    for year_dir in touched_year_dirs {
        match nfo::prune_year_dir(&year_dir) {
            Ok(true) => {
                event!(Level::INFO, "Removed empty season folder {year_dir:?}");
            }
            Ok(false) => {}
            Err(e) => {
                event!(Level::WARN, "Failed to prune {year_dir:?}: {e}");
            }
        }
    }

    event!(
        Level::INFO,
        "Retention for channel {}: removed {} videos, freed {} bytes",
        channel.channel_id,
        outcome.removed,
        outcome.bytes_freed,
    );

    Ok(outcome)
}

// Delete every file in the video's own directory carrying its id token,
// then the directory itself once empty. Returns the bytes freed; failures
// are logged and skipped.
fn delete_video_files(video_dir: &Path, video_id: &str) -> u64 {
    let token = format!("[{video_id}]");
    let mut bytes_freed = 0_u64;

    let entries = match std::fs::read_dir(video_dir) {
        Ok(entries) => entries,
        Err(e) => {
            event!(Level::WARN, "Failed to list {video_dir:?}: {e}");
            return bytes_freed;
        }
    };

    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.contains(&token) {
            continue;
        }
        let path = entry.path();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(&path) {
            Ok(()) => bytes_freed += size,
            Err(e) => {
                event!(Level::WARN, "Failed to delete {path:?}: {e}");
            }
        }
    }

    // The folder only goes if nothing foreign is left inside.
    if let Ok(mut remaining) = std::fs::read_dir(video_dir) {
        if remaining.next().is_none() {
            if let Err(e) = std::fs::remove_dir(video_dir) {
                event!(Level::WARN, "Failed to remove {video_dir:?}: {e}");
            }
        }
    }

    bytes_freed
}
