use crate::paths;

// Obtain the current timestamp in ISO 8601 / RFC 3339 format as a string.
// Every timestamp the core persists goes through this helper so that all
// stored times share one format and one clock (UTC).
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().fixed_offset().format("%+").to_string()
}

// Parse a timestamp previously produced by `now_rfc3339` (or by a
// collaborator writing ISO 8601). Returns `None` for malformed input so
// callers can treat unparseable rows as expired.
pub(crate) fn parse_rfc3339(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a single download row.
pub(crate) enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle of a per-channel run record.
pub(crate) enum HistoryStatus {
    Running,
    Completed,
    Failed,
}

impl HistoryStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            HistoryStatus::Running => "running",
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
/// A followed channel. Rows are created and edited by the management
/// surface; the core only reads them and stamps `last_check`.
pub(crate) struct Channel {
    pub(crate) id: i64,
    pub(crate) channel_id: String,
    pub(crate) name: String,
    pub(crate) url: String,
    pub(crate) video_limit: i64,
    pub(crate) enabled: bool,
    pub(crate) last_check: Option<String>,
    pub(crate) directory_name: Option<String>,
}

impl Channel {
    /// The channel's directory below the media root. Stored when the
    /// management surface set one, derived deterministically otherwise.
    pub(crate) fn directory(&self) -> String {
        match &self.directory_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => paths::channel_dir_name(&self.name, &self.channel_id),
        }
    }

    /// How many videos discovery asks for: the per-channel limit when it is
    /// set to something sensible, else the instance-wide default.
    pub(crate) fn effective_limit(&self, default_limit: i64) -> i64 {
        if self.video_limit >= 1 {
            self.video_limit
        } else {
            default_limit.max(1)
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
/// One record per (channel, video) pair the core has ever observed. Rows
/// outlive their files: `file_exists = false` marks a tombstone kept so a
/// later sweep can decide whether to re-download.
pub(crate) struct Download {
    pub(crate) id: i64,
    pub(crate) channel_id: i64,
    pub(crate) video_id: String,
    pub(crate) title: String,
    pub(crate) upload_date: Option<String>,
    pub(crate) duration: Option<i64>,
    pub(crate) file_path: Option<String>,
    pub(crate) file_size: Option<i64>,
    pub(crate) status: String,
    pub(crate) error_message: Option<String>,
    pub(crate) file_exists: bool,
    pub(crate) created_at: String,
    pub(crate) completed_at: Option<String>,
}

impl Download {
    pub(crate) fn is_completed_on_disk(&self) -> bool {
        self.status == DownloadStatus::Completed.as_str() && self.file_exists
    }
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
/// Audit record of one channel run within a sweep.
pub(crate) struct DownloadHistory {
    pub(crate) id: i64,
    pub(crate) channel_id: i64,
    pub(crate) run_at: String,
    pub(crate) videos_found: i64,
    pub(crate) videos_downloaded: i64,
    pub(crate) videos_skipped: i64,
    pub(crate) videos_failed: i64,
    pub(crate) status: String,
    pub(crate) error_message: Option<String>,
    pub(crate) completed_at: Option<String>,
}
