use crate::errors::{FetchError, classify_tool_failure};
use crate::metadata::{ChannelDump, ChannelInfo, FlatPlaylist, VideoInfo};
use crate::models::Channel;
use crate::paths;
use std::path::{Path, PathBuf};
use tracing::{Level, event};

// Subtitle languages mirrored next to each video. The live-chat pseudo
// subtitle is huge and useless to a library, so it is excluded explicitly.
const SUBTITLE_LANGS: &str = "en.*,es.*,-live_chat";

// Container everything gets merged into so the library reader never sees
// split audio/video streams.
const MERGE_FORMAT: &str = "mp4";

// File name stem used inside the temporary working directory. Downloading
// under a fixed name and renaming afterwards keeps the final naming rules in
// one place instead of scattered across tool templates.
const WORK_STEM: &str = "download";

/// Everything a channel job needs to know about one successfully fetched
/// video: its parsed metadata and where its files ended up.
#[derive(Debug)]
pub(crate) struct FetchedVideo {
    pub(crate) info: VideoInfo,
    pub(crate) video_path: PathBuf,
    pub(crate) year_dir: PathBuf,
    pub(crate) file_size: i64,
}

/// A refreshed view of channel-level metadata, plus the raw JSON document it
/// was parsed from (persisted as the channel's info sidecar).
#[derive(Debug)]
pub(crate) struct ChannelRefresh {
    pub(crate) info: ChannelInfo,
    pub(crate) raw_json: String,
}

/// The seam between orchestration and the extraction tool. Channel jobs are
/// generic over this trait; tests drive them with scripted implementations
/// instead of a network.
pub(crate) trait Fetcher {
    /// List the ids of the `limit` most recent videos of `channel_url`,
    /// newest first, without fetching per-video metadata.
    fn list_recent(
        &self,
        channel_url: &str,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<String>, FetchError>> + Send;

    /// Download one video into its final place below the media root.
    fn fetch_video(
        &self,
        video_id: &str,
        channel: &Channel,
    ) -> impl std::future::Future<Output = Result<FetchedVideo, FetchError>> + Send;

    /// Fetch channel-level metadata. Implementations may also deposit
    /// channel artwork next to the metadata; that part is best-effort.
    fn refresh_channel(
        &self,
        channel: &Channel,
    ) -> impl std::future::Future<Output = Result<ChannelRefresh, FetchError>> + Send;
}

#[derive(Clone, Debug)]
/// Production [`Fetcher`] invoking the `yt-dlp` binary as an opaque
/// subprocess.
pub(crate) struct YtDlp {
    media_dir: PathBuf,
    tmp_dir: PathBuf,
    cookie_file: Option<PathBuf>,
    fragment_concurrency: u32,
}

// Error out early if `yt-dlp` can't be called at all; a daemon that can
// never download anything should not pretend to start.
pub(crate) fn preflight(tmp_dir: &Path) -> anyhow::Result<()> {
    if std::process::Command::new("yt-dlp")
        .env_clear()
        .current_dir(tmp_dir)
        .arg("--version")
        .output()
        .is_err()
    {
        return Err(anyhow::anyhow!(
            "No 'yt-dlp' executable found, make sure it is installed"
        ));
    }
    Ok(())
}

impl YtDlp {
    pub(crate) fn new(
        media_dir: PathBuf,
        tmp_dir: PathBuf,
        cookie_file: Option<PathBuf>,
        fragment_concurrency: u32,
    ) -> Self {
        YtDlp {
            media_dir,
            tmp_dir,
            cookie_file,
            fragment_concurrency,
        }
    }

    // Shared invocation base: clean environment, quiet output, optional
    // cookie jar for age-restricted content.
    fn command(&self, workdir: &Path) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("yt-dlp");
        cmd.env_clear()
            .current_dir(workdir)
            .arg("--quiet")
            .arg("--no-warnings")
            .arg("--no-progress")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(cookie_file) = &self.cookie_file {
            cmd.arg("--cookies").arg(cookie_file);
        }
        cmd
    }

    async fn run(mut cmd: tokio::process::Command) -> Result<Vec<u8>, FetchError> {
        let output = cmd.output().await.map_err(FetchError::Io)?;
        if !output.status.success() {
            return Err(classify_tool_failure(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }
        Ok(output.stdout)
    }

    // Rename one file the tool produced under `WORK_STEM` to its final
    // basename, mapping the thumbnail to the `-thumb` suffix the library
    // expects.
    fn staged_name(basename: &str, produced: &str) -> Option<String> {
        let remainder = produced.strip_prefix(WORK_STEM)?;
        match remainder {
            ".jpg" | ".jpeg" | ".png" | ".webp" => Some(format!("{basename}-thumb.jpg")),
            _ => Some(format!("{basename}{remainder}")),
        }
    }
}

impl Fetcher for YtDlp {
    async fn list_recent(
        &self,
        channel_url: &str,
        limit: i64,
    ) -> Result<Vec<String>, FetchError> {
        let mut cmd = self.command(&self.tmp_dir);
        cmd.arg("--flat-playlist")
            .arg("--dump-single-json")
            .arg("--playlist-end")
            .arg(limit.to_string())
            .arg(channel_url);

        let stdout = Self::run(cmd).await?;
        let listing: FlatPlaylist = serde_json::from_slice(&stdout)
            .map_err(|e| FetchError::Permanent(format!("unreadable playlist listing: {e}")))?;

        Ok(listing
            .entries
            .into_iter()
            .filter_map(|entry| entry.id)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .collect())
    }

    async fn fetch_video(
        &self,
        video_id: &str,
        channel: &Channel,
    ) -> Result<FetchedVideo, FetchError> {
        // The temporary folder name carries the current UNIX epoch timestamp
        // in microseconds, which avoids collisions between retries of the
        // same video.
        let work_dir = self.tmp_dir.join(format!(
            "{video_id}-{}",
            chrono::Utc::now().timestamp_micros()
        ));
        std::fs::create_dir_all(&work_dir)?;

        let result = self.fetch_video_in(&work_dir, video_id, channel).await;

        // The working directory is removed on every path; on success all
        // files have already been promoted out of it.
        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            event!(Level::WARN, "Failed to clean up {work_dir:?}: {e}");
        }

        result
    }

    async fn refresh_channel(&self, channel: &Channel) -> Result<ChannelRefresh, FetchError> {
        let mut cmd = self.command(&self.tmp_dir);
        cmd.arg("--flat-playlist")
            .arg("--playlist-items")
            .arg("0")
            .arg("--dump-single-json")
            .arg(&channel.url);

        let stdout = Self::run(cmd).await?;
        let raw_json = String::from_utf8_lossy(&stdout).to_string();
        let dump: ChannelDump = serde_json::from_str(&raw_json)
            .map_err(|e| FetchError::Permanent(format!("unreadable channel metadata: {e}")))?;
        let info = ChannelInfo::from_dump(dump, channel);

        // Channel artwork is a nicety: failure to fetch it never fails the
        // refresh.
        let channel_dir = self.media_dir.join(channel.directory());
        if let Err(e) = std::fs::create_dir_all(&channel_dir) {
            event!(Level::WARN, "Failed to create {channel_dir:?}: {e}");
        } else {
            let mut cmd = self.command(&channel_dir);
            cmd.arg("--skip-download")
                .arg("--playlist-items")
                .arg("0")
                .arg("--write-thumbnail")
                .arg("--convert-thumbnails")
                .arg("jpg")
                .arg("--output")
                .arg("cover.%(ext)s")
                .arg(&channel.url);
            if let Err(e) = Self::run(cmd).await {
                event!(
                    Level::WARN,
                    "Could not fetch artwork for channel {}: {e}",
                    channel.channel_id
                );
            }
        }

        Ok(ChannelRefresh { info, raw_json })
    }
}

impl YtDlp {
    async fn fetch_video_in(
        &self,
        work_dir: &Path,
        video_id: &str,
        channel: &Channel,
    ) -> Result<FetchedVideo, FetchError> {
        let url = format!("https://www.youtube.com/watch?v={video_id}");

        let mut cmd = self.command(work_dir);
        cmd.arg("--no-simulate")
            .arg("--write-info-json")
            .arg("--write-thumbnail")
            .arg("--embed-thumbnail")
            .arg("--convert-thumbnails")
            .arg("jpg")
            .arg("--write-subs")
            .arg("--sub-langs")
            .arg(SUBTITLE_LANGS)
            .arg("--merge-output-format")
            .arg(MERGE_FORMAT)
            .arg("--concurrent-fragments")
            .arg(self.fragment_concurrency.to_string())
            .arg("--output")
            .arg(format!("{WORK_STEM}.%(ext)s"))
            .arg(&url);
        Self::run(cmd).await?;

        let info = crate::metadata::read_info_json(&work_dir.join(format!(
            "{WORK_STEM}.info.json"
        )))
        .map_err(|e| FetchError::Permanent(format!("missing video metadata: {e}")))?;

        // Locate the media file among the tool's output. Partial fragments
        // and sidecars are not it.
        let media_file = find_media_file(work_dir, info.ext.as_deref())?.ok_or_else(|| {
            FetchError::Permanent("tool reported success but produced no media file".to_string())
        })?;

        let upload_date = info.upload_date.clone().unwrap_or_else(|| "00000000".to_string());
        let year = info.upload_year().unwrap_or("0000").to_string();
        let basename =
            paths::video_basename(&channel.name, &upload_date, &info.title, video_id);

        // Stage the final folder inside the working directory, then promote
        // it below the media root with a single rename.
        let staging_dir = work_dir.join(&basename);
        std::fs::create_dir_all(&staging_dir)?;
        let produced_files: Vec<String> = std::fs::read_dir(work_dir)?
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();

        let mut video_file_name = None;
        for produced in produced_files {
            let Some(staged) = Self::staged_name(&basename, &produced) else {
                continue;
            };
            if produced == media_file {
                video_file_name = Some(staged.clone());
            }
            std::fs::rename(work_dir.join(&produced), staging_dir.join(staged))?;
        }
        let video_file_name = video_file_name.ok_or_else(|| {
            FetchError::Permanent("media file disappeared while staging".to_string())
        })?;

        let year_dir = self.media_dir.join(channel.directory()).join(&year);
        std::fs::create_dir_all(&year_dir)?;
        let video_dir = year_dir.join(&basename);
        if video_dir.exists() {
            // An earlier partial attempt left remains; the fresh download
            // replaces them wholesale.
            std::fs::remove_dir_all(&video_dir)?;
        }
        std::fs::rename(&staging_dir, &video_dir)?;

        let video_path = video_dir.join(&video_file_name);
        let file_size = i64::try_from(std::fs::metadata(&video_path)?.len()).unwrap_or(i64::MAX);

        event!(
            Level::INFO,
            "Downloaded {video_id} for channel {} to {video_path:?}",
            channel.channel_id
        );

        Ok(FetchedVideo {
            info,
            video_path,
            year_dir,
            file_size,
        })
    }
}

// The media file is whatever `WORK_STEM`-prefixed output is neither a
// sidecar nor an in-progress fragment, preferring the container extension
// the tool's metadata names.
fn find_media_file(work_dir: &Path, preferred_ext: Option<&str>) -> Result<Option<String>, FetchError> {
    const SIDECAR_SUFFIXES: [&str; 8] = [
        ".info.json",
        ".json",
        ".jpg",
        ".jpeg",
        ".png",
        ".webp",
        ".vtt",
        ".srt",
    ];

    if let Some(ext) = preferred_ext {
        let preferred = format!("{WORK_STEM}.{ext}");
        if work_dir.join(&preferred).is_file() {
            return Ok(Some(preferred));
        }
    }

    for entry in std::fs::read_dir(work_dir)
        .map_err(FetchError::Io)?
        .filter_map(Result::ok)
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(WORK_STEM) || name.ends_with(".part") {
            continue;
        }
        if SIDECAR_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        return Ok(Some(name));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_name_mapping() {
        let base = "Chan - 20240115 - Title [abc123def45]";
        let cases = [
            ("download.mp4", Some(format!("{base}.mp4"))),
            ("download.info.json", Some(format!("{base}.info.json"))),
            ("download.jpg", Some(format!("{base}-thumb.jpg"))),
            ("download.webp", Some(format!("{base}-thumb.jpg"))),
            ("download.en.vtt", Some(format!("{base}.en.vtt"))),
            ("unrelated.txt", None),
        ];

        for (produced, expected) in cases {
            assert_eq!(YtDlp::staged_name(base, produced), expected, "{produced}");
        }
    }

    #[test]
    fn test_find_media_file_skips_sidecars_and_fragments() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for name in [
            "download.info.json",
            "download.jpg",
            "download.en.vtt",
            "download.mp4.part",
        ] {
            std::fs::write(dir.path().join(name), b"x")?;
        }
        assert_eq!(find_media_file(dir.path(), None)?, None);

        std::fs::write(dir.path().join("download.mp4"), b"video")?;
        assert_eq!(
            find_media_file(dir.path(), None)?.as_deref(),
            Some("download.mp4")
        );
        // The container extension from the metadata wins over scanning.
        std::fs::write(dir.path().join("download.mkv"), b"video")?;
        assert_eq!(
            find_media_file(dir.path(), Some("mkv"))?.as_deref(),
            Some("download.mkv")
        );
        Ok(())
    }
}
