use std::path::Path;
use std::sync::LazyLock;

// Characters that are unsafe in file and directory names on at least one of
// the filesystems the media root may live on.
#[allow(clippy::unwrap_used)]
static FORBIDDEN_CHARS: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).unwrap());

// The bracketed video-id token every file and folder belonging to a video
// carries, e.g. `[dQw4w9WgXcQ]`. YouTube ids are URL-safe base64.
#[allow(clippy::unwrap_used)]
static ID_TOKEN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\[([0-9A-Za-z_-]+)\]").unwrap());

// Titles are capped so the per-video folder name stays well below common
// filesystem component limits even with channel name and date prepended.
const MAX_TITLE_CHARS: usize = 150;

/// Strip a human-supplied name down to something safe to use as a single
/// path component. Never returns an empty string.
pub(crate) fn sanitize_component(name: &str) -> String {
    let cleaned = FORBIDDEN_CHARS.replace_all(name, " ");
    let collapsed = cleaned.split_whitespace().collect::<Vec<&str>>().join(" ");
    let trimmed = collapsed.trim_matches(|c| c == '.' || c == ' ');

    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.chars().take(MAX_TITLE_CHARS).collect()
    }
}

/// Deterministic channel directory name: `"{sanitized name} [{channel_id}]"`.
pub(crate) fn channel_dir_name(name: &str, channel_id: &str) -> String {
    format!("{} [{channel_id}]", sanitize_component(name))
}

/// Per-video folder and file basename:
/// `"{channel} - {YYYYMMDD} - {title} [{video_id}]"`.
pub(crate) fn video_basename(
    channel_name: &str,
    upload_date: &str,
    title: &str,
    video_id: &str,
) -> String {
    format!(
        "{} - {upload_date} - {} [{video_id}]",
        sanitize_component(channel_name),
        sanitize_component(title),
    )
}

// Extract the video id witnessed by a file name. The id token is always the
// last bracketed group the download template emits, so when a title itself
// contains brackets the final match wins.
pub(crate) fn witnessed_video_id(file_name: &str) -> Option<String> {
    ID_TOKEN
        .captures_iter(file_name)
        .last()
        .map(|c| c[1].to_string())
}

// True if `target` stays inside `root` going by path components alone. Used
// as a guard before every unlink and rmdir below the media root.
pub(crate) fn is_under(root: &Path, target: &Path) -> bool {
    target.starts_with(root)
}

/// Write `bytes` to `path` via a sibling `.tmp` file and an atomic rename,
/// so readers observe either the old contents or the new ones, never a
/// partial write.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
