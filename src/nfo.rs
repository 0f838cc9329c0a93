//! Library descriptor (`.nfo`) generation. Three kinds exist: one per
//! channel (`tvshow.nfo`), one per year folder (`season.nfo`), and one per
//! video. All are UTF-8 XML, escaped by the emitter, and written atomically
//! via a temp file and rename so a crash never leaves a torn descriptor.

use crate::metadata::{ChannelInfo, VideoInfo};
use crate::paths::atomic_write;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::path::Path;
use tracing::{Level, event};

const STUDIO: &str = "YouTube";
const UNIQUEID_TYPE: &str = "youtube";

// Timestamp format library readers expect in `dateadded`.
fn date_added(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    text: &str,
) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

// The provider id element carries attributes marking it as the default
// external id for the entry.
fn uniqueid_element<W: std::io::Write>(writer: &mut Writer<W>, id: &str) -> anyhow::Result<()> {
    let mut start = BytesStart::new("uniqueid");
    start.push_attribute(("type", UNIQUEID_TYPE));
    start.push_attribute(("default", "true"));
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(id)))?;
    writer.write_event(Event::End(BytesEnd::new("uniqueid")))?;
    Ok(())
}

fn new_document() -> anyhow::Result<Writer<Vec<u8>>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
    Ok(writer)
}

/// Generate the channel-level `tvshow.nfo` inside `channel_dir`.
pub(crate) fn write_tvshow_nfo(channel_dir: &Path, info: &ChannelInfo) -> anyhow::Result<()> {
    let mut writer = new_document()?;

    writer.write_event(Event::Start(BytesStart::new("tvshow")))?;
    text_element(&mut writer, "title", &info.name)?;
    text_element(&mut writer, "plot", &info.description)?;
    uniqueid_element(&mut writer, &info.channel_id)?;
    text_element(&mut writer, "studio", STUDIO)?;
    for tag in &info.tags {
        text_element(&mut writer, "tag", tag)?;
    }
    writer.write_event(Event::End(BytesEnd::new("tvshow")))?;

    atomic_write(&channel_dir.join("tvshow.nfo"), &writer.into_inner())?;
    Ok(())
}

/// Generate the `season.nfo` for one year folder.
pub(crate) fn write_season_nfo(
    year_dir: &Path,
    year: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> anyhow::Result<()> {
    let mut writer = new_document()?;

    writer.write_event(Event::Start(BytesStart::new("season")))?;
    text_element(&mut writer, "plot", "")?;
    text_element(&mut writer, "outline", "")?;
    text_element(&mut writer, "dateadded", &date_added(now))?;
    text_element(&mut writer, "title", year)?;
    text_element(&mut writer, "season", year)?;
    writer.write_event(Event::Empty(BytesStart::new("art")))?;
    writer.write_event(Event::End(BytesEnd::new("season")))?;

    atomic_write(&year_dir.join("season.nfo"), &writer.into_inner())?;
    Ok(())
}

/// Generate the per-video descriptor at `dest`. Title and show title are
/// required by library readers; when either is missing the descriptor is
/// skipped with a warning and `Ok(false)` is returned.
pub(crate) fn write_episode_nfo(
    dest: &Path,
    info: &VideoInfo,
    show_title: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> anyhow::Result<bool> {
    if info.title.is_empty() || show_title.is_empty() {
        event!(
            Level::WARN,
            "Skipping descriptor for {}: missing title or show title",
            info.id
        );
        return Ok(false);
    }

    let mut writer = new_document()?;

    writer.write_event(Event::Start(BytesStart::new("episodedetails")))?;
    text_element(&mut writer, "title", &info.title)?;
    text_element(&mut writer, "showtitle", show_title)?;
    text_element(&mut writer, "plot", &info.description)?;
    if let Some(language) = &info.language {
        text_element(&mut writer, "language", language)?;
    }
    if let Some(aired) = info.aired_date() {
        text_element(&mut writer, "aired", &aired)?;
    }
    if let Some(year) = info.upload_year() {
        text_element(&mut writer, "year", year)?;
    }
    match info.duration_secs() {
        Some(secs) if secs > 0 => {
            text_element(&mut writer, "runtime", &(secs / 60).to_string())?;
        }
        _ => {}
    }
    if let Some(uploader) = &info.uploader {
        text_element(&mut writer, "director", uploader)?;
    }
    text_element(&mut writer, "studio", STUDIO)?;
    uniqueid_element(&mut writer, &info.id)?;
    for category in &info.categories {
        text_element(&mut writer, "genre", category)?;
    }
    for tag in &info.tags {
        text_element(&mut writer, "tag", tag)?;
    }
    text_element(&mut writer, "dateadded", &date_added(now))?;
    writer.write_event(Event::End(BytesEnd::new("episodedetails")))?;

    atomic_write(dest, &writer.into_inner())?;
    Ok(true)
}

/// Retention's descriptor cleanup: once a year folder holds no video folder
/// anymore, its `season.nfo` goes and then the folder itself. Returns
/// whether the folder was removed.
pub(crate) fn prune_year_dir(year_dir: &Path) -> anyhow::Result<bool> {
    if !year_dir.is_dir() {
        return Ok(false);
    }

    let has_video_folder = std::fs::read_dir(year_dir)?
        .filter_map(Result::ok)
        .any(|e| e.file_type().is_ok_and(|t| t.is_dir()));
    if has_video_folder {
        return Ok(false);
    }

    let season_nfo = year_dir.join("season.nfo");
    if season_nfo.is_file() {
        std::fs::remove_file(&season_nfo)?;
    }

    // Anything else left in the folder (stray files not owned by the core)
    // keeps it alive.
    if std::fs::read_dir(year_dir)?.filter_map(Result::ok).next().is_some() {
        return Ok(false);
    }
    std::fs::remove_dir(year_dir)?;
    Ok(true)
}
