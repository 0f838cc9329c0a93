//! The slice of the extraction tool's JSON output the core consumes. All
//! structs deserialize leniently: the tool's schema is large and shifts
//! between releases, and a missing optional field must never fail a job.

use std::path::Path;

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
/// Per-video metadata, from `--dump-single-json` output or an `.info.json`
/// sidecar.
pub(crate) struct VideoInfo {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) description: String,
    pub(crate) channel: Option<String>,
    pub(crate) uploader: Option<String>,
    /// Upload day as `YYYYMMDD`.
    pub(crate) upload_date: Option<String>,
    /// Runtime in seconds. The tool emits fractional values for some sites.
    pub(crate) duration: Option<f64>,
    /// ISO 639-1 code of the primary audio language, when known.
    pub(crate) language: Option<String>,
    #[serde(default)]
    pub(crate) categories: Vec<String>,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
    /// Container extension of the final media file.
    pub(crate) ext: Option<String>,
}

impl VideoInfo {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn duration_secs(&self) -> Option<i64> {
        self.duration.map(|d| d as i64)
    }

    /// The year component of `upload_date`, used as the season folder name.
    pub(crate) fn upload_year(&self) -> Option<&str> {
        match &self.upload_date {
            Some(date) if date.len() == 8 => Some(&date[..4]),
            _ => None,
        }
    }

    /// `upload_date` reformatted `YYYYMMDD` -> `YYYY-MM-DD`.
    pub(crate) fn aired_date(&self) -> Option<String> {
        match &self.upload_date {
            Some(date) if date.len() == 8 && date.chars().all(|c| c.is_ascii_digit()) => {
                Some(format!("{}-{}-{}", &date[..4], &date[4..6], &date[6..8]))
            }
            _ => None,
        }
    }
}

/// Read a `.info.json` sidecar back into the fields the core cares about.
pub(crate) fn read_info_json(path: &Path) -> anyhow::Result<VideoInfo> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[derive(Clone, Debug, Default)]
/// Channel-level metadata backing the show descriptor and the channel info
/// sidecar.
pub(crate) struct ChannelInfo {
    pub(crate) channel_id: String,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) tags: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
/// Raw shape of a channel-page `--dump-single-json` document; only used to
/// build a [`ChannelInfo`].
pub(crate) struct ChannelDump {
    pub(crate) id: Option<String>,
    pub(crate) channel_id: Option<String>,
    pub(crate) channel: Option<String>,
    pub(crate) uploader: Option<String>,
    pub(crate) title: Option<String>,
    #[serde(default)]
    pub(crate) description: String,
    #[serde(default)]
    pub(crate) tags: Vec<String>,
}

impl ChannelInfo {
    pub(crate) fn from_dump(dump: ChannelDump, fallback: &crate::models::Channel) -> Self {
        ChannelInfo {
            channel_id: dump
                .channel_id
                .or(dump.id)
                .unwrap_or_else(|| fallback.channel_id.clone()),
            name: dump
                .channel
                .or(dump.uploader)
                .or(dump.title)
                .unwrap_or_else(|| fallback.name.clone()),
            description: dump.description,
            tags: dump.tags,
        }
    }

    /// Metadata derived from the channel row alone, for when no refresh from
    /// the tool is available.
    pub(crate) fn from_channel(channel: &crate::models::Channel) -> Self {
        ChannelInfo {
            channel_id: channel.channel_id.clone(),
            name: channel.name.clone(),
            description: String::new(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
/// A flat-playlist listing: entries carry ids and nothing the core needs
/// beyond that.
pub(crate) struct FlatPlaylist {
    #[serde(default)]
    pub(crate) entries: Vec<FlatEntry>,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct FlatEntry {
    pub(crate) id: Option<String>,
}
