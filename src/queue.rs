use crate::models::{now_rfc3339, parse_rfc3339};
use crate::settings::{KEY_MANUAL_TRIGGER_QUEUE, SettingsStore};
use tracing::{Level, event};

/// Queued manual requests older than this are dropped unserved at the start
/// of a drain; the requester has long since stopped waiting.
pub(crate) const MANUAL_TRIGGER_MAX_AGE_MINUTES: i64 = 30;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
/// One pending per-channel download request, submitted while a sweep held
/// the single-flight lock.
pub(crate) struct ManualTrigger {
    pub(crate) channel_id: String,
    pub(crate) user: String,
    pub(crate) timestamp: String,
}

#[derive(Clone, Debug)]
/// Durable FIFO of manual download requests, stored as a JSON array in one
/// settings row. Producer (the trigger surface) and consumer (the sweep)
/// both mutate it exclusively through [`SettingsStore::update`], which
/// provides the serializability a queue needs.
pub(crate) struct ManualTriggerQueue {
    settings: SettingsStore,
}

fn decode(raw: Option<&str>) -> Vec<ManualTrigger> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str(raw) {
        Ok(entries) => entries,
        Err(e) => {
            // A corrupt queue row would wedge every future mutation, so it
            // is dropped rather than preserved.
            event!(Level::WARN, "Discarding unreadable manual trigger queue: {e}");
            Vec::new()
        }
    }
}

fn encode(entries: &[ManualTrigger]) -> String {
    serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string())
}

impl ManualTriggerQueue {
    pub(crate) fn new(settings: &SettingsStore) -> Self {
        ManualTriggerQueue {
            settings: settings.clone(),
        }
    }

    /// Append a request and return its 1-based queue position.
    pub(crate) async fn enqueue(&self, channel_id: &str, user: &str) -> anyhow::Result<usize> {
        let mut position = 0;
        self.settings
            .update(KEY_MANUAL_TRIGGER_QUEUE, |raw| {
                let mut entries = decode(raw);
                entries.push(ManualTrigger {
                    channel_id: channel_id.to_string(),
                    user: user.to_string(),
                    timestamp: now_rfc3339(),
                });
                position = entries.len();
                encode(&entries)
            })
            .await?;
        Ok(position)
    }

    /// Drop expired head entries. Entries are appended in time order, so
    /// eviction stops at the first one still fresh. Returns how many were
    /// dropped.
    pub(crate) async fn drain_stale(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        max_age: chrono::Duration,
    ) -> anyhow::Result<usize> {
        let mut dropped: Vec<ManualTrigger> = Vec::new();
        self.settings
            .update(KEY_MANUAL_TRIGGER_QUEUE, |raw| {
                let mut entries = decode(raw);
                while let Some(head) = entries.first() {
                    let expired = parse_rfc3339(&head.timestamp)
                        .is_none_or(|t| now.signed_duration_since(t) > max_age);
                    if !expired {
                        break;
                    }
                    dropped.push(entries.remove(0));
                }
                encode(&entries)
            })
            .await?;

        for entry in &dropped {
            event!(
                Level::WARN,
                "Dropping stale manual trigger for channel {} (requested by '{}' at {})",
                entry.channel_id,
                entry.user,
                entry.timestamp,
            );
        }
        Ok(dropped.len())
    }

    /// Remove and return the head entry, when there is one.
    pub(crate) async fn pop(&self) -> anyhow::Result<Option<ManualTrigger>> {
        let mut head = None;
        self.settings
            .update(KEY_MANUAL_TRIGGER_QUEUE, |raw| {
                let mut entries = decode(raw);
                if !entries.is_empty() {
                    head = Some(entries.remove(0));
                }
                encode(&entries)
            })
            .await?;
        Ok(head)
    }
}
