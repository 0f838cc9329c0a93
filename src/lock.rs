use crate::errors::LockHeldError;
use crate::models::{now_rfc3339, parse_rfc3339};
use crate::settings::SettingsStore;
use tracing::{Level, event};

/// Name of the lock guarding scheduled sweeps. The settings keys derived
/// from it (`scheduled_downloads_running`, `scheduled_downloads_last_run`)
/// are also what the manual-trigger surface consults.
pub(crate) const SCHEDULED_DOWNLOADS_LOCK: &str = "scheduled_downloads";

/// A lock held longer than this is assumed to be the leftover of a process
/// that died mid-run and is cleared at startup.
pub(crate) const STALE_LOCK_MAX_AGE_HOURS: i64 = 2;

#[derive(Clone, Debug)]
/// A named single-flight lock persisted in the settings table, so it holds
/// across process restarts and is visible to collaborating surfaces.
///
/// The flag lives under `{name}_running` as `"true"`/`"false"`; acquisition
/// is a check-and-set inside one transaction under the settings store's
/// write mutex.
pub(crate) struct SingleFlightLock {
    settings: SettingsStore,
}

impl SingleFlightLock {
    pub(crate) fn new(settings: &SettingsStore) -> Self {
        SingleFlightLock {
            settings: settings.clone(),
        }
    }

    // Atomically flip `{name}_running` from unset/"false" to "true" and
    // stamp `{name}_last_run`. A concurrent holder surfaces as
    // `LockHeldError` and nothing is written.
    async fn acquire(&self, name: &str) -> anyhow::Result<()> {
        let _guard = self.settings.serialize_writes().await;

        let mut tx = self.settings.pool().begin().await?;
        let flag_key = format!("{name}_running");

        let current: Option<(String,)> =
            sqlx::query_as("SELECT value FROM settings WHERE key = $1;")
                .bind(&flag_key)
                .fetch_optional(&mut *tx)
                .await?;
        if current.map(|r| r.0).as_deref() == Some("true") {
            // Dropping the transaction rolls it back.
            return Err(LockHeldError {
                name: name.to_string(),
            }
            .into());
        }

        let now = now_rfc3339();
        for (key, value) in [
            (flag_key, "true".to_string()),
            (format!("{name}_last_run"), now.clone()),
        ] {
            sqlx::query(
                "INSERT INTO settings ( key, value, description, updated_at )
                VALUES ( $1, $2, NULL, $3 )
                ON CONFLICT ( key ) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at;",
            )
            .bind(&key)
            .bind(&value)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    // Reset the flag to "false". Failures are retried once and otherwise
    // only logged: a sticky flag is recovered by `clear_stale` on the next
    // process start.
    async fn release(&self, name: &str) {
        let flag_key = format!("{name}_running");
        for attempt in 1..=2 {
            match self.settings.put(&flag_key, "false", None).await {
                Ok(()) => return,
                Err(e) => {
                    event!(
                        Level::WARN,
                        "Failed to release lock '{name}' (attempt {attempt}): {e}"
                    );
                }
            }
        }
    }

    /// Run `body` under the named lock. The body is executed on its own task
    /// so that even a panic inside it cannot skip the release; a panic is
    /// logged and swallowed. When the lock is already held the body is not
    /// invoked and the returned error downcasts to [`LockHeldError`].
    pub(crate) async fn with_lock<F>(&self, name: &str, body: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.acquire(name).await?;

        let outcome = tokio::task::spawn(body).await;
        self.release(name).await;

        match outcome {
            Ok(result) => result,
            Err(e) => {
                event!(Level::WARN, "Locked body for '{name}' panicked: {e}");
                Ok(())
            }
        }
    }

    /// Startup recovery: when the flag is still "true" but `{name}_last_run`
    /// (or, missing that, the flag row's own `updated_at`) lies further back
    /// than `max_age`, the previous holder is assumed dead and the flag is
    /// reset.
    pub(crate) async fn clear_stale(
        &self,
        name: &str,
        max_age: chrono::Duration,
    ) -> anyhow::Result<()> {
        let flag_key = format!("{name}_running");

        let flag_row: Option<(String, String)> =
            sqlx::query_as("SELECT value, updated_at FROM settings WHERE key = $1;")
                .bind(&flag_key)
                .fetch_optional(self.settings.pool())
                .await?;
        let Some((value, flag_updated_at)) = flag_row else {
            return Ok(());
        };
        if value != "true" {
            return Ok(());
        }

        let held_since = match self.settings.get(&format!("{name}_last_run")).await? {
            Some(last_run) => parse_rfc3339(&last_run),
            None => parse_rfc3339(&flag_updated_at),
        };

        // An unreadable timestamp is treated as ancient: better to recover
        // liveness than to stay wedged behind a flag nobody holds.
        let age_exceeded =
            held_since.is_none_or(|t| chrono::Utc::now().signed_duration_since(t) > max_age);
        if age_exceeded {
            event!(
                Level::WARN,
                "Lock '{name}' was still held at startup and is older than {}h, clearing stale flag",
                max_age.num_hours()
            );
            self.settings.put(&flag_key, "false", None).await?;
        }

        Ok(())
    }
}
