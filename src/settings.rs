use crate::models::now_rfc3339;

// Keys the orchestration core reads and writes. Management surfaces may add
// their own keys; these are the ones with meaning in here.
pub(crate) const KEY_CRON_SCHEDULE: &str = "cron_schedule";
pub(crate) const KEY_SCHEDULER_ENABLED: &str = "scheduler_enabled";
pub(crate) const KEY_SCHEDULER_RUNNING: &str = "scheduler_running";
pub(crate) const KEY_SCHEDULER_LAST_RUN: &str = "scheduler_last_run";
pub(crate) const KEY_SCHEDULER_NEXT_RUN: &str = "scheduler_next_run";
pub(crate) const KEY_MANUAL_TRIGGER_QUEUE: &str = "manual_trigger_queue";
pub(crate) const KEY_DEFAULT_VIDEO_LIMIT: &str = "default_video_limit";
pub(crate) const KEY_OVERWRITE_EXISTING_NFO: &str = "overwrite_existing_nfo";
pub(crate) const KEY_NFO_ENABLED: &str = "nfo_enabled";
pub(crate) const KEY_LAST_RUN_SUMMARY: &str = "scheduled_downloads_last_run_summary";

pub(crate) const DEFAULT_CRON_SCHEDULE: &str = "0 0 * * *";
pub(crate) const DEFAULT_VIDEO_LIMIT: i64 = 10;

#[derive(Clone, Debug)]
/// Typed facade over the settings table. Values are plain strings; callers
/// serialize anything structured (the manual queue, the run summary) before
/// handing it over.
///
/// All writes are serialized through a per-process mutex on top of a
/// database transaction, and every read-modify-write MUST go through
/// [`SettingsStore::update`] so concurrent tasks cannot lose updates.
pub(crate) struct SettingsStore {
    db_pool: sqlx::sqlite::SqlitePool,
    write_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl SettingsStore {
    pub(crate) fn new(db_pool: &sqlx::sqlite::SqlitePool) -> Self {
        SettingsStore {
            db_pool: db_pool.clone(),
            write_lock: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    // The single-flight lock lives on top of this store and needs to run its
    // own multi-key transaction under the same write serialization.
    pub(crate) fn pool(&self) -> &sqlx::sqlite::SqlitePool {
        &self.db_pool
    }

    pub(crate) async fn serialize_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub(crate) async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM settings WHERE key = $1;")
                .bind(key)
                .fetch_optional(&self.db_pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    // Read a key, falling back to `default` when it was never written.
    pub(crate) async fn get_or(&self, key: &str, default: &str) -> anyhow::Result<String> {
        Ok(self.get(key).await?.unwrap_or_else(|| default.to_string()))
    }

    /// Write `value` under `key`, stamping `updated_at` in the same
    /// statement. An existing description is kept when none is supplied.
    pub(crate) async fn put(
        &self,
        key: &str,
        value: &str,
        description: Option<&str>,
    ) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        upsert(&self.db_pool, key, value, description).await
    }

    /// Atomic read-modify-write: `f` receives the current value (if any) and
    /// returns the replacement, which is committed in the same transaction
    /// the read ran in. Returns the newly stored value.
    pub(crate) async fn update<F>(&self, key: &str, f: F) -> anyhow::Result<String>
    where
        F: FnOnce(Option<&str>) -> String,
    {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.db_pool.begin().await?;
        let current: Option<(String,)> =
            sqlx::query_as("SELECT value FROM settings WHERE key = $1;")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        let next = f(current.as_ref().map(|r| r.0.as_str()));

        sqlx::query(
            "INSERT INTO settings ( key, value, description, updated_at )
            VALUES ( $1, $2, NULL, $3 )
            ON CONFLICT ( key ) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at;",
        )
        .bind(key)
        .bind(&next)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(next)
    }
}

async fn upsert(
    db_pool: &sqlx::sqlite::SqlitePool,
    key: &str,
    value: &str,
    description: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO settings ( key, value, description, updated_at )
        VALUES ( $1, $2, $3, $4 )
        ON CONFLICT ( key ) DO UPDATE SET
            value = excluded.value,
            description = COALESCE(excluded.description, settings.description),
            updated_at = excluded.updated_at;",
    )
    .bind(key)
    .bind(value)
    .bind(description)
    .bind(now_rfc3339())
    .execute(db_pool)
    .await?;

    Ok(())
}
