// Open connections to the SQLite database at the supplied path. Create the
// application tables and indexes if they don't exist yet. The scheduler's
// own job store is a separate file and never lives in here.
pub(crate) async fn init_db(db_path: &str) -> anyhow::Result<sqlx::sqlite::SqlitePool> {
    let db_opts = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let db_pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(db_opts)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY,
            channel_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            video_limit INTEGER NOT NULL DEFAULT 10,
            enabled INTEGER NOT NULL DEFAULT 1,
            last_check TEXT,
            directory_name TEXT
        ) STRICT;",
    )
    .execute(&db_pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS downloads (
            id INTEGER PRIMARY KEY,
            channel_id INTEGER NOT NULL,
            video_id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            upload_date TEXT,
            duration INTEGER,
            file_path TEXT,
            file_size INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            file_exists INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            completed_at TEXT
        ) STRICT;",
    )
    .execute(&db_pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_downloads_channel_status
            ON downloads (channel_id, status);",
    )
    .execute(&db_pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_downloads_file_exists
            ON downloads (file_exists);",
    )
    .execute(&db_pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS download_history (
            id INTEGER PRIMARY KEY,
            channel_id INTEGER NOT NULL,
            run_at TEXT NOT NULL,
            videos_found INTEGER NOT NULL DEFAULT 0,
            videos_downloaded INTEGER NOT NULL DEFAULT 0,
            videos_skipped INTEGER NOT NULL DEFAULT 0,
            videos_failed INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'running',
            error_message TEXT,
            completed_at TEXT
        ) STRICT;",
    )
    .execute(&db_pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            description TEXT,
            updated_at TEXT NOT NULL
        ) STRICT;",
    )
    .execute(&db_pool)
    .await?;

    Ok(db_pool)
}
