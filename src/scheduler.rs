use crate::cron::{self, CronExpr};
use crate::lock::{SCHEDULED_DOWNLOADS_LOCK, STALE_LOCK_MAX_AGE_HOURS};
use crate::models::{now_rfc3339, parse_rfc3339};
use crate::settings::{
    DEFAULT_CRON_SCHEDULE, KEY_CRON_SCHEDULE, KEY_SCHEDULER_ENABLED, KEY_SCHEDULER_LAST_RUN,
    KEY_SCHEDULER_NEXT_RUN, KEY_SCHEDULER_RUNNING, SettingsStore,
};
use crate::sweep::{self, SweepState};
use crate::ytdlp::YtDlp;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{Level, event};

/// Identity of the one recurring sweep job. The job store never holds more
/// than a single entry under this id.
pub(crate) const MAIN_DOWNLOAD_JOB: &str = "main_download_job";

/// A fire that was missed by no more than this (process down, clock jump)
/// is coalesced into one immediate run; older misses are skipped entirely.
pub(crate) const MISFIRE_GRACE_MINUTES: i64 = 5;

// How often the engine re-reads its settings while idle, so schedule or
// enablement changes made by another process get picked up without a
// restart.
const SETTINGS_POLL_SECS: u64 = 60;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
/// One persisted job: its cron expression and fire bookkeeping. Survives
/// restarts in the job-store file, separately from the application store.
pub(crate) struct StoredJob {
    pub(crate) expression: String,
    pub(crate) next_run_at: Option<String>,
    pub(crate) last_run_at: Option<String>,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
/// The scheduler's durable job store, serialized as JSON and written
/// atomically. Owned exclusively by the scheduler runtime.
pub(crate) struct JobStore {
    pub(crate) jobs: BTreeMap<String, StoredJob>,
}

impl JobStore {
    pub(crate) fn load(path: &Path) -> anyhow::Result<JobStore> {
        if !path.exists() {
            return Ok(JobStore::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub(crate) fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        crate::paths::atomic_write(path, serde_json::to_string_pretty(self)?.as_bytes())?;
        Ok(())
    }
}

/// The persistent cron engine. One instance runs inside the daemon; it owns
/// the job-store file and fires the scheduled sweep.
pub(crate) struct Scheduler {
    state: SweepState,
    fetcher: YtDlp,
    jobs_path: PathBuf,
    store: JobStore,
}

impl Scheduler {
    /// Open the job store, recover from whatever the previous process left
    /// behind (stale locks, missed fires), seed default settings, and mark
    /// the engine as running. The engine loop itself starts with
    /// [`Scheduler::run`].
    pub(crate) async fn start(
        state: SweepState,
        fetcher: YtDlp,
        jobs_path: PathBuf,
    ) -> anyhow::Result<Scheduler> {
        state
            .lock
            .clear_stale(
                SCHEDULED_DOWNLOADS_LOCK,
                chrono::Duration::hours(STALE_LOCK_MAX_AGE_HOURS),
            )
            .await?;

        // First start on an empty database seeds the documented defaults so
        // the settings surface has something to show and edit.
        if state.settings.get(KEY_CRON_SCHEDULE).await?.is_none() {
            state
                .settings
                .put(
                    KEY_CRON_SCHEDULE,
                    DEFAULT_CRON_SCHEDULE,
                    Some("Cron schedule of the download sweep"),
                )
                .await?;
        }
        if state.settings.get(KEY_SCHEDULER_ENABLED).await?.is_none() {
            state
                .settings
                .put(
                    KEY_SCHEDULER_ENABLED,
                    "true",
                    Some("Whether the scheduled sweep fires at all"),
                )
                .await?;
        }

        let store = JobStore::load(&jobs_path)?;
        if store.jobs.is_empty() {
            event!(Level::INFO, "Job store at {jobs_path:?} is empty");
        }
        for (id, job) in &store.jobs {
            event!(
                Level::INFO,
                "Recovered job '{id}' ({}), next fire at {}",
                job.expression,
                job.next_run_at.as_deref().unwrap_or("unscheduled"),
            );
        }

        state.settings.put(KEY_SCHEDULER_RUNNING, "true", None).await?;

        Ok(Scheduler {
            state,
            fetcher,
            jobs_path,
            store,
        })
    }

    /// The engine loop: keep the single job armed according to the current
    /// settings, sleep until its next fire (or the next settings poll,
    /// whichever is sooner), and run sweeps one at a time. Returns once the
    /// shutdown channel closes; an in-flight sweep finishes first.
    pub(crate) async fn run(mut self, mut recv_shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            let due = match self.arm().await {
                Ok(due) => due,
                Err(e) => {
                    event!(Level::WARN, "Scheduler failed to arm its job: {e}");
                    None
                }
            };

            let now = chrono::Utc::now();
            if let Some(due_at) = due
                && due_at <= now
            {
                self.fire(due_at).await;
                continue;
            }

            let sleep_secs = match due {
                Some(due_at) => {
                    let until = due_at.signed_duration_since(now).num_seconds().max(1);
                    u64::try_from(until)
                        .unwrap_or(SETTINGS_POLL_SECS)
                        .min(SETTINGS_POLL_SECS)
                }
                None => SETTINGS_POLL_SECS,
            };

            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_secs(sleep_secs)) => {}
                _ = recv_shutdown.recv() => {
                    event!(Level::DEBUG, "Scheduler shutting down...");
                    break;
                }
            }
        }

        if let Err(e) = self
            .state
            .settings
            .put(KEY_SCHEDULER_RUNNING, "false", None)
            .await
        {
            event!(Level::WARN, "Failed to mark scheduler as stopped: {e}");
        }
    }

    // Reconcile the stored job with the current settings and return the
    // instant the next sweep is due, if any. Replaces the stored entry when
    // the expression changed and skips fires missed beyond the grace period.
    async fn arm(&mut self) -> anyhow::Result<Option<chrono::DateTime<chrono::Utc>>> {
        let enabled = self
            .state
            .settings
            .get_or(KEY_SCHEDULER_ENABLED, "true")
            .await?
            == "true";
        if !enabled {
            if self.store.jobs.remove(MAIN_DOWNLOAD_JOB).is_some() {
                event!(Level::INFO, "Scheduled downloads disabled, unregistering job");
                self.store.save(&self.jobs_path)?;
                self.state.settings.put(KEY_SCHEDULER_NEXT_RUN, "", None).await?;
            }
            return Ok(None);
        }

        let expression = self
            .state
            .settings
            .get_or(KEY_CRON_SCHEDULE, DEFAULT_CRON_SCHEDULE)
            .await?;
        let parsed = match cron::validate(&expression) {
            Ok(parsed) => parsed,
            Err(e) => {
                event!(Level::WARN, "Stored cron schedule '{expression}' is invalid: {e}");
                return Ok(None);
            }
        };

        let now = chrono::Utc::now();
        let stored = self.store.jobs.get(MAIN_DOWNLOAD_JOB);

        // A still-valid stored fire time is honored across restarts; one in
        // the recent past counts as a misfire and runs immediately, once.
        if let Some(job) = stored
            && job.expression == parsed.expression()
            && let Some(next_run_at) = job.next_run_at.as_deref().and_then(parse_rfc3339)
        {
            let overdue = now.signed_duration_since(next_run_at);
            if overdue <= chrono::Duration::zero() {
                return Ok(Some(next_run_at));
            }
            if overdue <= chrono::Duration::minutes(MISFIRE_GRACE_MINUTES) {
                event!(
                    Level::INFO,
                    "Coalescing fire missed at {next_run_at} into one immediate run"
                );
                return Ok(Some(next_run_at));
            }
            event!(
                Level::WARN,
                "Skipping fire(s) missed since {next_run_at}, beyond the {MISFIRE_GRACE_MINUTES}-minute grace period"
            );
        }

        // (Re)register: new job, changed expression, or a skipped misfire.
        let next = parsed.next_after(now);
        let last_run_at = stored.and_then(|j| j.last_run_at.clone());
        self.store.jobs.insert(
            MAIN_DOWNLOAD_JOB.to_string(),
            StoredJob {
                expression: parsed.expression().to_string(),
                next_run_at: next.map(|t| t.to_rfc3339()),
                last_run_at,
            },
        );
        self.store.save(&self.jobs_path)?;
        self.state
            .settings
            .put(
                KEY_SCHEDULER_NEXT_RUN,
                &next.map(|t| t.to_rfc3339()).unwrap_or_default(),
                None,
            )
            .await?;

        match next {
            Some(next) => {
                event!(
                    Level::INFO,
                    "Armed '{MAIN_DOWNLOAD_JOB}' ({}), next fire at {next}",
                    parsed.expression()
                );
            }
            None => {
                event!(
                    Level::WARN,
                    "Schedule '{}' has no reachable fire time",
                    parsed.expression()
                );
            }
        }
        Ok(next)
    }

    // Run one sweep and roll the job forward. Sweep errors are logged here
    // and go no further; the engine loop must survive every fire.
    async fn fire(&mut self, due_at: chrono::DateTime<chrono::Utc>) {
        event!(Level::INFO, "Firing '{MAIN_DOWNLOAD_JOB}' (due {due_at})");
        let started_at = now_rfc3339();

        if let Err(e) = self
            .state
            .settings
            .put(KEY_SCHEDULER_LAST_RUN, &started_at, None)
            .await
        {
            event!(Level::WARN, "Failed to record scheduler last run: {e}");
        }

        if let Err(e) = sweep::run(self.state.clone(), self.fetcher.clone()).await {
            event!(Level::WARN, "Scheduled sweep failed: {e}");
        }

        // Advance the stored fire times; the next arm() pass recomputes and
        // persists the follow-up fire.
        if let Some(job) = self.store.jobs.get_mut(MAIN_DOWNLOAD_JOB) {
            job.last_run_at = Some(started_at);
            job.next_run_at = None;
        }
        if let Err(e) = self.store.save(&self.jobs_path) {
            event!(Level::WARN, "Failed to persist job store: {e}");
        }
    }
}

/// Validate `expression`, persist it as the active schedule, and refresh the
/// stored job and `scheduler_next_run`. Shared by the daemon and the
/// schedule CLI surface; a running engine also picks the change up on its
/// next settings poll.
pub(crate) async fn update_schedule(
    settings: &SettingsStore,
    jobs_path: &Path,
    expression: &str,
) -> anyhow::Result<CronExpr> {
    let parsed = cron::validate(expression)?;

    settings
        .put(
            KEY_CRON_SCHEDULE,
            parsed.expression(),
            Some("Cron schedule of the download sweep"),
        )
        .await?;

    let next = parsed.next_after(chrono::Utc::now());
    let mut store = JobStore::load(jobs_path)?;
    let last_run_at = store
        .jobs
        .get(MAIN_DOWNLOAD_JOB)
        .and_then(|j| j.last_run_at.clone());
    store.jobs.insert(
        MAIN_DOWNLOAD_JOB.to_string(),
        StoredJob {
            expression: parsed.expression().to_string(),
            next_run_at: next.map(|t| t.to_rfc3339()),
            last_run_at,
        },
    );
    store.save(jobs_path)?;

    settings
        .put(
            KEY_SCHEDULER_NEXT_RUN,
            &next.map(|t| t.to_rfc3339()).unwrap_or_default(),
            None,
        )
        .await?;

    Ok(parsed)
}

#[derive(Debug, serde::Serialize)]
/// Snapshot of the scheduler for the status surface.
pub(crate) struct SchedulerStatus {
    pub(crate) running: bool,
    pub(crate) enabled: bool,
    pub(crate) schedule: String,
    pub(crate) next_run: Option<String>,
    pub(crate) last_run: Option<String>,
    pub(crate) sweep_in_progress: bool,
    pub(crate) total_jobs: usize,
}

/// Assemble the status snapshot from settings and the job store. Works from
/// any process, not just the daemon.
pub(crate) async fn read_status(
    settings: &SettingsStore,
    jobs_path: &Path,
) -> anyhow::Result<SchedulerStatus> {
    let store = JobStore::load(jobs_path)?;
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());

    Ok(SchedulerStatus {
        running: settings.get_or(KEY_SCHEDULER_RUNNING, "false").await? == "true",
        enabled: settings.get_or(KEY_SCHEDULER_ENABLED, "true").await? == "true",
        schedule: settings
            .get_or(KEY_CRON_SCHEDULE, DEFAULT_CRON_SCHEDULE)
            .await?,
        next_run: non_empty(settings.get(KEY_SCHEDULER_NEXT_RUN).await?),
        last_run: non_empty(settings.get(KEY_SCHEDULER_LAST_RUN).await?),
        sweep_in_progress: settings
            .get_or(&format!("{SCHEDULED_DOWNLOADS_LOCK}_running"), "false")
            .await?
            == "true",
        total_jobs: store.jobs.len(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::testutil::temp_db;

    #[test]
    fn test_job_store_roundtrip_and_atomic_save() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jobs.json");

        // A missing file loads as an empty store.
        let mut store = JobStore::load(&path)?;
        assert!(store.jobs.is_empty());

        store.jobs.insert(
            MAIN_DOWNLOAD_JOB.to_string(),
            StoredJob {
                expression: "0 0 * * *".to_string(),
                next_run_at: Some("2024-06-02T00:00:00+00:00".to_string()),
                last_run_at: None,
            },
        );
        store.save(&path)?;

        let reloaded = JobStore::load(&path)?;
        let job = reloaded.jobs.get(MAIN_DOWNLOAD_JOB).unwrap();
        assert_eq!(job.expression, "0 0 * * *");
        assert_eq!(job.next_run_at.as_deref(), Some("2024-06-02T00:00:00+00:00"));
        Ok(())
    }

    #[tokio::test]
    async fn test_update_schedule_persists_setting_and_job() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let jobs_dir = tempfile::tempdir()?;
        let jobs_path = jobs_dir.path().join("jobs.json");
        let settings = SettingsStore::new(&pool);

        let parsed = update_schedule(&settings, &jobs_path, "0 3 * * *").await?;
        assert_eq!(parsed.expression(), "0 3 * * *");
        assert_eq!(
            settings.get(KEY_CRON_SCHEDULE).await?.as_deref(),
            Some("0 3 * * *")
        );
        assert!(settings.get(KEY_SCHEDULER_NEXT_RUN).await?.is_some_and(|v| !v.is_empty()));

        let store = JobStore::load(&jobs_path)?;
        let job = store.jobs.get(MAIN_DOWNLOAD_JOB).unwrap();
        assert_eq!(job.expression, "0 3 * * *");
        assert!(job.next_run_at.is_some());

        // Replacing the schedule keeps a single job entry.
        update_schedule(&settings, &jobs_path, "0 */6 * * *").await?;
        let store = JobStore::load(&jobs_path)?;
        assert_eq!(store.jobs.len(), 1);
        assert_eq!(
            store.jobs.get(MAIN_DOWNLOAD_JOB).unwrap().expression,
            "0 */6 * * *"
        );

        // Invalid expressions change nothing.
        assert!(update_schedule(&settings, &jobs_path, "* * * * *").await.is_err());
        assert_eq!(
            settings.get(KEY_CRON_SCHEDULE).await?.as_deref(),
            Some("0 */6 * * *")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_start_clears_stale_lock_and_seeds_defaults() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let jobs_path = media.path().join("jobs.json");
        let state = SweepState::new(&pool, media.path().to_path_buf());

        // A flag left behind by a process that died three hours ago.
        let three_hours_ago = (chrono::Utc::now() - chrono::Duration::hours(3))
            .fixed_offset()
            .format("%+")
            .to_string();
        state
            .settings
            .put("scheduled_downloads_running", "true", None)
            .await?;
        state
            .settings
            .put("scheduled_downloads_last_run", &three_hours_ago, None)
            .await?;

        let fetcher = YtDlp::new(media.path().to_path_buf(), media.path().to_path_buf(), None, 4);
        let _scheduler = Scheduler::start(state.clone(), fetcher, jobs_path).await?;

        assert_eq!(
            state.settings.get("scheduled_downloads_running").await?.as_deref(),
            Some("false")
        );
        assert_eq!(
            state.settings.get(KEY_CRON_SCHEDULE).await?.as_deref(),
            Some(DEFAULT_CRON_SCHEDULE)
        );
        assert_eq!(
            state.settings.get(KEY_SCHEDULER_ENABLED).await?.as_deref(),
            Some("true")
        );
        assert_eq!(
            state.settings.get(KEY_SCHEDULER_RUNNING).await?.as_deref(),
            Some("true")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_arm_registers_and_respects_disabled() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let jobs_path = media.path().join("jobs.json");
        let state = SweepState::new(&pool, media.path().to_path_buf());
        let fetcher = YtDlp::new(media.path().to_path_buf(), media.path().to_path_buf(), None, 4);

        let mut scheduler = Scheduler::start(state.clone(), fetcher, jobs_path.clone()).await?;

        let due = scheduler.arm().await?;
        assert!(due.is_some_and(|t| t > chrono::Utc::now()));
        let store = JobStore::load(&jobs_path)?;
        assert_eq!(store.jobs.len(), 1);

        // Disabling unregisters the job and clears the advertised next run.
        state.settings.put(KEY_SCHEDULER_ENABLED, "false", None).await?;
        assert_eq!(scheduler.arm().await?, None);
        let store = JobStore::load(&jobs_path)?;
        assert!(store.jobs.is_empty());
        assert_eq!(
            state.settings.get(KEY_SCHEDULER_NEXT_RUN).await?.as_deref(),
            Some("")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_arm_coalesces_recent_misfire_and_skips_old_ones() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let media = tempfile::tempdir()?;
        let jobs_path = media.path().join("jobs.json");
        let state = SweepState::new(&pool, media.path().to_path_buf());
        let fetcher = YtDlp::new(media.path().to_path_buf(), media.path().to_path_buf(), None, 4);

        let mut scheduler =
            Scheduler::start(state.clone(), fetcher, jobs_path.clone()).await?;
        scheduler.arm().await?;

        // Pretend the process slept through a fire two minutes ago: within
        // grace, the missed instant itself comes back as due.
        let missed = chrono::Utc::now() - chrono::Duration::minutes(2);
        if let Some(job) = scheduler.store.jobs.get_mut(MAIN_DOWNLOAD_JOB) {
            job.next_run_at = Some(missed.to_rfc3339());
        }
        let due = scheduler.arm().await?;
        assert!(due.is_some_and(|t| t <= chrono::Utc::now()));

        // A fire missed an hour ago is beyond grace and gets skipped; the
        // job is rearmed into the future.
        let long_missed = chrono::Utc::now() - chrono::Duration::hours(1);
        if let Some(job) = scheduler.store.jobs.get_mut(MAIN_DOWNLOAD_JOB) {
            job.next_run_at = Some(long_missed.to_rfc3339());
        }
        let due = scheduler.arm().await?;
        assert!(due.is_some_and(|t| t > chrono::Utc::now()));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_status() -> anyhow::Result<()> {
        let (_dir, pool) = temp_db().await?;
        let jobs_dir = tempfile::tempdir()?;
        let jobs_path = jobs_dir.path().join("jobs.json");
        let settings = SettingsStore::new(&pool);

        let status = read_status(&settings, &jobs_path).await?;
        assert!(!status.running);
        assert!(status.enabled);
        assert_eq!(status.schedule, DEFAULT_CRON_SCHEDULE);
        assert_eq!(status.total_jobs, 0);
        assert!(!status.sweep_in_progress);

        update_schedule(&settings, &jobs_path, "0 4 * * *").await?;
        settings.put(KEY_SCHEDULER_RUNNING, "true", None).await?;
        settings.put("scheduled_downloads_running", "true", None).await?;

        let status = read_status(&settings, &jobs_path).await?;
        assert!(status.running);
        assert_eq!(status.schedule, "0 4 * * *");
        assert!(status.next_run.is_some());
        assert_eq!(status.total_jobs, 1);
        assert!(status.sweep_in_progress);
        Ok(())
    }
}
