//! Backup job executor - Orchestrates one backup run.
//!
//! A run holds the destination lock throughout and goes through:
//! - Planning the next backup against the catalog
//! - Reserving `<name>.not_started` and running the pre hook
//! - Syncing into `<name>.incomplete`
//! - Promoting to `<name>`, recording disk usage and notifying
//! - Purging generations beyond the retention limit
//!
//! A failed run leaves its directory with the suffix it had reached.

pub mod hooks;
pub mod source;
pub mod status_log;
pub mod sync;

use crate::config::Config;
use crate::daemon::DestinationLock;
use crate::fs::disk::consumed_gb;
use crate::fs::{measure_footprint, DiskUsage, Footprint};
use crate::notify::{notify_best_effort, subject, Notifier};
use crate::rotation::{
    BackupAddress, BackupCatalog, CompletionState, PurgeEngine, PurgeReport, RetentionPlanner,
};
use crate::{Result, RotationError};
use chrono::{DateTime, Utc};
use hooks::run_hook;
use serde::Serialize;
use source::BackupSource;
use status_log::{remove_legacy_log, StatusLog, StatusRecord};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sync::{SyncInvoker, SyncRequest};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use sync::RsyncInvoker;

const LOW_DISK_SPACE_MARKER: &str = "!!! Low Disk Space !!!";

/// Backup execution result
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub name: String,
    pub address: BackupAddress,
    pub path: PathBuf,
    pub link_base: Option<PathBuf>,
    pub disk: DiskUsage,
    pub footprint: Footprint,
    pub elapsed: Duration,
    pub low_disk_space: bool,
    pub purged: PurgeReport,
}

/// Progress of a run, consulted when it fails part way.
struct Attempt {
    started: Instant,
    disk_before: DiskUsage,
    /// Current location of the unfinished backup directory
    staged: Option<PathBuf>,
    post_hook_due: bool,
}

/// Main backup executor
pub struct BackupExecutor<S, N> {
    config: Config,
    sync: S,
    notifier: N,
    cancel_token: CancellationToken,
}

impl<S: SyncInvoker, N: Notifier> BackupExecutor<S, N> {
    /// Create a new backup executor (no cancellation support)
    pub fn new(config: Config, sync: S, notifier: N) -> Self {
        Self {
            config,
            sync,
            notifier,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Stop the sync and fail the run once `cancel_token` fires
    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Execute a backup now
    pub async fn run(&self) -> Result<BackupResult> {
        self.run_at(Utc::now()).await
    }

    /// Execute a backup as if the clock read `now`
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<BackupResult> {
        self.config.validate()?;
        let dest = self.config.ensure_dest()?.to_path_buf();
        self.sync.check()?;
        let source = BackupSource::resolve(self.config.source()?, self.config.backup.ssh.as_deref())?;
        let planner = RetentionPlanner::new(self.config.retention)?;

        let _lock = DestinationLock::acquire(&dest)?;

        let mut attempt = Attempt {
            started: Instant::now(),
            disk_before: DiskUsage::query(&dest)?,
            staged: None,
            post_hook_due: false,
        };

        let result = self
            .execute(&dest, &source, &planner, now, &mut attempt)
            .await;

        if let Err(e) = &result {
            error!(error = %e, "Backup failed");
            self.record_failure(&dest, &attempt);

            let mut details = Vec::new();
            if let Some(output) = e.output() {
                details.push(output.to_string());
            }
            details.push(e.to_string());
            let log = StatusLog::new(&dest).contents().unwrap_or_default();
            notify_best_effort(
                &self.notifier,
                &subject(&source.location, "Backup Failed"),
                &format!("{}\n\n\n{}", details.join("\n"), log),
            )
            .await;
        }

        if attempt.post_hook_due {
            if let Some(script) = &self.config.hooks.post_script {
                match run_hook(script).await {
                    Ok(output) => info!(output = %output.trim_end(), "Post hook finished"),
                    Err(e) => warn!(error = %e, "Post hook failed"),
                }
            }
        }

        result
    }

    async fn execute(
        &self,
        dest: &Path,
        source: &BackupSource,
        planner: &RetentionPlanner,
        now: DateTime<Utc>,
        attempt: &mut Attempt,
    ) -> Result<BackupResult> {
        let catalog = BackupCatalog::new(dest);
        let plan = planner.plan(&catalog, now)?;
        let name = plan.name();

        let reserved = plan.path_in(dest, CompletionState::NotStarted);
        std::fs::create_dir(&reserved)?;
        attempt.staged = Some(reserved.clone());
        attempt.post_hook_due = true;

        if let Some(script) = &self.config.hooks.pre_script {
            let output = run_hook(script).await?;
            info!(output = %output.trim_end(), "Pre hook finished");
        }

        let incomplete = plan.path_in(dest, CompletionState::Incomplete);
        std::fs::rename(&reserved, &incomplete)?;
        attempt.staged = Some(incomplete.clone());

        info!(
            source = %source.location,
            backup = %name,
            "Backing up {} to {}",
            source.location,
            incomplete.display()
        );

        let request = SyncRequest {
            source: source.location.clone(),
            destination: incomplete.clone(),
            link_base: plan.link_base.clone(),
            excludes: self.config.backup.exclude.clone(),
            remote_shell: source.remote_shell(),
        };
        let command = self.sync.describe(&request);
        info!(command = %command, "Sync command");

        let final_path = plan.path_in(dest, CompletionState::Complete);
        notify_best_effort(
            &self.notifier,
            &subject(&source.location, "Backup Started"),
            &format!(
                "BACKUP COMMAND\n\n{}\n\n\nThe backup source is {}. The backup will be stored in the {} path",
                command,
                source.location,
                final_path.display()
            ),
        )
        .await;

        if self.cancel_token.is_cancelled() {
            return Err(RotationError::Cancelled);
        }
        let outcome = self.sync.sync(&request, &self.cancel_token).await?;
        debug!(output = %outcome.output, "Sync output");

        std::fs::rename(&incomplete, &final_path)?;
        attempt.staged = None;

        let disk = DiskUsage::query(dest)?;
        let footprint = measure_footprint(&final_path)?;
        let elapsed = attempt.started.elapsed();

        let status_log = StatusLog::new(dest);
        let line = StatusRecord {
            name: &name,
            disk,
            consumed_gb: consumed_gb(&attempt.disk_before, &disk),
            elapsed,
            footprint,
        }
        .line();
        status_log.append(&line)?;
        info!("{}", line);

        let low_disk_space = disk.is_low(self.config.disk.low_space_mb);
        let mut message = "Backup Completed Successfully".to_string();
        if low_disk_space {
            message = format!("{}  {}", message, LOW_DISK_SPACE_MARKER);
            warn!(
                free_gb = disk.free_gb(),
                threshold_mb = self.config.disk.low_space_mb,
                "Low disk space on backup destination"
            );
        }
        info!(backup = %name, "{}", message);
        notify_best_effort(
            &self.notifier,
            &subject(&source.location, &message),
            &format!(
                "This backup has been stored in the {} path\n\n\n{}",
                final_path.display(),
                status_log.contents()?
            ),
        )
        .await;

        remove_legacy_log(dest)?;
        let purged = PurgeEngine::new(catalog).purge(self.config.retention.max_full)?;

        Ok(BackupResult {
            name,
            address: plan.address,
            path: final_path,
            link_base: plan.link_base,
            disk,
            footprint,
            elapsed,
            low_disk_space,
            purged,
        })
    }

    /// Record the space used by a run that did not finish.
    fn record_failure(&self, dest: &Path, attempt: &Attempt) {
        let Some(path) = &attempt.staged else {
            return;
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let disk = match DiskUsage::query(dest) {
            Ok(disk) => disk,
            Err(e) => {
                warn!(error = %e, "Failed to query disk usage after failed backup");
                return;
            }
        };
        let line = StatusRecord {
            name: &name,
            disk,
            consumed_gb: consumed_gb(&attempt.disk_before, &disk),
            elapsed: attempt.started.elapsed(),
            footprint: measure_footprint(path).unwrap_or_default(),
        }
        .line();

        match StatusLog::new(dest).append(&line) {
            Ok(()) => info!("{}", line),
            Err(e) => warn!(error = %e, "Failed to record failed backup"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::lock::LOCK_FILE_NAME;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Copies a single marker file instead of running rsync.
    #[derive(Default)]
    struct FakeSync {
        requests: Mutex<Vec<SyncRequest>>,
        fail: bool,
    }

    impl SyncInvoker for FakeSync {
        fn describe(&self, request: &SyncRequest) -> String {
            format!("fake-sync {} {}", request.source, request.destination.display())
        }

        async fn sync(
            &self,
            request: &SyncRequest,
            cancel: &CancellationToken,
        ) -> Result<sync::SyncOutcome> {
            self.requests.lock().unwrap().push(request.clone());
            if cancel.is_cancelled() {
                return Err(RotationError::Cancelled);
            }
            if self.fail {
                return Err(RotationError::SyncFailure {
                    status: "exit status: 23".into(),
                    output: "rsync: some files vanished".into(),
                });
            }
            std::fs::write(request.destination.join("data.txt"), b"backup payload")?;
            Ok(sync::SyncOutcome {
                output: "sent 14 bytes".into(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingNotifier {
        fn subjects(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        async fn notify(&self, subject: &str, body: &str) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        src: PathBuf,
        dest: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let src = temp_dir.path().join("src");
            let dest = temp_dir.path().join("dest");
            std::fs::create_dir(&src).unwrap();
            Self {
                _temp_dir: temp_dir,
                src,
                dest,
            }
        }

        fn config(&self) -> Config {
            let mut config = Config::default();
            config.backup.source = Some(self.src.to_string_lossy().into_owned());
            config.backup.dest = Some(self.dest.clone());
            config.disk.low_space_mb = 0;
            config
        }

        fn names(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(&self.dest)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|n| n.contains(".FULL_"))
                .collect();
            names.sort();
            names
        }

        fn status_lines(&self) -> Vec<String> {
            StatusLog::new(&self.dest)
                .contents()
                .unwrap()
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 10, 0, 0).unwrap()
    }

    fn executor(config: Config) -> BackupExecutor<FakeSync, RecordingNotifier> {
        BackupExecutor::new(config, FakeSync::default(), RecordingNotifier::default())
    }

    #[tokio::test]
    async fn test_full_then_incrementals() {
        let fx = Fixture::new();
        let exec = executor(fx.config());

        let first = exec.run_at(day(5)).await.unwrap();
        let second = exec.run_at(day(6)).await.unwrap();
        let third = exec.run_at(day(7)).await.unwrap();

        assert_eq!(first.name, "2024-Jan-05_10_00_00.FULL_1");
        assert_eq!(second.name, "2024-Jan-06_10_00_00.FULL_1_INCR_1");
        assert_eq!(third.name, "2024-Jan-07_10_00_00.FULL_1_INCR_2");
        assert!(third.path.join("data.txt").is_file());
        assert_eq!(first.footprint.files, 1);

        let requests = exec.sync.requests.lock().unwrap();
        assert_eq!(requests[0].link_base, None);
        assert_eq!(requests[1].link_base, Some(first.path.clone()));
        assert_eq!(requests[2].link_base, Some(second.path.clone()));
        assert!(requests[0].source.ends_with('/'));
        assert!(requests[0]
            .destination
            .to_string_lossy()
            .ends_with("FULL_1.incomplete"));

        let lines = fx.status_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("2024-Jan-05_10_00_00.FULL_1: Disk: Free "));
        assert!(lines[0].contains(", Files 1, New "));

        let subjects = exec.notifier.subjects();
        assert_eq!(subjects.len(), 6);
        assert!(subjects[0].ends_with("Backup Started"));
        assert!(subjects[1].ends_with("Backup Completed Successfully"));

        // Lock file is the only non-backup entry besides the log.
        assert!(fx.dest.join(LOCK_FILE_NAME).exists());
        assert_eq!(fx.names().len(), 3);
    }

    #[tokio::test]
    async fn test_daily_quota_leaves_disk_untouched() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.retention.max_daily_backups = 1;
        let exec = executor(config);

        exec.run_at(day(5)).await.unwrap();
        let err = exec
            .run_at(day(5) + chrono::Duration::hours(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::QuotaExceeded { count: 1, limit: 1 }));

        assert_eq!(fx.names(), vec!["2024-Jan-05_10_00_00.FULL_1"]);
        assert_eq!(fx.status_lines().len(), 1);
        assert!(exec.notifier.subjects().last().unwrap().ends_with("Backup Failed"));
    }

    #[tokio::test]
    async fn test_failed_sync_stays_incomplete() {
        let fx = Fixture::new();
        let marker = fx.dest.with_file_name("post-hook-ran");
        let mut config = fx.config();
        config.hooks.post_script = Some(format!("touch '{}'", marker.display()));

        let exec = BackupExecutor::new(
            config,
            FakeSync {
                fail: true,
                ..Default::default()
            },
            RecordingNotifier::default(),
        );

        let err = exec.run_at(day(5)).await.unwrap_err();
        assert!(matches!(err, RotationError::SyncFailure { .. }));
        assert_eq!(fx.names(), vec!["2024-Jan-05_10_00_00.FULL_1.incomplete"]);
        assert!(marker.exists());

        let lines = fx.status_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("2024-Jan-05_10_00_00.FULL_1.incomplete: Disk: "));

        let sent = exec.notifier.sent.lock().unwrap();
        let (subject, body) = sent.last().unwrap();
        assert!(subject.ends_with("Backup Failed"));
        assert!(body.contains("rsync: some files vanished"));
        assert!(body.contains("exit status: 23"));
    }

    #[tokio::test]
    async fn test_pre_hook_failure_stays_not_started() {
        let fx = Fixture::new();
        let marker = fx.dest.with_file_name("post-hook-ran");
        let mut config = fx.config();
        config.hooks.pre_script = Some("echo no snapshot >&2; exit 3".into());
        config.hooks.post_script = Some(format!("touch '{}'", marker.display()));
        let exec = executor(config);

        let err = exec.run_at(day(5)).await.unwrap_err();
        assert!(matches!(err, RotationError::Hook { .. }));
        assert_eq!(fx.names(), vec!["2024-Jan-05_10_00_00.FULL_1.not_started"]);
        assert!(marker.exists());
        assert!(exec.sync.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_attempt_does_not_block_next_run() {
        let fx = Fixture::new();
        let failing = BackupExecutor::new(
            fx.config(),
            FakeSync {
                fail: true,
                ..Default::default()
            },
            RecordingNotifier::default(),
        );
        failing.run_at(day(5)).await.unwrap_err();

        let result = executor(fx.config()).run_at(day(6)).await.unwrap();
        assert_eq!(result.name, "2024-Jan-06_10_00_00.FULL_1");
        assert_eq!(result.link_base, None);
    }

    #[tokio::test]
    async fn test_purge_after_new_full() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.retention.max_full = 2;
        config.retention.max_incremental = 0;
        std::fs::create_dir_all(&fx.dest).unwrap();
        std::fs::write(fx.dest.join(status_log::LEGACY_SIZE_LOG_FILE), "old").unwrap();
        let exec = executor(config);

        exec.run_at(day(5)).await.unwrap();
        exec.run_at(day(6)).await.unwrap();
        let third = exec.run_at(day(7)).await.unwrap();

        assert_eq!(third.purged.generations, vec![1]);
        assert_eq!(
            fx.names(),
            vec!["2024-Jan-06_10_00_00.FULL_2", "2024-Jan-07_10_00_00.FULL_3"]
        );
        assert!(!fx.dest.join(status_log::LEGACY_SIZE_LOG_FILE).exists());
    }

    #[tokio::test]
    async fn test_low_disk_space_warning() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.disk.low_space_mb = u64::MAX;
        let exec = executor(config);

        let result = exec.run_at(day(5)).await.unwrap();
        assert!(result.low_disk_space);
        assert!(exec.notifier.subjects()[1].ends_with(LOW_DISK_SPACE_MARKER));
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_lock() {
        let fx = Fixture::new();
        let token = CancellationToken::new();
        token.cancel();
        let exec = executor(fx.config()).with_cancel(token);

        let err = exec.run_at(day(5)).await.unwrap_err();
        assert!(matches!(err, RotationError::Cancelled));
        assert_eq!(fx.names(), vec!["2024-Jan-05_10_00_00.FULL_1.incomplete"]);
        assert!(DestinationLock::acquire(&fx.dest).is_ok());
    }

    #[tokio::test]
    async fn test_locked_destination() {
        let fx = Fixture::new();
        std::fs::create_dir_all(&fx.dest).unwrap();
        let _held = DestinationLock::acquire(&fx.dest).unwrap();

        let exec = executor(fx.config());
        let err = exec.run_at(day(5)).await.unwrap_err();
        assert!(matches!(err, RotationError::Locked(_)));
        assert!(fx.names().is_empty());
        assert!(exec.notifier.subjects().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_touches_nothing() {
        let fx = Fixture::new();
        let mut config = fx.config();
        config.retention.max_full = 1;

        let err = executor(config).run_at(day(5)).await.unwrap_err();
        assert!(matches!(err, RotationError::PolicyViolation(_)));
        assert!(!fx.dest.exists());
    }
}
