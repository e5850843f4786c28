use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;
use crate::config::ConverterConfig;
use crate::error::{EncodeStage, JobFailure, Rejection};
use crate::fallback::FallbackChain;
use crate::ffmpeg::{FFmpegManager, MediaTools};
use crate::job::{Job, JobReport, JobRequest, OutputArtifact};
use crate::ledger::{Account, Entitlement, LedgerLock, QuotaLedger};
use crate::pipeline::TransformPipeline;
use crate::quality::QualitySelector;
use crate::resource::{ResourceMonitor, ResourceSnapshot, SystemMonitor};
use crate::workspace::JobWorkspace;

/// Controller wired to the real ffmpeg binaries and host sampler
pub type HostController = Controller<FFmpegManager, SystemMonitor>;

type AccountLock = Arc<tokio::sync::Mutex<()>>;

struct Shared<T: MediaTools, M: ResourceMonitor> {
    config: ConverterConfig,
    ledger: Mutex<QuotaLedger>,
    account_locks: Mutex<HashMap<String, AccountLock>>,
    slots: Arc<Semaphore>,
    accepting: AtomicBool,
    selector: QualitySelector,
    chain: FallbackChain<T>,
    tools: Arc<T>,
    monitor: Arc<M>,
    _ledger_lock: LedgerLock,
}

/// Admission, per-account exclusivity, the worker pool and ledger commits.
/// Cloning yields another handle to the same controller.
pub struct Controller<T: MediaTools, M: ResourceMonitor> {
    shared: Arc<Shared<T, M>>,
}

impl<T: MediaTools, M: ResourceMonitor> Clone for Controller<T, M> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

/// Handle to an admitted job
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub account_id: String,
    pub entitlement: Entitlement,
    join: JoinHandle<JobReport>,
}

impl JobHandle {
    /// Wait for the terminal report
    pub async fn wait(self) -> Result<JobReport> {
        self.join.await.with_context(|| format!("Worker for job {} panicked", self.job_id))
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// What a worker holds for the lifetime of one job
struct Admission {
    job: Job,
    entitlement: Entitlement,
    account_guard: OwnedMutexGuard<()>,
    slot: OwnedSemaphorePermit,
}

impl HostController {
    pub fn with_host(config: ConverterConfig) -> Result<Self> {
        let tools = FFmpegManager::new(&config);
        let monitor = SystemMonitor::new(config.sample_interval_ms);
        Self::new(config, tools, monitor)
    }
}

impl<T: MediaTools, M: ResourceMonitor> Controller<T, M> {
    pub fn new(config: ConverterConfig, tools: T, monitor: M) -> Result<Self> {
        config.validate()?;
        let ledger_lock = LedgerLock::try_acquire(&config.ledger_path)?.ok_or_else(|| {
            anyhow!(
                "Ledger {} is in use by process {}",
                config.ledger_path.display(),
                LedgerLock::holder(&config.ledger_path).map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
            )
        })?;
        let ledger = QuotaLedger::load(&config.ledger_path)?;
        std::fs::create_dir_all(&config.temp_dir)
            .with_context(|| format!("Failed to create temp dir: {}", config.temp_dir.display()))?;
        std::fs::create_dir_all(&config.output_dir)
            .with_context(|| format!("Failed to create output dir: {}", config.output_dir.display()))?;

        info!(
            "Controller ready: {} worker slot(s), {} account(s) in ledger {}",
            config.worker_pool_size,
            ledger.len(),
            ledger.path().display()
        );

        let tools = Arc::new(tools);
        let chain = FallbackChain::new(TransformPipeline::new(tools.clone(), &config));
        let shared = Shared {
            selector: QualitySelector::new(&config),
            slots: Arc::new(Semaphore::new(config.worker_pool_size)),
            ledger: Mutex::new(ledger),
            account_locks: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            chain,
            tools,
            monitor: Arc::new(monitor),
            _ledger_lock: ledger_lock,
            config,
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.shared.config
    }

    /// Media tools shared with the pipeline, for callers that need to probe inputs
    pub fn tools(&self) -> Arc<T> {
        self.shared.tools.clone()
    }

    /// Admit a job or reject it without side effects. Must be called from within a
    /// Tokio runtime; the admitted job runs on a spawned task.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, Rejection> {
        let admission = self.shared.admit(request)?;
        let job_id = admission.job.id;
        let account_id = admission.job.account_id.clone();
        let entitlement = admission.entitlement;

        let shared = self.shared.clone();
        let join = tokio::spawn(async move { shared.run_job(admission).await });

        Ok(JobHandle { job_id, account_id, entitlement, join })
    }

    /// Committed ledger state for an account
    pub fn snapshot_account(&self, account_id: &str) -> Account {
        self.shared.ledger().account(account_id)
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.shared.ledger().accounts().cloned().collect()
    }

    /// Credit purchased packs to an account
    pub fn grant_premium(&self, account_id: &str, packs: u32) -> Result<Account> {
        let units = packs as u64 * self.shared.config.premium_unit_grant_size as u64;
        self.shared.ledger().grant_premium(account_id, units)
    }

    /// Jobs currently holding a worker slot
    pub fn in_flight(&self) -> usize {
        self.shared.config.worker_pool_size - self.shared.slots.available_permits()
    }

    /// Stop admitting and wait for every in-flight job to reach a terminal state
    pub async fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!("Shutting down, waiting for {} in-flight job(s)", in_flight);
        }
        match self.shared.slots.acquire_many(self.shared.config.worker_pool_size as u32).await {
            Ok(_all) => info!("All jobs drained"),
            Err(e) => warn!("Worker pool closed while draining: {}", e),
        }
    }
}

impl<T: MediaTools, M: ResourceMonitor> Shared<T, M> {
    fn ledger(&self) -> MutexGuard<'_, QuotaLedger> {
        self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, AccountLock>> {
        self.account_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admission checks, cheapest first. Every early return releases whatever
    /// was acquired before it.
    fn admit(&self, request: JobRequest) -> Result<Admission, Rejection> {
        let cfg = &self.config;
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Rejection::HostBusy);
        }

        // NaN must not slip through
        if !(request.declared_duration_secs <= cfg.max_duration_seconds) {
            return Err(Rejection::DurationExceeded {
                declared: request.declared_duration_secs,
                max: cfg.max_duration_seconds,
            });
        }
        if request.declared_size_bytes > cfg.max_input_size_bytes {
            return Err(Rejection::SizeExceeded {
                declared: request.declared_size_bytes,
                max: cfg.max_input_size_bytes,
            });
        }

        let account_guard = {
            let mut locks = self.locks();
            let lock = locks.entry(request.account_id.clone()).or_default().clone();
            lock.try_lock_owned()
                .map_err(|_| Rejection::AccountBusy(request.account_id.clone()))?
        };

        let slot = match self.slots.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.release_account(&request.account_id, account_guard);
                return Err(Rejection::HostBusy);
            }
        };

        // The debit is durable before any work starts
        let debited = {
            let mut ledger = self.ledger();
            let mut account = ledger.account(&request.account_id);
            match account.debit(cfg.free_trial_count) {
                None => Err(Rejection::QuotaExceeded(request.account_id.clone())),
                Some(entitlement) => ledger.commit(account).map(|()| entitlement).map_err(|e| {
                    error!("Failed to record debit for account {}: {:#}", request.account_id, e);
                    Rejection::LedgerUnavailable(format!("{:#}", e))
                }),
            }
        };
        let entitlement = match debited {
            Ok(e) => e,
            Err(rejection) => {
                drop(slot);
                self.release_account(&request.account_id, account_guard);
                return Err(rejection);
            }
        };

        let job = Job::admit(request);
        info!("Admitted job {} for account {} ({:?})", job.id, job.account_id, entitlement);
        Ok(Admission { job, entitlement, account_guard, slot })
    }

    /// Drop an account guard and forget the lock if nobody else references it
    fn release_account(&self, account_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks();
        if locks.get(account_id).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(account_id);
        }
    }

    async fn run_job(&self, admission: Admission) -> JobReport {
        let Admission { mut job, account_guard, slot, .. } = admission;
        let attempts = AtomicU32::new(0);
        let limit = Duration::from_secs(self.config.job_timeout_secs);

        job.mark_running();
        let result = tokio::time::timeout(limit, self.execute(&mut job, &attempts)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Job {} hit the {}s limit, cancelling", job.id, self.config.job_timeout_secs);
                Err(JobFailure::Timeout { secs: self.config.job_timeout_secs })
            }
        };

        job.attempt_count = attempts.load(Ordering::SeqCst);
        job.finish(outcome.is_ok());
        let ledger_error = self.record_completion(&job);

        match &outcome {
            Ok(artifact) => info!(
                "✅ Job {} succeeded after {} attempt(s): {} ({} bytes)",
                job.id, job.attempt_count, artifact.path.display(), artifact.size_bytes
            ),
            Err(failure) => warn!(
                "❌ Job {} failed after {} attempt(s) [{:?}]: {}",
                job.id, job.attempt_count, failure.category(), failure
            ),
        }

        // Ledger state is durable before the account can admit its next job
        drop(slot);
        self.release_account(&job.account_id, account_guard);

        let elapsed = job.finished_at.unwrap_or_else(Utc::now) - job.admitted_at;
        JobReport {
            job_id: job.id,
            account_id: job.account_id,
            status: job.status,
            attempt_count: job.attempt_count,
            profile_used: job.profile_used,
            outcome,
            elapsed,
            ledger_error,
        }
    }

    /// Stage, sample, select, convert and deliver. The workspace (and any encoder
    /// child) is released when this future completes or is dropped.
    async fn execute(&self, job: &mut Job, attempts: &AtomicU32) -> Result<OutputArtifact, JobFailure> {
        let workspace = JobWorkspace::create(&self.config.temp_dir, job.id)
            .map_err(|e| JobFailure::DownloadFailure(format!("{:#}", e)))?;
        let staged = workspace.input_path(&job.source_path);
        tokio::fs::copy(&job.source_path, &staged).await.map_err(|e| {
            JobFailure::DownloadFailure(format!("{}: {}", job.source_path.display(), e))
        })?;
        debug!("Staged {} into {}", job.source_path.display(), workspace.path().display());

        let monitor = self.monitor.clone();
        let snapshot = tokio::task::spawn_blocking(move || monitor.sample())
            .await
            .unwrap_or_else(|e| {
                warn!("Resource sampler failed: {}", e);
                ResourceSnapshot::idle()
            });
        let profile = self.selector.select(&snapshot, job);
        job.profile_used = Some(profile.clone());

        let artifact = self.chain.run(&staged, &profile, &workspace, attempts).await?;
        self.deliver(job, artifact).await
    }

    /// Move the artifact out of the workspace into the account's output directory
    async fn deliver(&self, job: &Job, artifact: OutputArtifact) -> Result<OutputArtifact, JobFailure> {
        let dest = output_path_for(&self.config.output_dir, &job.account_id, job.id);
        let moved = async {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if tokio::fs::rename(&artifact.path, &dest).await.is_err() {
                // Different filesystem
                tokio::fs::copy(&artifact.path, &dest).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        moved.await.map_err(|e| JobFailure::EncodeFailure {
            stage: EncodeStage::Primary,
            detail: format!("could not deliver output to {}: {}", dest.display(), e),
        })?;
        Ok(OutputArtifact { path: dest, ..artifact })
    }

    /// Count the finished job against the latest committed record
    fn record_completion(&self, job: &Job) -> Option<String> {
        let mut ledger = self.ledger();
        let mut account = ledger.account(&job.account_id);
        account.record_use(job.finished_at.unwrap_or_else(Utc::now));
        match ledger.commit(account) {
            Ok(()) => None,
            Err(e) => {
                error!("Failed to record completion for account {} (job {}): {:#}", job.account_id, job.id, e);
                Some(format!("{:#}", e))
            }
        }
    }
}

/// `<output_dir>/<account>`, with the account id reduced to a safe single path component
pub fn account_output_dir(output_dir: &Path, account_id: &str) -> PathBuf {
    let mut dir: String = account_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if dir.is_empty() {
        dir.push('_');
    }
    output_dir.join(dir)
}

/// `<output_dir>/<account>/reel_<job_id>.mp4`
pub fn output_path_for(output_dir: &Path, account_id: &str, job_id: Uuid) -> PathBuf {
    account_output_dir(output_dir, account_id).join(format!("reel_{}.mp4", job_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::job::JobStatus;
    use crate::quality::QualityTier;
    use crate::resource::StaticMonitor;
    use crate::testing::{ScriptedTools, Step};

    const IDLE: StaticMonitor = StaticMonitor { cpu_percent: 10.0, mem_percent: 20.0 };

    struct Harness {
        tmp: tempfile::TempDir,
        config: ConverterConfig,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let config = ConverterConfig {
                ledger_path: tmp.path().join("ledger.json"),
                temp_dir: tmp.path().join("work"),
                output_dir: tmp.path().join("out"),
                inbox_dir: tmp.path().join("inbox"),
                ..Default::default()
            };
            Self { tmp, config }
        }

        fn source(&self, name: &str) -> PathBuf {
            let path = self.tmp.path().join(name);
            std::fs::write(&path, b"circular note").unwrap();
            path
        }

        fn controller(&self, tools: ScriptedTools, monitor: StaticMonitor) -> Controller<ScriptedTools, StaticMonitor> {
            Controller::new(self.config.clone(), tools, monitor).unwrap()
        }

        fn request(&self, account: &str) -> JobRequest {
            JobRequest::new(account, self.source(&format!("{}.mp4", account)), 12.0, 800_000)
        }

        fn work_entries(&self) -> usize {
            crate::workspace::count_temp_entries(&self.config.temp_dir)
        }
    }

    #[tokio::test]
    async fn test_free_trial_job_succeeds_and_commits() {
        let h = Harness::new();
        let half_loaded = StaticMonitor { cpu_percent: 50.0, mem_percent: 40.0 };
        let ctl = h.controller(ScriptedTools::new([]), half_loaded);

        let request = JobRequest::new("42", h.source("note.mp4"), 40.0, 10 * 1024 * 1024);
        let handle = ctl.submit(request).unwrap();
        assert_eq!(handle.entitlement, Entitlement::FreeTrial);
        let report = handle.wait().await.unwrap();

        assert_eq!(report.status, JobStatus::Succeeded);
        assert_eq!(report.attempt_count, 1);
        assert_eq!(report.profile_used.as_ref().map(|p| p.tier), Some(QualityTier::Balanced));
        let artifact = report.outcome.unwrap();
        assert_eq!((artifact.width, artifact.height), (1080, 1920));
        assert_eq!(artifact.path, output_path_for(&h.config.output_dir, "42", report.job_id));
        assert!(artifact.path.exists());

        let acct = ctl.snapshot_account("42");
        assert!(acct.free_trial_consumed);
        assert_eq!(acct.lifetime_used, 1);
        assert!(acct.last_activity.is_some());
        assert_eq!(QuotaLedger::load(&h.config.ledger_path).unwrap().account("42"), acct);
        assert_eq!(h.work_entries(), 0);
        assert_eq!(ctl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_overlong_clip_rejected_without_side_effects() {
        let h = Harness::new();
        let ctl = h.controller(ScriptedTools::new([]), IDLE);
        let request = JobRequest::new("42", h.source("long.mp4"), 75.0, 1_000);

        let err = ctl.submit(request).unwrap_err();
        assert_eq!(err, Rejection::DurationExceeded { declared: 75.0, max: 60.0 });
        assert_eq!(ctl.snapshot_account("42"), Account::new("42"));
        assert!(!h.config.ledger_path.exists());
        assert_eq!(h.work_entries(), 0);
    }

    #[tokio::test]
    async fn test_nan_duration_and_oversized_input_rejected() {
        let h = Harness::new();
        let ctl = h.controller(ScriptedTools::new([]), IDLE);
        let nan = JobRequest::new("1", h.source("a.mp4"), f64::NAN, 1);
        assert_eq!(ctl.submit(nan).unwrap_err().category(), ErrorCategory::DurationExceeded);

        let big = JobRequest::new("1", h.source("b.mp4"), 10.0, h.config.max_input_size_bytes + 1);
        assert_eq!(ctl.submit(big).unwrap_err().category(), ErrorCategory::SizeExceeded);
        assert_eq!(ctl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_second_job_for_same_account_is_busy() {
        let h = Harness::new();
        let gate = Arc::new(Semaphore::new(0));
        let ctl = h.controller(ScriptedTools::new([]).gated(gate.clone()), IDLE);
        ctl.grant_premium("7", 1).unwrap();

        let first = ctl.submit(h.request("7")).unwrap();
        let second = ctl.submit(h.request("7"));
        assert_eq!(second.unwrap_err(), Rejection::AccountBusy("7".to_string()));

        gate.add_permits(1);
        assert_eq!(first.wait().await.unwrap().status, JobStatus::Succeeded);

        // Free trial was used by the first job; premium pays for the next one
        let again = ctl.submit(h.request("7")).unwrap();
        assert_eq!(again.entitlement, Entitlement::Premium);
        gate.add_permits(1);
        again.wait().await.unwrap();
        let acct = ctl.snapshot_account("7");
        assert_eq!(acct.premium_balance, 9);
        assert_eq!(acct.lifetime_used, 2);
    }

    #[tokio::test]
    async fn test_pool_saturation_rejects_with_host_busy() {
        let mut h = Harness::new();
        h.config.worker_pool_size = 2;
        let gate = Arc::new(Semaphore::new(0));
        let ctl = h.controller(ScriptedTools::new([]).gated(gate.clone()), IDLE);

        let a = ctl.submit(h.request("1")).unwrap();
        let b = ctl.submit(h.request("2")).unwrap();
        assert_eq!(ctl.in_flight(), 2);

        assert_eq!(ctl.submit(h.request("3")).unwrap_err(), Rejection::HostBusy);
        // The rejected account was not locked or charged
        assert_eq!(ctl.snapshot_account("3"), Account::new("3"));

        gate.add_permits(2);
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        let c = ctl.submit(h.request("3")).unwrap();
        gate.add_permits(1);
        assert_eq!(c.wait().await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_no_entitlement_is_quota_exceeded() {
        let h = Harness::new();
        let ctl = h.controller(ScriptedTools::new([]), IDLE);
        ctl.submit(h.request("9")).unwrap().wait().await.unwrap();
        let before = ctl.snapshot_account("9");

        assert_eq!(ctl.submit(h.request("9")).unwrap_err(), Rejection::QuotaExceeded("9".to_string()));
        assert_eq!(ctl.snapshot_account("9"), before);
        assert_eq!(ctl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_loaded_host_degrades_profile() {
        let h = Harness::new();
        let busy = StaticMonitor { cpu_percent: 92.0, mem_percent: 40.0 };
        let ctl = h.controller(ScriptedTools::new([]), busy);
        let report = ctl.submit(h.request("5")).unwrap().wait().await.unwrap();
        let profile = report.profile_used.unwrap();
        assert_eq!(profile.tier, QualityTier::Degraded);
        assert_eq!(profile.preset, "ultrafast");
        assert!(report.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_failed_encode_still_debits_and_cleans_up() {
        let h = Harness::new();
        let ctl = h.controller(ScriptedTools::new([Step::Exit(1), Step::Exit(1)]), IDLE);
        let report = ctl.submit(h.request("8")).unwrap().wait().await.unwrap();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.attempt_count, 2);
        assert_eq!(report.failure_category(), Some(ErrorCategory::EncodeFailureFallbackExhausted));

        let acct = ctl.snapshot_account("8");
        assert!(acct.free_trial_consumed);
        assert_eq!(acct.lifetime_used, 1);
        assert_eq!(h.work_entries(), 0);
        assert!(!h.config.output_dir.join("8").exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_download_failure() {
        let h = Harness::new();
        let ctl = h.controller(ScriptedTools::new([]), IDLE);
        let request = JobRequest::new("4", h.tmp.path().join("gone.mp4"), 5.0, 10);
        let report = ctl.submit(request).unwrap().wait().await.unwrap();
        assert_eq!(report.failure_category(), Some(ErrorCategory::DownloadFailure));
        assert_eq!(report.attempt_count, 0);
        assert_eq!(h.work_entries(), 0);
    }

    #[tokio::test]
    async fn test_stalled_job_times_out_and_releases_everything() {
        let mut h = Harness::new();
        h.config.encode_timeout_secs = 1;
        h.config.probe_timeout_secs = 1;
        h.config.job_timeout_secs = 5;
        let ctl = h.controller(ScriptedTools::new([Step::Stall]), IDLE);

        let report = ctl.submit(h.request("6")).unwrap().wait().await.unwrap();
        assert_eq!(report.outcome.unwrap_err(), JobFailure::Timeout { secs: 5 });
        assert_eq!(report.attempt_count, 1);
        assert_eq!(h.work_entries(), 0);
        assert_eq!(ctl.in_flight(), 0);
        assert_eq!(ctl.snapshot_account("6").lifetime_used, 1);

        // Account lock is free again
        ctl.grant_premium("6", 1).unwrap();
        assert!(ctl.submit(h.request("6")).is_ok());
    }

    #[tokio::test]
    async fn test_grant_during_job_is_not_lost() {
        let h = Harness::new();
        let gate = Arc::new(Semaphore::new(0));
        let ctl = h.controller(ScriptedTools::new([]).gated(gate.clone()), IDLE);

        let handle = ctl.submit(h.request("3")).unwrap();
        ctl.grant_premium("3", 2).unwrap();
        gate.add_permits(1);
        handle.wait().await.unwrap();

        let acct = ctl.snapshot_account("3");
        assert!(acct.free_trial_consumed);
        assert_eq!(acct.premium_balance, 20);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_refuses_new_work() {
        let h = Harness::new();
        let gate = Arc::new(Semaphore::new(0));
        let ctl = h.controller(ScriptedTools::new([]).gated(gate.clone()), IDLE);
        let handle = ctl.submit(h.request("1")).unwrap();

        let drain = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.shutdown().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(ctl.submit(h.request("2")).unwrap_err(), Rejection::HostBusy);
        assert!(!drain.is_finished());

        gate.add_permits(1);
        drain.await.unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.wait().await.unwrap().status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_debit_is_on_disk_before_the_encode_runs() {
        let h = Harness::new();
        let gate = Arc::new(Semaphore::new(0));
        let ctl = h.controller(ScriptedTools::new([]).gated(gate.clone()), IDLE);
        let handle = ctl.submit(h.request("2")).unwrap();

        let on_disk = QuotaLedger::load(&h.config.ledger_path).unwrap().account("2");
        assert!(on_disk.free_trial_consumed);
        assert_eq!(on_disk.lifetime_used, 0);

        gate.add_permits(1);
        let report = handle.wait().await.unwrap();
        assert_eq!(report.ledger_error, None);
        let on_disk = QuotaLedger::load(&h.config.ledger_path).unwrap().account("2");
        assert_eq!(on_disk.lifetime_used, 1);
    }

    /// Replace the ledger file with a non-empty directory so every commit fails
    fn break_ledger(path: &Path) {
        if path.exists() {
            std::fs::remove_file(path).unwrap();
        }
        std::fs::create_dir(path).unwrap();
        std::fs::write(path.join("blocker"), b"x").unwrap();
    }

    #[tokio::test]
    async fn test_unwritable_ledger_refuses_admission() {
        let h = Harness::new();
        let ctl = h.controller(ScriptedTools::new([]), IDLE);
        break_ledger(&h.config.ledger_path);

        for _ in 0..3 {
            let err = ctl.submit(h.request("7")).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::LedgerFailure);
            assert!(err.is_transient());
        }
        assert_eq!(ctl.in_flight(), 0);
        assert_eq!(ctl.snapshot_account("7"), Account::new("7"));
        assert_eq!(h.work_entries(), 0);
    }

    #[tokio::test]
    async fn test_failed_completion_write_is_reported_and_not_refunded() {
        let h = Harness::new();
        let gate = Arc::new(Semaphore::new(0));
        let ctl = h.controller(ScriptedTools::new([]).gated(gate.clone()), IDLE);
        let handle = ctl.submit(h.request("7")).unwrap();

        break_ledger(&h.config.ledger_path);
        gate.add_permits(1);
        let report = handle.wait().await.unwrap();
        assert_eq!(report.status, JobStatus::Succeeded);
        assert!(report.ledger_error.is_some());

        // The trial spent at admission stays spent
        let acct = ctl.snapshot_account("7");
        assert!(acct.free_trial_consumed);
        assert_eq!(acct.lifetime_used, 0);
        assert_eq!(ctl.submit(h.request("7")).unwrap_err(), Rejection::QuotaExceeded("7".to_string()));
    }

    #[test]
    fn test_second_controller_on_same_ledger_is_refused() {
        let h = Harness::new();
        let first = h.controller(ScriptedTools::new([]), IDLE);
        assert!(Controller::new(h.config.clone(), ScriptedTools::new([]), IDLE).is_err());
        drop(first);
        assert!(Controller::new(h.config.clone(), ScriptedTools::new([]), IDLE).is_ok());
    }

    #[test]
    fn test_output_path_sanitizes_account() {
        let id = Uuid::new_v4();
        let path = output_path_for(Path::new("/out"), "../../etc", id);
        assert_eq!(path, Path::new("/out").join("______etc").join(format!("reel_{}.mp4", id)));
        assert!(output_path_for(Path::new("/out"), "", id).starts_with("/out/_"));
    }
}
