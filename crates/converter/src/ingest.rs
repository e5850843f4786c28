use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::task::{JoinHandle, JoinSet};
use crate::commands;
use crate::controller::{Controller, JobHandle};
use crate::ffmpeg::MediaTools;
use crate::job::JobRequest;
use crate::resource::ResourceMonitor;
use crate::scan::{self, InboxClip, ScanResult};
use crate::sidecar;

/// Counts from one inbox pass
#[derive(Debug, Default)]
pub struct IngestPass {
    /// Queued ledger commands applied before the scan
    pub commands: usize,
    pub submitted: usize,
    /// Transient rejections, retried next pass
    pub deferred: usize,
    /// Permanent rejections, marked with a `.skip`
    pub refused: usize,
    pub skipped: usize,
    /// Post-processing of each admitted job
    pub completions: Vec<JoinHandle<()>>,
}

/// Feeds clips from `<inbox>/<account_id>/` into the controller
pub struct InboxIngest<T: MediaTools, M: ResourceMonitor> {
    controller: Controller<T, M>,
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl<T: MediaTools, M: ResourceMonitor> InboxIngest<T, M> {
    pub fn new(controller: Controller<T, M>) -> Self {
        Self {
            controller,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn is_claimed(&self, path: &Path) -> bool {
        self.claimed.lock().map(|c| c.contains(path)).unwrap_or(false)
    }

    /// Apply queued grants, then scan once and submit every stable clip
    pub async fn run_once(&self) -> Result<IngestPass> {
        let mut pass = IngestPass::default();
        match commands::process_command_files(&self.controller) {
            Ok(n) => pass.commands = n,
            Err(e) => error!("Failed to process command files: {:#}", e),
        }

        let cfg = self.controller.config();
        let results = scan::scan_inbox(&cfg.inbox_dir, Duration::from_secs(cfg.stable_check_secs)).await?;

        for result in results {
            let clip = match result {
                ScanResult::Candidate(clip) => clip,
                ScanResult::Skipped(path, reason) => {
                    debug!("Skipping {}: {}", path.display(), reason);
                    pass.skipped += 1;
                    continue;
                }
            };
            // Already admitted in an earlier pass and still being processed
            if self.is_claimed(&clip.path) {
                continue;
            }
            self.submit_clip(clip, &mut pass).await;
        }

        if pass.submitted + pass.refused > 0 {
            info!(
                "Inbox pass: {} submitted, {} deferred, {} refused, {} skipped",
                pass.submitted, pass.deferred, pass.refused, pass.skipped
            );
        }
        Ok(pass)
    }

    async fn submit_clip(&self, clip: InboxClip, pass: &mut IngestPass) {
        let meta = match self.controller.tools().probe(&clip.path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Cannot read {}: {:#}", clip.path.display(), e);
                refuse(&clip.path, &format!("encode_failure: not readable media: {:#}", e));
                pass.refused += 1;
                return;
            }
        };
        let duration = meta.duration_secs().unwrap_or(f64::NAN);
        let request = JobRequest::new(clip.account_id.clone(), clip.path.clone(), duration, clip.size_bytes);

        match self.controller.submit(request) {
            Ok(handle) => {
                if let Ok(mut claimed) = self.claimed.lock() {
                    claimed.insert(clip.path.clone());
                }
                pass.submitted += 1;
                let claimed = self.claimed.clone();
                pass.completions.push(tokio::spawn(complete(handle, clip.path, claimed)));
            }
            Err(rejection) if rejection.is_transient() => {
                debug!("Deferring {}: {}", clip.path.display(), rejection);
                pass.deferred += 1;
            }
            Err(rejection) => {
                info!("Refusing {}: {}", clip.path.display(), rejection);
                refuse(&clip.path, &format!("{}: {}", rejection.category(), rejection));
                pass.refused += 1;
            }
        }
    }

    /// Poll the inbox until `shutdown` resolves, then drain in-flight jobs
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let interval = Duration::from_secs(self.controller.config().scan_interval_secs.max(1));
        let mut completions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            match self.run_once().await {
                Ok(pass) => {
                    for handle in pass.completions {
                        completions.spawn(async move {
                            if let Err(e) = handle.await {
                                error!("Ingest completion task failed: {}", e);
                            }
                        });
                    }
                }
                Err(e) => error!("Inbox scan failed: {:#}", e),
            }
            while completions.try_join_next().is_some() {}

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.controller.shutdown().await;
        while completions.join_next().await.is_some() {}
        Ok(())
    }
}

fn refuse(path: &Path, reason: &str) {
    if let Err(e) = sidecar::mark_refused(path, reason) {
        error!("Failed to mark {} as refused: {:#}", path.display(), e);
    }
}

async fn complete(handle: JobHandle, source: PathBuf, claimed: Arc<Mutex<HashSet<PathBuf>>>) {
    match handle.wait().await {
        Ok(report) => {
            if let Some(e) = &report.ledger_error {
                warn!("Job {} finished but its usage was not recorded: {}", report.job_id, e);
            }
            match &report.outcome {
                Ok(artifact) => {
                    info!("Reel for {} ready at {}", source.display(), artifact.path.display());
                    if let Err(e) = tokio::fs::remove_file(&source).await {
                        warn!("Failed to remove converted clip {}: {}", source.display(), e);
                    }
                }
                Err(failure) => refuse(&source, &format!("{}: {}", failure.category(), failure)),
            }
        }
        Err(e) => refuse(&source, &format!("{:#}", e)),
    }
    if let Ok(mut claimed) = claimed.lock() {
        claimed.remove(&source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use crate::config::ConverterConfig;
    use crate::resource::StaticMonitor;
    use crate::testing::{ScriptedTools, Step};

    const IDLE: StaticMonitor = StaticMonitor { cpu_percent: 5.0, mem_percent: 5.0 };

    fn setup(tools: ScriptedTools) -> (tempfile::TempDir, InboxIngest<ScriptedTools, StaticMonitor>) {
        let tmp = tempfile::tempdir().unwrap();
        let config = ConverterConfig {
            ledger_path: tmp.path().join("ledger.json"),
            temp_dir: tmp.path().join("work"),
            output_dir: tmp.path().join("out"),
            inbox_dir: tmp.path().join("inbox"),
            stable_check_secs: 0,
            ..Default::default()
        };
        let controller = Controller::new(config, tools, IDLE).unwrap();
        (tmp, InboxIngest::new(controller))
    }

    fn drop_clip(tmp: &Path, account: &str, name: &str) -> PathBuf {
        let dir = tmp.join("inbox").join(account);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, b"circular note").unwrap();
        path
    }

    async fn finish(pass: IngestPass) {
        for c in pass.completions {
            c.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_converted_clip_is_removed_from_inbox() {
        let (tmp, ingest) = setup(ScriptedTools::new([]));
        let clip = drop_clip(tmp.path(), "42", "note.mp4");

        let pass = ingest.run_once().await.unwrap();
        assert_eq!(pass.submitted, 1);
        finish(pass).await;

        assert!(!clip.exists());
        assert!(!sidecar::has_skip_marker(&clip));
        let delivered: Vec<_> = fs::read_dir(tmp.path().join("out").join("42")).unwrap().collect();
        assert_eq!(delivered.len(), 1);
    }

    #[tokio::test]
    async fn test_quota_refusal_is_marked_and_not_retried() {
        let (tmp, ingest) = setup(ScriptedTools::new([]));
        drop_clip(tmp.path(), "9", "first.mp4");
        finish(ingest.run_once().await.unwrap()).await;

        let second = drop_clip(tmp.path(), "9", "second.mp4");
        let pass = ingest.run_once().await.unwrap();
        assert_eq!(pass.refused, 1);
        assert!(sidecar::has_skip_marker(&second));
        let why = fs::read_to_string(sidecar::why_txt_path(&second)).unwrap();
        assert!(why.starts_with("quota_exceeded"));

        let pass = ingest.run_once().await.unwrap();
        assert_eq!((pass.submitted, pass.refused, pass.skipped), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_second_clip_of_busy_account_is_deferred() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (tmp, ingest) = setup(ScriptedTools::new([]).gated(gate.clone()));
        ingest.controller.grant_premium("5", 1).unwrap();
        drop_clip(tmp.path(), "5", "a.mp4");
        let b = drop_clip(tmp.path(), "5", "b.mp4");

        let pass = ingest.run_once().await.unwrap();
        assert_eq!((pass.submitted, pass.deferred), (1, 1));
        assert!(b.exists());
        assert!(!sidecar::has_skip_marker(&b));

        // The in-flight clip is not submitted twice
        let again = ingest.run_once().await.unwrap();
        assert_eq!(again.submitted, 0);

        gate.add_permits(2);
        finish(pass).await;
        finish(again).await;
        let pass = ingest.run_once().await.unwrap();
        assert_eq!(pass.submitted, 1);
        finish(pass).await;
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn test_queued_grant_lands_before_the_scan() {
        let (tmp, ingest) = setup(ScriptedTools::new([]));
        let cfg = ingest.controller.config().clone();
        drop_clip(tmp.path(), "9", "first.mp4");
        finish(ingest.run_once().await.unwrap()).await;

        commands::queue_command(&cfg.command_dir(), &commands::CommandFile::grant("9", 1)).unwrap();
        let second = drop_clip(tmp.path(), "9", "second.mp4");
        let pass = ingest.run_once().await.unwrap();
        assert_eq!((pass.commands, pass.submitted), (1, 1));
        finish(pass).await;

        assert!(!second.exists());
        assert_eq!(ingest.controller.snapshot_account("9").premium_balance, 9);
    }

    #[tokio::test]
    async fn test_unwritable_ledger_defers_instead_of_refusing() {
        let (tmp, ingest) = setup(ScriptedTools::new([]));
        let ledger = tmp.path().join("ledger.json");
        fs::create_dir(&ledger).unwrap();
        fs::write(ledger.join("blocker"), b"x").unwrap();
        let clip = drop_clip(tmp.path(), "4", "note.mp4");

        let pass = ingest.run_once().await.unwrap();
        assert_eq!((pass.submitted, pass.deferred, pass.refused), (0, 1, 0));
        assert!(clip.exists());
        assert!(!sidecar::has_skip_marker(&clip));
    }

    #[tokio::test]
    async fn test_failed_conversion_keeps_clip_with_reason() {
        let (tmp, ingest) = setup(ScriptedTools::new([Step::Exit(1), Step::Exit(1)]));
        let clip = drop_clip(tmp.path(), "3", "note.webm");

        finish(ingest.run_once().await.unwrap()).await;
        assert!(clip.exists());
        let why = fs::read_to_string(sidecar::why_txt_path(&clip)).unwrap();
        assert!(why.starts_with("encode_failure_fallback_exhausted"));
    }

    #[tokio::test]
    async fn test_unreadable_clip_is_refused_without_charge() {
        let mut tools = ScriptedTools::new([]);
        tools.unreadable_source = true;
        let (tmp, ingest) = setup(tools);
        let clip = drop_clip(tmp.path(), "1", "junk.mkv");

        let pass = ingest.run_once().await.unwrap();
        assert_eq!(pass.refused, 1);
        assert!(sidecar::has_skip_marker(&clip));
        assert!(ingest.controller.snapshot_account("1").has_entitlement(1));
    }
}
