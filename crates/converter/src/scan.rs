use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use walkdir::WalkDir;
use crate::sidecar;
use log::{debug, info, warn};

/// Clip file extensions picked up from the inbox
const CLIP_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v", "webm", "mkv"];

/// A clip dropped into an account's inbox directory
#[derive(Debug, Clone, PartialEq)]
pub struct InboxClip {
    pub account_id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Result of scanning a file
#[derive(Debug, Clone, PartialEq)]
pub enum ScanResult {
    /// File should be processed
    Candidate(InboxClip),
    /// File should be left alone this pass (path, reason)
    Skipped(PathBuf, String),
}

fn is_clip(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| CLIP_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Scan `<inbox>/<account_id>/` for clips whose size held steady over `stable_wait`
pub async fn scan_inbox(inbox: &Path, stable_wait: Duration) -> Result<Vec<ScanResult>> {
    if !inbox.exists() {
        warn!("Inbox does not exist: {}", inbox.display());
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    let mut pending = Vec::new();

    for entry in WalkDir::new(inbox).min_depth(2).max_depth(2).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading inbox entry: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !entry.file_type().is_file() || !is_clip(path) {
            continue;
        }

        let account_id = match path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        {
            Some(id) => id.to_string(),
            None => continue,
        };

        if sidecar::has_skip_marker(path) {
            results.push(ScanResult::Skipped(path.to_path_buf(), "skip marker (.skip) exists".to_string()));
            continue;
        }

        let size = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat file: {}", path.display()))?
            .len();
        pending.push(InboxClip { account_id, path: path.to_path_buf(), size_bytes: size });
    }

    if pending.is_empty() {
        return Ok(results);
    }

    // Stable-file check: stat again after one shared delay
    debug!("Checking stability of {} clip(s)", pending.len());
    tokio::time::sleep(stable_wait).await;

    for clip in pending {
        let size1 = match std::fs::metadata(&clip.path) {
            Ok(m) => m.len(),
            Err(e) => {
                debug!("{} vanished during stability check: {}", clip.path.display(), e);
                continue;
            }
        };

        if size1 != clip.size_bytes || size1 == 0 {
            results.push(ScanResult::Skipped(clip.path, "file still copying".to_string()));
            continue;
        }

        info!("Found candidate: {} for account {} ({} bytes)", clip.path.display(), clip.account_id, size1);
        results.push(ScanResult::Candidate(clip));
    }

    Ok(results)
}
