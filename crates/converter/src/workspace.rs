use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Per-job scratch directory, removed with everything in it when dropped
#[derive(Debug)]
pub struct JobWorkspace {
    dir: PathBuf,
}

impl JobWorkspace {
    pub fn create(temp_dir: &Path, job_id: Uuid) -> Result<Self> {
        let dir = temp_dir.join(format!("job-{}", job_id));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create job workspace: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Staged copy of the source
    pub fn input_path(&self, source: &Path) -> PathBuf {
        let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("mp4");
        self.dir.join(format!("input.{}", ext))
    }

    pub fn primary_output(&self) -> PathBuf {
        self.dir.join("reel.mp4")
    }

    pub fn fallback_output(&self) -> PathBuf {
        self.dir.join("reel.fallback.mp4")
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => debug!("Removed job workspace {}", self.dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove job workspace {}: {}", self.dir.display(), e),
        }
    }
}

/// Number of entries directly under the temp dir (in-flight or leftover workspaces)
pub fn count_temp_entries(temp_dir: &Path) -> usize {
    fs::read_dir(temp_dir).map(|entries| entries.filter_map(|e| e.ok()).count()).unwrap_or(0)
}

/// Remove everything under the temp dir. Only safe while no job is running.
/// Returns the number of files deleted.
pub fn cleanup_temp_dir(temp_dir: &Path) -> Result<usize> {
    if !temp_dir.exists() {
        return Ok(0);
    }

    let mut deleted = 0;
    for entry in WalkDir::new(temp_dir).min_depth(1).contents_first(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Error reading temp entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path).map(|()| deleted += 1)
        };
        if let Err(e) = result {
            warn!("Failed to delete temp entry {}: {}", path.display(), e);
        }
    }

    if deleted > 0 {
        info!("🗑️  Cleaned {} temp file(s) from {}", deleted, temp_dir.display());
    }
    Ok(deleted)
}
