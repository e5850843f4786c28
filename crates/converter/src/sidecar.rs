use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};

fn with_suffix(file_path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = file_path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    file_path.with_file_name(name)
}

/// Check if a skip marker (`<clip>.skip`) exists for a file
pub fn has_skip_marker(file_path: &Path) -> bool {
    skip_marker_path(file_path).exists()
}

/// Get the path to the skip marker file for a given clip
pub fn skip_marker_path(file_path: &Path) -> PathBuf {
    with_suffix(file_path, ".skip")
}

/// Write a skip marker file
pub fn write_skip_marker(file_path: &Path) -> Result<()> {
    let skip_path = skip_marker_path(file_path);
    fs::write(&skip_path, "")
        .with_context(|| format!("Failed to write skip marker: {}", skip_path.display()))?;
    Ok(())
}

/// Get the path to the why.txt file for a given clip
pub fn why_txt_path(file_path: &Path) -> PathBuf {
    with_suffix(file_path, ".why.txt")
}

/// Write a why.txt file explaining why a clip was not converted
pub fn write_why_txt(file_path: &Path, reason: &str) -> Result<()> {
    let why_path = why_txt_path(file_path);
    fs::write(&why_path, reason)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}

/// Record a permanent refusal: the reason plus a marker so the clip is not picked up again
pub fn mark_refused(file_path: &Path, reason: &str) -> Result<()> {
    write_why_txt(file_path, reason)?;
    write_skip_marker(file_path)
}
