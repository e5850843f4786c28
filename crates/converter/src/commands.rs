use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use crate::controller::Controller;
use crate::ffmpeg::MediaTools;
use crate::resource::ResourceMonitor;

/// Queued ledger change for a running daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandFile {
    pub action: String,
    pub account_id: String,
    #[serde(default)]
    pub packs: u32,
    pub queued_at: DateTime<Utc>,
}

impl CommandFile {
    pub fn grant(account_id: impl Into<String>, packs: u32) -> Self {
        Self {
            action: "grant".to_string(),
            account_id: account_id.into(),
            packs,
            queued_at: Utc::now(),
        }
    }
}

/// Write a command where the daemon will pick it up on its next pass
pub fn queue_command(command_dir: &Path, cmd: &CommandFile) -> Result<PathBuf> {
    fs::create_dir_all(command_dir)
        .with_context(|| format!("Failed to create command directory: {}", command_dir.display()))?;

    let path = command_dir.join(format!("{}.json", uuid::Uuid::new_v4()));
    let content = serde_json::to_vec_pretty(cmd).context("Failed to serialize command")?;
    let mut tmp = NamedTempFile::new_in(command_dir)
        .with_context(|| format!("Failed to create command file in {}", command_dir.display()))?;
    tmp.write_all(&content)
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("Failed to write command file: {}", tmp.path().display()))?;
    tmp.persist(&path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to publish command file: {}", path.display()))?;
    Ok(path)
}

/// Apply queued commands through the controller. A command whose ledger write
/// fails stays queued for the next pass.
pub fn process_command_files<T: MediaTools, M: ResourceMonitor>(controller: &Controller<T, M>) -> Result<usize> {
    let command_dir = controller.config().command_dir();
    if !command_dir.exists() {
        return Ok(0);
    }

    let mut paths: Vec<PathBuf> = match fs::read_dir(&command_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json"))
            .collect(),
        Err(e) => {
            debug!("Failed to read command directory {}: {}", command_dir.display(), e);
            return Ok(0);
        }
    };
    paths.sort();

    let mut processed = 0;
    for path in paths {
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read command file {}: {}", path.display(), e);
                continue;
            }
        };

        let cmd: CommandFile = match serde_json::from_str(&content) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to parse command file {}: {}", path.display(), e);
                fs::remove_file(&path).ok();
                continue;
            }
        };

        match cmd.action.as_str() {
            "grant" => match controller.grant_premium(&cmd.account_id, cmd.packs) {
                Ok(account) => {
                    info!(
                        "Account {}: applied queued grant of {} pack(s), balance {}",
                        account.id, cmd.packs, account.premium_balance
                    );
                    processed += 1;
                }
                Err(e) => {
                    warn!("Failed to apply grant for account {}: {:#}", cmd.account_id, e);
                    continue;
                }
            },
            other => warn!("Unknown command action: {}", other),
        }

        fs::remove_file(&path)
            .with_context(|| format!("Failed to delete processed command file: {}", path.display()))?;
    }

    if processed > 0 {
        info!("✅ Processed {} command file(s)", processed);
    }
    Ok(processed)
}
