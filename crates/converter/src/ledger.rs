use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// Per-account usage and entitlement state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub free_trial_consumed: bool,
    #[serde(default)]
    pub free_trials_used: u32,
    #[serde(default)]
    pub premium_balance: u64,
    #[serde(default)]
    pub lifetime_used: u64,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// What paid for an admitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Entitlement {
    FreeTrial,
    Premium,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            free_trial_consumed: false,
            free_trials_used: 0,
            premium_balance: 0,
            lifetime_used: 0,
            last_activity: None,
            created_at: None,
        }
    }

    pub fn free_trials_remaining(&self, free_trial_count: u32) -> u32 {
        if self.free_trial_consumed {
            0
        } else {
            free_trial_count.saturating_sub(self.free_trials_used)
        }
    }

    pub fn has_entitlement(&self, free_trial_count: u32) -> bool {
        self.free_trials_remaining(free_trial_count) > 0 || self.premium_balance > 0
    }

    /// Consume one conversion: a free trial first, then a premium unit
    pub fn debit(&mut self, free_trial_count: u32) -> Option<Entitlement> {
        if self.free_trials_remaining(free_trial_count) > 0 {
            self.free_trials_used += 1;
            self.free_trial_consumed = self.free_trials_used >= free_trial_count;
            Some(Entitlement::FreeTrial)
        } else if self.premium_balance > 0 {
            self.premium_balance -= 1;
            Some(Entitlement::Premium)
        } else {
            None
        }
    }

    /// Record that a job reached a terminal state
    pub fn record_use(&mut self, at: DateTime<Utc>) {
        self.lifetime_used += 1;
        self.last_activity = Some(at);
    }
}

/// Durable account store; the whole file is replaced atomically on every commit
pub struct QuotaLedger {
    path: PathBuf,
    accounts: BTreeMap<String, Account>,
}

impl QuotaLedger {
    /// Load the ledger; a missing file is an empty ledger
    pub fn load(path: &Path) -> Result<Self> {
        let accounts = if path.exists() {
            let content = fs::read(path)
                .with_context(|| format!("Failed to read ledger: {}", path.display()))?;
            serde_json::from_slice(&content)
                .with_context(|| format!("Failed to parse ledger: {}", path.display()))?
        } else {
            debug!("Ledger {} does not exist yet, starting empty", path.display());
            BTreeMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            accounts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Committed state of an account, or the default state for an unknown id
    pub fn account(&self, id: &str) -> Account {
        self.accounts.get(id).cloned().unwrap_or_else(|| Account::new(id))
    }

    /// Persist a new state for one account. The in-memory view only changes once
    /// the file has been durably replaced.
    pub fn commit(&mut self, mut account: Account) -> Result<()> {
        if let Some(existing) = self.accounts.get(&account.id) {
            if account.lifetime_used < existing.lifetime_used {
                bail!(
                    "refusing to move lifetime_used of account {} backwards ({} -> {})",
                    account.id,
                    existing.lifetime_used,
                    account.lifetime_used
                );
            }
            account.created_at = account.created_at.or(existing.created_at);
        }
        if account.created_at.is_none() {
            account.created_at = Some(Utc::now());
        }

        let mut next = self.accounts.clone();
        next.insert(account.id.clone(), account);

        let bytes = serde_json::to_vec_pretty(&next).context("Failed to serialize ledger")?;
        write_atomic(&self.path, &bytes)?;
        self.accounts = next;
        Ok(())
    }

    /// Credit premium units to an account and commit
    pub fn grant_premium(&mut self, id: &str, units: u64) -> Result<Account> {
        let mut account = self.account(id);
        account.premium_balance = account.premium_balance.saturating_add(units);
        self.commit(account.clone())?;
        info!("Granted {} premium unit(s) to account {} (balance {})", units, id, account.premium_balance);
        Ok(account)
    }
}

/// Advisory lock marking the process that owns the ledger. The kernel releases it
/// when the holder exits, so a crashed daemon never blocks its successor.
#[derive(Debug)]
pub struct LedgerLock {
    _file: File,
}

impl LedgerLock {
    pub fn lock_path(ledger_path: &Path) -> PathBuf {
        let name = ledger_path.file_name().and_then(|n| n.to_str()).unwrap_or("ledger");
        ledger_path.with_file_name(format!(".{}.lock", name))
    }

    /// Take the lock, or `None` if another holder has it
    pub fn try_acquire(ledger_path: &Path) -> Result<Option<Self>> {
        let path = Self::lock_path(ledger_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open ledger lock: {}", path.display()))?;

        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                debug!("Ledger lock {} is held elsewhere", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to lock: {}", path.display())),
        }

        // Informational only; the lock itself is what excludes other writers
        file.set_len(0)
            .and_then(|()| write!(file, "{}", std::process::id()))
            .and_then(|()| file.sync_all())
            .with_context(|| format!("Failed to write ledger lock: {}", path.display()))?;
        Ok(Some(Self { _file: file }))
    }

    /// Pid recorded by the current holder, if the lock is held
    pub fn holder(ledger_path: &Path) -> Option<u32> {
        let path = Self::lock_path(ledger_path);
        let file = File::open(&path).ok()?;
        if fs2::FileExt::try_lock_shared(&file).is_ok() {
            // Nobody holds it; dropping the file releases our probe lock
            return None;
        }
        fs::read_to_string(&path).ok()?.trim().parse().ok()
    }
}

/// Write to a sibling temp file, fsync, persist over the target, fsync the directory
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create ledger directory: {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(&parent)
        .with_context(|| format!("Failed to create temp ledger in {}", parent.display()))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .with_context(|| format!("Failed to write temp ledger: {}", tmp.path().display()))?;

    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace ledger: {}", path.display()))?;
    sync_dir(&parent)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("Failed to sync ledger directory: {}", dir.display()))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
