//! # veil-lock
//!
//! The repository-wide advisory lock shared by foreground git commands and
//! the background virtualization pipeline. Exactly one side runs at a
//! time; the holder leaves a parseable record of who it is, which the
//! dispatcher consults to decide whether inline placeholder creation is
//! safe to race with the current command.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Commands that may run concurrently with inline placeholder creation.
///
/// Everything else snapshots the working tree and must never observe a
/// placeholder appearing mid-command.
const PLACEHOLDER_SAFE_VERBS: &[&str] = &["status", "add", "stage", "mv"];

/// On-disk record written into the lock file by whoever holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub acquired_at: u64,
}

impl LockHolder {
    pub fn new(pid: u32, command: impl Into<String>, args: Vec<String>) -> Self {
        let acquired_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            pid,
            command: command.into(),
            args,
            acquired_at,
        }
    }

    /// Holder record for this process's own background maintenance.
    pub fn background_maintenance() -> Self {
        Self::new(std::process::id(), "gitveil-maintenance", Vec::new())
    }
}

/// The command currently holding the repository lock, as seen by others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
}

impl ParsedCommand {
    fn from_holder(holder: LockHolder) -> Self {
        Self {
            pid: holder.pid,
            command: holder.command,
            args: holder.args,
        }
    }

    /// An unreadable lock file still means someone holds the lock; treat
    /// it as an unrecognized command so callers stay conservative.
    fn unknown() -> Self {
        Self {
            pid: 0,
            command: "<unknown>".to_string(),
            args: Vec::new(),
        }
    }

    /// The git verb, e.g. `checkout` in `git checkout main`.
    pub fn verb(&self) -> Option<&str> {
        self.args.first().map(|s| s.as_str())
    }

    pub fn is_git_command(&self) -> bool {
        let basename = self
            .command
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.command);
        basename == "git" || basename == "git.exe"
    }

    /// Whether inline placeholder creation may race this command.
    pub fn is_placeholder_safe(&self) -> bool {
        self.is_git_command()
            && self
                .verb()
                .is_some_and(|verb| PLACEHOLDER_SAFE_VERBS.contains(&verb))
    }
}

/// Capability interface over the repository lock.
pub trait RepoLock: Send + Sync {
    /// Attempt to take the lock. Never blocks.
    fn try_acquire(&self) -> bool;

    /// Release the lock if this instance holds it.
    fn release(&self);

    /// The foreground command currently holding the lock, `None` when the
    /// lock is free or held by this process itself.
    fn locked_command(&self) -> Option<ParsedCommand>;
}

/// File-backed lock: exclusive-create of a lock file whose body is the
/// JSON [`LockHolder`] record, removed on release.
pub struct FileRepoLock {
    path: PathBuf,
    holder: LockHolder,
    held: AtomicBool,
}

impl FileRepoLock {
    pub fn new(path: impl AsRef<Path>, holder: LockHolder) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            holder,
            held: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_holder(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, &self.holder)?;
        file.sync_data()?;
        Ok(())
    }
}

impl RepoLock for FileRepoLock {
    fn try_acquire(&self) -> bool {
        match self.write_holder() {
            Ok(()) => {
                self.held.store(true, Ordering::SeqCst);
                true
            }
            Err(LockError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(_) => {
                // Created the file but failed to record the holder; do not
                // leave an empty lock behind.
                let _ = std::fs::remove_file(&self.path);
                false
            }
        }
    }

    fn release(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn locked_command(&self) -> Option<ParsedCommand> {
        let contents = match std::fs::read(&self.path) {
            Ok(contents) => contents,
            Err(_) => return None,
        };
        let parsed = match serde_json::from_slice::<LockHolder>(&contents) {
            Ok(holder) => ParsedCommand::from_holder(holder),
            Err(_) => return Some(ParsedCommand::unknown()),
        };
        if parsed.pid == std::process::id() && self.held.load(Ordering::SeqCst) {
            return None;
        }
        Some(parsed)
    }
}

impl Drop for FileRepoLock {
    fn drop(&mut self) {
        self.release();
    }
}
