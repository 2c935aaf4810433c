//! Explicit virtualization context.
//!
//! Every component takes a [`VeilContext`] at construction instead of
//! consulting process-wide state, so tests can build isolated contexts
//! and components never depend on initialization order.

use std::path::{Path, PathBuf};

use crate::{path::normalize_or_original, VeilConfig};

/// Path comparison policy of the mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

impl CaseSensitivity {
    /// Default policy for the platform the process is running on.
    pub fn platform_default() -> Self {
        if cfg!(any(windows, target_os = "macos")) {
            CaseSensitivity::Insensitive
        } else {
            CaseSensitivity::Sensitive
        }
    }

    /// Fold a repository-relative path into its lookup key.
    pub fn fold(&self, path: &str) -> String {
        match self {
            CaseSensitivity::Sensitive => path.to_string(),
            CaseSensitivity::Insensitive => path.to_lowercase(),
        }
    }

    /// Compare two repository-relative paths under this policy.
    pub fn eq(&self, a: &str, b: &str) -> bool {
        match self {
            CaseSensitivity::Sensitive => a == b,
            CaseSensitivity::Insensitive => a.to_lowercase() == b.to_lowercase(),
        }
    }
}

/// Per-repository context handed to every component constructor.
#[derive(Debug, Clone)]
pub struct VeilContext {
    repo_root: PathBuf,
    metadata_dir_name: String,
    database_dir: PathBuf,
    case: CaseSensitivity,
}

impl VeilContext {
    pub fn new(repo_root: impl AsRef<Path>, config: &VeilConfig, case: CaseSensitivity) -> Self {
        let repo_root = normalize_or_original(repo_root);
        let metadata_dir_name = config.layout.metadata_dir_name.clone();
        let database_dir = repo_root
            .join(&metadata_dir_name)
            .join(&config.layout.database_dir_name);
        Self {
            repo_root,
            metadata_dir_name,
            database_dir,
            case,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn case(&self) -> CaseSensitivity {
        self.case
    }

    /// Repository metadata directory (`<root>/.git` by default).
    pub fn metadata_dir(&self) -> PathBuf {
        self.repo_root.join(&self.metadata_dir_name)
    }

    /// Directory holding the durable stores.
    pub fn database_dir(&self) -> &Path {
        &self.database_dir
    }

    pub fn task_journal_path(&self) -> PathBuf {
        self.database_dir.join("background_tasks.dat")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.database_dir.join("placeholders.dat")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.metadata_dir().join("veil.lock")
    }

    /// Create the database directory if missing.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.database_dir)
    }

    /// Whether a repository-relative path points inside the metadata
    /// directory rather than the working tree.
    pub fn is_metadata_path(&self, relative: &str) -> bool {
        let first = relative
            .split(['/', '\\'])
            .next()
            .unwrap_or(relative);
        self.case.eq(first, &self.metadata_dir_name)
    }

    /// Strip the metadata directory prefix, if present.
    pub fn metadata_relative<'a>(&self, relative: &'a str) -> Option<&'a str> {
        if !self.is_metadata_path(relative) {
            return None;
        }
        let rest = &relative[self.metadata_dir_name.len().min(relative.len())..];
        Some(rest.trim_start_matches(['/', '\\']))
    }

    /// Absolute path of a repository-relative entry.
    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.repo_root.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> VeilContext {
        VeilContext::new(
            "/repo",
            &VeilConfig::default(),
            CaseSensitivity::Insensitive,
        )
    }

    #[test]
    fn test_metadata_path_detection() {
        let ctx = test_context();
        assert!(ctx.is_metadata_path(".git/index"));
        assert!(ctx.is_metadata_path(".GIT/HEAD"));
        assert!(!ctx.is_metadata_path("src/main.rs"));
        assert!(!ctx.is_metadata_path(".github/workflows/ci.yml"));
    }

    #[test]
    fn test_metadata_relative() {
        let ctx = test_context();
        assert_eq!(ctx.metadata_relative(".git/index"), Some("index"));
        assert_eq!(ctx.metadata_relative(".git/info/exclude"), Some("info/exclude"));
        assert_eq!(ctx.metadata_relative("src/lib.rs"), None);
    }

    #[test]
    fn test_database_paths_under_metadata_dir() {
        let ctx = test_context();
        assert!(ctx
            .task_journal_path()
            .starts_with("/repo/.git/gitveil/databases"));
        assert!(ctx.ledger_path().ends_with("placeholders.dat"));
        assert_eq!(ctx.lock_path(), PathBuf::from("/repo/.git/veil.lock"));
    }

    #[test]
    fn test_case_fold() {
        assert_eq!(CaseSensitivity::Insensitive.fold("A/B.txt"), "a/b.txt");
        assert_eq!(CaseSensitivity::Sensitive.fold("A/B.txt"), "A/B.txt");
    }
}
