//! Notification types crossing the OS-binding boundary.

/// What the notification layer observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    FileCreated,
    FileOverwritten,
    FileDeleted,
    FileRenamed,
    FileHardLinkCreated,
    FileConvertedToFull,
    FileSuperseded,
    /// First read of a placeholder; content must be materialized.
    FileFirstRead,
    FolderCreated,
    FolderDeleted,
    FolderRenamed,
}

/// One event as delivered by the notification binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsNotification {
    pub kind: NotificationKind,
    pub relative_path: String,
    /// Populated only for renames.
    pub old_relative_path: String,
    /// Process that triggered the event.
    pub pid: u32,
}

impl FsNotification {
    pub fn new(kind: NotificationKind, relative_path: impl Into<String>, pid: u32) -> Self {
        Self {
            kind,
            relative_path: relative_path.into(),
            old_relative_path: String::new(),
            pid,
        }
    }

    pub fn renamed(
        kind: NotificationKind,
        old_relative_path: impl Into<String>,
        relative_path: impl Into<String>,
        pid: u32,
    ) -> Self {
        Self {
            kind,
            relative_path: relative_path.into(),
            old_relative_path: old_relative_path.into(),
            pid,
        }
    }
}

/// Result code handed back to the notification binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Ok,
    NotFound,
    /// Accepted; the side effect completes in the background.
    Pending,
    IoError,
}

/// Classification of a change inside the metadata directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataChange {
    Index,
    Head,
    Exclude,
    Other,
}

/// Classify a path relative to the metadata directory root.
pub fn classify_metadata(relative: &str) -> MetadataChange {
    if relative == "index" {
        MetadataChange::Index
    } else if relative == "HEAD" || relative == "packed-refs" || relative.starts_with("refs/") {
        MetadataChange::Head
    } else if relative == "info/exclude" {
        MetadataChange::Exclude
    } else {
        MetadataChange::Other
    }
}
