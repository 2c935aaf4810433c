//! Deferred filesystem work items.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of operations the background pipeline understands.
///
/// Codes are the on-disk encoding; an unknown code during replay is a
/// corruption error, never silently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FsOperation {
    FileCreated = 1,
    FileDeleted = 2,
    FileOverwritten = 3,
    FileConvertedToFull = 4,
    FileRenamed = 5,
    FileHardLinkCreated = 6,
    FileSuperseded = 7,
    FolderCreated = 8,
    FolderDeleted = 9,
    FolderRenamed = 10,
}

impl FsOperation {
    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FsOperation::FileCreated),
            2 => Some(FsOperation::FileDeleted),
            3 => Some(FsOperation::FileOverwritten),
            4 => Some(FsOperation::FileConvertedToFull),
            5 => Some(FsOperation::FileRenamed),
            6 => Some(FsOperation::FileHardLinkCreated),
            7 => Some(FsOperation::FileSuperseded),
            8 => Some(FsOperation::FolderCreated),
            9 => Some(FsOperation::FolderDeleted),
            10 => Some(FsOperation::FolderRenamed),
            _ => None,
        }
    }

    pub fn is_rename(&self) -> bool {
        matches!(self, FsOperation::FileRenamed | FsOperation::FolderRenamed)
    }
}

/// A unit of deferred work, owned by the [`TaskJournal`](crate::TaskJournal)
/// from enqueue until its handler reports success.
///
/// `old_virtual_path` is populated only for renames. Two tasks are equal
/// when operation and both paths match; journal sequence numbers are an
/// internal correlation detail and never part of task identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemTask {
    pub operation: FsOperation,
    pub virtual_path: String,
    pub old_virtual_path: String,
}

impl FileSystemTask {
    pub fn new(operation: FsOperation, virtual_path: impl Into<String>) -> Self {
        Self {
            operation,
            virtual_path: virtual_path.into(),
            old_virtual_path: String::new(),
        }
    }

    fn renamed(
        operation: FsOperation,
        old_virtual_path: impl Into<String>,
        virtual_path: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            virtual_path: virtual_path.into(),
            old_virtual_path: old_virtual_path.into(),
        }
    }

    pub fn file_created(path: impl Into<String>) -> Self {
        Self::new(FsOperation::FileCreated, path)
    }

    pub fn file_deleted(path: impl Into<String>) -> Self {
        Self::new(FsOperation::FileDeleted, path)
    }

    pub fn file_overwritten(path: impl Into<String>) -> Self {
        Self::new(FsOperation::FileOverwritten, path)
    }

    pub fn file_converted_to_full(path: impl Into<String>) -> Self {
        Self::new(FsOperation::FileConvertedToFull, path)
    }

    pub fn file_renamed(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self::renamed(FsOperation::FileRenamed, old_path, new_path)
    }

    pub fn file_hardlink_created(path: impl Into<String>) -> Self {
        Self::new(FsOperation::FileHardLinkCreated, path)
    }

    pub fn file_superseded(path: impl Into<String>) -> Self {
        Self::new(FsOperation::FileSuperseded, path)
    }

    pub fn folder_created(path: impl Into<String>) -> Self {
        Self::new(FsOperation::FolderCreated, path)
    }

    pub fn folder_deleted(path: impl Into<String>) -> Self {
        Self::new(FsOperation::FolderDeleted, path)
    }

    pub fn folder_renamed(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self::renamed(FsOperation::FolderRenamed, old_path, new_path)
    }
}

impl fmt::Display for FileSystemTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operation.is_rename() {
            write!(
                f,
                "{:?} {} -> {}",
                self.operation, self.old_virtual_path, self.virtual_path
            )
        } else {
            write!(f, "{:?} {}", self.operation, self.virtual_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_codes_roundtrip() {
        for code in 1..=10u8 {
            let op = FsOperation::from_code(code).unwrap();
            assert_eq!(op as u8, code);
        }
        assert!(FsOperation::from_code(0).is_none());
        assert!(FsOperation::from_code(11).is_none());
    }

    #[test]
    fn test_task_identity_ignores_nothing() {
        let a = FileSystemTask::file_renamed("old.txt", "new.txt");
        let b = FileSystemTask::file_renamed("old.txt", "new.txt");
        let c = FileSystemTask::file_renamed("other.txt", "new.txt");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_display_includes_old_path_for_renames() {
        let t = FileSystemTask::folder_renamed("a", "b");
        assert_eq!(t.to_string(), "FolderRenamed a -> b");
        let t = FileSystemTask::file_deleted("x.txt");
        assert_eq!(t.to_string(), "FileDeleted x.txt");
    }
}
