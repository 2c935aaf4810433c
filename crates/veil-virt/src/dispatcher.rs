//! The synchronous virtualizer dispatcher.

use std::sync::Arc;

use dashmap::DashSet;
use tracing::{debug, error, warn};

use veil_config::path::is_safe_relative;
use veil_config::{log_virt_info, HydrationConfig, VeilContext};
use veil_journal::{ContentId, FileSystemTask, PlaceholderLedger};
use veil_lock::RepoLock;
use veil_runner::BackgroundRunner;

use crate::hydrate::{HydrationJob, HydrationPool};
use crate::notify::{
    classify_metadata, FsNotification, MetadataChange, NotificationKind, NotificationStatus,
};
use crate::platform::PlatformLayer;
use crate::store::{ContentStore, MetadataObserver, StatusCache};
use crate::{Result, VirtError};

/// Result of a gated placeholder-creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderOutcome {
    /// Written to disk and recorded in the ledger inline.
    Created,
    /// The foreground command cannot tolerate racing hydration; a task was
    /// enqueued for the background worker instead.
    Deferred,
}

/// Collaborators wired into the dispatcher at startup.
pub struct VirtualizerParts {
    pub ctx: VeilContext,
    pub ledger: Arc<PlaceholderLedger>,
    pub runner: Arc<BackgroundRunner>,
    pub lock: Arc<dyn RepoLock>,
    pub platform: Arc<dyn PlatformLayer>,
    pub status_cache: Arc<dyn StatusCache>,
    pub metadata: Arc<dyn MetadataObserver>,
    pub store: Arc<dyn ContentStore>,
}

/// Synchronous dispatcher between the OS notification binding and the
/// durable pipeline.
pub struct Virtualizer {
    ctx: VeilContext,
    ledger: Arc<PlaceholderLedger>,
    runner: Arc<BackgroundRunner>,
    lock: Arc<dyn RepoLock>,
    platform: Arc<dyn PlatformLayer>,
    status_cache: Arc<dyn StatusCache>,
    metadata: Arc<dyn MetadataObserver>,
    hydration: HydrationPool,
    /// Folders deleted by a foreground git command, kept so a later
    /// projection change can tell "git deleted this" from "the user did".
    git_deleted_folders: DashSet<String>,
}

impl Virtualizer {
    pub fn new(parts: VirtualizerParts, hydration_config: &HydrationConfig) -> Self {
        let hydration = HydrationPool::start(
            parts.store.clone(),
            parts.platform.clone(),
            hydration_config,
        );
        log_virt_info!("Virtualizer started");
        Self {
            ctx: parts.ctx,
            ledger: parts.ledger,
            runner: parts.runner,
            lock: parts.lock,
            platform: parts.platform,
            status_cache: parts.status_cache,
            metadata: parts.metadata,
            hydration,
            git_deleted_folders: DashSet::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<PlaceholderLedger> {
        &self.ledger
    }

    /// Entry point called synchronously by the notification binding.
    pub fn handle_notification(&self, n: &FsNotification) -> NotificationStatus {
        if !is_safe_relative(&n.relative_path) {
            warn!(path = n.relative_path.as_str(), "rejecting unsafe notification path");
            return NotificationStatus::IoError;
        }
        if self.ctx.is_metadata_path(&n.relative_path) {
            return self.handle_metadata_event(n);
        }

        match n.kind {
            NotificationKind::FileCreated => self.lenient(n, self.on_file_created(n)),
            NotificationKind::FileOverwritten => self.lenient(
                n,
                self.on_placeholder_replaced(n, FileSystemTask::file_overwritten(&n.relative_path)),
            ),
            NotificationKind::FileSuperseded => self.lenient(
                n,
                self.on_placeholder_replaced(n, FileSystemTask::file_superseded(&n.relative_path)),
            ),
            NotificationKind::FileDeleted => self.lenient(
                n,
                self.on_placeholder_replaced(n, FileSystemTask::file_deleted(&n.relative_path)),
            ),
            NotificationKind::FolderCreated => self.lenient(
                n,
                self.enqueue_and_invalidate(FileSystemTask::folder_created(&n.relative_path)),
            ),
            NotificationKind::FolderDeleted => self.lenient(n, self.on_folder_deleted(n)),
            NotificationKind::FileFirstRead => self.on_first_read(n),
            // A wrong decision on these would be committed to the durable
            // stores; failures terminate instead of guessing.
            NotificationKind::FileRenamed | NotificationKind::FolderRenamed => {
                self.fatal_on_error(n, self.on_renamed(n))
            }
            NotificationKind::FileHardLinkCreated => self.fatal_on_error(
                n,
                self.enqueue_and_invalidate(FileSystemTask::file_hardlink_created(
                    &n.relative_path,
                )),
            ),
            NotificationKind::FileConvertedToFull => {
                self.fatal_on_error(n, self.on_converted_to_full(n))
            }
        }
    }

    fn lenient(&self, n: &FsNotification, result: Result<()>) -> NotificationStatus {
        match result {
            Ok(()) => NotificationStatus::Ok,
            Err(e) => {
                warn!(
                    kind = ?n.kind,
                    path = n.relative_path.as_str(),
                    error = %e,
                    "notification handling failed"
                );
                NotificationStatus::IoError
            }
        }
    }

    fn fatal_on_error(&self, n: &FsNotification, result: Result<()>) -> NotificationStatus {
        match result {
            Ok(()) => NotificationStatus::Ok,
            Err(e) => {
                error!(
                    kind = ?n.kind,
                    path = n.relative_path.as_str(),
                    old_path = n.old_relative_path.as_str(),
                    pid = n.pid,
                    error = %e,
                    "unrecoverable dispatcher failure, terminating"
                );
                std::process::exit(1);
            }
        }
    }

    fn enqueue_and_invalidate(&self, task: FileSystemTask) -> Result<()> {
        self.runner.enqueue(&task)?;
        self.status_cache.invalidate();
        Ok(())
    }

    fn on_file_created(&self, n: &FsNotification) -> Result<()> {
        self.enqueue_and_invalidate(FileSystemTask::file_created(&n.relative_path))
    }

    /// Deleted, overwritten, superseded: the placeholder entry is gone
    /// either way; what differs is the deferred task.
    fn on_placeholder_replaced(&self, n: &FsNotification, task: FileSystemTask) -> Result<()> {
        self.ledger.remove(&n.relative_path)?;
        self.enqueue_and_invalidate(task)
    }

    fn on_folder_deleted(&self, n: &FsNotification) -> Result<()> {
        self.ledger.remove(&n.relative_path)?;
        if let Some(cmd) = self.lock.locked_command() {
            if cmd.is_git_command() {
                self.git_deleted_folders
                    .insert(self.ctx.case().fold(&n.relative_path));
                debug!(
                    path = n.relative_path.as_str(),
                    command = cmd.command.as_str(),
                    "folder delete attributed to foreground git"
                );
                return Ok(());
            }
        }
        self.enqueue_and_invalidate(FileSystemTask::folder_deleted(&n.relative_path))
    }

    fn on_renamed(&self, n: &FsNotification) -> Result<()> {
        if !n.old_relative_path.is_empty() {
            self.ledger.remove(&n.old_relative_path)?;
        }
        let task = match n.kind {
            NotificationKind::FolderRenamed => {
                FileSystemTask::folder_renamed(&n.old_relative_path, &n.relative_path)
            }
            _ => FileSystemTask::file_renamed(&n.old_relative_path, &n.relative_path),
        };
        self.enqueue_and_invalidate(task)
    }

    fn on_converted_to_full(&self, n: &FsNotification) -> Result<()> {
        // Fully materialized files are no longer tracked.
        self.ledger.remove(&n.relative_path)?;
        self.enqueue_and_invalidate(FileSystemTask::file_converted_to_full(&n.relative_path))
    }

    fn on_first_read(&self, n: &FsNotification) -> NotificationStatus {
        match self.ledger.file_content_id(&n.relative_path) {
            Some(content_id) => {
                self.hydration.submit(HydrationJob {
                    relative_path: n.relative_path.clone(),
                    content_id,
                });
                debug!(path = n.relative_path.as_str(), "hydration scheduled");
                NotificationStatus::Pending
            }
            None => NotificationStatus::NotFound,
        }
    }

    fn handle_metadata_event(&self, n: &FsNotification) -> NotificationStatus {
        let Some(inner) = self.ctx.metadata_relative(&n.relative_path) else {
            return NotificationStatus::Ok;
        };
        match classify_metadata(inner) {
            MetadataChange::Index => self.metadata.index_changed(),
            MetadataChange::Head => self.metadata.head_changed(),
            MetadataChange::Exclude => self.metadata.exclude_changed(),
            MetadataChange::Other => {
                debug!(path = n.relative_path.as_str(), "ignoring metadata change");
            }
        }
        NotificationStatus::Ok
    }

    /// Gate for on-demand placeholder file creation during enumeration.
    ///
    /// Creation happens inline only when no foreground command holds the
    /// repository lock or the holder is on the allow-list of commands safe
    /// to race with hydration; otherwise the work is deferred to the
    /// background queue, which runs under the lock.
    pub fn try_create_placeholder_file(
        &self,
        relative: &str,
        content_id: ContentId,
    ) -> Result<PlaceholderOutcome> {
        if !is_safe_relative(relative) {
            return Err(VirtError::UnsafePath(relative.to_string()));
        }
        if let Some(cmd) = self.lock.locked_command() {
            if !cmd.is_placeholder_safe() {
                self.runner.enqueue(&FileSystemTask::file_created(relative))?;
                debug!(
                    path = relative,
                    command = cmd.command.as_str(),
                    "placeholder creation deferred to background"
                );
                return Ok(PlaceholderOutcome::Deferred);
            }
        }
        self.platform.write_placeholder_file(relative, &content_id)?;
        self.ledger.add_file(relative, content_id)?;
        Ok(PlaceholderOutcome::Created)
    }

    /// Folder variant of the creation gate.
    pub fn try_create_placeholder_folder(&self, relative: &str) -> Result<PlaceholderOutcome> {
        if !is_safe_relative(relative) {
            return Err(VirtError::UnsafePath(relative.to_string()));
        }
        if let Some(cmd) = self.lock.locked_command() {
            if !cmd.is_placeholder_safe() {
                self.runner
                    .enqueue(&FileSystemTask::folder_created(relative))?;
                return Ok(PlaceholderOutcome::Deferred);
            }
        }
        self.platform.write_placeholder_folder(relative)?;
        self.ledger.add_partial_folder(relative)?;
        Ok(PlaceholderOutcome::Created)
    }

    /// Record that a partial folder has been fully enumerated.
    pub fn mark_folder_expanded(&self, relative: &str) -> Result<()> {
        self.ledger.add_expanded_folder(relative)?;
        Ok(())
    }

    /// Hand the accumulated git-deleted folder set to the projection
    /// layer, clearing it.
    pub fn drain_git_deleted_folders(&self) -> Vec<String> {
        let drained: Vec<String> = self
            .git_deleted_folders
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.git_deleted_folders.clear();
        drained
    }

    /// Drain and join the hydration pool. The background runner is owned
    /// by the caller and stopped separately.
    pub fn shutdown(mut self) {
        self.hydration.shutdown();
        log_virt_info!("Virtualizer stopped");
    }
}
