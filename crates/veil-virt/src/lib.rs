//! # veil-virt
//!
//! The synchronous entry point of the virtualization pipeline. The OS
//! notification binding calls [`Virtualizer::handle_notification`] on
//! every create/delete/rename/hardlink/read event; the dispatcher either
//! mutates the placeholder ledger inline or enqueues a durable background
//! task, and returns a result code without blocking on deferrable I/O.
//!
//! Network- and disk-bound side effects (fetching object contents,
//! writing hydrated files) run on a small fixed worker pool behind an
//! unbounded queue, separate from the durable task pipeline.

pub mod dispatcher;
pub mod hydrate;
pub mod notify;
pub mod platform;
pub mod store;

pub use dispatcher::{PlaceholderOutcome, Virtualizer, VirtualizerParts};
pub use hydrate::{HydrationJob, HydrationPool};
pub use notify::{FsNotification, MetadataChange, NotificationKind, NotificationStatus};
pub use platform::{platform_layer, DiskPlatformLayer, PlatformLayer};
pub use store::{
    seed_ledger, ContentStore, MetadataObserver, StatusCache, StoreError, TrackedEntry,
    TrackedKind, TrackedPathEnumerator,
};

use thiserror::Error;

/// Errors surfaced by the dispatcher and its helpers
#[derive(Error, Debug)]
pub enum VirtError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("durable store error: {0}")]
    Journal(#[from] veil_journal::JournalError),

    #[error("unsafe relative path: {0}")]
    UnsafePath(String),
}

pub type Result<T> = std::result::Result<T, VirtError>;
