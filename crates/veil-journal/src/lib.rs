//! # veil-journal
//!
//! The two durable stores behind gitveil's crash-safe virtualization:
//!
//! - [`TaskJournal`]: an append-only queue of deferred filesystem work.
//!   Enqueued tasks survive process crashes and are drained exactly once.
//! - [`PlaceholderLedger`]: a log-structured record of which paths are
//!   unmaterialized placeholders, partially or fully expanded folders.
//!
//! Both stores share one record framing (see [`record`]): a marker, a
//! length-prefixed UTF-8 path, a store-specific payload, and a four-byte
//! all-zero terminator. The terminator lets replay distinguish a torn
//! trailing write from a well-formed record, so only the cleanly
//! terminated prefix of a file is ever trusted. Removal never rewrites
//! history; it appends a tombstone that replay reconciles with the
//! matching add. Compaction rewrites the reconciled state to a temp file
//! and atomically renames it over the original.

mod ledger;
mod record;
mod task;
mod task_journal;

pub use ledger::{ContentId, PlaceholderEntry, PlaceholderKind, PlaceholderLedger};
pub use task::{FileSystemTask, FsOperation};
pub use task_journal::TaskJournal;

use std::io;
use thiserror::Error;

/// Errors that can occur in the durable stores
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("path exceeds 255 bytes: {path}")]
    PathTooLong { path: String },

    #[error("corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("dequeue head mismatch: expected {expected}, found {actual}")]
    HeadMismatch { expected: String, actual: String },

    #[error("write_all_entries called without a prepared snapshot")]
    CompactionNotArmed,
}

pub type Result<T> = std::result::Result<T, JournalError>;
