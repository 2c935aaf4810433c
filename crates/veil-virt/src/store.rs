//! Capability interfaces over the external collaborators.
//!
//! The core never talks to the object store, the index parser, or the
//! status cache directly; it consumes them through these traits so the
//! pipeline is testable without any of them present.

use thiserror::Error;
use tracing::{info, warn};

use veil_journal::{ContentId, PlaceholderLedger};

/// Failure modes of the content-addressable object store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Worth retrying: network hiccup, store busy.
    #[error("transient content-store failure: {0}")]
    Transient(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("permanent content-store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Fetches object bytes by content identifier.
pub trait ContentStore: Send + Sync {
    fn fetch(&self, id: &ContentId) -> std::result::Result<Vec<u8>, StoreError>;
}

/// Invalidation hook for the cached working-tree status snapshot.
pub trait StatusCache: Send + Sync {
    fn invalidate(&self);
}

/// Callbacks for changes inside the metadata directory.
pub trait MetadataObserver: Send + Sync {
    fn index_changed(&self);
    fn head_changed(&self);
    fn exclude_changed(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedKind {
    File(ContentId),
    Folder,
}

/// One tracked path from the index/projection parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedEntry {
    pub path: String,
    pub kind: TrackedKind,
}

/// Ordered enumeration of the tracked tree, used only to seed the ledger
/// on initial checkout.
pub trait TrackedPathEnumerator {
    fn enumerate(&self) -> Box<dyn Iterator<Item = TrackedEntry> + '_>;
}

/// Seed the placeholder ledger from the tracked tree. Folders start
/// partial; every file records its content identifier.
pub fn seed_ledger(
    enumerator: &dyn TrackedPathEnumerator,
    ledger: &PlaceholderLedger,
) -> veil_journal::Result<usize> {
    let mut seeded = 0usize;
    for entry in enumerator.enumerate() {
        match entry.kind {
            TrackedKind::File(id) => ledger.add_file(&entry.path, id)?,
            TrackedKind::Folder => ledger.add_partial_folder(&entry.path)?,
        }
        seeded += 1;
    }
    if ledger.len() < seeded {
        warn!(
            entries = seeded,
            live = ledger.len(),
            "tracked tree contained colliding paths"
        );
    }
    info!(entries = seeded, "placeholder ledger seeded");
    Ok(seeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use veil_config::CaseSensitivity;
    use veil_journal::PlaceholderKind;

    struct VecEnumerator(Vec<TrackedEntry>);

    impl TrackedPathEnumerator for VecEnumerator {
        fn enumerate(&self) -> Box<dyn Iterator<Item = TrackedEntry> + '_> {
            Box::new(self.0.iter().cloned())
        }
    }

    fn test_id(fill: char) -> ContentId {
        ContentId::from_hex(&fill.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn test_seed_ledger() {
        let dir = tempdir().unwrap();
        let ledger = PlaceholderLedger::open(
            dir.path().join("placeholders.dat"),
            CaseSensitivity::Insensitive,
        )
        .unwrap();

        let enumerator = VecEnumerator(vec![
            TrackedEntry {
                path: "src".to_string(),
                kind: TrackedKind::Folder,
            },
            TrackedEntry {
                path: "src/main.rs".to_string(),
                kind: TrackedKind::File(test_id('1')),
            },
            TrackedEntry {
                path: "README.md".to_string(),
                kind: TrackedKind::File(test_id('2')),
            },
        ]);

        let seeded = seed_ledger(&enumerator, &ledger).unwrap();
        assert_eq!(seeded, 3);
        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.get("src"), Some(PlaceholderKind::PartialFolder));
        assert_eq!(ledger.file_content_id("src/main.rs"), Some(test_id('1')));
    }

    #[test]
    fn test_store_error_retryability() {
        assert!(StoreError::Transient("timeout".into()).is_retryable());
        assert!(!StoreError::NotFound("abc".into()).is_retryable());
        assert!(!StoreError::Permanent("auth".into()).is_retryable());
    }
}
