//! End-to-end dispatcher tests over the real journal, ledger, lock, and
//! runner, with in-memory doubles for the external collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};
use veil_config::{CaseSensitivity, HydrationConfig, RunnerConfig, VeilConfig, VeilContext};
use veil_journal::{ContentId, FileSystemTask, PlaceholderLedger, TaskJournal};
use veil_lock::{FileRepoLock, LockHolder, RepoLock};
use veil_runner::{BackgroundRunner, TaskHandler, TaskOutcome};
use veil_virt::{
    platform_layer, ContentStore, FsNotification, MetadataObserver, NotificationKind,
    NotificationStatus, PlaceholderOutcome, StatusCache, StoreError, Virtualizer, VirtualizerParts,
};

fn test_id(fill: char) -> ContentId {
    ContentId::from_hex(&fill.to_string().repeat(40)).unwrap()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[derive(Clone, Default)]
struct RecordingHandler {
    executed: Arc<Mutex<Vec<FileSystemTask>>>,
}

impl TaskHandler for RecordingHandler {
    fn execute(&mut self, task: &FileSystemTask) -> TaskOutcome {
        self.executed.lock().unwrap().push(task.clone());
        TaskOutcome::Success
    }
}

#[derive(Default)]
struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    transient_failures: AtomicU32,
}

impl MemoryStore {
    fn insert(&self, id: &ContentId, bytes: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(id.as_str().to_string(), bytes.to_vec());
    }
}

impl ContentStore for MemoryStore {
    fn fetch(&self, id: &ContentId) -> Result<Vec<u8>, StoreError> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Transient("injected failure".to_string()));
        }
        self.blobs
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

#[derive(Default)]
struct CountingStatusCache {
    invalidations: AtomicUsize,
}

impl StatusCache for CountingStatusCache {
    fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingMetadata {
    index: AtomicUsize,
    head: AtomicUsize,
    exclude: AtomicUsize,
}

impl MetadataObserver for CountingMetadata {
    fn index_changed(&self) {
        self.index.fetch_add(1, Ordering::SeqCst);
    }
    fn head_changed(&self) {
        self.head.fetch_add(1, Ordering::SeqCst);
    }
    fn exclude_changed(&self) {
        self.exclude.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    _dir: TempDir,
    root: std::path::PathBuf,
    lock_path: std::path::PathBuf,
    journal: Arc<TaskJournal>,
    ledger: Arc<PlaceholderLedger>,
    runner: Arc<BackgroundRunner>,
    handler: RecordingHandler,
    store: Arc<MemoryStore>,
    status: Arc<CountingStatusCache>,
    metadata: Arc<CountingMetadata>,
}

fn build() -> (Fixture, Virtualizer) {
    let dir = tempdir().unwrap();
    let ctx = VeilContext::new(
        dir.path(),
        &VeilConfig::default(),
        CaseSensitivity::Insensitive,
    );
    ctx.ensure_layout().unwrap();

    let journal = Arc::new(TaskJournal::open(ctx.task_journal_path()).unwrap());
    let ledger = Arc::new(PlaceholderLedger::open(ctx.ledger_path(), ctx.case()).unwrap());
    let lock_path = ctx.lock_path();
    let lock = Arc::new(FileRepoLock::new(
        &lock_path,
        LockHolder::background_maintenance(),
    ));

    let handler = RecordingHandler::default();
    let runner = Arc::new(BackgroundRunner::start(
        journal.clone(),
        lock.clone(),
        handler.clone(),
        RunnerConfig {
            lock_backoff_ms: 2,
            retry_interval_ms: 2,
            ..RunnerConfig::default()
        },
    ));

    let store = Arc::new(MemoryStore::default());
    let status = Arc::new(CountingStatusCache::default());
    let metadata = Arc::new(CountingMetadata::default());

    let virt = Virtualizer::new(
        VirtualizerParts {
            ctx: ctx.clone(),
            ledger: ledger.clone(),
            runner: runner.clone(),
            lock: lock.clone(),
            platform: platform_layer(&ctx),
            status_cache: status.clone(),
            metadata: metadata.clone(),
            store: store.clone(),
        },
        &HydrationConfig {
            threads: Some(2),
            max_retries: 3,
        },
    );

    let fixture = Fixture {
        root: dir.path().to_path_buf(),
        _dir: dir,
        lock_path,
        journal,
        ledger,
        runner,
        handler,
        store,
        status,
        metadata,
    };
    (fixture, virt)
}

#[test]
fn file_delete_updates_ledger_and_enqueues_task() {
    let (fx, virt) = build();
    fx.ledger.add_file("src/a.txt", test_id('1')).unwrap();

    let status =
        virt.handle_notification(&FsNotification::new(NotificationKind::FileDeleted, "src/a.txt", 7));
    assert_eq!(status, NotificationStatus::Ok);

    assert!(!fx.ledger.contains_file("src/a.txt"));
    assert!(fx.status.invalidations.load(Ordering::SeqCst) >= 1);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.handler
            .executed
            .lock()
            .unwrap()
            .contains(&FileSystemTask::file_deleted("src/a.txt"))
    }));
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn rename_removes_old_ledger_entry() {
    let (fx, virt) = build();
    fx.ledger.add_file("old.txt", test_id('2')).unwrap();

    let status = virt.handle_notification(&FsNotification::renamed(
        NotificationKind::FileRenamed,
        "old.txt",
        "new.txt",
        7,
    ));
    assert_eq!(status, NotificationStatus::Ok);
    assert!(!fx.ledger.contains_file("old.txt"));

    assert!(wait_until(Duration::from_secs(5), || {
        fx.handler
            .executed
            .lock()
            .unwrap()
            .contains(&FileSystemTask::file_renamed("old.txt", "new.txt"))
    }));
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn metadata_changes_route_to_observers_not_the_journal() {
    let (fx, virt) = build();

    for (path, kind) in [
        (".git/index", NotificationKind::FileOverwritten),
        (".git/HEAD", NotificationKind::FileOverwritten),
        (".git/refs/heads/main", NotificationKind::FileCreated),
        (".git/info/exclude", NotificationKind::FileOverwritten),
        (".git/config", NotificationKind::FileOverwritten),
    ] {
        assert_eq!(
            virt.handle_notification(&FsNotification::new(kind, path, 7)),
            NotificationStatus::Ok
        );
    }

    assert_eq!(fx.metadata.index.load(Ordering::SeqCst), 1);
    assert_eq!(fx.metadata.head.load(Ordering::SeqCst), 2);
    assert_eq!(fx.metadata.exclude.load(Ordering::SeqCst), 1);
    assert!(fx.journal.is_empty());
    assert_eq!(fx.status.invalidations.load(Ordering::SeqCst), 0);
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn placeholder_created_inline_when_lock_is_free() {
    let (fx, virt) = build();

    let outcome = virt
        .try_create_placeholder_file("src/lib.rs", test_id('3'))
        .unwrap();
    assert_eq!(outcome, PlaceholderOutcome::Created);
    assert!(fx.ledger.contains_file("src/lib.rs"));
    assert!(fx.root.join("src/lib.rs").exists());
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn placeholder_deferred_under_unsafe_foreground_command() {
    let (fx, virt) = build();
    let foreground = FileRepoLock::new(
        &fx.lock_path,
        LockHolder::new(9999, "/usr/bin/git", vec!["checkout".to_string()]),
    );
    assert!(foreground.try_acquire());

    let outcome = virt
        .try_create_placeholder_file("deep/file.rs", test_id('4'))
        .unwrap();
    assert_eq!(outcome, PlaceholderOutcome::Deferred);
    assert!(!fx.ledger.contains_file("deep/file.rs"));
    assert!(!fx.root.join("deep/file.rs").exists());
    // The runner cannot drain while the foreground command holds the lock,
    // so the deferred task is observable in the journal.
    assert_eq!(fx.journal.len(), 1);
    assert_eq!(
        fx.journal.try_peek(),
        Some(FileSystemTask::file_created("deep/file.rs"))
    );

    foreground.release();
    assert!(wait_until(Duration::from_secs(5), || fx.journal.is_empty()));
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn placeholder_created_inline_under_safe_foreground_command() {
    let (fx, virt) = build();
    let foreground = FileRepoLock::new(
        &fx.lock_path,
        LockHolder::new(9999, "/usr/bin/git", vec!["status".to_string()]),
    );
    assert!(foreground.try_acquire());

    let outcome = virt
        .try_create_placeholder_folder("vendor")
        .unwrap();
    assert_eq!(outcome, PlaceholderOutcome::Created);
    assert!(fx.ledger.contains_folder("vendor"));
    assert!(fx.root.join("vendor").is_dir());

    virt.mark_folder_expanded("vendor").unwrap();
    assert_eq!(
        fx.ledger.get("vendor"),
        Some(veil_journal::PlaceholderKind::ExpandedFolder)
    );
    foreground.release();
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn git_folder_delete_becomes_tombstone_candidate() {
    let (fx, virt) = build();
    fx.ledger.add_partial_folder("gone/dir").unwrap();
    let foreground = FileRepoLock::new(
        &fx.lock_path,
        LockHolder::new(9999, "/usr/bin/git", vec!["checkout".to_string()]),
    );
    assert!(foreground.try_acquire());

    let status = virt.handle_notification(&FsNotification::new(
        NotificationKind::FolderDeleted,
        "gone/dir",
        9999,
    ));
    assert_eq!(status, NotificationStatus::Ok);
    assert!(!fx.ledger.contains_folder("gone/dir"));
    // Attributed to git: no background task was enqueued.
    assert!(fx.journal.is_empty());
    assert_eq!(virt.drain_git_deleted_folders(), vec!["gone/dir".to_string()]);
    assert!(virt.drain_git_deleted_folders().is_empty());

    foreground.release();
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn user_folder_delete_enqueues_background_task() {
    let (fx, virt) = build();
    fx.ledger.add_partial_folder("scratch").unwrap();

    let status = virt.handle_notification(&FsNotification::new(
        NotificationKind::FolderDeleted,
        "scratch",
        1234,
    ));
    assert_eq!(status, NotificationStatus::Ok);
    assert!(wait_until(Duration::from_secs(5), || {
        fx.handler
            .executed
            .lock()
            .unwrap()
            .contains(&FileSystemTask::folder_deleted("scratch"))
    }));
    assert!(virt.drain_git_deleted_folders().is_empty());
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn first_read_hydrates_through_the_pool() {
    let (fx, virt) = build();
    let id = test_id('5');
    fx.store.insert(&id, b"object contents");
    // One injected transient failure exercises the retry path.
    fx.store.transient_failures.store(1, Ordering::SeqCst);
    fx.ledger.add_file("data/big.bin", id).unwrap();

    let status = virt.handle_notification(&FsNotification::new(
        NotificationKind::FileFirstRead,
        "data/big.bin",
        7,
    ));
    assert_eq!(status, NotificationStatus::Pending);

    let target = fx.root.join("data/big.bin");
    assert!(wait_until(Duration::from_secs(5), || {
        std::fs::read(&target).map(|b| b == b"object contents").unwrap_or(false)
    }));
    // Hydrated placeholders stay tracked; only conversion to full removes
    // the ledger entry.
    assert!(fx.ledger.contains_file("data/big.bin"));
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn first_read_of_untracked_path_is_not_found() {
    let (fx, virt) = build();
    let status = virt.handle_notification(&FsNotification::new(
        NotificationKind::FileFirstRead,
        "nope.txt",
        7,
    ));
    assert_eq!(status, NotificationStatus::NotFound);
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn unsafe_paths_are_rejected() {
    let (fx, virt) = build();
    let status = virt.handle_notification(&FsNotification::new(
        NotificationKind::FileDeleted,
        "../escape.txt",
        7,
    ));
    assert_eq!(status, NotificationStatus::IoError);
    assert!(fx.journal.is_empty());

    assert!(virt
        .try_create_placeholder_file("../../etc/passwd", test_id('6'))
        .is_err());
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn conversion_to_full_stops_tracking_the_file() {
    let (fx, virt) = build();
    fx.ledger.add_file("notes.md", test_id('7')).unwrap();

    let status = virt.handle_notification(&FsNotification::new(
        NotificationKind::FileConvertedToFull,
        "notes.md",
        7,
    ));
    assert_eq!(status, NotificationStatus::Ok);
    assert!(!fx.ledger.contains_file("notes.md"));
    assert!(wait_until(Duration::from_secs(5), || {
        fx.handler
            .executed
            .lock()
            .unwrap()
            .contains(&FileSystemTask::file_converted_to_full("notes.md"))
    }));
    virt.shutdown();
    fx.runner.stop();
}

#[test]
fn shutdown_finishes_queued_hydrations() {
    let (fx, virt) = build();
    let mut targets = Vec::new();
    for i in 0..12u32 {
        let id = test_id(char::from_digit(i % 10, 10).unwrap());
        fx.store.insert(&id, format!("blob {i}").as_bytes());
        let rel = format!("blobs/file{i}.bin");
        fx.ledger.add_file(&rel, id).unwrap();
        assert_eq!(
            virt.handle_notification(&FsNotification::new(
                NotificationKind::FileFirstRead,
                rel.as_str(),
                7,
            )),
            NotificationStatus::Pending
        );
        targets.push(fx.root.join(rel));
    }

    // Shutdown must let every queued job finish before joining.
    virt.shutdown();
    for target in targets {
        assert!(target.exists(), "{} not hydrated", target.display());
    }
    fx.runner.stop();
}
