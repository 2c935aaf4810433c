//! Durable FIFO queue of background tasks.
//!
//! Adds and removes are separate appended records correlated by sequence
//! number. A task is only ever removed after its handler reported success,
//! so a crash at any point replays exactly the tasks that were durably
//! enqueued and not yet durably dequeued.

use std::collections::{BTreeMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::record::{frame_record, truncate_to, RecordScanner};
use crate::task::{FileSystemTask, FsOperation};
use crate::{JournalError, Result};

const MARKER_ADD: u8 = b'A';
const MARKER_REMOVE: u8 = b'D';

/// Crash-safe multi-producer, single-consumer task queue.
///
/// Any number of dispatcher threads may [`enqueue`](Self::enqueue); exactly
/// one background runner thread peeks and dequeues.
pub struct TaskJournal {
    path: PathBuf,
    inner: Mutex<JournalInner>,
}

struct JournalInner {
    file: File,
    pending: VecDeque<(u64, FileSystemTask)>,
    next_seq: u64,
}

enum ReplayRecord {
    Add(u64, FileSystemTask),
    Remove(u64),
}

impl TaskJournal {
    /// Open (or create) the journal at `path`, replaying any existing
    /// records in file order.
    ///
    /// An add followed by a matching remove cancels out; duplicate removes
    /// of one sequence number are idempotent; a torn trailing record is
    /// dropped and physically truncated. If the reconciled queue is empty
    /// the backing file is truncated to zero as a compaction.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut reconciled: BTreeMap<u64, FileSystemTask> = BTreeMap::new();
        let mut max_seq = 0u64;
        let mut scanner = RecordScanner::new(&bytes);
        let valid_len;
        loop {
            let offset = scanner.pos();
            if scanner.is_at_end() {
                valid_len = offset;
                break;
            }
            match Self::read_record(&mut scanner)? {
                None => {
                    valid_len = offset;
                    break;
                }
                Some(ReplayRecord::Add(seq, task)) => {
                    max_seq = max_seq.max(seq);
                    if reconciled.insert(seq, task).is_some() {
                        debug!(seq, "duplicate add record for sequence number, keeping latest");
                    }
                }
                Some(ReplayRecord::Remove(seq)) => {
                    max_seq = max_seq.max(seq);
                    if reconciled.remove(&seq).is_none() {
                        // Expected after a crash between appending the remove
                        // record and updating in-memory state, or when the add
                        // lived in an already-compacted file. Logged so a real
                        // double-dequeue is still visible in diagnostics.
                        warn!(seq, "remove record without a matching add");
                    }
                }
            }
        }

        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - valid_len,
                "task journal has a torn trailing record, truncating"
            );
            truncate_to(&path, valid_len as u64)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let pending: VecDeque<(u64, FileSystemTask)> = reconciled.into_iter().collect();

        if pending.is_empty() && valid_len > 0 {
            file.set_len(0)?;
            file.sync_data()?;
            debug!(path = %path.display(), "task journal reconciled empty, truncated");
        }

        info!(
            path = %path.display(),
            pending = pending.len(),
            "task journal opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(JournalInner {
                file,
                pending,
                next_seq: max_seq + 1,
            }),
        })
    }

    /// One record, or `Ok(None)` for a torn tail. Semantic corruption in a
    /// fully terminated record (unknown marker or operation code, invalid
    /// path encoding) is a hard load error.
    fn read_record(scanner: &mut RecordScanner<'_>) -> Result<Option<ReplayRecord>> {
        let offset = scanner.pos() as u64;
        let marker = match scanner.read_u8() {
            Some(marker) => marker,
            None => return Ok(None),
        };
        let corrupt = |reason: String| JournalError::Corrupt { offset, reason };

        match marker {
            MARKER_ADD => {
                let Some(seq) = scanner.read_u64_le() else {
                    return Ok(None);
                };
                let Some(path_raw) = scanner.read_len_prefixed() else {
                    return Ok(None);
                };
                let Some(op_code) = scanner.read_u8() else {
                    return Ok(None);
                };
                let Some(old_raw) = scanner.read_len_prefixed() else {
                    return Ok(None);
                };
                match scanner.read_terminator() {
                    None => return Ok(None),
                    Some(false) => {
                        return Err(corrupt("add record with nonzero terminator".to_string()))
                    }
                    Some(true) => {}
                }

                let path = str::from_utf8(path_raw)
                    .map_err(|_| corrupt("task path is not valid UTF-8".to_string()))?;
                let old_path = str::from_utf8(old_raw)
                    .map_err(|_| corrupt("task old path is not valid UTF-8".to_string()))?;
                let operation = FsOperation::from_code(op_code)
                    .ok_or_else(|| corrupt(format!("unknown operation code {op_code}")))?;

                let mut task = FileSystemTask::new(operation, path);
                task.old_virtual_path = old_path.to_string();
                Ok(Some(ReplayRecord::Add(seq, task)))
            }
            MARKER_REMOVE => {
                let Some(seq) = scanner.read_u64_le() else {
                    return Ok(None);
                };
                let Some(_empty_path) = scanner.read_len_prefixed() else {
                    return Ok(None);
                };
                match scanner.read_terminator() {
                    None => Ok(None),
                    Some(false) => {
                        Err(corrupt("remove record with nonzero terminator".to_string()))
                    }
                    Some(true) => Ok(Some(ReplayRecord::Remove(seq))),
                }
            }
            other => Err(corrupt(format!("unknown record marker 0x{other:02x}"))),
        }
    }

    fn encode_add(seq: u64, task: &FileSystemTask) -> Result<Vec<u8>> {
        let mut marker = [0u8; 9];
        marker[0] = MARKER_ADD;
        marker[1..].copy_from_slice(&seq.to_le_bytes());

        let old = task.old_virtual_path.as_bytes();
        if old.len() > crate::record::MAX_PATH_BYTES {
            return Err(JournalError::PathTooLong {
                path: task.old_virtual_path.clone(),
            });
        }
        let mut payload = Vec::with_capacity(2 + old.len());
        payload.push(task.operation as u8);
        payload.push(old.len() as u8);
        payload.extend_from_slice(old);

        frame_record(&marker, &task.virtual_path, &payload)
    }

    fn encode_remove(seq: u64) -> Result<Vec<u8>> {
        let mut marker = [0u8; 9];
        marker[0] = MARKER_REMOVE;
        marker[1..].copy_from_slice(&seq.to_le_bytes());
        frame_record(&marker, "", &[])
    }

    /// Append a task and flush it to stable storage.
    ///
    /// The task is visible to the consumer only after the append is durable,
    /// so a crash can never hand out work that would vanish on replay.
    pub fn enqueue(&self, task: &FileSystemTask) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        let bytes = Self::encode_add(seq, task)?;
        inner.file.write_all(&bytes)?;
        inner.file.sync_data()?;
        inner.next_seq += 1;
        inner.pending.push_back((seq, task.clone()));
        debug!(seq, task = %task, "task enqueued");
        Ok(())
    }

    /// The oldest pending task, without removing it. Never blocks.
    pub fn try_peek(&self) -> Option<FileSystemTask> {
        let inner = self.inner.lock().unwrap();
        inner.pending.front().map(|(_, task)| task.clone())
    }

    /// Durably remove the head task.
    ///
    /// `expected` must equal the actual head; a mismatch means the caller
    /// and the journal have diverged, which is an invariant violation and
    /// not a recoverable condition.
    pub fn dequeue(&self, expected: &FileSystemTask) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let (seq, head) = match inner.pending.front() {
            Some((seq, head)) => (*seq, head.clone()),
            None => {
                return Err(JournalError::HeadMismatch {
                    expected: expected.to_string(),
                    actual: "<empty>".to_string(),
                })
            }
        };
        if head != *expected {
            return Err(JournalError::HeadMismatch {
                expected: expected.to_string(),
                actual: head.to_string(),
            });
        }

        let bytes = Self::encode_remove(seq)?;
        inner.file.write_all(&bytes)?;
        inner.file.sync_data()?;
        inner.pending.pop_front();
        debug!(seq, task = %head, "task dequeued");

        if inner.pending.is_empty() {
            // Inline compaction: an empty queue has no history worth keeping.
            inner.file.set_len(0)?;
            inner.file.sync_data()?;
            debug!(path = %self.path.display(), "task journal drained, truncated");
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().pending.is_empty()
    }

    /// Number of pending tasks.
    ///
    /// O(1) against the in-memory mirror here, but other backings may need
    /// a scan; hot paths should prefer [`is_empty`](Self::is_empty).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_enqueue_peek_dequeue_fifo() {
        let dir = tempdir().unwrap();
        let journal = TaskJournal::open(dir.path().join("tasks.dat")).unwrap();

        let first = FileSystemTask::file_created("a.txt");
        let second = FileSystemTask::file_deleted("b.txt");
        journal.enqueue(&first).unwrap();
        journal.enqueue(&second).unwrap();

        assert_eq!(journal.len(), 2);
        assert_eq!(journal.try_peek(), Some(first.clone()));
        journal.dequeue(&first).unwrap();
        assert_eq!(journal.try_peek(), Some(second.clone()));
        journal.dequeue(&second).unwrap();
        assert!(journal.is_empty());
        assert_eq!(journal.try_peek(), None);
    }

    #[test]
    fn test_dequeue_head_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let journal = TaskJournal::open(dir.path().join("tasks.dat")).unwrap();

        journal
            .enqueue(&FileSystemTask::file_created("a.txt"))
            .unwrap();
        let stale = FileSystemTask::file_created("other.txt");
        assert!(matches!(
            journal.dequeue(&stale),
            Err(JournalError::HeadMismatch { .. })
        ));
        // Head must be untouched after the failed dequeue.
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn test_dequeue_empty_is_head_mismatch() {
        let dir = tempdir().unwrap();
        let journal = TaskJournal::open(dir.path().join("tasks.dat")).unwrap();
        let task = FileSystemTask::file_created("a.txt");
        assert!(matches!(
            journal.dequeue(&task),
            Err(JournalError::HeadMismatch { .. })
        ));
    }

    #[test]
    fn test_reopen_replays_pending_tasks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.dat");
        let rename = FileSystemTask::folder_renamed("old/dir", "new/dir");
        {
            let journal = TaskJournal::open(&path).unwrap();
            journal
                .enqueue(&FileSystemTask::file_created("done.txt"))
                .unwrap();
            journal.enqueue(&rename).unwrap();
            let head = journal.try_peek().unwrap();
            journal.dequeue(&head).unwrap();
        }

        let journal = TaskJournal::open(&path).unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.try_peek(), Some(rename));
    }

    #[test]
    fn test_empty_queue_truncates_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.dat");
        let task = FileSystemTask::file_created("a.txt");
        {
            let journal = TaskJournal::open(&path).unwrap();
            journal.enqueue(&task).unwrap();
            journal.dequeue(&task).unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_unknown_operation_code_is_load_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.dat");
        {
            let journal = TaskJournal::open(&path).unwrap();
            journal
                .enqueue(&FileSystemTask::file_created("a.txt"))
                .unwrap();
        }
        // Flip the operation code to a value outside the closed set.
        let mut bytes = std::fs::read(&path).unwrap();
        let op_offset = 1 + 8 + 1 + "a.txt".len();
        bytes[op_offset] = 0xEE;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            TaskJournal::open(&path),
            Err(JournalError::Corrupt { .. })
        ));
    }
}
