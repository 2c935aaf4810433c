//! Log-structured placeholder ledger.
//!
//! Records, per repository-relative path, whether the on-disk entry is an
//! unmaterialized placeholder file, a partially- or fully-expanded folder,
//! or removed. The whole file is replayed with one sequential scan on
//! open; the in-memory index answers the dispatcher's hot-path lookups.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str;
use std::sync::Mutex;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use veil_config::CaseSensitivity;

use crate::record::{frame_record, replace_file_atomically, truncate_to, RecordScanner};
use crate::{JournalError, Result};

const MARKER_FILE: u8 = b'F';
const MARKER_FOLDER: u8 = b'O';
const MARKER_TOMBSTONE: u8 = b'X';

const FOLDER_PARTIAL: u8 = 0;
const FOLDER_EXPANDED: u8 = 1;

/// Hex width of a content identifier.
pub const CONTENT_ID_HEX_LEN: usize = 40;

/// Opaque fixed-length content identifier, stored as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId([u8; CONTENT_ID_HEX_LEN]);

impl ContentId {
    /// Parse a 40-character hex string; uppercase is normalized down.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let bytes = hex.as_bytes();
        if bytes.len() != CONTENT_ID_HEX_LEN {
            return None;
        }
        let mut id = [0u8; CONTENT_ID_HEX_LEN];
        for (i, b) in bytes.iter().enumerate() {
            if !b.is_ascii_hexdigit() {
                return None;
            }
            id[i] = b.to_ascii_lowercase();
        }
        Some(Self(id))
    }

    /// Build from the raw 20-byte object identifier.
    pub fn from_object_bytes(raw: &[u8; 20]) -> Self {
        let mut id = [0u8; CONTENT_ID_HEX_LEN];
        id.copy_from_slice(hex::encode(raw).as_bytes());
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        // Construction guarantees ASCII hex.
        str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.as_str())
    }
}

/// What kind of entry a path currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    /// Unmaterialized placeholder file; carries its content identifier.
    File(ContentId),
    /// Folder placeholder whose children are not all materialized.
    PartialFolder,
    /// Folder whose children have all been enumerated onto disk.
    ExpandedFolder,
}

/// A reconciled ledger entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderEntry {
    pub path: String,
    pub kind: PlaceholderKind,
}

enum RacingOp {
    Add(PlaceholderEntry),
    Remove(String),
}

struct CompactionState {
    generation: u64,
    racing: Vec<RacingOp>,
}

struct LedgerWriter {
    file: BufWriter<File>,
    generation: u64,
    compaction: Option<CompactionState>,
}

/// Crash-safe record of per-path materialization state.
///
/// Adds and removes are safe from any number of dispatcher threads;
/// compaction (`get_all_entries` followed by `write_all_entries_and_flush`)
/// must be serialized by the caller, and any add/remove racing the
/// snapshot is preserved in the compacted file.
pub struct PlaceholderLedger {
    path: PathBuf,
    case: CaseSensitivity,
    /// folded path -> (original path, content id)
    files: DashMap<String, (String, ContentId)>,
    /// folded path -> (original path, expanded flag)
    folders: DashMap<String, (String, bool)>,
    writer: Mutex<LedgerWriter>,
}

impl PlaceholderLedger {
    /// Open (or create) the ledger, replaying the file with one sequential
    /// scan. A torn trailing record is dropped and truncated; a fully
    /// terminated record whose payload fails to decode is treated as
    /// absent without invalidating the rest of the file.
    pub fn open(path: impl AsRef<Path>, case: CaseSensitivity) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let ledger = Self {
            path: path.clone(),
            case,
            files: DashMap::new(),
            folders: DashMap::new(),
            writer: Mutex::new(LedgerWriter {
                file: open_append(&path)?,
                generation: 0,
                compaction: None,
            }),
        };

        let mut skipped = 0usize;
        let mut scanner = RecordScanner::new(&bytes);
        let valid_len;
        loop {
            let offset = scanner.pos();
            if scanner.is_at_end() {
                valid_len = offset;
                break;
            }
            match read_entry(&mut scanner) {
                LedgerScan::Stop => {
                    valid_len = offset;
                    break;
                }
                LedgerScan::Skip(reason) => {
                    skipped += 1;
                    warn!(offset, reason, "skipping undecodable ledger entry");
                }
                LedgerScan::Add(entry) => ledger.apply_add(entry),
                LedgerScan::Tombstone(path) => {
                    ledger.apply_remove(&path);
                }
            }
        }

        if valid_len < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - valid_len,
                "placeholder ledger has a torn trailing record, truncating"
            );
            truncate_to(&path, valid_len as u64)?;
            // Reopen so the append cursor sits at the valid prefix.
            ledger.writer.lock().unwrap().file = open_append(&path)?;
        }

        info!(
            path = %path.display(),
            files = ledger.files.len(),
            folders = ledger.folders.len(),
            skipped,
            "placeholder ledger loaded"
        );
        Ok(ledger)
    }

    fn key(&self, path: &str) -> String {
        self.case.fold(path)
    }

    fn apply_add(&self, entry: PlaceholderEntry) {
        let folded = self.key(&entry.path);
        match entry.kind {
            PlaceholderKind::File(id) => {
                self.folders.remove(&folded);
                self.files.insert(folded, (entry.path, id));
            }
            PlaceholderKind::PartialFolder => {
                self.files.remove(&folded);
                self.folders.insert(folded, (entry.path, false));
            }
            PlaceholderKind::ExpandedFolder => {
                self.files.remove(&folded);
                self.folders.insert(folded, (entry.path, true));
            }
        }
    }

    fn apply_remove(&self, path: &str) -> bool {
        let folded = self.key(path);
        let had_file = self.files.remove(&folded).is_some();
        let had_folder = self.folders.remove(&folded).is_some();
        had_file || had_folder
    }

    fn append(&self, entry: PlaceholderEntry) -> Result<()> {
        let bytes = encode_add(&entry)?;
        let mut writer = self.writer.lock().unwrap();
        writer.file.write_all(&bytes)?;
        writer.file.flush()?;
        if let Some(compaction) = writer.compaction.as_mut() {
            compaction.racing.push(RacingOp::Add(entry.clone()));
        }
        self.apply_add(entry);
        Ok(())
    }

    /// Record a placeholder file and its content identifier.
    pub fn add_file(&self, path: &str, content_id: ContentId) -> Result<()> {
        self.append(PlaceholderEntry {
            path: path.to_string(),
            kind: PlaceholderKind::File(content_id),
        })
    }

    /// Record a folder placeholder that has not been fully enumerated.
    pub fn add_partial_folder(&self, path: &str) -> Result<()> {
        self.append(PlaceholderEntry {
            path: path.to_string(),
            kind: PlaceholderKind::PartialFolder,
        })
    }

    /// Record a folder whose children are all on disk.
    pub fn add_expanded_folder(&self, path: &str) -> Result<()> {
        self.append(PlaceholderEntry {
            path: path.to_string(),
            kind: PlaceholderKind::ExpandedFolder,
        })
    }

    /// Append a tombstone for `path`.
    ///
    /// The tombstone is recorded even when no matching add exists, so a
    /// later compaction of an older file generation stays consistent.
    pub fn remove(&self, path: &str) -> Result<()> {
        let bytes = encode_tombstone(path)?;
        let mut writer = self.writer.lock().unwrap();
        writer.file.write_all(&bytes)?;
        writer.file.flush()?;
        if let Some(compaction) = writer.compaction.as_mut() {
            compaction.racing.push(RacingOp::Remove(path.to_string()));
        }
        if !self.apply_remove(path) {
            debug!(path, "tombstone recorded for untracked path");
        }
        Ok(())
    }

    /// Reconciled snapshot of every live entry, sorted by path, and arm
    /// the ledger for a compaction: every add/remove between this call and
    /// [`write_all_entries_and_flush`](Self::write_all_entries_and_flush)
    /// is buffered so the compacted file cannot lose it.
    pub fn get_all_entries(&self) -> Vec<PlaceholderEntry> {
        let mut writer = self.writer.lock().unwrap();
        writer.generation += 1;
        writer.compaction = Some(CompactionState {
            generation: writer.generation,
            racing: Vec::new(),
        });

        let mut entries: Vec<PlaceholderEntry> = self
            .files
            .iter()
            .map(|item| PlaceholderEntry {
                path: item.value().0.clone(),
                kind: PlaceholderKind::File(item.value().1),
            })
            .chain(self.folders.iter().map(|item| PlaceholderEntry {
                path: item.value().0.clone(),
                kind: if item.value().1 {
                    PlaceholderKind::ExpandedFolder
                } else {
                    PlaceholderKind::PartialFolder
                },
            }))
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(
            entries = entries.len(),
            generation = writer.generation,
            "ledger snapshot prepared for compaction"
        );
        entries
    }

    /// Atomically replace the ledger file with exactly `entries` plus any
    /// adds/removes that raced the snapshot, then rebuild the index to
    /// match. Errors with [`JournalError::CompactionNotArmed`] unless
    /// [`get_all_entries`](Self::get_all_entries) was called first.
    pub fn write_all_entries_and_flush(&self, entries: &[PlaceholderEntry]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        let state = writer
            .compaction
            .take()
            .ok_or(JournalError::CompactionNotArmed)?;

        let mut bytes = Vec::new();
        for entry in entries {
            bytes.extend_from_slice(&encode_add(entry)?);
        }
        for op in &state.racing {
            match op {
                RacingOp::Add(entry) => bytes.extend_from_slice(&encode_add(entry)?),
                RacingOp::Remove(path) => bytes.extend_from_slice(&encode_tombstone(path)?),
            }
        }
        replace_file_atomically(&self.path, &bytes)?;
        writer.file = open_append(&self.path)?;

        self.files.clear();
        self.folders.clear();
        for entry in entries {
            self.apply_add(entry.clone());
        }
        for op in state.racing.iter() {
            match op {
                RacingOp::Add(entry) => self.apply_add(entry.clone()),
                RacingOp::Remove(path) => {
                    self.apply_remove(path);
                }
            }
        }

        info!(
            entries = entries.len(),
            raced = state.racing.len(),
            generation = state.generation,
            "placeholder ledger compacted"
        );
        Ok(())
    }

    /// Current state of a path, if it is tracked.
    pub fn get(&self, path: &str) -> Option<PlaceholderKind> {
        let folded = self.key(path);
        if let Some(item) = self.files.get(&folded) {
            return Some(PlaceholderKind::File(item.value().1));
        }
        self.folders.get(&folded).map(|item| {
            if item.value().1 {
                PlaceholderKind::ExpandedFolder
            } else {
                PlaceholderKind::PartialFolder
            }
        })
    }

    /// Content identifier of a placeholder file, if tracked.
    pub fn file_content_id(&self, path: &str) -> Option<ContentId> {
        self.files.get(&self.key(path)).map(|item| item.value().1)
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.files.contains_key(&self.key(path))
    }

    pub fn contains_folder(&self, path: &str) -> bool {
        self.folders.contains_key(&self.key(path))
    }

    pub fn len(&self) -> usize {
        self.files.len() + self.folders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.folders.is_empty()
    }
}

fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn encode_add(entry: &PlaceholderEntry) -> Result<Vec<u8>> {
    match entry.kind {
        PlaceholderKind::File(id) => {
            frame_record(&[MARKER_FILE], &entry.path, id.as_str().as_bytes())
        }
        PlaceholderKind::PartialFolder => {
            frame_record(&[MARKER_FOLDER], &entry.path, &[FOLDER_PARTIAL])
        }
        PlaceholderKind::ExpandedFolder => {
            frame_record(&[MARKER_FOLDER], &entry.path, &[FOLDER_EXPANDED])
        }
    }
}

fn encode_tombstone(path: &str) -> Result<Vec<u8>> {
    frame_record(&[MARKER_TOMBSTONE], path, &[])
}

enum LedgerScan {
    Add(PlaceholderEntry),
    Tombstone(String),
    Skip(&'static str),
    Stop,
}

/// Decode one ledger record. Structural damage (truncation, unknown
/// marker, bad terminator) stops the scan at the previous record; payload
/// decode failures skip just that entry.
fn read_entry(scanner: &mut RecordScanner<'_>) -> LedgerScan {
    let marker = match scanner.read_u8() {
        Some(marker) => marker,
        None => return LedgerScan::Stop,
    };
    if !matches!(marker, MARKER_FILE | MARKER_FOLDER | MARKER_TOMBSTONE) {
        return LedgerScan::Stop;
    }

    let Some(path_raw) = scanner.read_len_prefixed() else {
        return LedgerScan::Stop;
    };
    let payload = match marker {
        MARKER_FILE => scanner.read_exact(CONTENT_ID_HEX_LEN),
        MARKER_FOLDER => scanner.read_exact(1),
        _ => Some(&[][..]),
    };
    let Some(payload) = payload else {
        return LedgerScan::Stop;
    };
    match scanner.read_terminator() {
        None | Some(false) => return LedgerScan::Stop,
        Some(true) => {}
    }

    let Ok(path) = str::from_utf8(path_raw) else {
        return LedgerScan::Skip("path is not valid UTF-8");
    };

    match marker {
        MARKER_FILE => {
            let Some(id) = str::from_utf8(payload).ok().and_then(ContentId::from_hex) else {
                return LedgerScan::Skip("malformed content identifier");
            };
            LedgerScan::Add(PlaceholderEntry {
                path: path.to_string(),
                kind: PlaceholderKind::File(id),
            })
        }
        MARKER_FOLDER => match payload[0] {
            FOLDER_PARTIAL => LedgerScan::Add(PlaceholderEntry {
                path: path.to_string(),
                kind: PlaceholderKind::PartialFolder,
            }),
            FOLDER_EXPANDED => LedgerScan::Add(PlaceholderEntry {
                path: path.to_string(),
                kind: PlaceholderKind::ExpandedFolder,
            }),
            _ => LedgerScan::Skip("unknown folder expansion flag"),
        },
        _ => LedgerScan::Tombstone(path.to_string()),
    }
}
