//! Changelog-backed store and its append-only logs
//!
//! Every mutation is appended to the changelog before the in-memory table
//! changes, so the changelog is always a superset of what readers have seen.
//! Opening a [`ChangelogStore`] replays the whole log synchronously.
//!
//! File format (big-endian), one frame per mutation:
//!
//! ```text
//! [seq: u64][op: u8][key_len: u32][key: bytes][value_len: u32][value: bytes]
//! ```
//!
//! `op` is `1` for put and `2` for delete (delete frames carry an empty value).
//! A frame cut short by a crash is discarded on open and the file truncated
//! back to the last complete frame.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::StateStore;
use crate::error::{StoreError, StoreResult};

const OP_PUT: u8 = 1;
const OP_DELETE: u8 = 2;
const HEADER_LEN: usize = 8 + 1 + 4;

/// One replicated mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangelogEntry {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl ChangelogEntry {
    pub fn key(&self) -> &str {
        match self {
            ChangelogEntry::Put { key, .. } | ChangelogEntry::Delete { key } => key,
        }
    }
}

/// Durable, ordered append log used to replicate and recover a store
pub trait Changelog: Send + Sync {
    /// Append one mutation
    fn append(&self, entry: &ChangelogEntry) -> StoreResult<()>;

    /// Read every mutation in append order
    fn replay(&self) -> StoreResult<Vec<ChangelogEntry>>;

    /// Atomically replace the whole log with `entries`
    fn rewrite(&self, entries: &[ChangelogEntry]) -> StoreResult<()>;

    /// Make appended entries durable
    fn sync(&self) -> StoreResult<()>;
}

/// Shared in-memory changelog.
///
/// Clones share the same log, which lets tests drop a store and reopen a new
/// one over the surviving log the way a restarted shard would.
#[derive(Clone, Default)]
pub struct MemoryChangelog {
    entries: Arc<Mutex<Vec<ChangelogEntry>>>,
}

impl MemoryChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Changelog for MemoryChangelog {
    fn append(&self, entry: &ChangelogEntry) -> StoreResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        entries.push(entry.clone());
        Ok(())
    }

    fn replay(&self) -> StoreResult<Vec<ChangelogEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(entries.clone())
    }

    fn rewrite(&self, replacement: &[ChangelogEntry]) -> StoreResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        *entries = replacement.to_vec();
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        Ok(())
    }
}

struct FileLogWriter {
    writer: BufWriter<File>,
    next_seq: u64,
}

/// Append-only changelog file
pub struct FileChangelog {
    path: PathBuf,
    state: Mutex<FileLogWriter>,
    sync_writes: bool,
}

impl FileChangelog {
    /// Open or create a changelog file, discarding a torn trailing frame.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (frames, valid_len, file_len) = match std::fs::read(&path) {
            Ok(bytes) => {
                let (frames, valid_len) = decode_frames(&bytes, &path)?;
                (frames, valid_len, bytes.len())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), 0, 0),
            Err(e) => return Err(e.into()),
        };

        if valid_len < file_len {
            warn!(
                "Changelog {} has a torn trailing frame ({} bytes), truncating",
                path.display(),
                file_len - valid_len
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        let next_seq = frames.last().map(|(seq, _)| seq + 1).unwrap_or(0);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        debug!(
            "Opened changelog {} ({} frames)",
            path.display(),
            frames.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(FileLogWriter {
                writer: BufWriter::new(file),
                next_seq,
            }),
            sync_writes: false,
        })
    }

    /// fsync after every append instead of on [`Changelog::sync`] only
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Changelog for FileChangelog {
    fn append(&self, entry: &ChangelogEntry) -> StoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let frame = encode_frame(state.next_seq, entry)?;
        state.writer.write_all(&frame)?;
        state.writer.flush()?;
        if self.sync_writes {
            state.writer.get_ref().sync_data()?;
        }
        state.next_seq += 1;
        Ok(())
    }

    fn replay(&self) -> StoreResult<Vec<ChangelogEntry>> {
        {
            let mut state = self
                .state
                .lock()
                .map_err(|e| StoreError::Io(e.to_string()))?;
            state.writer.flush()?;
        }
        let bytes = std::fs::read(&self.path)?;
        let (frames, _) = decode_frames(&bytes, &self.path)?;
        Ok(frames.into_iter().map(|(_, entry)| entry).collect())
    }

    fn rewrite(&self, entries: &[ChangelogEntry]) -> StoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        state.writer.flush()?;

        // Atomic replace: write to temp file, then rename
        let tmp_path = self.path.with_extension("compact");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for (seq, entry) in entries.iter().enumerate() {
                tmp.write_all(&encode_frame(seq as u64, entry)?)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.writer = BufWriter::new(file);
        state.next_seq = entries.len() as u64;
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        state.writer.flush()?;
        state.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn encode_frame(seq: u64, entry: &ChangelogEntry) -> StoreResult<Vec<u8>> {
    let (op, key, value): (u8, &str, &[u8]) = match entry {
        ChangelogEntry::Put { key, value } => (OP_PUT, key.as_str(), value.as_slice()),
        ChangelogEntry::Delete { key } => (OP_DELETE, key.as_str(), &[][..]),
    };
    let key_len = u32::try_from(key.len())
        .map_err(|_| StoreError::Serialization(format!("key of {} bytes", key.len())))?;
    let value_len = u32::try_from(value.len())
        .map_err(|_| StoreError::Serialization(format!("value of {} bytes", value.len())))?;

    let mut frame = Vec::with_capacity(HEADER_LEN + key.len() + 4 + value.len());
    frame.extend_from_slice(&seq.to_be_bytes());
    frame.push(op);
    frame.extend_from_slice(&key_len.to_be_bytes());
    frame.extend_from_slice(key.as_bytes());
    frame.extend_from_slice(&value_len.to_be_bytes());
    frame.extend_from_slice(value);
    Ok(frame)
}

/// Decode complete frames; returns them with the byte length they cover.
fn decode_frames(bytes: &[u8], path: &Path) -> StoreResult<(Vec<(u64, ChangelogEntry)>, usize)> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut last_seq: Option<u64> = None;

    loop {
        let Some(header) = bytes.get(offset..offset + HEADER_LEN) else {
            break;
        };
        let seq = read_u64(&header[0..8]);
        let op = header[8];
        let key_len = read_u32(&header[9..13]) as usize;

        let key_start = offset + HEADER_LEN;
        let Some(key_bytes) = bytes.get(key_start..key_start + key_len) else {
            break;
        };
        let value_len_start = key_start + key_len;
        let Some(value_len_bytes) = bytes.get(value_len_start..value_len_start + 4) else {
            break;
        };
        let value_len = read_u32(value_len_bytes) as usize;
        let value_start = value_len_start + 4;
        let Some(value) = bytes.get(value_start..value_start + value_len) else {
            break;
        };

        if let Some(prev) = last_seq {
            if seq <= prev {
                return Err(corrupt(format!(
                    "sequence {} follows {} at offset {}",
                    seq, prev, offset
                )));
            }
        }
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|_| corrupt(format!("non UTF-8 key at offset {}", offset)))?;

        let entry = match op {
            OP_PUT => ChangelogEntry::Put {
                key,
                value: value.to_vec(),
            },
            OP_DELETE => ChangelogEntry::Delete { key },
            other => {
                return Err(corrupt(format!(
                    "unknown op {} at offset {}",
                    other, offset
                )))
            }
        };

        frames.push((seq, entry));
        last_seq = Some(seq);
        offset = value_start + value_len;
    }

    Ok((frames, offset))
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

/// Store whose contents are an in-memory table replicated to a changelog
pub struct ChangelogStore {
    name: String,
    table: RwLock<FxHashMap<String, Vec<u8>>>,
    changelog: Box<dyn Changelog>,
}

impl ChangelogStore {
    /// Open the store, replaying the full changelog before returning.
    pub fn open(name: impl Into<String>, changelog: Box<dyn Changelog>) -> StoreResult<Self> {
        let name = name.into();
        let entries = changelog.replay()?;
        let mut table = FxHashMap::default();
        for entry in &entries {
            match entry {
                ChangelogEntry::Put { key, value } => {
                    table.insert(key.clone(), value.clone());
                }
                ChangelogEntry::Delete { key } => {
                    table.remove(key);
                }
            }
        }

        info!(
            "Restored store '{}' ({} keys from {} changelog entries)",
            name,
            table.len(),
            entries.len()
        );
        Ok(Self {
            name,
            table: RwLock::new(table),
            changelog,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rewrite the changelog as one put per live key.
    pub fn compact(&self) -> StoreResult<usize> {
        let table = self
            .table
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let mut keys: Vec<&String> = table.keys().collect();
        keys.sort();
        let entries: Vec<ChangelogEntry> = keys
            .into_iter()
            .map(|key| ChangelogEntry::Put {
                key: key.clone(),
                value: table[key].clone(),
            })
            .collect();
        self.changelog.rewrite(&entries)?;
        debug!(
            "Compacted changelog for '{}' to {} entries",
            self.name,
            entries.len()
        );
        Ok(entries.len())
    }
}

impl StateStore for ChangelogStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut table = self
            .table
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        self.changelog.append(&ChangelogEntry::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })?;
        table.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let table = self
            .table
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(table.get(key).cloned())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut table = self
            .table
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        if table.contains_key(key) {
            self.changelog.append(&ChangelogEntry::Delete {
                key: key.to_string(),
            })?;
            table.remove(key);
        }
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let table = self
            .table
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(table.keys().cloned().collect())
    }

    fn flush(&self) -> StoreResult<()> {
        self.changelog.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &str, value: &[u8]) -> ChangelogEntry {
        ChangelogEntry::Put {
            key: key.to_string(),
            value: value.to_vec(),
        }
    }

    #[test]
    fn test_changelog_store_replays_puts_and_deletes() {
        let log = MemoryChangelog::new();
        {
            let store = ChangelogStore::open("s", Box::new(log.clone())).unwrap();
            store.put("a", b"1").unwrap();
            store.put("b", b"2").unwrap();
            store.put("a", b"3").unwrap();
            store.delete("b").unwrap();
        }
        assert_eq!(log.len(), 4);

        let store = ChangelogStore::open("s", Box::new(log)).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"3".to_vec()));
        assert!(store.get("b").unwrap().is_none());
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_delete_of_missing_key_is_not_logged() {
        let log = MemoryChangelog::new();
        let store = ChangelogStore::open("s", Box::new(log.clone())).unwrap();
        store.delete("nothing").unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn test_compact_keeps_contents() {
        let log = MemoryChangelog::new();
        let store = ChangelogStore::open("s", Box::new(log.clone())).unwrap();
        for i in 0..10 {
            store.put("k", format!("{}", i).as_bytes()).unwrap();
        }
        store.put("other", b"x").unwrap();
        assert_eq!(log.len(), 11);

        assert_eq!(store.compact().unwrap(), 2);
        assert_eq!(log.len(), 2);

        let reopened = ChangelogStore::open("s", Box::new(log)).unwrap();
        assert_eq!(reopened.get("k").unwrap(), Some(b"9".to_vec()));
        assert_eq!(reopened.get("other").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_file_changelog_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders-dedup.log");
        {
            let log = FileChangelog::open(&path).unwrap();
            log.append(&put("a", b"1")).unwrap();
            log.append(&ChangelogEntry::Delete { key: "a".into() })
                .unwrap();
            log.append(&put("b", b"")).unwrap();
        }

        let log = FileChangelog::open(&path).unwrap();
        assert_eq!(
            log.replay().unwrap(),
            vec![
                put("a", b"1"),
                ChangelogEntry::Delete { key: "a".into() },
                put("b", b""),
            ]
        );

        // Sequence numbers continue after reopen
        log.append(&put("c", b"3")).unwrap();
        assert_eq!(log.replay().unwrap().len(), 4);
    }

    #[test]
    fn test_file_changelog_discards_torn_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.log");
        {
            let log = FileChangelog::open(&path).unwrap();
            log.append(&put("a", b"complete")).unwrap();
            log.append(&put("b", b"also complete")).unwrap();
        }

        // Simulate a crash in the middle of writing a third frame
        let mut torn = encode_frame(2, &put("c", b"never finished")).unwrap();
        torn.truncate(torn.len() - 5);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn).unwrap();
        drop(file);

        let log = FileChangelog::open(&path).unwrap();
        assert_eq!(
            log.replay().unwrap(),
            vec![put("a", b"complete"), put("b", b"also complete")]
        );

        // New appends land after the last complete frame
        log.append(&put("d", b"4")).unwrap();
        drop(log);
        let log = FileChangelog::open(&path).unwrap();
        assert_eq!(log.replay().unwrap().last(), Some(&put("d", b"4")));
    }

    #[test]
    fn test_file_changelog_rejects_unknown_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.log");
        let mut frame = encode_frame(0, &put("a", b"1")).unwrap();
        frame[8] = 9;
        std::fs::write(&path, &frame).unwrap();

        assert!(matches!(
            FileChangelog::open(&path),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_file_changelog_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.log");
        let store =
            ChangelogStore::open("s", Box::new(FileChangelog::open(&path).unwrap())).unwrap();
        for i in 0..5 {
            store.put("k", format!("{}", i).as_bytes()).unwrap();
        }
        store.compact().unwrap();
        store.put("j", b"after").unwrap();
        store.flush().unwrap();
        drop(store);

        let log = FileChangelog::open(&path).unwrap();
        assert_eq!(log.replay().unwrap(), vec![put("k", b"4"), put("j", b"after")]);
    }
}
