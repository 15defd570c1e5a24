use std::path::{Path, PathBuf};

use super::StateStore;
use crate::error::{StoreError, StoreResult};

/// File-system based state store
///
/// Stores each key as one file in a directory. Keys are hex-encoded into file
/// names so arbitrary group keys are safe on any filesystem.
/// Writes are atomic via temp file + rename.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open or create a file-based store at the given directory
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.dir.join(hex_encode(key.as_bytes()))
    }
}

impl StateStore for FileStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let path = self.key_to_path(key);

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, value)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.key_to_path(key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.key_to_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            // Leftover temp files from an interrupted write are not keys
            if name.ends_with(".tmp") {
                continue;
            }
            if let Some(key) = hex_decode(&name).and_then(|b| String::from_utf8(b).ok()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(()) // File writes are already flushed on close
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.put("\"user/1\"", b"hello world").unwrap();
        assert_eq!(
            store.get("\"user/1\"").unwrap(),
            Some(b"hello world".to_vec())
        );

        assert!(store.get("missing").unwrap().is_none());

        store.delete("\"user/1\"").unwrap();
        assert!(store.get("\"user/1\"").unwrap().is_none());

        // Delete missing key (should not error)
        store.delete("missing").unwrap();
    }

    #[test]
    fn test_file_store_keys_and_atomic_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.put("a:b", b"version 1").unwrap();
        store.put("a:b", b"version 2").unwrap();
        store.put("[1,\"x\"]", b"other").unwrap();

        assert_eq!(store.get("a:b").unwrap(), Some(b"version 2".to_vec()));

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(keys, vec!["[1,\"x\"]".to_string(), "a:b".to_string()]);

        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.ends_with(".tmp"), "tmp file left behind: {}", name);
        }
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.put("k", b"persisted").unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(b"persisted".to_vec()));
    }

    #[test]
    fn test_hex_round_trip() {
        let encoded = hex_encode("\"é/:\"".as_bytes());
        assert_eq!(
            hex_decode(&encoded).and_then(|b| String::from_utf8(b).ok()),
            Some("\"é/:\"".to_string())
        );
        assert_eq!(hex_decode("abc"), None);
        assert_eq!(hex_decode("zz"), None);
    }
}
