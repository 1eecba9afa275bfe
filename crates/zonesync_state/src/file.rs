//! Journal-based state backend for persistent state.

use crate::backend::StateBackend;
use crate::error::{StateError, StateResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Size of the little-endian length prefix in front of every frame.
const FRAME_HEADER_LEN: usize = 4;

/// Configuration for the journal backend.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Number of superseded frames tolerated before the journal is
    /// rewritten with only the live entries.
    pub compact_after: u64,
    /// Whether every write is followed by `sync_all`.
    pub sync_on_write: bool,
}

impl JournalConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub const fn compact_after(mut self, frames: u64) -> Self {
        self.compact_after = frames;
        self
    }

    /// Sets whether every write is synced to disk.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            compact_after: 256,
            sync_on_write: false,
        }
    }
}

/// A single journal record.
#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Put { key: String, value: Vec<u8> },
    Remove { key: String },
}

impl Frame {
    fn encode(&self) -> StateResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(self, &mut payload)
            .map_err(|e| StateError::Encoding(e.to_string()))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| StateError::Encoding("frame larger than 4 GiB".into()))?;

        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }
}

struct Journal {
    file: File,
    entries: BTreeMap<String, Vec<u8>>,
    /// Frames currently in the file, live or superseded.
    frames: u64,
}

impl Journal {
    fn dead_frames(&self) -> u64 {
        self.frames.saturating_sub(self.entries.len() as u64)
    }
}

/// A journal-backed state backend.
///
/// Every `put` and `remove` appends a length-prefixed CBOR frame to the
/// journal file. Opening the backend replays the journal to rebuild the
/// key/value map, so values survive process restarts.
///
/// # Recovery
///
/// - A torn trailing frame (the process died mid-append) is truncated
/// - A malformed frame followed by more data is reported as corruption
///
/// # Compaction
///
/// Once more than [`JournalConfig::compact_after`] frames have been
/// superseded, the live map is written to a sibling file which then
/// atomically replaces the journal.
///
/// # Example
///
/// ```no_run
/// use zonesync_state::{StateBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("sync-state.journal")).unwrap();
/// backend.put("cursor/database", b"opaque").unwrap();
/// backend.flush().unwrap();
/// ```
pub struct FileBackend {
    path: PathBuf,
    config: JournalConfig,
    journal: Mutex<Journal>,
}

impl FileBackend {
    /// Opens or creates a journal at the given path with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is corrupted.
    pub fn open(path: &Path) -> StateResult<Self> {
        Self::open_with_config(path, JournalConfig::default())
    }

    /// Opens or creates a journal, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file
    /// cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Opens or creates a journal with an explicit configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or is corrupted.
    pub fn open_with_config(path: &Path, config: JournalConfig) -> StateResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let (entries, frames, valid_len) = replay(&raw)?;
        if valid_len < raw.len() as u64 {
            warn!(
                path = %path.display(),
                dropped = raw.len() as u64 - valid_len,
                "truncating torn tail of state journal"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), keys = entries.len(), frames, "state journal opened");

        Ok(Self {
            path: path.to_path_buf(),
            config,
            journal: Mutex::new(Journal {
                file,
                entries,
                frames,
            }),
        })
    }

    /// Returns the path to the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of frames currently in the journal file.
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.journal.lock().frames
    }

    /// Rewrites the journal so it holds exactly one frame per live key.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite fails. The old journal stays in
    /// place until the new one is fully written.
    pub fn compact(&self) -> StateResult<()> {
        let mut journal = self.journal.lock();
        self.compact_locked(&mut journal)
    }

    fn compact_locked(&self, journal: &mut Journal) -> StateResult<()> {
        let tmp_path = self.path.with_extension("compacting");
        {
            let mut tmp = File::create(&tmp_path)?;
            for (key, value) in &journal.entries {
                let frame = Frame::Put {
                    key: key.clone(),
                    value: value.clone(),
                };
                tmp.write_all(&frame.encode()?)?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        journal.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        let before = journal.frames;
        journal.frames = journal.entries.len() as u64;

        debug!(
            path = %self.path.display(),
            before,
            after = journal.frames,
            "state journal compacted"
        );
        Ok(())
    }

    fn append(&self, frame: Frame) -> StateResult<()> {
        let bytes = frame.encode()?;
        let mut journal = self.journal.lock();

        journal.file.write_all(&bytes)?;
        if self.config.sync_on_write {
            journal.file.sync_data()?;
        }
        journal.frames += 1;

        match frame {
            Frame::Put { key, value } => {
                journal.entries.insert(key, value);
            }
            Frame::Remove { key } => {
                journal.entries.remove(&key);
            }
        }

        if journal.dead_frames() > self.config.compact_after {
            self.compact_locked(&mut journal)?;
        }
        Ok(())
    }
}

/// Replays raw journal bytes.
///
/// Returns the rebuilt map, the number of valid frames and the length of
/// the valid prefix.
fn replay(raw: &[u8]) -> StateResult<(BTreeMap<String, Vec<u8>>, u64, u64)> {
    let mut entries = BTreeMap::new();
    let mut frames = 0u64;
    let mut offset = 0usize;

    while offset < raw.len() {
        let remaining = raw.len() - offset;
        if remaining < FRAME_HEADER_LEN {
            break;
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&raw[offset..offset + FRAME_HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;

        let start = offset + FRAME_HEADER_LEN;
        let end = start.saturating_add(len);
        if end > raw.len() {
            break;
        }

        let frame: Frame = match ciborium::de::from_reader(&raw[start..end]) {
            Ok(frame) => frame,
            Err(_) if end == raw.len() => break,
            Err(e) => {
                return Err(StateError::Corrupted {
                    offset: offset as u64,
                    message: e.to_string(),
                })
            }
        };

        match frame {
            Frame::Put { key, value } => {
                entries.insert(key, value);
            }
            Frame::Remove { key } => {
                entries.remove(&key);
            }
        }
        frames += 1;
        offset = end;
    }

    Ok((entries, frames, offset as u64))
}

impl StateBackend for FileBackend {
    fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        Ok(self.journal.lock().entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StateResult<()> {
        self.append(Frame::Put {
            key: key.to_string(),
            value: value.to_vec(),
        })
    }

    fn remove(&self, key: &str) -> StateResult<()> {
        if !self.journal.lock().entries.contains_key(key) {
            return Ok(());
        }
        self.append(Frame::Remove {
            key: key.to_string(),
        })
    }

    fn keys_with_prefix(&self, prefix: &str) -> StateResult<Vec<String>> {
        Ok(self
            .journal
            .lock()
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn flush(&self) -> StateResult<()> {
        let mut journal = self.journal.lock();
        journal.file.flush()?;
        journal.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.journal");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.frame_count(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_put_and_get() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.journal");

        let backend = FileBackend::open(&path).unwrap();
        backend.put("cursor/database", b"token-1").unwrap();
        assert_eq!(
            backend.get("cursor/database").unwrap(),
            Some(b"token-1".to_vec())
        );
        assert_eq!(backend.get("missing").unwrap(), None);
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.journal");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend.put("cursor/database", b"token-1").unwrap();
            backend.put("cursor/database", b"token-2").unwrap();
            backend.put("flag/zone", &[1]).unwrap();
            backend.put("doomed", b"x").unwrap();
            backend.remove("doomed").unwrap();
            backend.flush().unwrap();
        }

        {
            let backend = FileBackend::open(&path).unwrap();
            assert_eq!(
                backend.get("cursor/database").unwrap(),
                Some(b"token-2".to_vec())
            );
            assert_eq!(backend.get("flag/zone").unwrap(), Some(vec![1]));
            assert_eq!(backend.get("doomed").unwrap(), None);
        }
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.journal");

        {
            let backend = FileBackend::open(&path).unwrap();
            backend.put("a", b"1").unwrap();
            backend.flush().unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();

        // Simulate a crash halfway through the next append
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[40, 0, 0, 0, 0xA1, 0x63]).unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

        // Journal is writable again after recovery
        backend.put("b", b"2").unwrap();
        drop(backend);
        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn corrupted_middle_frame_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.journal");

        {
            let mut file = File::create(&path).unwrap();
            // A complete frame whose payload is not a valid journal record
            file.write_all(&[2, 0, 0, 0, 0xFF, 0xFF]).unwrap();
            let good = Frame::Put {
                key: "a".into(),
                value: vec![1],
            }
            .encode()
            .unwrap();
            file.write_all(&good).unwrap();
        }

        let result = FileBackend::open(&path);
        assert!(matches!(result, Err(StateError::Corrupted { offset: 0, .. })));
    }

    #[test]
    fn automatic_compaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.journal");
        let config = JournalConfig::new().compact_after(4);

        let backend = FileBackend::open_with_config(&path, config).unwrap();
        for i in 0..10u8 {
            backend.put("cursor/database", &[i]).unwrap();
        }

        assert!(backend.frame_count() <= 5);
        drop(backend);

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.get("cursor/database").unwrap(), Some(vec![9]));
    }

    #[test]
    fn explicit_compaction_keeps_live_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.journal");

        let backend = FileBackend::open(&path).unwrap();
        backend.put("a", b"1").unwrap();
        backend.put("a", b"2").unwrap();
        backend.put("b", b"3").unwrap();
        backend.remove("b").unwrap();
        assert_eq!(backend.frame_count(), 4);

        backend.compact().unwrap();
        assert_eq!(backend.frame_count(), 1);
        assert_eq!(backend.get("a").unwrap(), Some(b"2".to_vec()));

        backend.put("c", b"4").unwrap();
        drop(backend);

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(backend.get("c").unwrap(), Some(b"4".to_vec()));
    }

    #[test]
    fn removing_absent_key_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.journal");

        let backend = FileBackend::open(&path).unwrap();
        backend.remove("never-written").unwrap();
        assert_eq!(backend.frame_count(), 0);
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.journal");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.path(), path);
        assert!(path.exists());
    }
}
