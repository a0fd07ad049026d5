//! Durable transaction journal.
//!
//! The log index writes every durable transaction here as `Pending` before
//! the rest of the pipeline runs, and a `Committed` marker once all indices
//! have applied it. Entries left pending after a failure or crash identify
//! transactions whose local application is partial.
//!
//! Frame layout: `len: u32 LE | MessagePack entry | crc32: u32 LE`, after a
//! five byte header (magic + version).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{info, warn};

use crate::error::{ReplicaError, Result};
use crate::tx::{Tx, TxOrigin};
use crate::types::Timestamp;

/// Magic bytes for journal files.
const JOURNAL_MAGIC: &[u8; 4] = b"RTJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Largest frame accepted when reading.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const JOURNAL_FILE: &str = "tx.journal";
const LOCK_FILE: &str = "LOCK";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalStatus {
    /// Written by the log index; the pipeline has not finished.
    Pending,
    /// Every index applied the transaction.
    Committed,
}

/// A single journal frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub status: JournalStatus,
    /// Present on pending entries; commit markers carry only the sequence.
    #[serde(default)]
    pub tx: Option<Tx>,
    #[serde(default)]
    pub origin: Option<TxOrigin>,
    pub timestamp: Timestamp,
}

/// Append-only, file-locked transaction journal.
pub struct TxJournal {
    path: PathBuf,
    next_seq: Mutex<u64>,
    writer: Mutex<BufWriter<File>>,
    /// Held for the journal's lifetime.
    _lock_file: File,
}

impl TxJournal {
    /// Open the journal in `dir`, creating it if missing.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock_file = Self::acquire_lock(dir)?;

        let path = dir.join(JOURNAL_FILE);
        let next_seq = if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            Self::verify_header(&mut reader)?;
            let mut max_seq = 0;
            let mut valid_len = HEADER_LEN;
            while let Some(entry) = Self::read_entry(&mut reader)? {
                max_seq = max_seq.max(entry.seq);
                valid_len = reader.stream_position()?;
            }

            // Drop a torn final frame so new frames follow the last good one.
            let file_len = fs::metadata(&path)?.len();
            if valid_len < file_len {
                warn!(path = %path.display(), valid_len, file_len, "truncating torn journal tail");
                OpenOptions::new().write(true).open(&path)?.set_len(valid_len)?;
            }
            max_seq + 1
        } else {
            let mut file = File::create(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            1
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);
        info!(path = %path.display(), next_seq, "journal opened");

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(writer),
            _lock_file: lock_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a transaction as pending. Returns its sequence number.
    pub fn append(&self, tx: &Tx, origin: TxOrigin) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;

        self.write(&JournalEntry {
            seq,
            status: JournalStatus::Pending,
            tx: Some(tx.clone()),
            origin: Some(origin),
            timestamp: Timestamp::now(),
        })?;

        *next_seq += 1;
        Ok(seq)
    }

    /// Mark an entry as committed.
    pub fn commit(&self, seq: u64) -> Result<()> {
        self.write(&JournalEntry {
            seq,
            status: JournalStatus::Committed,
            tx: None,
            origin: None,
            timestamp: Timestamp::now(),
        })
    }

    /// Entries never committed, in sequence order.
    pub fn pending_entries(&self) -> Result<Vec<JournalEntry>> {
        let mut pending = BTreeMap::new();
        let mut committed = HashSet::new();

        for entry in self.read_all()? {
            match entry.status {
                JournalStatus::Pending => {
                    pending.insert(entry.seq, entry);
                }
                JournalStatus::Committed => {
                    committed.insert(entry.seq);
                }
            }
        }

        Ok(pending
            .into_iter()
            .filter(|(seq, _)| !committed.contains(seq))
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Every journaled transaction, in sequence order.
    pub fn transactions(&self) -> Result<Vec<Tx>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter_map(|entry| entry.tx)
            .collect())
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending_entries()?.is_empty())
    }

    /// Truncate to an empty journal.
    pub fn clear(&self) -> Result<()> {
        let mut next_seq = self.next_seq.lock();
        let mut writer = self.writer.lock();
        writer.flush()?;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;

        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        *next_seq = 1;
        Ok(())
    }

    fn write(&self, entry: &JournalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(entry)?;
        let checksum = crc32fast::hash(&encoded);

        let mut writer = self.writer.lock();
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&checksum.to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<JournalEntry>> {
        self.writer.lock().flush()?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        while let Some(entry) = Self::read_entry(&mut reader)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    fn verify_header(reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(ReplicaError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(ReplicaError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    /// Read the next frame. `None` at end of file or at a torn final frame.
    fn read_entry(reader: &mut impl Read) -> Result<Option<JournalEntry>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ReplicaError::Corruption(format!(
                "journal frame too large ({} bytes)",
                len
            )));
        }

        let mut frame = vec![0u8; len + 4];
        match reader.read_exact(&mut frame) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!("torn journal frame at end of file, ignoring");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let (encoded, checksum_bytes) = frame.split_at(len);
        let mut stored = [0u8; 4];
        stored.copy_from_slice(checksum_bytes);
        let stored = u32::from_le_bytes(stored);
        let computed = crc32fast::hash(encoded);
        if stored != computed {
            return Err(ReplicaError::Corruption(format!(
                "journal checksum mismatch: expected {:08x}, got {:08x}",
                stored, computed
            )));
        }

        Ok(Some(rmp_serde::from_slice(encoded)?))
    }

    fn acquire_lock(dir: &Path) -> Result<File> {
        let lock_file = File::create(dir.join(LOCK_FILE))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| ReplicaError::Locked)?;
        Ok(lock_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::UpdateOp;
    use serde_json::{json, Map};
    use tempfile::TempDir;

    fn sample_tx(id: &str) -> Tx {
        let mut attributes = Map::new();
        attributes.insert("title".into(), json!("Write docs"));
        attributes.insert("rank".into(), json!(-3));
        Tx::create(id, "class:task.Task", attributes).with_id(format!("tx-{id}"))
    }

    #[test]
    fn test_append_and_commit() {
        let dir = TempDir::new().unwrap();
        let journal = TxJournal::open(dir.path()).unwrap();

        let seq = journal.append(&sample_tx("t1"), TxOrigin::Client).unwrap();
        assert_eq!(seq, 1);
        assert!(journal.has_pending().unwrap());

        journal.commit(seq).unwrap();
        assert!(!journal.has_pending().unwrap());
    }

    #[test]
    fn test_entries_roundtrip_through_msgpack() {
        let dir = TempDir::new().unwrap();
        let journal = TxJournal::open(dir.path()).unwrap();

        let create = sample_tx("t1");
        let update = Tx::update("t1", "class:task.Task", vec![UpdateOp::set("title", "v2")]);
        journal.append(&create, TxOrigin::Client).unwrap();
        journal.append(&update, TxOrigin::Server).unwrap();

        assert_eq!(journal.transactions().unwrap(), vec![create, update]);
        let pending = journal.pending_entries().unwrap();
        assert_eq!(pending[1].origin, Some(TxOrigin::Server));
    }

    #[test]
    fn test_reopen_keeps_pending_and_sequence() {
        let dir = TempDir::new().unwrap();
        {
            let journal = TxJournal::open(dir.path()).unwrap();
            let seq = journal.append(&sample_tx("t1"), TxOrigin::Client).unwrap();
            journal.append(&sample_tx("t2"), TxOrigin::Client).unwrap();
            journal.commit(seq).unwrap();
        }

        let journal = TxJournal::open(dir.path()).unwrap();
        let pending = journal.pending_entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx.as_ref().unwrap().object_id.as_str(), "t2");
        assert_eq!(journal.append(&sample_tx("t3"), TxOrigin::Client).unwrap(), 3);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let _journal = TxJournal::open(dir.path()).unwrap();
        assert!(matches!(
            TxJournal::open(dir.path()),
            Err(ReplicaError::Locked)
        ));
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let journal = TxJournal::open(dir.path()).unwrap();
        journal.append(&sample_tx("t1"), TxOrigin::Client).unwrap();

        journal.clear().unwrap();
        assert!(!journal.has_pending().unwrap());
        assert_eq!(journal.append(&sample_tx("t2"), TxOrigin::Client).unwrap(), 1);
    }
}
