use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::Item;
use crate::error::{DflowError, Result};

const MAGIC: &[u8; 8] = b"DFLEDG\0\0";
const VERSION: u8 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChunkStatus {
    Pending,
    Done,
    Failed,
}

/// One durable mutation of the per-chunk ledger. The log is append-only;
/// status only ever moves Pending -> Done or Pending -> Failed, and a
/// `Requeued` record is the sole, explicit way back from Failed.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum LedgerRecord {
    Assigned {
        index: u64,
        /// Items captured at assignment time. Populated for chunks fetched
        /// from a peer, absent when the local file can be re-read.
        content: Option<Vec<Item>>,
    },
    Done {
        index: u64,
        result: Vec<String>,
    },
    Failed {
        index: u64,
    },
    Requeued {
        index: u64,
    },
}

#[derive(Clone, Debug)]
pub struct ChunkState {
    pub status: ChunkStatus,
    pub content: Option<Vec<Item>>,
    pub result: Option<Vec<String>>,
}

/// Durable per-chunk status ledger for one job: an append-only record log
/// replayed into an in-memory map on open, so lookups never rescan the file.
/// Single writer per job instance; every append is synced before returning.
pub struct Ledger {
    f: File,
    pub path: PathBuf,
    map: BTreeMap<u64, ChunkState>,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self> {
        let existed = path.exists();
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if !existed {
            f.write_all(MAGIC)?;
            f.write_all(&[VERSION])?;
            f.flush()?;
        } else {
            let mut magic = [0u8; 8];
            f.read_exact(&mut magic).map_err(|_| {
                DflowError::StoreCorruption(format!("{}: short ledger header", path.display()))
            })?;
            if &magic != MAGIC {
                return Err(DflowError::StoreCorruption(format!(
                    "{}: bad ledger magic",
                    path.display()
                )));
            }
            let mut ver = [0u8; 1];
            f.read_exact(&mut ver)?;
            if ver[0] != VERSION {
                return Err(DflowError::StoreCorruption(format!(
                    "{}: unsupported ledger version {}",
                    path.display(),
                    ver[0]
                )));
            }
        }

        let mut map = BTreeMap::new();
        let mut end = f.stream_position()?;
        loop {
            match read_next_record(&mut f)? {
                Some(rec) => {
                    apply(&mut map, &rec);
                    end = f.stream_position()?;
                }
                None => break,
            }
        }
        // A crash mid-append leaves a partial tail record. Drop it so later
        // appends start on a record boundary.
        let len = f.metadata()?.len();
        if len != end {
            tracing::warn!(
                path = %path.display(),
                dropped = len - end,
                "truncating partial ledger tail"
            );
            f.set_len(end)?;
        }
        f.seek(SeekFrom::End(0))?;

        Ok(Self {
            f,
            path: path.to_path_buf(),
            map,
        })
    }

    /// Record a freshly assigned chunk as Pending. An index already present
    /// in the ledger is never re-inserted.
    pub fn record_pending(&mut self, index: u64, content: Option<Vec<Item>>) -> Result<()> {
        if self.map.contains_key(&index) {
            tracing::warn!(index, "chunk already recorded, skipping assignment");
            return Ok(());
        }
        let rec = LedgerRecord::Assigned { index, content };
        self.append(&rec)?;
        apply(&mut self.map, &rec);
        Ok(())
    }

    pub fn mark_done(&mut self, index: u64, result: Vec<String>) -> Result<()> {
        if self.is_terminal(index) {
            tracing::warn!(index, "chunk already terminal, ignoring done");
            return Ok(());
        }
        let rec = LedgerRecord::Done { index, result };
        self.append(&rec)?;
        apply(&mut self.map, &rec);
        Ok(())
    }

    pub fn mark_failed(&mut self, index: u64) -> Result<()> {
        if self.is_terminal(index) {
            tracing::warn!(index, "chunk already terminal, ignoring failure");
            return Ok(());
        }
        let rec = LedgerRecord::Failed { index };
        self.append(&rec)?;
        apply(&mut self.map, &rec);
        Ok(())
    }

    /// Explicit retry operation: flips every Failed chunk back to Pending and
    /// returns the affected indices. This is deliberately separate from the
    /// normal status transitions, which never leave a terminal state.
    pub fn requeue_failed(&mut self) -> Result<Vec<u64>> {
        let failed: Vec<u64> = self.indices_by_status(ChunkStatus::Failed);
        for &index in &failed {
            let rec = LedgerRecord::Requeued { index };
            self.append(&rec)?;
            apply(&mut self.map, &rec);
        }
        if !failed.is_empty() {
            tracing::info!(count = failed.len(), "failed chunks requeued");
        }
        Ok(failed)
    }

    pub fn indices_by_status(&self, status: ChunkStatus) -> Vec<u64> {
        self.map
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(&i, _)| i)
            .collect()
    }

    /// Every index with any record, regardless of status. The controller
    /// subtracts this from the full range to rebuild its unused pool.
    pub fn recorded_indices(&self) -> BTreeSet<u64> {
        self.map.keys().copied().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.map
            .values()
            .filter(|s| s.status == ChunkStatus::Pending)
            .count()
    }

    pub fn state(&self, index: u64) -> Option<&ChunkState> {
        self.map.get(&index)
    }

    pub fn result(&self, index: u64) -> Option<&[String]> {
        self.map.get(&index)?.result.as_deref()
    }

    /// (pending, done, failed)
    pub fn status_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for s in self.map.values() {
            match s.status {
                ChunkStatus::Pending => counts.0 += 1,
                ChunkStatus::Done => counts.1 += 1,
                ChunkStatus::Failed => counts.2 += 1,
            }
        }
        counts
    }

    fn is_terminal(&self, index: u64) -> bool {
        matches!(
            self.map.get(&index).map(|s| s.status),
            Some(ChunkStatus::Done) | Some(ChunkStatus::Failed)
        )
    }

    /// Append one record, synced to disk before returning so a crash right
    /// after a mutation never loses that record.
    fn append(&mut self, rec: &LedgerRecord) -> Result<()> {
        let mut plain = Vec::with_capacity(256);
        serde_cbor::to_writer(&mut plain, rec)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        let mut lenv = Vec::with_capacity(10);
        put_uvarint(&mut lenv, plain.len() as u64);
        self.f.write_all(&lenv)?;
        self.f.write_all(&plain)?;
        self.f.flush()?;
        self.f.sync_data()?;
        Ok(())
    }
}

fn apply(map: &mut BTreeMap<u64, ChunkState>, rec: &LedgerRecord) {
    match rec {
        LedgerRecord::Assigned { index, content } => {
            map.entry(*index).or_insert_with(|| ChunkState {
                status: ChunkStatus::Pending,
                content: content.clone(),
                result: None,
            });
        }
        LedgerRecord::Done { index, result } => {
            let entry = map.entry(*index).or_insert_with(|| ChunkState {
                status: ChunkStatus::Pending,
                content: None,
                result: None,
            });
            if entry.status == ChunkStatus::Pending {
                entry.status = ChunkStatus::Done;
                entry.result = Some(result.clone());
            }
        }
        LedgerRecord::Failed { index } => {
            let entry = map.entry(*index).or_insert_with(|| ChunkState {
                status: ChunkStatus::Pending,
                content: None,
                result: None,
            });
            if entry.status == ChunkStatus::Pending {
                entry.status = ChunkStatus::Failed;
            }
        }
        LedgerRecord::Requeued { index } => {
            if let Some(entry) = map.get_mut(index) {
                if entry.status == ChunkStatus::Failed {
                    entry.status = ChunkStatus::Pending;
                    entry.result = None;
                }
            }
        }
    }
}

/// Read one length-delimited record. `Ok(None)` means clean EOF or a partial
/// tail (the caller truncates); a record body that does not decode is
/// corruption, not a tail.
fn read_next_record(f: &mut File) -> Result<Option<LedgerRecord>> {
    let len = match get_uvarint(f)? {
        Some(n) => n,
        None => return Ok(None),
    };
    let mut buf = vec![0u8; len as usize];
    if let Err(e) = f.read_exact(&mut buf) {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }
    let rec: LedgerRecord = serde_cbor::from_slice(&buf).map_err(|e| {
        DflowError::StoreCorruption(format!("undecodable ledger record: {e}"))
    })?;
    Ok(Some(rec))
}

fn put_uvarint(out: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        out.push((x as u8) | 0x80);
        x >>= 7;
    }
    out.push(x as u8);
}

fn get_uvarint<R: Read>(r: &mut R) -> Result<Option<u64>> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for _ in 0..10 {
        let mut b = [0u8; 1];
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                let byte = b[0];
                if byte < 0x80 {
                    x |= (byte as u64) << s;
                    return Ok(Some(x));
                }
                x |= ((byte & 0x7f) as u64) << s;
                s += 7;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "varint too long").into())
}
