use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::FileIndex;
use crate::error::Result;

/// One known job, as recorded in the registry file. Enough to reconstruct a
/// [`crate::job::controller::Dflow`] without rescanning anything.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JobEntry {
    pub filepath: PathBuf,
    pub fingerprint: String,
    pub total_chunks: u64,
    pub chunk_size: u64,
    pub mode: String,
    pub delimiter: String,
    /// Unix seconds.
    pub added_at: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl JobEntry {
    pub fn from_index(index: &FileIndex) -> Self {
        let mut metadata = Map::new();
        metadata.insert("file_size".into(), index.file_size.into());
        metadata.insert("total_items".into(), index.total_items.into());
        Self {
            filepath: index.filepath.clone(),
            fingerprint: index.fingerprint.clone(),
            total_chunks: index.total_chunks,
            chunk_size: index.items_per_chunk,
            mode: index.mode.as_str().to_string(),
            delimiter: String::from_utf8_lossy(&index.delimiter).into_owned(),
            added_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            metadata,
        }
    }
}

/// Plain JSON listing of known jobs. The core consumes entries to rebuild
/// jobs; the add/remove surface exists for the operator CLI.
pub struct JobRegistry {
    path: PathBuf,
    entries: Vec<JobEntry>,
}

impl JobRegistry {
    /// Load the registry, starting empty when the file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let data = std::fs::read(&path)?;
            serde_json::from_slice(&data).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?
        } else {
            Vec::new()
        };
        Ok(Self { path, entries })
    }

    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.entries).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    /// Add and persist. Jobs are content-addressed, so a duplicate
    /// fingerprint is rejected.
    pub fn add(&mut self, entry: JobEntry) -> Result<bool> {
        if self.get_by_fingerprint(&entry.fingerprint).is_some() {
            tracing::warn!(
                fingerprint = %entry.fingerprint,
                "job already registered, not adding"
            );
            return Ok(false);
        }
        tracing::info!(path = %entry.filepath.display(), "job registered");
        self.entries.push(entry);
        self.save()?;
        Ok(true)
    }

    pub fn remove(&mut self, fingerprint: &str) -> Result<bool> {
        let before = self.entries.len();
        self.entries.retain(|e| e.fingerprint != fingerprint);
        if self.entries.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<&JobEntry> {
        self.entries.iter().find(|e| e.fingerprint == fingerprint)
    }

    pub fn get_by_filepath(&self, path: &Path) -> Option<&JobEntry> {
        self.entries.iter().find(|e| e.filepath == path)
    }

    pub fn list(&self) -> &[JobEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ChunkMode;

    fn entry(fp: &str, path: &str) -> JobEntry {
        JobEntry {
            filepath: PathBuf::from(path),
            fingerprint: fp.to_string(),
            total_chunks: 4,
            chunk_size: 3,
            mode: ChunkMode::Line.as_str().to_string(),
            delimiter: "\n".into(),
            added_at: 1_700_000_000,
            metadata: Map::new(),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        {
            let mut reg = JobRegistry::load(&path).unwrap();
            assert!(reg.add(entry("aaa", "one.txt")).unwrap());
            assert!(reg.add(entry("bbb", "two.txt")).unwrap());
        }
        let reg = JobRegistry::load(&path).unwrap();
        assert_eq!(reg.list().len(), 2);
        assert_eq!(
            reg.get_by_fingerprint("bbb").unwrap().filepath,
            PathBuf::from("two.txt")
        );
        assert!(reg.get_by_filepath(Path::new("one.txt")).is_some());
    }

    #[test]
    fn duplicate_fingerprints_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = JobRegistry::load(dir.path().join("jobs.json")).unwrap();
        assert!(reg.add(entry("aaa", "one.txt")).unwrap());
        assert!(!reg.add(entry("aaa", "elsewhere.txt")).unwrap());
        assert_eq!(reg.list().len(), 1);
    }

    #[test]
    fn remove_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let mut reg = JobRegistry::load(dir.path().join("jobs.json")).unwrap();
        reg.add(entry("aaa", "one.txt")).unwrap();
        assert!(reg.remove("aaa").unwrap());
        assert!(!reg.remove("aaa").unwrap());
        assert!(reg.list().is_empty());
    }
}
