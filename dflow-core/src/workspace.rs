use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::index::store::IndexStore;

/// Explicit home for a node's persisted artifacts: one index file and one
/// ledger per fingerprint. Passed into jobs and stores instead of relying on
/// ambient process-wide state, so tests and embedders can run isolated
/// instances side by side.
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_store(&self) -> IndexStore {
        IndexStore::new(&self.root)
    }

    pub fn ledger_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{fingerprint}.ledger"))
    }
}
