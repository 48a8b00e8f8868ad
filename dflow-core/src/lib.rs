pub mod domain;
pub mod error;
pub mod fingerprint;
pub mod workspace;

pub mod index {
    pub mod builder;
    pub mod store;
}

pub mod read {
    pub mod chunk;
}

pub mod job {
    pub mod controller;
    pub mod ledger;
    pub mod registry;
    pub mod remote;
}

// Re-exports: stable API surface
pub use domain::{ChunkMode, FileIndex, Item};
pub use error::{DflowError, ProcessingError, Result};
pub use fingerprint::file_fingerprint;
pub use index::builder::build_index;
pub use index::store::IndexStore;
pub use job::controller::{
    CancelToken, ChunkProcessor, Dflow, JobOptions, RunSummary, DEFAULT_ITEMS_PER_CHUNK,
    DEFAULT_QUEUE_LIMIT,
};
pub use job::ledger::{ChunkStatus, Ledger};
pub use job::registry::{JobEntry, JobRegistry};
pub use job::remote::RemoteChunkSource;
pub use read::chunk::ChunkReader;
pub use workspace::Workspace;
