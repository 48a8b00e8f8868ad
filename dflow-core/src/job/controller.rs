use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{ChunkMode, FileIndex, Item};
use crate::error::{DflowError, ProcessingError, Result};
use crate::job::ledger::{ChunkStatus, Ledger};
use crate::job::registry::JobEntry;
use crate::job::remote::RemoteChunkSource;
use crate::read::chunk::ChunkReader;
use crate::workspace::Workspace;

pub const DEFAULT_ITEMS_PER_CHUNK: u64 = 512;
pub const DEFAULT_QUEUE_LIMIT: usize = 8;

/// The per-chunk computation, injected as a typed capability. A failure is
/// recorded against the chunk and never aborts the job.
pub trait ChunkProcessor {
    fn process(&self, items: &[Item]) -> std::result::Result<Vec<String>, ProcessingError>;
}

impl<F> ChunkProcessor for F
where
    F: Fn(&[Item]) -> std::result::Result<Vec<String>, ProcessingError>,
{
    fn process(&self, items: &[Item]) -> std::result::Result<Vec<String>, ProcessingError> {
        self(items)
    }
}

/// Cooperative cancellation for the processing loop, checked between chunks.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub done: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub struct JobOptions {
    pub mode: ChunkMode,
    pub delimiter: Vec<u8>,
    pub items_per_chunk: u64,
    pub queue_limit: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            mode: ChunkMode::Line,
            delimiter: b"\n".to_vec(),
            items_per_chunk: DEFAULT_ITEMS_PER_CHUNK,
            queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

/// Where chunk content comes from: the indexed local file, or peers for a
/// job attached without the file on disk.
enum ChunkSource {
    Local {
        index: FileIndex,
        reader: ChunkReader,
    },
    Remote {
        source: Box<dyn RemoteChunkSource>,
    },
}

/// One job: a fingerprinted file, its chunk ledger, and the assignment state
/// machine. Owns the unused-index pool exclusively; the ledger is
/// single-writer through this instance.
pub struct Dflow {
    fingerprint: String,
    total_chunks: u64,
    source: ChunkSource,
    ledger: Ledger,
    queue_limit: usize,
    unused: Vec<u64>,
    rng: StdRng,
}

impl Dflow {
    /// Set up a job for a local file: fingerprint it, load or build its
    /// boundary index, open its ledger, and reconcile the unused pool against
    /// anything already recorded.
    pub fn create(ws: &Workspace, path: &Path, opts: JobOptions) -> Result<Self> {
        Self::create_with_rng(ws, path, opts, StdRng::from_entropy())
    }

    pub fn create_with_rng(
        ws: &Workspace,
        path: &Path,
        opts: JobOptions,
        rng: StdRng,
    ) -> Result<Self> {
        let index = ws.index_store().load_or_build(
            path,
            opts.mode,
            &opts.delimiter,
            opts.items_per_chunk,
        )?;
        let reader = ChunkReader::open(path)?;
        let ledger = Ledger::open(&ws.ledger_path(&index.fingerprint))?;
        Ok(Self::assemble(
            index.fingerprint.clone(),
            index.total_chunks,
            ChunkSource::Local { index, reader },
            ledger,
            opts.queue_limit,
            rng,
        ))
    }

    /// Rebuild a job from its registry entry. The file must still hash to the
    /// recorded fingerprint; a changed file is a different job.
    pub fn from_entry(ws: &Workspace, entry: &JobEntry, queue_limit: usize) -> Result<Self> {
        Self::from_entry_with_rng(ws, entry, queue_limit, StdRng::from_entropy())
    }

    pub fn from_entry_with_rng(
        ws: &Workspace,
        entry: &JobEntry,
        queue_limit: usize,
        rng: StdRng,
    ) -> Result<Self> {
        let actual = crate::fingerprint::file_fingerprint(&entry.filepath)?;
        if actual != entry.fingerprint {
            return Err(DflowError::Config(format!(
                "{} no longer matches fingerprint {}",
                entry.filepath.display(),
                entry.fingerprint
            )));
        }
        let mode: ChunkMode = entry.mode.parse()?;
        let index = ws.index_store().load_or_build(
            &entry.filepath,
            mode,
            entry.delimiter.as_bytes(),
            entry.chunk_size,
        )?;
        let reader = ChunkReader::open(&entry.filepath)?;
        let ledger = Ledger::open(&ws.ledger_path(&index.fingerprint))?;
        Ok(Self::assemble(
            index.fingerprint.clone(),
            index.total_chunks,
            ChunkSource::Local { index, reader },
            ledger,
            queue_limit,
            rng,
        ))
    }

    /// Attach to a job whose file this node does not hold; chunk content is
    /// fetched from peers and captured in the ledger at assignment time.
    pub fn from_entry_remote(
        ws: &Workspace,
        entry: &JobEntry,
        source: Box<dyn RemoteChunkSource>,
        queue_limit: usize,
    ) -> Result<Self> {
        Self::from_entry_remote_with_rng(ws, entry, source, queue_limit, StdRng::from_entropy())
    }

    pub fn from_entry_remote_with_rng(
        ws: &Workspace,
        entry: &JobEntry,
        source: Box<dyn RemoteChunkSource>,
        queue_limit: usize,
        rng: StdRng,
    ) -> Result<Self> {
        let ledger = Ledger::open(&ws.ledger_path(&entry.fingerprint))?;
        Ok(Self::assemble(
            entry.fingerprint.clone(),
            entry.total_chunks,
            ChunkSource::Remote { source },
            ledger,
            queue_limit,
            rng,
        ))
    }

    fn assemble(
        fingerprint: String,
        total_chunks: u64,
        source: ChunkSource,
        ledger: Ledger,
        queue_limit: usize,
        rng: StdRng,
    ) -> Self {
        // Restart safety: anything already in the ledger, whatever its
        // status, is never selected again.
        let recorded = ledger.recorded_indices();
        let unused: Vec<u64> = (0..total_chunks)
            .filter(|i| !recorded.contains(i))
            .collect();
        tracing::info!(
            %fingerprint,
            total_chunks,
            recorded = recorded.len(),
            unused = unused.len(),
            "job controller ready"
        );
        Self {
            fingerprint,
            total_chunks,
            source,
            ledger,
            queue_limit,
            unused,
            rng,
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_chunks
    }

    pub fn unused_len(&self) -> usize {
        self.unused.len()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Registry descriptor for this job. Only meaningful for local jobs.
    pub fn entry(&self) -> Option<JobEntry> {
        match &self.source {
            ChunkSource::Local { index, .. } => Some(JobEntry::from_index(index)),
            ChunkSource::Remote { .. } => None,
        }
    }

    /// Pop one index uniformly at random from the unused pool. An empty pool
    /// means no more work is available, not a fault.
    pub fn select_unused(&mut self) -> Result<u64> {
        if self.unused.is_empty() {
            return Err(DflowError::EmptyPool);
        }
        let pos = self.rng.gen_range(0..self.unused.len());
        Ok(self.unused.swap_remove(pos))
    }

    /// Top up the Pending queue to the backpressure limit from the unused
    /// pool. Remote jobs capture the fetched items in the ledger record;
    /// local jobs re-read the file at processing time instead.
    pub fn fill_queue(&mut self) -> Result<()> {
        while self.ledger.pending_count() < self.queue_limit && !self.unused.is_empty() {
            let index = self.select_unused()?;
            let content = match &mut self.source {
                ChunkSource::Local { .. } => None,
                ChunkSource::Remote { source } => {
                    match source.fetch_chunk(&self.fingerprint, index) {
                        Ok(Some(items)) => Some(items),
                        Ok(None) => {
                            // No peer holds it yet; hand the index back and
                            // stop filling for now.
                            tracing::debug!(index, "chunk not available from peers");
                            self.unused.push(index);
                            return Ok(());
                        }
                        Err(e) => {
                            // Nothing was recorded, so the index goes back
                            // to the pool before the error surfaces.
                            self.unused.push(index);
                            return Err(e);
                        }
                    }
                }
            };
            self.ledger.record_pending(index, content)?;
            tracing::debug!(index, "chunk assigned");
        }
        Ok(())
    }

    /// Requeue every Failed chunk as Pending. The separate opt-in retry path;
    /// a normal run never revisits terminal chunks.
    pub fn requeue_failed(&mut self) -> Result<Vec<u64>> {
        self.ledger.requeue_failed()
    }

    /// Process Pending chunks until none remain and the unused pool is
    /// exhausted, the token is cancelled, or a store error surfaces.
    /// Processing failures are recorded as Failed and the loop continues.
    pub fn run(&mut self, processor: &dyn ChunkProcessor, cancel: &CancelToken) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        self.fill_queue()?;
        loop {
            if cancel.is_cancelled() {
                tracing::info!(fingerprint = %self.fingerprint, "run cancelled");
                break;
            }
            let Some(index) = self
                .ledger
                .indices_by_status(ChunkStatus::Pending)
                .into_iter()
                .next()
            else {
                break;
            };
            let items = self.chunk_items(index)?;
            match processor.process(&items) {
                Ok(result) => {
                    self.ledger.mark_done(index, result)?;
                    summary.done += 1;
                    tracing::debug!(index, "chunk done");
                }
                Err(e) => {
                    tracing::warn!(index, error = %e, "chunk processing failed");
                    self.ledger.mark_failed(index)?;
                    summary.failed += 1;
                }
            }
            self.fill_queue()?;
        }
        Ok(summary)
    }

    fn chunk_items(&mut self, index: u64) -> Result<Vec<Item>> {
        if let Some(items) = self.ledger.state(index).and_then(|s| s.content.clone()) {
            return Ok(items);
        }
        match &mut self.source {
            ChunkSource::Local { index: file_index, reader } => {
                reader.read_items(file_index, index)
            }
            ChunkSource::Remote { source } => source
                .fetch_chunk(&self.fingerprint, index)?
                .ok_or_else(|| {
                    DflowError::Config(format!(
                        "chunk {index} has no recorded content and no peer holds it"
                    ))
                }),
        }
    }
}
