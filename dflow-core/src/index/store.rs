use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{ChunkMode, FileIndex};
use crate::error::{DflowError, Result};
use crate::fingerprint::file_fingerprint;
use crate::index::builder::build_index;

pub const MAGIC: &[u8; 6] = b"DFIDX\0";
pub const VERSION: u16 = 1;

const ZSTD_LEVEL: i32 = 3;

/// Metadata header, CBOR-encoded after the superblock fields. The boundary
/// table itself follows as `[width:1][zstd(packed deltas)]` for item modes.
#[derive(Serialize, Deserialize, Debug)]
struct IndexMeta {
    filepath: String,
    file_size: u64,
    mode: ChunkMode,
    delimiter: Vec<u8>,
    items_per_chunk: u64,
    total_items: u64,
    total_chunks: u64,
}

/// Durable, reloadable encoding of a boundary table, one file per
/// fingerprint under a store directory.
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!("{fingerprint}.idx"))
    }

    /// Persist an index. Uses a temp file plus an atomic no-clobber rename so
    /// two near-simultaneous first encounters of the same fingerprint cannot
    /// interleave writes; the loser of the race is a harmless no-op.
    pub fn save(&self, index: &FileIndex) -> Result<()> {
        let meta = IndexMeta {
            filepath: index.filepath.to_string_lossy().into_owned(),
            file_size: index.file_size,
            mode: index.mode,
            delimiter: index.delimiter.clone(),
            items_per_chunk: index.items_per_chunk,
            total_items: index.total_items,
            total_chunks: index.total_chunks,
        };
        let mut meta_buf = Vec::new();
        ciborium::ser::into_writer(&meta, &mut meta_buf).map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(MAGIC)?;
        tmp.write_all(&VERSION.to_le_bytes())?;
        tmp.write_all(&(meta_buf.len() as u64).to_le_bytes())?;
        tmp.write_all(&meta_buf)?;

        if index.mode.is_item_mode() {
            let deltas: Vec<u64> = index
                .item_positions
                .windows(2)
                .map(|w| w[1] - w[0])
                .collect();
            let width = delta_width(deltas.iter().copied().max().unwrap_or(0));
            let packed = pack_deltas(&deltas, width);
            let compressed = zstd::stream::encode_all(&packed[..], ZSTD_LEVEL)?;
            tmp.write_all(&[width])?;
            tmp.write_all(&compressed)?;
        }
        tmp.flush()?;

        match tmp.persist_noclobber(self.path_for(&index.fingerprint)) {
            Ok(_) => {
                tracing::debug!(fingerprint = %index.fingerprint, "index persisted");
                Ok(())
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(
                    fingerprint = %index.fingerprint,
                    "index already persisted by a concurrent build"
                );
                Ok(())
            }
            Err(e) => Err(e.error.into()),
        }
    }

    /// Load the index persisted for `fingerprint`. `Ok(None)` when no store
    /// exists; any malformed or truncated content is `StoreCorruption`.
    pub fn load(&self, fingerprint: &str) -> Result<Option<FileIndex>> {
        let path = self.path_for(fingerprint);
        if !path.exists() {
            return Ok(None);
        }
        let mut buf = Vec::new();
        File::open(&path)?.read_to_end(&mut buf)?;
        self.decode(fingerprint, &buf).map(Some)
    }

    fn decode(&self, fingerprint: &str, buf: &[u8]) -> Result<FileIndex> {
        let corrupt =
            |msg: &str| DflowError::StoreCorruption(format!("{fingerprint}: {msg}"));

        let header = MAGIC.len() + 2 + 8;
        if buf.len() < header {
            return Err(corrupt("short header"));
        }
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        if version != VERSION {
            return Err(corrupt("unsupported version"));
        }
        let meta_len = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
        let meta_end = header.checked_add(meta_len).ok_or_else(|| corrupt("meta length overflow"))?;
        if buf.len() < meta_end {
            return Err(corrupt("truncated metadata"));
        }
        let meta: IndexMeta = ciborium::de::from_reader(&buf[header..meta_end])
            .map_err(|e| corrupt(&format!("metadata decode: {e}")))?;

        let item_positions = if meta.mode.is_item_mode() {
            if buf.len() < meta_end + 1 {
                return Err(corrupt("missing delta section"));
            }
            let width = buf[meta_end] as usize;
            if !matches!(width, 1 | 2 | 4 | 8) {
                return Err(corrupt("bad delta width"));
            }
            let packed = zstd::stream::decode_all(&buf[meta_end + 1..])
                .map_err(|_| corrupt("delta decompression failed"))?;
            if packed.len() % width != 0 {
                return Err(corrupt("delta payload not a multiple of width"));
            }
            if (packed.len() / width) as u64 != meta.total_items {
                return Err(corrupt("delta count mismatch"));
            }
            unpack_positions(&packed, width)
                .ok_or_else(|| corrupt("delta sum overflows u64"))?
        } else {
            if buf.len() != meta_end {
                return Err(corrupt("trailing bytes after byte-mode metadata"));
            }
            Vec::new()
        };

        let index = FileIndex {
            fingerprint: fingerprint.to_string(),
            filepath: PathBuf::from(meta.filepath),
            file_size: meta.file_size,
            mode: meta.mode,
            delimiter: meta.delimiter,
            items_per_chunk: meta.items_per_chunk,
            item_positions,
            total_items: meta.total_items,
            total_chunks: meta.total_chunks,
        };
        index.validate()?;
        Ok(index)
    }

    /// Load-or-build for a concrete file. A hit never rescans; a miss builds
    /// and persists; a corrupt store is discarded, logged, and rebuilt from
    /// the file — never half-trusted.
    pub fn load_or_build(
        &self,
        path: &Path,
        mode: ChunkMode,
        delimiter: &[u8],
        items_per_chunk: u64,
    ) -> Result<FileIndex> {
        let fingerprint = file_fingerprint(path)?;
        match self.load(&fingerprint) {
            Ok(Some(index)) => {
                tracing::debug!(%fingerprint, "index store hit, skipping rescan");
                return self.adapt(index, mode, delimiter, items_per_chunk);
            }
            Ok(None) => {}
            Err(DflowError::StoreCorruption(msg)) => {
                tracing::warn!(%fingerprint, %msg, "corrupt index store, rebuilding");
                std::fs::remove_file(self.path_for(&fingerprint))?;
            }
            Err(e) => return Err(e),
        }
        let index = build_index(path, mode, delimiter, items_per_chunk)?;
        self.save(&index)?;
        Ok(index)
    }

    /// A reload may ask for a different items-per-chunk than the build that
    /// persisted the table; the boundary table is reused and the chunk count
    /// recomputed. A different mode or delimiter would need a different
    /// table, which contradicts the content-addressed key.
    fn adapt(
        &self,
        mut index: FileIndex,
        mode: ChunkMode,
        delimiter: &[u8],
        items_per_chunk: u64,
    ) -> Result<FileIndex> {
        if items_per_chunk == 0 {
            return Err(DflowError::Config("items_per_chunk must be positive".into()));
        }
        if index.mode != mode {
            return Err(DflowError::Config(format!(
                "fingerprint {} is indexed in {} mode, requested {}",
                index.fingerprint,
                index.mode.as_str(),
                mode.as_str()
            )));
        }
        // Line and csv always split on newline and byte mode has no
        // delimiter, so only token mode can actually conflict.
        if mode == ChunkMode::Token && index.delimiter != delimiter {
            return Err(DflowError::Config(format!(
                "fingerprint {} is indexed with delimiter {:?}, requested {:?}",
                index.fingerprint,
                String::from_utf8_lossy(&index.delimiter),
                String::from_utf8_lossy(delimiter)
            )));
        }
        if index.items_per_chunk != items_per_chunk {
            index.items_per_chunk = items_per_chunk;
            index.total_chunks = match mode {
                ChunkMode::Byte => index.file_size.div_ceil(items_per_chunk),
                _ => index.total_items.div_ceil(items_per_chunk),
            };
        }
        Ok(index)
    }
}

fn delta_width(max: u64) -> u8 {
    if max <= u8::MAX as u64 {
        1
    } else if max <= u16::MAX as u64 {
        2
    } else if max <= u32::MAX as u64 {
        4
    } else {
        8
    }
}

fn pack_deltas(deltas: &[u64], width: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(deltas.len() * width as usize);
    for &d in deltas {
        out.extend_from_slice(&d.to_le_bytes()[..width as usize]);
    }
    out
}

// `None` when the running sum overflows, which only a corrupt payload can do.
fn unpack_positions(packed: &[u8], width: usize) -> Option<Vec<u64>> {
    let mut positions = Vec::with_capacity(packed.len() / width + 1);
    positions.push(0u64);
    let mut acc = 0u64;
    for chunk in packed.chunks_exact(width) {
        let mut le = [0u8; 8];
        le[..width].copy_from_slice(chunk);
        acc = acc.checked_add(u64::from_le_bytes(le))?;
        positions.push(acc);
    }
    Some(positions)
}
