use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DflowError, Result};

/// How a file is split into items. `Line` and `Csv` are newline-delimited;
/// `Token` uses an arbitrary byte-sequence delimiter; `Byte` ignores item
/// boundaries entirely and chunks by raw byte count.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    Byte,
    Line,
    Token,
    Csv,
}

impl ChunkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkMode::Byte => "byte",
            ChunkMode::Line => "line",
            ChunkMode::Token => "token",
            ChunkMode::Csv => "csv",
        }
    }

    /// Item modes carry a boundary table; byte mode does not.
    pub fn is_item_mode(&self) -> bool {
        !matches!(self, ChunkMode::Byte)
    }
}

impl FromStr for ChunkMode {
    type Err = DflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "byte" => Ok(ChunkMode::Byte),
            "line" => Ok(ChunkMode::Line),
            "token" => Ok(ChunkMode::Token),
            "csv" => Ok(ChunkMode::Csv),
            other => Err(DflowError::Config(format!("unknown chunk mode: {other}"))),
        }
    }
}

/// One logical item inside a chunk. Csv rows keep their fields; every other
/// mode yields plain text.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum Item {
    Text(String),
    Record(Vec<String>),
}

impl Item {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Item::Text(s) => Some(s),
            Item::Record(_) => None,
        }
    }
}

/// Stable chunk→byte-range mapping for one file, keyed by its content
/// fingerprint. Built once per fingerprint, persisted, then only loaded;
/// immutable after creation.
#[derive(Clone, Debug)]
pub struct FileIndex {
    /// Content hash, lowercase hex. Identity key for all persisted artifacts.
    pub fingerprint: String,
    /// Where the file was when the index was built. Informational only.
    pub filepath: PathBuf,
    pub file_size: u64,
    pub mode: ChunkMode,
    pub delimiter: Vec<u8>,
    pub items_per_chunk: u64,
    /// Byte offset of every item boundary: starts at 0, strictly increasing,
    /// ends at `file_size`. Empty in byte mode.
    pub item_positions: Vec<u64>,
    pub total_items: u64,
    pub total_chunks: u64,
}

impl FileIndex {
    /// Byte range `[start, end)` covered by chunk `index`, or `None` when the
    /// index is out of range.
    pub fn chunk_byte_range(&self, index: u64) -> Option<(u64, u64)> {
        if index >= self.total_chunks {
            return None;
        }
        match self.mode {
            ChunkMode::Byte => {
                let start = index * self.items_per_chunk;
                let end = (start + self.items_per_chunk).min(self.file_size);
                Some((start, end))
            }
            _ => {
                let start_item = (index * self.items_per_chunk) as usize;
                let end_item =
                    ((index + 1) * self.items_per_chunk).min(self.total_items) as usize;
                let start = self.item_positions[start_item];
                let end = self.item_positions[end_item];
                Some((start, end))
            }
        }
    }

    /// Number of items chunk `index` holds, or `None` out of range. Byte mode
    /// reports the byte span instead.
    pub fn chunk_item_count(&self, index: u64) -> Option<u64> {
        if index >= self.total_chunks {
            return None;
        }
        match self.mode {
            ChunkMode::Byte => {
                let (start, end) = self.chunk_byte_range(index)?;
                Some(end - start)
            }
            _ => {
                let start = index * self.items_per_chunk;
                let end = ((index + 1) * self.items_per_chunk).min(self.total_items);
                Some(end - start)
            }
        }
    }

    /// Re-checks the structural invariants. Used when reconstructing an index
    /// from a persisted store, where any violation means the store is bad.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |msg: String| DflowError::StoreCorruption(msg);

        if self.items_per_chunk == 0 {
            return Err(corrupt("items_per_chunk is zero".into()));
        }
        match self.mode {
            ChunkMode::Byte => {
                if !self.item_positions.is_empty() {
                    return Err(corrupt("byte-mode index carries item positions".into()));
                }
                let want = self.file_size.div_ceil(self.items_per_chunk);
                if self.total_chunks != want {
                    return Err(corrupt(format!(
                        "total_chunks {} != {} for {} bytes",
                        self.total_chunks, want, self.file_size
                    )));
                }
            }
            _ => {
                if self.item_positions.first() != Some(&0) {
                    return Err(corrupt("item positions do not start at 0".into()));
                }
                if !self.item_positions.windows(2).all(|w| w[0] < w[1]) {
                    return Err(corrupt("item positions are not strictly increasing".into()));
                }
                if self.file_size > 0 && self.item_positions.last() != Some(&self.file_size) {
                    return Err(corrupt(format!(
                        "last item position {:?} != file size {}",
                        self.item_positions.last(),
                        self.file_size
                    )));
                }
                if self.total_items != (self.item_positions.len() as u64).saturating_sub(1) {
                    return Err(corrupt(format!(
                        "total_items {} inconsistent with {} positions",
                        self.total_items,
                        self.item_positions.len()
                    )));
                }
                let want = self.total_items.div_ceil(self.items_per_chunk);
                if self.total_chunks != want {
                    return Err(corrupt(format!(
                        "total_chunks {} != {} for {} items",
                        self.total_chunks, want, self.total_items
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_index() -> FileIndex {
        // 10 one-byte items plus newlines: offsets every 2 bytes.
        let positions: Vec<u64> = (0..=10).map(|i| i * 2).collect();
        FileIndex {
            fingerprint: "f".repeat(64),
            filepath: PathBuf::from("ten.txt"),
            file_size: 20,
            mode: ChunkMode::Line,
            delimiter: b"\n".to_vec(),
            items_per_chunk: 3,
            item_positions: positions,
            total_items: 10,
            total_chunks: 4,
        }
    }

    #[test]
    fn mode_parse_round_trip() {
        for s in ["byte", "line", "token", "csv"] {
            assert_eq!(ChunkMode::from_str(s).unwrap().as_str(), s);
        }
        assert!(matches!(
            ChunkMode::from_str("paragraph"),
            Err(DflowError::Config(_))
        ));
    }

    #[test]
    fn ten_items_three_per_chunk() {
        let idx = line_index();
        idx.validate().unwrap();
        let sizes: Vec<u64> = (0..idx.total_chunks)
            .map(|i| idx.chunk_item_count(i).unwrap())
            .collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(idx.chunk_item_count(4), None);
    }

    #[test]
    fn chunk_ranges_tile_the_file() {
        let idx = line_index();
        let mut cursor = 0;
        for i in 0..idx.total_chunks {
            let (start, end) = idx.chunk_byte_range(i).unwrap();
            assert_eq!(start, cursor);
            assert!(end > start);
            cursor = end;
        }
        assert_eq!(cursor, idx.file_size);
        assert_eq!(idx.chunk_byte_range(99), None);
    }

    #[test]
    fn byte_mode_ranges() {
        let idx = FileIndex {
            fingerprint: "a".repeat(64),
            filepath: PathBuf::from("raw.bin"),
            file_size: 10,
            mode: ChunkMode::Byte,
            delimiter: Vec::new(),
            items_per_chunk: 4,
            item_positions: Vec::new(),
            total_items: 0,
            total_chunks: 3,
        };
        idx.validate().unwrap();
        assert_eq!(idx.chunk_byte_range(0), Some((0, 4)));
        assert_eq!(idx.chunk_byte_range(2), Some((8, 10)));
        assert_eq!(idx.chunk_byte_range(3), None);
    }

    #[test]
    fn validate_rejects_bad_tables() {
        let mut idx = line_index();
        idx.item_positions[3] = 3; // breaks monotonicity
        assert!(matches!(
            idx.validate(),
            Err(DflowError::StoreCorruption(_))
        ));

        let mut idx = line_index();
        idx.total_chunks = 5;
        assert!(idx.validate().is_err());
    }
}
