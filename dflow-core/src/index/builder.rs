use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::domain::{ChunkMode, FileIndex};
use crate::error::{DflowError, Result};
use crate::fingerprint::file_fingerprint;

/// Single-pass boundary scan: records the byte offset of every item start for
/// the chosen chunking mode. Pure — persistence is the store's job.
pub fn build_index(
    path: &Path,
    mode: ChunkMode,
    delimiter: &[u8],
    items_per_chunk: u64,
) -> Result<FileIndex> {
    if items_per_chunk == 0 {
        return Err(DflowError::Config("items_per_chunk must be positive".into()));
    }
    // Line and csv always split on a single newline, whatever was passed in.
    let delimiter: Vec<u8> = match mode {
        ChunkMode::Line | ChunkMode::Csv => b"\n".to_vec(),
        ChunkMode::Token => {
            if delimiter.is_empty() {
                return Err(DflowError::Config(
                    "token mode requires a non-empty delimiter".into(),
                ));
            }
            delimiter.to_vec()
        }
        ChunkMode::Byte => Vec::new(),
    };

    let fingerprint = file_fingerprint(path)?;
    let file = File::open(path)?;
    let file_size = file.metadata()?.len();

    if mode == ChunkMode::Byte {
        let total_chunks = file_size.div_ceil(items_per_chunk);
        tracing::debug!(%fingerprint, total_chunks, "byte-mode index, no scan");
        return Ok(FileIndex {
            fingerprint,
            filepath: path.to_path_buf(),
            file_size,
            mode,
            delimiter,
            items_per_chunk,
            item_positions: Vec::new(),
            total_items: 0,
            total_chunks,
        });
    }

    let item_positions = if file_size == 0 {
        // Zero-length maps are not portable; an empty file has no items.
        vec![0]
    } else {
        // SAFETY: the map is read-only and dropped before this function
        // returns; we never hand out references into it.
        let mmap = unsafe { Mmap::map(&file)? };
        scan_boundaries(&mmap, &delimiter)
    };

    let total_items = item_positions.len() as u64 - 1;
    let total_chunks = total_items.div_ceil(items_per_chunk);
    tracing::debug!(
        %fingerprint,
        mode = mode.as_str(),
        total_items,
        total_chunks,
        "boundary index built"
    );

    Ok(FileIndex {
        fingerprint,
        filepath: path.to_path_buf(),
        file_size,
        mode,
        delimiter,
        items_per_chunk,
        item_positions,
        total_items,
        total_chunks,
    })
}

/// Offsets immediately following each delimiter match, plus 0 and, when the
/// data does not end on a delimiter, a closing `data.len()` boundary.
fn scan_boundaries(data: &[u8], delimiter: &[u8]) -> Vec<u64> {
    let mut positions = vec![0u64];
    let mut pos = 0usize;
    while pos < data.len() {
        match find(data, delimiter, pos) {
            Some(hit) => {
                let next = hit + delimiter.len();
                positions.push(next as u64);
                pos = next;
            }
            None => {
                positions.push(data.len() as u64);
                break;
            }
        }
    }
    positions
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.len() == 1 {
        let b = needle[0];
        return haystack[from..]
            .iter()
            .position(|&x| x == b)
            .map(|i| from + i);
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_temp(name: &str, content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join(name);
        std::fs::write(&p, content).unwrap();
        (dir, p)
    }

    #[test]
    fn ten_lines_three_per_chunk() {
        let (_d, p) = write_temp("ten.txt", b"0\n1\n2\n3\n4\n5\n6\n7\n8\n9\n");
        let idx = build_index(&p, ChunkMode::Line, b"", 3).unwrap();
        assert_eq!(idx.total_items, 10);
        assert_eq!(idx.total_chunks, 4);
        assert_eq!(idx.item_positions.len(), 11);
        assert_eq!(*idx.item_positions.last().unwrap(), idx.file_size);
        idx.validate().unwrap();
    }

    #[test]
    fn missing_trailing_newline_closes_at_file_size() {
        let (_d, p) = write_temp("notrail.txt", b"aa\nbb\ncc");
        let idx = build_index(&p, ChunkMode::Line, b"", 2).unwrap();
        assert_eq!(idx.total_items, 3);
        assert_eq!(idx.item_positions, vec![0, 3, 6, 8]);
        assert_eq!(idx.total_chunks, 2);
    }

    #[test]
    fn token_mode_multibyte_delimiter() {
        let (_d, p) = write_temp("tok.txt", b"one::two::three");
        let idx = build_index(&p, ChunkMode::Token, b"::", 2).unwrap();
        assert_eq!(idx.total_items, 3);
        assert_eq!(idx.item_positions, vec![0, 5, 10, 15]);
    }

    #[test]
    fn byte_mode_skips_scan() {
        let (_d, p) = write_temp("raw.bin", &[7u8; 100]);
        let idx = build_index(&p, ChunkMode::Byte, b"", 30).unwrap();
        assert!(idx.item_positions.is_empty());
        assert_eq!(idx.total_chunks, 4);
        assert_eq!(idx.chunk_byte_range(3), Some((90, 100)));
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let (_d, p) = write_temp("empty.txt", b"");
        let idx = build_index(&p, ChunkMode::Line, b"", 5).unwrap();
        assert_eq!(idx.total_items, 0);
        assert_eq!(idx.total_chunks, 0);
        idx.validate().unwrap();
    }

    #[test]
    fn bad_config_is_rejected() {
        let (_d, p) = write_temp("x.txt", b"data\n");
        assert!(matches!(
            build_index(&p, ChunkMode::Line, b"", 0),
            Err(DflowError::Config(_))
        ));
        assert!(matches!(
            build_index(&p, ChunkMode::Token, b"", 4),
            Err(DflowError::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = build_index(Path::new("/no/such/file"), ChunkMode::Line, b"", 4)
            .unwrap_err();
        assert!(matches!(err, DflowError::Io(_)));
    }
}
