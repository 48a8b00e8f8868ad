use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::domain::{ChunkMode, FileIndex, Item};
use crate::error::Result;

/// Reads exactly the bytes of one chunk and splits them into items per the
/// chunking mode. Out-of-range indices yield an empty result, not an error;
/// callers must not mistake that for legitimately empty content.
pub struct ChunkReader {
    f: File,
}

impl ChunkReader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            f: File::open(path)?,
        })
    }

    /// Raw bytes of chunk `chunk`, empty when out of range.
    pub fn read_chunk(&mut self, index: &FileIndex, chunk: u64) -> Result<Vec<u8>> {
        let Some((start, end)) = index.chunk_byte_range(chunk) else {
            return Ok(Vec::new());
        };
        let mut buf = vec![0u8; (end - start) as usize];
        self.f.seek(SeekFrom::Start(start))?;
        self.f.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_items(&mut self, index: &FileIndex, chunk: u64) -> Result<Vec<Item>> {
        let data = self.read_chunk(index, chunk)?;
        if data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(split_items(index.mode, &index.delimiter, &data))
    }
}

fn split_items(mode: ChunkMode, delimiter: &[u8], data: &[u8]) -> Vec<Item> {
    match mode {
        // Field splitting is not quote-aware; a quoted comma splits too.
        ChunkMode::Csv => lossy_lines(data)
            .map(|line| Item::Record(line.split(',').map(str::to_string).collect()))
            .collect(),
        ChunkMode::Token => split_on(data, delimiter)
            .filter_map(|piece| {
                let s = String::from_utf8_lossy(piece);
                let t = s.trim();
                (!t.is_empty()).then(|| Item::Text(t.to_string()))
            })
            .collect(),
        ChunkMode::Line => lossy_lines(data).map(Item::Text).collect(),
        ChunkMode::Byte => vec![Item::Text(
            String::from_utf8_lossy(data).into_owned(),
        )],
    }
}

// Blank lines are discarded; everything else is kept verbatim, surrounding
// whitespace included.
fn lossy_lines(data: &[u8]) -> impl Iterator<Item = String> + '_ {
    data.split(|&b| b == b'\n').filter_map(|line| {
        let s = String::from_utf8_lossy(line);
        (!s.trim().is_empty()).then(|| s.into_owned())
    })
}

fn split_on<'a>(data: &'a [u8], delimiter: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
    let mut rest = Some(data);
    std::iter::from_fn(move || {
        let data = rest?;
        match data
            .windows(delimiter.len().max(1))
            .position(|w| w == delimiter)
        {
            Some(i) => {
                rest = Some(&data[i + delimiter.len()..]);
                Some(&data[..i])
            }
            None => {
                rest = None;
                Some(data)
            }
        }
    })
}
