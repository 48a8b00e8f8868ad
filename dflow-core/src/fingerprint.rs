use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::Result;

const BUF_SIZE: usize = 1 << 20;

/// Whole-file content hash (blake3, lowercase hex). Two byte-identical files
/// at different paths fingerprint the same, so they share one index and one
/// ledger.
pub fn file_fingerprint(path: &Path) -> Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn identical_content_same_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"same bytes\n").unwrap();
        std::fs::write(&b, b"same bytes\n").unwrap();
        assert_eq!(
            file_fingerprint(&a).unwrap(),
            file_fingerprint(&b).unwrap()
        );
    }

    #[test]
    fn different_content_different_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"one").unwrap();
        std::fs::write(&b, b"two").unwrap();
        assert_ne!(
            file_fingerprint(&a).unwrap(),
            file_fingerprint(&b).unwrap()
        );
    }

    #[test]
    fn matches_streaming_hash() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("big.bin");
        let mut f = File::create(&p).unwrap();
        let block = vec![0xabu8; 8192];
        for _ in 0..300 {
            f.write_all(&block).unwrap();
        }
        drop(f);

        let mut hasher = blake3::Hasher::new();
        for _ in 0..300 {
            hasher.update(&block);
        }
        assert_eq!(
            file_fingerprint(&p).unwrap(),
            hex::encode(hasher.finalize().as_bytes())
        );
    }
}
