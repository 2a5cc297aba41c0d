use std::{
    io::Read,
    path::Path,
};

use anyhow::Context as _;
use sha2::Digest as _;

use crate::error::KilnResult;

/// Chunk size for streaming file hashes. Bounds memory use regardless of
/// file size.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = sha2::Sha256::digest(bytes);
    hex_string(&digest)
}

/// SHA-256 of a file's contents, read in fixed-size chunks.
///
/// Fails if the file cannot be opened or a read fails mid-stream; no partial
/// hash is ever returned.
pub fn sha256_file(path: &Path) -> KilnResult<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("open '{}' for hashing", path.display()))?;
    let mut hasher = sha2::Sha256::new();
    let mut chunk = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut chunk)
            .with_context(|| format!("read '{}' while hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(hex_string(&hasher.finalize()))
}

fn hex_string(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_hash_matches_buffer_hash_across_chunk_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        // Larger than one chunk so the loop runs more than once.
        let data = vec![0xa7u8; HASH_CHUNK_SIZE * 2 + 13];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(&data));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sha256_file(&dir.path().join("nope")).is_err());
    }
}
