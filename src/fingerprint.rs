//! Content fingerprints used to gate reloads

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const CHUNK_SIZE: usize = 8192;

/// Hex SHA-256 digest of in-memory data
pub fn fingerprint_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 digest of a file's bytes, read in chunks
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether `candidate` differs from `active`.
///
/// A missing active file always counts as a change.
pub fn has_changed(candidate: &Path, active: &Path) -> io::Result<bool> {
    let candidate = fingerprint_file(candidate)?;
    match fingerprint_file(active) {
        Ok(active) => Ok(candidate != active),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e),
    }
}
