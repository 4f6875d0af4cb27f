//! Streaming content hashing for snapshot files.

use crate::core::types::Hash256;
use crate::shutdown::Shutdown;
use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read granularity for file hashing. Also the natural cancellation point.
const HASH_READ_SIZE: usize = 1024 * 1024;

/// Double-SHA256, the node's generic content hash.
pub fn hash_bytes(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// Hash a file in 1 MiB reads. Bails out between reads when shutdown has
/// been requested, since state files can be large.
pub fn hash_file<P: AsRef<Path>>(path: P, shutdown: &Shutdown) -> Result<Hash256> {
    let path = path.as_ref();
    let mut file =
        File::open(path).with_context(|| format!("opening {} for hashing", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_READ_SIZE];
    loop {
        if shutdown.requested() {
            bail!("hashing of {} interrupted by shutdown", path.display());
        }
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let first = hasher.finalize();
    Ok(Hash256(Sha256::digest(first).into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_hash_matches_byte_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..100_000u32).flat_map(|i| i.to_le_bytes()).collect();
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let from_file = hash_file(&path, &Shutdown::new()).unwrap();
        assert_eq!(from_file, hash_bytes(&data));
    }

    #[test]
    fn empty_input_has_well_defined_hash() {
        assert_eq!(hash_bytes(&[]), hash_bytes(b""));
        assert!(!hash_bytes(&[]).is_zero());
    }

    #[test]
    fn shutdown_interrupts_file_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [0u8; 16]).unwrap();

        let shutdown = Shutdown::new();
        shutdown.request();
        assert!(hash_file(&path, &shutdown).is_err());
    }
}
