//! Hashing utilities for sync transfers.
//!
//! Every transfer is checksummed with BLAKE3 while it streams; the digest
//! travels in the `DataEnd` frame.

use std::io::Read;
use std::path::Path;

/// Length of a transfer checksum in bytes.
pub const CHECKSUM_LEN: usize = 32;

pub type Checksum = [u8; CHECKSUM_LEN];

/// Incremental checksum over the chunks of one transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferHasher {
    hasher: blake3::Hasher,
    bytes: u64,
}

impl TransferHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(&self) -> Checksum {
        *self.hasher.finalize().as_bytes()
    }
}

/// Hash bytes using BLAKE3.
pub fn hash_bytes(data: &[u8]) -> Checksum {
    *blake3::hash(data).as_bytes()
}

/// Hash a file using BLAKE3, reading it in 64KB blocks.
pub fn hash_file(path: &Path) -> std::io::Result<Checksum> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 65536];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(*hasher.finalize().as_bytes())
}

/// Render a checksum as hex for log lines.
pub fn to_hex(checksum: &Checksum) -> String {
    blake3::Hash::from(*checksum).to_hex().to_string()
}
