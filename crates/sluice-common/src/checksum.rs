//! Checksum utilities for staged file verification

use crate::error::{Result, SluiceError};
use crate::types::ChecksumAlgorithm;
use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::Path;

/// Digest of a file or buffer, together with the number of bytes hashed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
    pub size: u64,
}

impl Checksum {
    /// SHA-256 of a file on disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        compute_checksum(&mut file, ChecksumAlgorithm::Sha256)
    }

    /// SHA-256 of an in-memory buffer
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            algorithm: ChecksumAlgorithm::Sha256,
            hex: hex::encode(hasher.finalize()),
            size: data.len() as u64,
        }
    }

    /// Fail with [`SluiceError::ChecksumMismatch`] unless `other` has the same digest
    pub fn verify(&self, other: &Checksum) -> Result<()> {
        if self.algorithm == other.algorithm && self.hex == other.hex {
            Ok(())
        } else {
            Err(SluiceError::ChecksumMismatch {
                expected: self.hex.clone(),
                actual: other.hex.clone(),
            })
        }
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Compute a checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R, algorithm: ChecksumAlgorithm) -> Result<Checksum> {
    let mut buffer = [0u8; 8192];
    let mut size = 0u64;

    let hex = match algorithm {
        ChecksumAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let bytes_read = reader.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                size += bytes_read as u64;
                hasher.update(&buffer[..bytes_read]);
            }
            hex::encode(hasher.finalize())
        },
        ChecksumAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            loop {
                let bytes_read = reader.read(&mut buffer)?;
                if bytes_read == 0 {
                    break;
                }
                size += bytes_read as u64;
                hasher.update(&buffer[..bytes_read]);
            }
            hex::encode(hasher.finalize())
        },
    };

    Ok(Checksum {
        algorithm,
        hex,
        size,
    })
}
