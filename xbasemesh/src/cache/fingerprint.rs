//! Content fingerprints for DEM inputs.
//!
//! Fingerprints feed cache keys and the provenance block of the build plan.
//! Basic mode is cheap (size + mtime) and good enough for a single machine;
//! strict mode hashes file contents so keys survive copies across hosts.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How DEM inputs are fingerprinted for caching and provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProvenanceMode {
    /// File size + mtime. Fast, machine-local.
    #[default]
    Basic,
    /// SHA-256 of file contents. Stable across hosts.
    Strict,
}

/// A content fingerprint of one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum Fingerprint {
    Basic { size: u64, mtime_ms: u64 },
    Strict { sha256: String },
}

impl Fingerprint {
    /// Stable token for inclusion in a cache-key preimage.
    pub fn token(&self) -> String {
        match self {
            Fingerprint::Basic { size, mtime_ms } => format!("basic:{size}:{mtime_ms}"),
            Fingerprint::Strict { sha256 } => format!("sha256:{sha256}"),
        }
    }
}

/// Fingerprint a file in the given provenance mode.
pub fn fingerprint_file(path: &Path, mode: ProvenanceMode) -> io::Result<Fingerprint> {
    match mode {
        ProvenanceMode::Basic => {
            let meta = std::fs::metadata(path)?;
            let mtime_ms = meta
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            Ok(Fingerprint::Basic {
                size: meta.len(),
                mtime_ms,
            })
        }
        ProvenanceMode::Strict => Ok(Fingerprint::Strict {
            sha256: sha256_file(path)?,
        }),
    }
}

/// SHA-256 of a file's contents as lowercase hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_string(&hasher.finalize()))
}

/// SHA-256 of an in-memory byte string as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_string(&Sha256::digest(bytes))
}

fn hex_string(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
