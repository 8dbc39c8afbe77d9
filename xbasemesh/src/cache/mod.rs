//! Content-addressed cache of normalized tile artifacts.
//!
//! Entries are write-once and key-addressed: `cache/<key[..2]>/<key>/`
//! holding the artifact plus an `entry.json` describing it. Writes go
//! through temp-file + rename so concurrent readers never see a partial
//! entry, and a corrupt entry is simply a miss that gets recomputed.

mod fingerprint;
mod key;

pub use fingerprint::{
    fingerprint_file, sha256_file, sha256_hex, Fingerprint, ProvenanceMode,
};
pub use key::CacheKeyInputs;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::fsio;
use crate::tile::Tile;

/// Schema version of `entry.json`.
const ENTRY_SCHEMA_VERSION: u32 = 1;

/// Artifact filename inside an entry directory.
const ARTIFACT_NAME: &str = "artifact.tif";

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors from cache maintenance. Lookup never errors; a bad entry is a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure under the cache root.
    #[error("cache I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// How cache hits are verified before reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VerifyMode {
    /// Entry metadata must match; artifact bytes are trusted.
    #[default]
    Fingerprint,
    /// Additionally re-hash the artifact against the recorded digest.
    ContentHash,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntryMeta {
    schema_version: u32,
    key: String,
    tile: Tile,
    created_by: String,
    content_sha256: String,
}

/// Result of a cache clean pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    /// Entries removed.
    pub entries_removed: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
}

impl fmt::Display for CleanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cache clean: removed {} entries, freed {} bytes",
            self.entries_removed, self.bytes_freed
        )
    }
}

/// The normalization cache rooted at `<output>/normalized/cache/`.
#[derive(Debug, Clone)]
pub struct NormalizationCache {
    root: PathBuf,
    verify: VerifyMode,
}

impl NormalizationCache {
    /// Open (or designate) a cache under the given output directory.
    pub fn new(output: &Path, verify: VerifyMode) -> Self {
        Self {
            root: output.join("normalized").join("cache"),
            verify,
        }
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, cache_key: &str) -> PathBuf {
        self.root.join(&cache_key[..2]).join(cache_key)
    }

    /// Look up an artifact by key. Returns its path on a verified hit.
    ///
    /// Any inconsistency (missing artifact, unparseable metadata, digest
    /// mismatch) is logged and treated as a miss.
    pub fn lookup(&self, cache_key: &str) -> Option<PathBuf> {
        let dir = self.entry_dir(cache_key);
        let artifact = dir.join(ARTIFACT_NAME);
        let meta_path = dir.join("entry.json");
        if !artifact.is_file() {
            return None;
        }

        let meta: CacheEntryMeta = match std::fs::read_to_string(&meta_path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
        {
            Some(meta) => meta,
            None => {
                warn!(key = cache_key, "cache entry metadata unreadable, treating as miss");
                return None;
            }
        };
        if meta.key != cache_key {
            warn!(key = cache_key, "cache entry key mismatch, treating as miss");
            return None;
        }

        if self.verify == VerifyMode::ContentHash {
            match sha256_file(&artifact) {
                Ok(digest) if digest == meta.content_sha256 => {}
                Ok(_) => {
                    warn!(key = cache_key, "cache artifact digest mismatch, treating as miss");
                    return None;
                }
                Err(e) => {
                    warn!(key = cache_key, error = %e, "cache artifact unreadable, treating as miss");
                    return None;
                }
            }
        }

        debug!(key = cache_key, tile = %meta.tile, "cache hit");
        Some(artifact)
    }

    /// Store an artifact under a key (write-once; replaces a broken entry).
    pub fn store(&self, cache_key: &str, tile: Tile, artifact: &Path) -> CacheResult<PathBuf> {
        let dir = self.entry_dir(cache_key);
        let io_err = |path: PathBuf| {
            move |source| CacheError::Io {
                path: path.clone(),
                source,
            }
        };

        let cached = dir.join(ARTIFACT_NAME);
        fsio::copy_atomic(artifact, &cached).map_err(io_err(cached.clone()))?;

        let content_sha256 =
            sha256_file(&cached).map_err(io_err(cached.clone()))?;
        let meta = CacheEntryMeta {
            schema_version: ENTRY_SCHEMA_VERSION,
            key: cache_key.to_string(),
            tile,
            created_by: format!("xbasemesh {}", env!("CARGO_PKG_VERSION")),
            content_sha256,
        };
        let meta_path = dir.join("entry.json");
        let body = serde_json::to_vec_pretty(&meta).expect("entry meta serializes");
        fsio::write_atomic(&meta_path, &body).map_err(io_err(meta_path.clone()))?;

        debug!(key = cache_key, tile = %tile, "stored cache entry");
        Ok(cached)
    }

    /// Best-effort LRU clean down to `max_bytes`, oldest entries first.
    ///
    /// Never runs automatically during a build; only via the explicit
    /// `cache clean` operation.
    pub fn clean(&self, max_bytes: u64) -> CacheResult<CleanReport> {
        let mut entries: Vec<(PathBuf, std::time::SystemTime, u64)> = Vec::new();
        let mut total = 0u64;

        for prefix in read_dir_or_empty(&self.root)? {
            for entry in read_dir_or_empty(&prefix)? {
                let size = dir_size(&entry)?;
                let mtime = std::fs::metadata(&entry)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                total += size;
                entries.push((entry, mtime, size));
            }
        }

        let mut report = CleanReport::default();
        if total <= max_bytes {
            return Ok(report);
        }

        entries.sort_by_key(|(_, mtime, _)| *mtime);
        for (dir, _, size) in entries {
            if total <= max_bytes {
                break;
            }
            std::fs::remove_dir_all(&dir).map_err(|source| CacheError::Io {
                path: dir.clone(),
                source,
            })?;
            total -= size;
            report.entries_removed += 1;
            report.bytes_freed += size;
        }
        Ok(report)
    }
}

fn read_dir_or_empty(dir: &Path) -> CacheResult<Vec<PathBuf>> {
    match std::fs::read_dir(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(CacheError::Io {
            path: dir.to_path_buf(),
            source,
        }),
        Ok(entries) => {
            let mut out: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            out.sort();
            Ok(out)
        }
    }
}

fn dir_size(dir: &Path) -> CacheResult<u64> {
    let mut size = 0u64;
    for entry in std::fs::read_dir(dir)
        .map_err(|source| CacheError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .flatten()
    {
        let path = entry.path();
        if path.is_file() {
            size += entry.metadata().map(|m| m.len()).unwrap_or(0);
        } else if path.is_dir() {
            size += dir_size(&path)?;
        }
    }
    Ok(size)
}
