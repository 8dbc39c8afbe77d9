//! Atomic JSON document I/O.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use super::BuildReport;
use crate::fsio;

/// Result type for report I/O.
pub type ReportResult<T> = Result<T, ReportError>;

/// Errors from report document I/O.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Filesystem failure.
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Document serialization failed.
    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// An existing document did not parse.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Write any document as pretty JSON, atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> ReportResult<()> {
    let mut body = serde_json::to_vec_pretty(value).map_err(|source| ReportError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    body.push(b'\n');
    fsio::write_atomic(path, &body).map_err(|source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a prior build report if one exists.
///
/// A missing file is `None`; an unreadable or unparseable file is an error,
/// because resuming against a half-understood report would silently redo or
/// skip work.
pub fn load_report(path: &Path) -> ReportResult<Option<BuildReport>> {
    let text = match std::fs::read_to_string(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ReportError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
        Ok(text) => text,
    };
    let report = serde_json::from_str(&text).map_err(|source| ReportError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{BuildStatus, TileResult, TileStatus};
    use crate::tile::Tile;
    use tempfile::TempDir;

    #[test]
    fn test_report_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build_report.json");

        let mut report = BuildReport::new(Some(String::from("2026-01-01T00:00:00Z")));
        let mut tile = TileResult::new(Tile::parse("+47+008").unwrap());
        tile.status = TileStatus::Ok;
        tile.nodata = Some(-32768.0);
        report.record(tile);
        report.finalize(false, false);

        write_json(&path, &report).unwrap();
        let loaded = load_report(&path).unwrap().unwrap();
        assert_eq!(loaded.status, BuildStatus::Ok);
        assert_eq!(loaded.tiles["+47+008"].nodata, Some(-32768.0));
    }

    #[test]
    fn test_missing_report_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(load_report(&temp.path().join("nope.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_corrupt_report_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build_report.json");
        std::fs::write(&path, "{ truncated").unwrap();
        assert!(matches!(
            load_report(&path),
            Err(ReportError::Parse { .. })
        ));
    }
}
