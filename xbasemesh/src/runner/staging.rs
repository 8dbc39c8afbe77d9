//! Normalized DEM staging into the backend tree.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{RunnerError, RunnerResult};
use crate::fsio;
use crate::tile::{Tile, ELEVATION_EXTENSIONS};

/// Stage a tile's normalized DEM into `Elevation_data/<bucket>/`.
///
/// Every stale file matching the tile's cardinal-letter stem is removed
/// first, whatever its extension, so a leftover `N47E008.hgt` from an
/// earlier run can never shadow the fresh `N47E008.tif`. Returns the exact
/// staged path.
pub fn stage_dem(tile: &Tile, artifact: &Path, backend_root: &Path) -> RunnerResult<PathBuf> {
    let ext = artifact
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("tif")
        .to_ascii_lowercase();
    let dest = tile.elevation_path(backend_root, &ext);
    let dest_dir = dest.parent().expect("elevation path has a parent");

    std::fs::create_dir_all(dest_dir).map_err(|source| RunnerError::Io {
        path: dest_dir.to_path_buf(),
        source,
    })?;

    let pattern = tile.stale_stage_pattern(dest_dir);
    match glob::glob(&pattern) {
        Err(e) => warn!(pattern = %pattern, error = %e, "invalid staging glob"),
        Ok(matches) => {
            for stale in matches.flatten() {
                let supported = stale
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| ELEVATION_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false);
                if supported && stale.is_file() {
                    debug!(stale = %stale.display(), "removing stale staged DEM");
                    std::fs::remove_file(&stale).map_err(|source| RunnerError::Io {
                        path: stale.clone(),
                        source,
                    })?;
                }
            }
        }
    }

    fsio::copy_atomic(artifact, &dest).map_err(|source| RunnerError::Io {
        path: dest.clone(),
        source,
    })?;
    debug!(tile = %tile, staged = %dest.display(), "staged tile DEM");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stage_writes_cardinal_name() {
        let temp = TempDir::new().unwrap();
        let artifact = temp.path().join("+47+008.tif");
        std::fs::write(&artifact, b"dem").unwrap();

        let tile = Tile::parse("+47+008").unwrap();
        let staged = stage_dem(&tile, &artifact, temp.path()).unwrap();
        assert!(staged.ends_with("Elevation_data/+40+000/N47E008.tif"));
        assert_eq!(std::fs::read(&staged).unwrap(), b"dem");
    }

    #[test]
    fn test_stage_removes_stale_variants() {
        let temp = TempDir::new().unwrap();
        let tile = Tile::parse("+47+008").unwrap();
        let bucket_dir = temp.path().join("Elevation_data").join("+40+000");
        std::fs::create_dir_all(&bucket_dir).unwrap();

        // Stale files from an earlier run with a different extension, plus a
        // neighbor tile that must survive.
        let stale_hgt = bucket_dir.join("N47E008.hgt");
        let stale_img = bucket_dir.join("N47E008.img");
        let neighbor = bucket_dir.join("N47E009.hgt");
        std::fs::write(&stale_hgt, b"old").unwrap();
        std::fs::write(&stale_img, b"old").unwrap();
        std::fs::write(&neighbor, b"keep").unwrap();

        let artifact = temp.path().join("norm.tif");
        std::fs::write(&artifact, b"new").unwrap();
        stage_dem(&tile, &artifact, temp.path()).unwrap();

        assert!(!stale_hgt.exists());
        assert!(!stale_img.exists());
        assert!(neighbor.exists());
        assert!(bucket_dir.join("N47E008.tif").exists());
    }
}
