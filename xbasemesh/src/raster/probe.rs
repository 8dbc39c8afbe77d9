//! DEM source metadata probing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{open_dataset, RasterError, RasterResult};
use crate::cache::{fingerprint_file, Fingerprint, ProvenanceMode};
use crate::crs::{self, Transformer};

/// Detected metadata of one DEM input.
///
/// Bounds are kept both in the source's native CRS and in EPSG:4326; tile
/// intersection tests always use the geographic bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemSourceInfo {
    /// Source file path.
    pub path: PathBuf,
    /// Native CRS as WKT, if the file carries one.
    pub crs_wkt: Option<String>,
    /// Native bounds `(min_x, min_y, max_x, max_y)`.
    pub bounds_native: (f64, f64, f64, f64),
    /// Bounds in EPSG:4326 degrees.
    pub bounds_wgs84: (f64, f64, f64, f64),
    /// Declared nodata value.
    pub nodata: Option<f64>,
    /// Native resolution `(res_x, res_y)` in CRS units/pixel, absolute.
    pub resolution: (f64, f64),
    /// Band sample type name (`Int16`, `Float32`, ...).
    pub dtype: String,
    /// Content fingerprint in the configured provenance mode.
    pub fingerprint: Fingerprint,
}

impl DemSourceInfo {
    /// Approximate resolution of this source in degrees/pixel.
    ///
    /// For non-geographic sources this scales the native resolution by the
    /// degrees-per-unit ratio of the transformed bounds; good enough for
    /// kernel selection, which only needs the up/down direction.
    pub fn resolution_degrees(&self) -> f64 {
        let native_width = self.bounds_native.2 - self.bounds_native.0;
        let wgs_width = self.bounds_wgs84.2 - self.bounds_wgs84.0;
        if native_width <= 0.0 || wgs_width <= 0.0 {
            return self.resolution.0;
        }
        self.resolution.0 * wgs_width / native_width
    }
}

/// Probe a DEM file: georeferencing, nodata, resolution, sample type, and a
/// content fingerprint.
pub fn probe_dem(path: &Path, mode: ProvenanceMode) -> RasterResult<DemSourceInfo> {
    let ds = open_dataset(path)?;
    let io_err = |source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    };

    let gt = ds
        .geo_transform()
        .map_err(|_| RasterError::NotGeoreferenced(path.to_path_buf()))?;
    if gt[1] == 0.0 || gt[5] == 0.0 {
        return Err(RasterError::NotGeoreferenced(path.to_path_buf()));
    }

    let (width, height) = ds.raster_size();
    let x0 = gt[0];
    let y0 = gt[3];
    let x1 = gt[0] + gt[1] * width as f64;
    let y1 = gt[3] + gt[5] * height as f64;
    let bounds_native = (x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1));

    let crs_wkt = ds
        .spatial_ref()
        .ok()
        .and_then(|sr| sr.to_wkt().ok())
        .filter(|wkt| !wkt.is_empty());
    let bounds_wgs84 = match &crs_wkt {
        // No CRS recorded: treat as already-geographic, per long-standing
        // DEM tooling convention.
        None => bounds_native,
        Some(wkt) => {
            let src = crs::spatial_ref(wkt)?;
            if src.is_geographic() {
                bounds_native
            } else {
                let transformer = Transformer::between(&src, &crs::wgs84()?)?;
                transformer.transform_bounds(bounds_native)?
            }
        }
    };

    let band = ds.rasterband(1).map_err(io_err)?;
    let nodata = band.no_data_value();
    let dtype = band.band_type().name();

    let fingerprint = fingerprint_file(path, mode).map_err(|source| RasterError::Fs {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(
        path = %path.display(),
        ?nodata,
        dtype = %dtype,
        "probed DEM source"
    );

    Ok(DemSourceInfo {
        path: path.to_path_buf(),
        crs_wkt,
        bounds_native,
        bounds_wgs84,
        nodata,
        resolution: (gt[1].abs(), gt[5].abs()),
        dtype,
        fingerprint,
    })
}

/// Whether two `(min_x, min_y, max_x, max_y)` bounds overlap.
pub fn bounds_intersect(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> bool {
    a.0 < b.2 && b.0 < a.2 && a.1 < b.3 && b.1 < a.3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_intersect_overlap_and_touch() {
        let tile = (8.0, 47.0, 9.0, 48.0);
        assert!(bounds_intersect(tile, (8.5, 47.5, 10.0, 49.0)));
        assert!(bounds_intersect(tile, (7.0, 46.0, 10.0, 49.0)));
        // Edge contact is not overlap.
        assert!(!bounds_intersect(tile, (9.0, 47.0, 10.0, 48.0)));
        assert!(!bounds_intersect(tile, (10.0, 50.0, 11.0, 51.0)));
    }
}
