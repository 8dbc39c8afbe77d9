//! Axis-order-safe coordinate reference system transforms.
//!
//! All bounds and points in this crate use traditional GIS axis order
//! (x = longitude/easting, y = latitude/northing) regardless of what the
//! authority definition says, so an EPSG:4326 bound is always
//! `(min_lon, min_lat, max_lon, max_lat)`. GDAL is told the same via
//! [`AxisMappingStrategy::TraditionalGisOrder`] on every `SpatialRef` built
//! here; building one anywhere else in the crate is a bug.
//!
//! The tile grid itself is geographic-degrees only. A projected *target* CRS
//! is rejected up front (see [`ensure_geographic_target`]) instead of
//! producing silently mis-registered tiles.

use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use thiserror::Error;

/// Result type for CRS operations.
pub type CrsResult<T> = Result<T, CrsError>;

/// Edge sample count used when densifying bounds transforms. 21 points per
/// edge keeps curvature error well under a pixel at tile scale.
const BOUNDS_DENSIFY_POINTS: i32 = 21;

/// Errors that can occur while building or applying CRS transforms.
#[derive(Debug, Error)]
pub enum CrsError {
    /// The CRS definition could not be parsed.
    #[error("failed to parse CRS '{definition}': {reason}")]
    Parse { definition: String, reason: String },

    /// A coordinate transform between two CRSes could not be built.
    #[error("failed to build transform '{src}' -> '{dst}': {source}")]
    TransformBuild {
        src: String,
        dst: String,
        source: gdal::errors::GdalError,
    },

    /// A transform was built but failed on the given coordinates.
    #[error("coordinate transform failed: {0}")]
    TransformFailed(gdal::errors::GdalError),

    /// The requested target CRS is not usable for 1°×1° tile grids.
    #[error(
        "unsupported target CRS '{0}': tile grids are EPSG:4326 degrees only"
    )]
    UnsupportedTarget(String),
}

/// Parse a CRS definition into a `SpatialRef` with traditional axis order.
///
/// Accepts `EPSG:<code>`, PROJ strings (`+proj=...`), and WKT.
pub fn spatial_ref(definition: &str) -> CrsResult<SpatialRef> {
    let parse_err = |reason: String| CrsError::Parse {
        definition: definition.to_string(),
        reason,
    };

    let trimmed = definition.trim();
    let mut sr = if let Some(code) = trimmed
        .strip_prefix("EPSG:")
        .or_else(|| trimmed.strip_prefix("epsg:"))
    {
        let code: u32 = code
            .parse()
            .map_err(|_| parse_err(format!("invalid EPSG code '{code}'")))?;
        SpatialRef::from_epsg(code).map_err(|e| parse_err(e.to_string()))?
    } else if trimmed.starts_with("+proj") {
        SpatialRef::from_proj4(trimmed).map_err(|e| parse_err(e.to_string()))?
    } else {
        SpatialRef::from_wkt(trimmed).map_err(|e| parse_err(e.to_string()))?
    };
    sr.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    Ok(sr)
}

/// The canonical tile-grid CRS (EPSG:4326, traditional axis order).
pub fn wgs84() -> CrsResult<SpatialRef> {
    spatial_ref("EPSG:4326")
}

/// Reject a target CRS that cannot carry the 1°×1° tile grid.
///
/// Returns the parsed `SpatialRef` when the target is geographic; fails with
/// [`CrsError::UnsupportedTarget`] for projected or local CRSes. This runs at
/// plan time so a bad `--target-crs` never reaches the per-tile pipeline.
pub fn ensure_geographic_target(definition: &str) -> CrsResult<SpatialRef> {
    let sr = spatial_ref(definition)?;
    if !sr.is_geographic() {
        return Err(CrsError::UnsupportedTarget(definition.to_string()));
    }
    Ok(sr)
}

/// A reusable point/bounds transform between two CRSes.
///
/// Not `Send`: GDAL transform handles stay on the thread that built them.
/// Workers construct their own.
pub struct Transformer {
    transform: CoordTransform,
}

impl Transformer {
    /// Build a transform between two definitions (see [`spatial_ref`]).
    pub fn new(src: &str, dst: &str) -> CrsResult<Self> {
        let src_ref = spatial_ref(src)?;
        let dst_ref = spatial_ref(dst)?;
        let transform =
            CoordTransform::new(&src_ref, &dst_ref).map_err(|source| CrsError::TransformBuild {
                src: src.to_string(),
                dst: dst.to_string(),
                source,
            })?;
        Ok(Self { transform })
    }

    /// Build a transform between two already-parsed spatial refs.
    pub fn between(src: &SpatialRef, dst: &SpatialRef) -> CrsResult<Self> {
        let transform =
            CoordTransform::new(src, dst).map_err(|source| CrsError::TransformBuild {
                src: src.to_wkt().unwrap_or_default(),
                dst: dst.to_wkt().unwrap_or_default(),
                source,
            })?;
        Ok(Self { transform })
    }

    /// Transform `(min_x, min_y, max_x, max_y)` bounds, densifying each edge
    /// so curved edges in the target CRS are bounded correctly.
    pub fn transform_bounds(
        &self,
        bounds: (f64, f64, f64, f64),
    ) -> CrsResult<(f64, f64, f64, f64)> {
        let (min_x, min_y, max_x, max_y) = bounds;
        let out = self
            .transform
            .transform_bounds(&[min_x, min_y, max_x, max_y], BOUNDS_DENSIFY_POINTS)
            .map_err(CrsError::TransformFailed)?;
        Ok((out[0], out[1], out[2], out[3]))
    }

    /// Transform a single `(x, y)` point.
    pub fn transform_point(&self, x: f64, y: f64) -> CrsResult<(f64, f64)> {
        let mut xs = [x];
        let mut ys = [y];
        let mut zs = [0.0];
        self.transform
            .transform_coords(&mut xs, &mut ys, &mut zs)
            .map_err(CrsError::TransformFailed)?;
        Ok((xs[0], ys[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_rejects_projected_target() {
        // UTM 32N is projected; tile math cannot run in meters.
        let err = ensure_geographic_target("EPSG:32632").unwrap_err();
        assert!(matches!(err, CrsError::UnsupportedTarget(_)));
    }

    #[test]
    fn test_accepts_geographic_target() {
        assert!(ensure_geographic_target("EPSG:4326").is_ok());
    }

    #[test]
    fn test_rejects_garbage_definition() {
        assert!(matches!(
            spatial_ref("not-a-crs"),
            Err(CrsError::Parse { .. })
        ));
    }

    #[test]
    fn test_bounds_round_trip_through_projected_crs() {
        // Tile +47+008 out to UTM 32N and back; would explode if axis order
        // were authority-compliant (lat/lon swapped) on either leg.
        let fwd = Transformer::new("EPSG:4326", "EPSG:32632").unwrap();
        let back = Transformer::new("EPSG:32632", "EPSG:4326").unwrap();

        let bounds = (8.0, 47.0, 9.0, 48.0);
        let projected = fwd.transform_bounds(bounds).unwrap();

        // With x = lon the easting lands near the central meridian (~500km);
        // a swapped transform would put it thousands of km out.
        assert!(projected.0 > 350_000.0 && projected.0 < 650_000.0);
        assert!(projected.1 > 5_100_000.0 && projected.1 < 5_400_000.0);

        let round = back.transform_bounds(projected).unwrap();
        assert_relative_eq!(round.0, bounds.0, epsilon = 1e-3);
        assert_relative_eq!(round.1, bounds.1, epsilon = 1e-3);
        assert_relative_eq!(round.2, bounds.2, epsilon = 1e-3);
        assert_relative_eq!(round.3, bounds.3, epsilon = 1e-3);
    }

    #[test]
    fn test_point_transform_axis_order() {
        let t = Transformer::new("EPSG:4326", "EPSG:32632").unwrap();
        // (lon, lat) argument order, by contract.
        let (e, n) = t.transform_point(9.0, 47.0).unwrap();
        assert!(e > 490_000.0 && e < 520_000.0, "easting {e}");
        assert!(n > 5_190_000.0 && n < 5_220_000.0, "northing {n}");
    }
}
