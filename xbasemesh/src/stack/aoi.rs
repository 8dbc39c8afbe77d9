//! Area-of-interest polygons for stack layers.

use std::str::FromStr;

use geo::{Contains, MultiPolygon, Point};
use serde::{Deserialize, Serialize};

use super::{StackError, StackResult};
use crate::cache::sha256_hex;
use crate::crs::Transformer;
use crate::raster::TileGrid;
use wkt::{Geometry, Wkt};

/// A layer's area of interest: a WKT polygon plus an optional CRS.
///
/// Without a CRS the polygon is taken as EPSG:4326, matching the tile grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aoi {
    /// `POLYGON(...)` or `MULTIPOLYGON(...)` text.
    pub wkt: String,
    /// CRS of the polygon coordinates, e.g. `EPSG:3857`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
}

impl Aoi {
    /// Validate the WKT early; geometry errors at plan time, not mid-build.
    pub fn validate(&self) -> StackResult<()> {
        self.polygon_native().map(|_| ())
    }

    /// Stable token folded into cache keys.
    pub fn fingerprint_token(&self) -> String {
        let crs = self.crs.as_deref().unwrap_or("EPSG:4326");
        sha256_hex(format!("{}|{}", crs, self.wkt.trim()).as_bytes())
    }

    fn polygon_native(&self) -> StackResult<MultiPolygon<f64>> {
        let parsed: Wkt<f64> = Wkt::from_str(self.wkt.trim())
            .map_err(|e| StackError::InvalidAoi(format!("unparseable WKT: {e}")))?;
        match parsed.item {
            Geometry::MultiPolygon(mp) => Ok(mp.into()),
            Geometry::Polygon(p) => {
                let poly: geo::Polygon<f64> = p.into();
                Ok(MultiPolygon::new(vec![poly]))
            }
            _ => Err(StackError::InvalidAoi(String::from(
                "AOI must be a POLYGON or MULTIPOLYGON",
            ))),
        }
    }

    /// Polygon in tile-grid coordinates (EPSG:4326).
    pub fn polygon_wgs84(&self) -> StackResult<MultiPolygon<f64>> {
        let native = self.polygon_native()?;
        let Some(crs) = self.crs.as_deref() else {
            return Ok(native);
        };
        if crs.eq_ignore_ascii_case("EPSG:4326") {
            return Ok(native);
        }

        let transformer = Transformer::new(crs, "EPSG:4326")
            .map_err(|e| StackError::InvalidAoi(format!("AOI CRS '{crs}': {e}")))?;
        geo::MapCoords::try_map_coords(&native, |coord| {
            transformer
                .transform_point(coord.x, coord.y)
                .map(|(x, y)| geo::Coord { x, y })
        })
        .map_err(|e| StackError::InvalidAoi(format!("AOI coordinate transform failed: {e}")))
    }

    /// Outside-mask over a tile grid: `true` marks pixels whose center falls
    /// outside the polygon.
    pub fn outside_mask(&self, grid: &TileGrid) -> StackResult<Vec<bool>> {
        let polygon = self.polygon_wgs84()?;
        let mut mask = vec![false; grid.pixel_count()];
        for row in 0..grid.height {
            for col in 0..grid.width {
                let (lon, lat) = grid.pixel_center(col, row);
                if !polygon.contains(&Point::new(lon, lat)) {
                    mask[row * grid.width + col] = true;
                }
            }
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::Tile;

    fn west_half_aoi() -> Aoi {
        // Covers the western half of tile +47+008.
        Aoi {
            wkt: String::from("POLYGON((8.0 47.0, 8.5 47.0, 8.5 48.0, 8.0 48.0, 8.0 47.0))"),
            crs: None,
        }
    }

    #[test]
    fn test_polygon_parses() {
        assert!(west_half_aoi().validate().is_ok());
    }

    #[test]
    fn test_multipolygon_parses() {
        let aoi = Aoi {
            wkt: String::from("MULTIPOLYGON(((8 47, 9 47, 9 48, 8 48, 8 47)))"),
            crs: None,
        };
        assert!(aoi.validate().is_ok());
    }

    #[test]
    fn test_non_polygon_rejected() {
        let aoi = Aoi {
            wkt: String::from("POINT(8 47)"),
            crs: None,
        };
        assert!(matches!(aoi.validate(), Err(StackError::InvalidAoi(_))));
    }

    #[test]
    fn test_outside_mask_splits_tile() {
        let grid = TileGrid::for_tile(&Tile::parse("+47+008").unwrap(), 0.25);
        let mask = west_half_aoi().outside_mask(&grid).unwrap();
        // 4x4 grid; columns 0..2 have centers at 8.125/8.375 (inside),
        // columns 2..4 at 8.625/8.875 (outside).
        for row in 0..4 {
            assert!(!mask[row * 4]);
            assert!(!mask[row * 4 + 1]);
            assert!(mask[row * 4 + 2]);
            assert!(mask[row * 4 + 3]);
        }
    }

    #[test]
    fn test_fingerprint_changes_with_crs() {
        let a = west_half_aoi();
        let mut b = west_half_aoi();
        b.crs = Some(String::from("EPSG:3857"));
        assert_ne!(a.fingerprint_token(), b.fingerprint_token());
    }
}
