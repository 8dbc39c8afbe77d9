//! Tile identity and path algebra.
//!
//! X-Plane addresses base-mesh scenery by 1°×1° tiles named after their
//! south-west corner (`+47+008`) and groups them into 10°×10° buckets
//! (`Earth nav data/+40+000/+47+008.dsf`). Elevation inputs staged for the
//! mesh backend use the cardinal-letter form instead (`N47E008.tif`).
//!
//! Every on-disk path involving a tile flows through this module; no other
//! code splices tile names into paths.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Southernmost valid tile latitude (south-west corner).
pub const MIN_LAT: i32 = -90;
/// Northernmost valid tile latitude (south-west corner).
pub const MAX_LAT: i32 = 89;
/// Westernmost valid tile longitude (south-west corner).
pub const MIN_LON: i32 = -180;
/// Easternmost valid tile longitude (south-west corner).
pub const MAX_LON: i32 = 179;

/// Elevation file extensions the mesh backend recognizes in `Elevation_data/`.
///
/// Staging removes stale files with *any* of these extensions before writing
/// a fresh one, so a leftover `.hgt` never shadows a new `.tif`.
pub const ELEVATION_EXTENSIONS: &[&str] = &["hgt", "tif", "tiff", "img", "raw"];

/// DSF folder name inside a scenery tree.
pub const EARTH_NAV_DIR: &str = "Earth nav data";

/// Staged-elevation folder name inside the backend tree.
pub const ELEVATION_DATA_DIR: &str = "Elevation_data";

/// Errors from tile name parsing and construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TileError {
    /// The name does not have the `[+-]DD[+-]DDD` shape.
    #[error("invalid tile name '{0}': expected signed degrees like +47+008")]
    InvalidTileName(String),

    /// Latitude outside [-90, 89].
    #[error("tile latitude {0} out of range [{MIN_LAT}, {MAX_LAT}]")]
    LatitudeOutOfRange(i32),

    /// Longitude outside [-180, 179].
    #[error("tile longitude {0} out of range [{MIN_LON}, {MAX_LON}]")]
    LongitudeOutOfRange(i32),
}

/// A 1°×1° scenery tile identified by its south-west corner.
///
/// Immutable identifier; `parse` and `Display` round-trip exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tile {
    lat: i32,
    lon: i32,
}

impl Tile {
    /// Create a tile from south-west corner degrees, validating range.
    pub fn new(lat: i32, lon: i32) -> Result<Self, TileError> {
        if !(MIN_LAT..=MAX_LAT).contains(&lat) {
            return Err(TileError::LatitudeOutOfRange(lat));
        }
        if !(MIN_LON..=MAX_LON).contains(&lon) {
            return Err(TileError::LongitudeOutOfRange(lon));
        }
        Ok(Self { lat, lon })
    }

    /// Parse a canonical tile name such as `+47+008` or `-03+017`.
    ///
    /// Only the signed form is accepted; cardinal-letter names (`N47E008`)
    /// are an output format, never an input.
    pub fn parse(name: &str) -> Result<Self, TileError> {
        let invalid = || TileError::InvalidTileName(name.to_string());

        let bytes = name.as_bytes();
        if bytes.len() != 7 {
            return Err(invalid());
        }
        let sign = |b: u8| match b {
            b'+' => Some(1i32),
            b'-' => Some(-1i32),
            _ => None,
        };
        let lat_sign = sign(bytes[0]).ok_or_else(invalid)?;
        let lon_sign = sign(bytes[3]).ok_or_else(invalid)?;
        if !bytes[1..3].iter().all(u8::is_ascii_digit)
            || !bytes[4..7].iter().all(u8::is_ascii_digit)
        {
            return Err(invalid());
        }
        let lat: i32 = name[1..3].parse().map_err(|_| invalid())?;
        let lon: i32 = name[4..7].parse().map_err(|_| invalid())?;
        Self::new(lat_sign * lat, lon_sign * lon)
    }

    /// South-west corner latitude in degrees.
    pub fn lat(&self) -> i32 {
        self.lat
    }

    /// South-west corner longitude in degrees.
    pub fn lon(&self) -> i32 {
        self.lon
    }

    /// Canonical name: explicit sign, two-digit latitude, three-digit
    /// longitude (`+47+008`).
    pub fn name(&self) -> String {
        format!("{:+03}{:+04}", self.lat, self.lon)
    }

    /// Tile bounds in EPSG:4326 degrees as `(min_lon, min_lat, max_lon, max_lat)`.
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        (
            f64::from(self.lon),
            f64::from(self.lat),
            f64::from(self.lon) + 1.0,
            f64::from(self.lat) + 1.0,
        )
    }

    /// The 10°×10° bucket containing this tile.
    ///
    /// Uses floor division so negative coordinates land in the correct
    /// south-west bucket corner (`-3` → `-10`, not `0`).
    pub fn bucket(&self) -> Bucket {
        Bucket {
            lat: self.lat.div_euclid(10) * 10,
            lon: self.lon.div_euclid(10) * 10,
        }
    }

    /// Cardinal-letter stem used for staged elevation files (`N47E008`).
    pub fn hgt_stem(&self) -> String {
        let ns = if self.lat >= 0 { 'N' } else { 'S' };
        let ew = if self.lon >= 0 { 'E' } else { 'W' };
        format!(
            "{}{:02}{}{:03}",
            ns,
            self.lat.abs(),
            ew,
            self.lon.abs()
        )
    }

    /// Cardinal-letter elevation filename with the given extension.
    pub fn hgt_name(&self, ext: &str) -> String {
        format!("{}.{}", self.hgt_stem(), ext)
    }

    /// Path of this tile's DSF inside a scenery tree:
    /// `<root>/Earth nav data/<bucket>/<tile>.dsf`.
    pub fn dsf_path(&self, root: &Path) -> PathBuf {
        root.join(EARTH_NAV_DIR)
            .join(self.bucket().name())
            .join(format!("{}.dsf", self.name()))
    }

    /// Path of this tile's staged elevation file inside the backend tree:
    /// `<root>/Elevation_data/<bucket>/<N47E008.ext>`.
    pub fn elevation_path(&self, root: &Path, ext: &str) -> PathBuf {
        root.join(ELEVATION_DATA_DIR)
            .join(self.bucket().name())
            .join(self.hgt_name(ext))
    }

    /// Glob pattern matching any staged elevation file for this tile,
    /// regardless of extension (`<dir>/N47E008.*`).
    pub fn stale_stage_pattern(&self, dir: &Path) -> String {
        dir.join(format!("{}.*", self.hgt_stem()))
            .to_string_lossy()
            .into_owned()
    }

    /// Directory of this tile's normalized artifact under an output root.
    pub fn normalized_dir(&self, output: &Path) -> PathBuf {
        output.join("normalized").join("tiles").join(self.name())
    }

    /// Path of this tile's normalized GeoTIFF artifact under an output root.
    pub fn normalized_artifact(&self, output: &Path) -> PathBuf {
        self.normalized_dir(output).join(format!("{}.tif", self.name()))
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+03}{:+04}", self.lat, self.lon)
    }
}

impl std::str::FromStr for Tile {
    type Err = TileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Tile {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for Tile {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TileVisitor;

        impl Visitor<'_> for TileVisitor {
            type Value = Tile;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a tile name like +47+008")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Tile, E> {
                Tile::parse(v).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_str(TileVisitor)
    }
}

/// A 10°×10° bucket folder under `Earth nav data/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bucket {
    lat: i32,
    lon: i32,
}

impl Bucket {
    /// South-west corner latitude, always a multiple of 10.
    pub fn lat(&self) -> i32 {
        self.lat
    }

    /// South-west corner longitude, always a multiple of 10.
    pub fn lon(&self) -> i32 {
        self.lon
    }

    /// Canonical folder name (`+40+000`, `-10+010`).
    pub fn name(&self) -> String {
        format!("{:+03}{:+04}", self.lat, self.lon)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
