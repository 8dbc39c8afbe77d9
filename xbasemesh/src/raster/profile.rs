//! Backend sample profile.
//!
//! The mesh backend consumes signed 16-bit elevation with `-32768` as void,
//! matching the HGT convention. Normalization remaps whatever sentinel the
//! sources use to this profile as part of the tile write; for already-written
//! rasters a windowed streaming remap is available that never loads the full
//! dataset.

use std::path::Path;

use gdal::raster::{Buffer, RasterCreationOption};
use gdal::DriverManager;
use serde::{Deserialize, Serialize};

use super::{is_nodata, open_dataset, RasterError, RasterResult};

/// Rows per window for the streaming remap.
const STRIPE_ROWS: usize = 512;

/// Sample profile expected by the mesh backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    /// Nodata value written to staged tiles.
    pub nodata: f64,
    /// Sample type name, for the build plan.
    pub dtype: &'static str,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            nodata: -32768.0,
            dtype: "Int16",
        }
    }
}

impl BackendProfile {
    /// Clamp range of the profile's sample type, excluding the void value.
    fn clamp(&self, value: f32) -> f32 {
        value.clamp(-32767.0, 32767.0)
    }
}

/// Remap an in-memory canvas to the backend profile.
///
/// Masked cells become `profile.nodata`; valid cells are clamped into the
/// signed 16-bit payload range. Returns the number of remapped void cells.
pub fn remap_to_profile(
    data: &mut [f32],
    src_nodata: Option<f64>,
    profile: &BackendProfile,
) -> u64 {
    let mut remapped = 0u64;
    for value in data.iter_mut() {
        if is_nodata(*value, src_nodata) {
            *value = profile.nodata as f32;
            remapped += 1;
        } else {
            *value = profile.clamp(*value);
        }
    }
    remapped
}

/// Streaming dataset remap, window by window.
///
/// Fallback for sources that cannot be remapped during the warp; reads and
/// writes `STRIPE_ROWS`-row windows so memory stays bounded regardless of
/// mosaic size.
pub fn remap_streaming(
    src_path: &Path,
    dst_path: &Path,
    profile: &BackendProfile,
) -> RasterResult<u64> {
    let src = open_dataset(src_path)?;
    let src_err = |source| RasterError::Io {
        path: src_path.to_path_buf(),
        source,
    };
    let dst_err = |source| RasterError::Io {
        path: dst_path.to_path_buf(),
        source,
    };

    let (width, height) = src.raster_size();
    let src_band = src.rasterband(1).map_err(src_err)?;
    let src_nodata = src_band.no_data_value();

    let driver = DriverManager::get_driver_by_name("GTiff").map_err(dst_err)?;
    let mut dst = driver
        .create_with_band_type_with_options::<i16, _>(
            dst_path,
            width as isize,
            height as isize,
            1,
            &[RasterCreationOption {
                key: "COMPRESS",
                value: "LZW",
            }],
        )
        .map_err(|source| RasterError::Create {
            path: dst_path.to_path_buf(),
            source,
        })?;
    if let Ok(gt) = src.geo_transform() {
        dst.set_geo_transform(&gt).map_err(dst_err)?;
    }
    if let Ok(sr) = src.spatial_ref() {
        dst.set_spatial_ref(&sr).map_err(dst_err)?;
    }
    let mut dst_band = dst.rasterband(1).map_err(dst_err)?;
    dst_band
        .set_no_data_value(Some(profile.nodata))
        .map_err(dst_err)?;

    let mut remapped = 0u64;
    let mut row = 0usize;
    while row < height {
        let rows = STRIPE_ROWS.min(height - row);
        let mut stripe = src_band
            .read_as::<f32>((0, row as isize), (width, rows), (width, rows), None)
            .map_err(src_err)?;
        remapped += remap_to_profile(&mut stripe.data, src_nodata, profile);

        let out: Vec<i16> = stripe.data.iter().map(|&v| v as i16).collect();
        dst_band
            .write(
                (0, row as isize),
                (width, rows),
                &Buffer::new((width, rows), out),
            )
            .map_err(dst_err)?;
        row += rows;
    }

    Ok(remapped)
}
