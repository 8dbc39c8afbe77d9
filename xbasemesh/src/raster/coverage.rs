//! Valid-data coverage statistics.

use std::path::Path;

use gdal::Dataset;
use serde::{Deserialize, Serialize};

use super::{count_nodata, RasterError, RasterResult};

/// Rows per window when streaming a mask band.
const STRIPE_ROWS: usize = 512;

/// Valid-data coverage of a tile or source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    /// Fraction of pixels carrying data, in `[0, 1]`.
    pub valid_ratio: f64,
    /// Total pixels considered.
    pub total_pixels: u64,
    /// Pixels flagged nodata.
    pub nodata_pixels: u64,
}

impl Coverage {
    fn from_counts(total_pixels: u64, nodata_pixels: u64) -> Self {
        let valid_ratio = if total_pixels == 0 {
            0.0
        } else {
            (total_pixels - nodata_pixels) as f64 / total_pixels as f64
        };
        Self {
            valid_ratio,
            total_pixels,
            nodata_pixels,
        }
    }

    /// Whether coverage is complete.
    pub fn is_full(&self) -> bool {
        self.nodata_pixels == 0
    }
}

/// Zero-I/O coverage over an array the caller already holds.
pub fn coverage_of_array(data: &[f32], nodata: Option<f64>) -> Coverage {
    Coverage::from_counts(data.len() as u64, count_nodata(data, nodata))
}

/// Coverage of a dataset's first band, streamed through its mask band.
///
/// Reads the GDAL mask (one byte per pixel, 0 = nodata) in stripes instead
/// of pulling the full sample array, so this stays cheap on large mosaics.
pub fn coverage_of_dataset(ds: &Dataset, path: &Path) -> RasterResult<Coverage> {
    let io_err = |source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    };

    let band = ds.rasterband(1).map_err(io_err)?;
    let mask = band.open_mask_band().map_err(io_err)?;
    let (width, height) = ds.raster_size();

    let mut nodata_pixels = 0u64;
    let mut row = 0usize;
    while row < height {
        let rows = STRIPE_ROWS.min(height - row);
        let stripe = mask
            .read_as::<u8>((0, row as isize), (width, rows), (width, rows), None)
            .map_err(io_err)?;
        nodata_pixels += stripe.data.iter().filter(|&&flag| flag == 0).count() as u64;
        row += rows;
    }

    Ok(Coverage::from_counts(
        (width * height) as u64,
        nodata_pixels,
    ))
}
