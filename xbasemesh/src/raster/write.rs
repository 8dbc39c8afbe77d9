//! Warping into tile windows and writing tile artifacts.

use std::path::{Path, PathBuf};

use gdal::raster::{Buffer, RasterCreationOption};
use gdal::{Dataset, DriverManager};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    create_mem_canvas, read_full_band, reproject_into, RasterError, RasterResult,
    ResamplingKernel, TileGrid,
};
use crate::crs;

/// GeoTIFF compression for normalized artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Compression {
    None,
    #[default]
    Lzw,
    Deflate,
}

impl Compression {
    fn creation_options(&self) -> Vec<RasterCreationOption<'static>> {
        match self {
            Compression::None => vec![],
            Compression::Lzw => vec![RasterCreationOption {
                key: "COMPRESS",
                value: "LZW",
            }],
            Compression::Deflate => vec![RasterCreationOption {
                key: "COMPRESS",
                value: "DEFLATE",
            }],
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Compression::None),
            "lzw" => Ok(Compression::Lzw),
            "deflate" => Ok(Compression::Deflate),
            other => Err(format!(
                "unknown compression '{other}' (expected none|lzw|deflate)"
            )),
        }
    }
}

/// Outcome of a tile artifact write.
#[derive(Debug, Clone)]
pub struct WrittenDem {
    /// Artifact path.
    pub path: PathBuf,
    /// Nodata value actually present in the written dataset header. Read
    /// back from the band after the write, never echoed from the request.
    pub nodata: Option<f64>,
}

/// Warp a source dataset into a tile grid window.
///
/// The window is initialized to the effective nodata value
/// (`dst_nodata ?? source nodata ?? NaN`) so uncovered pixels come back
/// masked. Returns the samples and the effective nodata.
pub fn warp_to_grid(
    src: &Dataset,
    src_path: &Path,
    grid: &TileGrid,
    kernel: ResamplingKernel,
    dst_nodata: Option<f64>,
) -> RasterResult<(Vec<f32>, f64)> {
    let src_nodata = src
        .rasterband(1)
        .map_err(|source| RasterError::Io {
            path: src_path.to_path_buf(),
            source,
        })?
        .no_data_value();
    let nodata = dst_nodata.or(src_nodata).unwrap_or(f64::NAN);

    let canvas = create_mem_canvas(grid, nodata)?;
    reproject_into(src, &canvas, kernel, &src_path.display().to_string())?;
    let data = read_full_band(&canvas, src_path)?;

    debug!(
        src = %src_path.display(),
        width = grid.width,
        height = grid.height,
        nodata,
        kernel = %kernel,
        "warped source into tile grid"
    );
    Ok((data, nodata))
}

/// Write a tile canvas as a normalized GeoTIFF artifact.
///
/// The nodata written is `requested ?? source`, matching what the warp used
/// to initialize the window. The returned [`WrittenDem::nodata`] is read
/// back from the created band so callers see the value that actually landed
/// in the header.
pub fn write_tile_dem(
    out_path: &Path,
    grid: &TileGrid,
    data: &[f32],
    requested_nodata: Option<f64>,
    source_nodata: Option<f64>,
    compression: Compression,
    as_int16: bool,
) -> RasterResult<WrittenDem> {
    debug_assert_eq!(data.len(), grid.pixel_count());

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| RasterError::Fs {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let io_err = |source| RasterError::Io {
        path: out_path.to_path_buf(),
        source,
    };
    let create_err = |source| RasterError::Create {
        path: out_path.to_path_buf(),
        source,
    };

    let effective = requested_nodata.or(source_nodata);
    let driver = DriverManager::get_driver_by_name("GTiff").map_err(create_err)?;
    let options = compression.creation_options();

    let mut ds = if as_int16 {
        driver
            .create_with_band_type_with_options::<i16, _>(
                out_path,
                grid.width as isize,
                grid.height as isize,
                1,
                &options,
            )
            .map_err(create_err)?
    } else {
        driver
            .create_with_band_type_with_options::<f32, _>(
                out_path,
                grid.width as isize,
                grid.height as isize,
                1,
                &options,
            )
            .map_err(create_err)?
    };
    ds.set_geo_transform(&grid.geo_transform()).map_err(io_err)?;
    ds.set_spatial_ref(&crs::wgs84()?).map_err(io_err)?;

    let mut band = ds.rasterband(1).map_err(io_err)?;
    if let Some(nd) = effective {
        band.set_no_data_value(Some(nd)).map_err(io_err)?;
    }

    if as_int16 {
        let samples: Vec<i16> = data.iter().map(|&v| v as i16).collect();
        band.write(
            (0, 0),
            (grid.width, grid.height),
            &Buffer::new((grid.width, grid.height), samples),
        )
        .map_err(io_err)?;
    } else {
        band.write(
            (0, 0),
            (grid.width, grid.height),
            &Buffer::new((grid.width, grid.height), data.to_vec()),
        )
        .map_err(io_err)?;
    }

    // Truthful nodata: re-read from the band, not from the request.
    let written_nodata = band.no_data_value();
    drop(band);
    drop(ds);

    Ok(WrittenDem {
        path: out_path.to_path_buf(),
        nodata: written_nodata,
    })
}
