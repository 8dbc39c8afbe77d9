//! Raster normalization primitives.
//!
//! Everything that touches pixels lives here: source probing, mosaicking,
//! warping into tile grids, coverage statistics, the backend sample profile,
//! and tile artifact writing. GDAL dataset handles are created and consumed
//! on one thread; workers never share them.

mod coverage;
mod grid;
mod mask;
mod mosaic;
mod probe;
mod profile;
mod warp;
mod write;

pub use coverage::{coverage_of_array, coverage_of_dataset, Coverage};
pub use grid::TileGrid;
pub use mask::{count_nodata, is_nodata, mask};
pub use mosaic::{merge_tile, prepare_mosaic, MosaicSource, MosaicStrategy};
pub use probe::{bounds_intersect, probe_dem, DemSourceInfo};
pub use profile::{remap_to_profile, remap_streaming, BackendProfile};
pub use warp::{reproject_into, ResamplingKernel, ResamplingPolicy};
pub use write::{warp_to_grid, write_tile_dem, Compression, WrittenDem};

use std::path::{Path, PathBuf};

use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags};
use thiserror::Error;

use crate::crs::{self, CrsError};

/// Result type for raster operations.
pub type RasterResult<T> = Result<T, RasterError>;

/// Errors from raster primitives.
#[derive(Debug, Error)]
pub enum RasterError {
    /// Failed to open a dataset.
    #[error("failed to open raster {path}: {source}")]
    Open {
        path: PathBuf,
        source: gdal::errors::GdalError,
    },

    /// Failed to create a dataset.
    #[error("failed to create raster {path}: {source}")]
    Create {
        path: PathBuf,
        source: gdal::errors::GdalError,
    },

    /// Band or dataset I/O failed.
    #[error("raster I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: gdal::errors::GdalError,
    },

    /// Warp failed.
    #[error("warp failed ({context}): {message}")]
    Warp { context: String, message: String },

    /// Mosaic construction failed.
    #[error("mosaic failed: {0}")]
    Mosaic(String),

    /// A source raster carries no usable georeferencing.
    #[error("raster {0} has no geotransform")]
    NotGeoreferenced(PathBuf),

    /// CRS handling failed.
    #[error(transparent)]
    Crs(#[from] CrsError),

    /// Plain filesystem failure around raster files.
    #[error("filesystem error at {path}: {source}")]
    Fs {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Open a dataset read-only with path context on failure.
pub fn open_dataset(path: &Path) -> RasterResult<Dataset> {
    Dataset::open(path).map_err(|source| RasterError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Open a dataset writable (for warping into an existing file).
pub(crate) fn open_dataset_for_update(path: &Path) -> RasterResult<Dataset> {
    let options = DatasetOptions {
        open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
        ..Default::default()
    };
    Dataset::open_ex(path, options).map_err(|source| RasterError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Create an in-memory `f32` canvas on the tile grid, initialized to
/// `nodata`, georeferenced in EPSG:4326.
pub(crate) fn create_mem_canvas(grid: &TileGrid, nodata: f64) -> RasterResult<Dataset> {
    let mem_path = PathBuf::from("<MEM>");
    let io_err = |source| RasterError::Io {
        path: mem_path.clone(),
        source,
    };

    let driver = DriverManager::get_driver_by_name("MEM").map_err(io_err)?;
    let mut ds = driver
        .create_with_band_type::<f32, _>("", grid.width as isize, grid.height as isize, 1)
        .map_err(io_err)?;
    ds.set_geo_transform(&grid.geo_transform()).map_err(io_err)?;
    ds.set_spatial_ref(&crs::wgs84()?).map_err(io_err)?;

    let mut band = ds.rasterband(1).map_err(io_err)?;
    band.set_no_data_value(Some(nodata)).map_err(io_err)?;
    band.fill(nodata, None).map_err(io_err)?;
    Ok(ds)
}

/// Read the full first band of a dataset as `f32` samples.
pub(crate) fn read_full_band(ds: &Dataset, path: &Path) -> RasterResult<Vec<f32>> {
    let io_err = |source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    };
    let band = ds.rasterband(1).map_err(io_err)?;
    let (width, height) = ds.raster_size();
    let buffer = band
        .read_as::<f32>((0, 0), (width, height), (width, height), None)
        .map_err(io_err)?;
    Ok(buffer.data)
}
