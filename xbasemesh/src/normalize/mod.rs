//! Per-tile normalization: the canonical artifact pipeline.
//!
//! One tile in, one GeoTIFF out: warp or blend the inputs onto the tile
//! grid, fill voids, measure coverage on both sides, remap to the backend
//! profile, write, cache. The cache is consulted first; a verified hit
//! skips everything.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{CacheError, CacheKeyInputs, NormalizationCache};
use crate::config::BuildOptions;
use crate::fill;
use crate::fsio;
use crate::raster::{
    self, coverage_of_array, open_dataset, warp_to_grid, write_tile_dem, BackendProfile,
    Coverage, DemSourceInfo, MosaicSource, RasterError, TileGrid,
};
use crate::stack::{DemStack, StackError};
use crate::tile::Tile;

/// Result type for normalization.
pub type NormalizeResult<T> = Result<T, NormalizeError>;

/// Errors from the normalization pipeline. Per-tile and non-fatal to peers.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("artifact I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The tile's input: a prepared mosaic or a DEM stack.
#[derive(Debug, Clone, Copy)]
pub enum TileInputs<'a> {
    Mosaic(&'a MosaicSource),
    Stack(&'a DemStack),
}

/// A normalized tile artifact plus the numbers the report wants.
#[derive(Debug, Clone)]
pub struct NormalizedTile {
    pub artifact: PathBuf,
    /// Nodata actually written to the artifact header.
    pub nodata: Option<f64>,
    pub coverage_before: Coverage,
    pub coverage_after: Coverage,
    pub filled_pixels: u64,
    pub cache_hit: bool,
    /// Sources contributed nothing to this tile.
    pub empty_input: bool,
}

/// Derive the cache key for one tile under the given options and inputs.
pub fn cache_key(
    tile: Tile,
    inputs: &TileInputs<'_>,
    dem_infos: &[DemSourceInfo],
    options: &BuildOptions,
) -> String {
    let dem_tokens = dem_infos
        .iter()
        .map(|info| format!("{}={}", info.path.display(), info.fingerprint.token()))
        .collect();
    let stack_token = match inputs {
        TileInputs::Stack(stack) => Some(stack.key_token()),
        TileInputs::Mosaic(_) => None,
    };
    CacheKeyInputs {
        dem_tokens,
        target_crs: options.target_crs.clone(),
        resolution: options.resolution,
        kernel: options.kernel_for(options.resolution),
        nodata_policy: format!("backend:{}", BackendProfile::default().nodata),
        fill: options.fill.describe(),
        stack_token,
        tile,
    }
    .derive()
}

/// Normalize one tile, going through the cache.
pub fn normalize_tile(
    tile: Tile,
    inputs: TileInputs<'_>,
    dem_infos: &[DemSourceInfo],
    options: &BuildOptions,
    cache: &NormalizationCache,
    output: &Path,
) -> NormalizeResult<NormalizedTile> {
    let artifact = tile.normalized_artifact(output);
    let key = cache_key(tile, &inputs, dem_infos, options);

    if let Some(cached) = cache.lookup(&key) {
        fsio::copy_atomic(&cached, &artifact).map_err(|source| NormalizeError::Io {
            path: artifact.clone(),
            source,
        })?;
        let ds = open_dataset(&artifact)?;
        let nodata = ds
            .rasterband(1)
            .map_err(|source| RasterError::Io {
                path: artifact.clone(),
                source,
            })?
            .no_data_value();
        let coverage = raster::coverage_of_dataset(&ds, &artifact)?;
        debug!(tile = %tile, key = %&key[..12], "normalized artifact from cache");
        return Ok(NormalizedTile {
            artifact,
            nodata,
            coverage_before: coverage,
            coverage_after: coverage,
            filled_pixels: 0,
            cache_hit: true,
            empty_input: false,
        });
    }

    let grid = TileGrid::for_tile(&tile, options.resolution);
    let (mut canvas, canvas_nodata) = build_canvas(tile, &inputs, &grid, options)?;
    let empty_input = canvas
        .iter()
        .all(|&v| raster::is_nodata(v, Some(canvas_nodata)));

    let coverage_before = coverage_of_array(&canvas, Some(canvas_nodata));

    let fill_outcome = fill::apply(
        &options.fill,
        &mut canvas,
        &grid,
        Some(canvas_nodata),
        options.kernel_for(options.resolution),
    )?;
    let coverage_after = coverage_of_array(&canvas, Some(canvas_nodata));

    let profile = BackendProfile::default();
    raster::remap_to_profile(&mut canvas, Some(canvas_nodata), &profile);

    let written = write_tile_dem(
        &artifact,
        &grid,
        &canvas,
        Some(profile.nodata),
        Some(canvas_nodata),
        options.compression,
        true,
    )?;

    cache.store(&key, tile, &written.path)?;
    info!(
        tile = %tile,
        coverage_before = coverage_before.valid_ratio,
        coverage_after = coverage_after.valid_ratio,
        filled = fill_outcome.filled,
        "normalized tile"
    );

    Ok(NormalizedTile {
        artifact: written.path,
        nodata: written.nodata,
        coverage_before,
        coverage_after,
        filled_pixels: fill_outcome.filled,
        cache_hit: false,
        empty_input,
    })
}

/// Produce the raw tile canvas from the inputs.
fn build_canvas(
    tile: Tile,
    inputs: &TileInputs<'_>,
    grid: &TileGrid,
    options: &BuildOptions,
) -> NormalizeResult<(Vec<f32>, f64)> {
    match inputs {
        TileInputs::Stack(stack) => {
            let kernel = options.kernel_for(options.resolution);
            Ok(stack.blend_tile(grid, kernel)?)
        }
        TileInputs::Mosaic(MosaicSource::Dataset { path, nodata }) => {
            let ds = open_dataset(path)?;
            let kernel = options.kernel_for(options.resolution);
            let (data, effective) = warp_to_grid(&ds, path, grid, kernel, *nodata)?;
            Ok((data, effective))
        }
        TileInputs::Mosaic(mosaic @ MosaicSource::Sources(_)) => {
            let relevant = mosaic.intersecting(tile.bounds());
            let kernel_for = |src_res: f64| options.kernel_for(src_res);
            Ok(raster::merge_tile(&relevant, grid, &kernel_for)?)
        }
    }
}
