//! Multi-source mosaic strategies.
//!
//! The mosaic strategy is a plan-time choice. `Materialize` produces one
//! merged GeoTIFF up front (simple, heavy on disk and memory bandwidth),
//! `Virtual` builds a VRT descriptor that merges lazily per read, and
//! `PerTile` defers merging entirely: each tile warps only the sources that
//! intersect it, never the full union.

use std::path::{Path, PathBuf};

use gdal::programs::raster::build_vrt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    bounds_intersect, open_dataset, reproject_into, warp_to_grid, write_tile_dem, Compression,
    DemSourceInfo, RasterError, RasterResult, ResamplingKernel, TileGrid,
};

/// Plan-time mosaic strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MosaicStrategy {
    /// Merge all inputs into one GeoTIFF before tiling.
    Materialize,
    /// Build a VRT; sources are merged lazily per read.
    Virtual,
    /// Merge per tile, touching only intersecting sources.
    #[default]
    PerTile,
}

impl MosaicStrategy {
    /// Canonical name, as used in CLI flags and the build plan.
    pub fn as_str(&self) -> &'static str {
        match self {
            MosaicStrategy::Materialize => "materialize",
            MosaicStrategy::Virtual => "virtual",
            MosaicStrategy::PerTile => "per-tile",
        }
    }
}

impl std::str::FromStr for MosaicStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "materialize" => Ok(MosaicStrategy::Materialize),
            "virtual" => Ok(MosaicStrategy::Virtual),
            "per-tile" => Ok(MosaicStrategy::PerTile),
            other => Err(format!(
                "unknown mosaic strategy '{other}' (expected materialize|virtual|per-tile)"
            )),
        }
    }
}

/// Prepared mosaic input for the tile pipeline.
#[derive(Debug, Clone)]
pub enum MosaicSource {
    /// A single merged dataset (materialized file or VRT).
    Dataset { path: PathBuf, nodata: Option<f64> },
    /// Per-tile merging over the original sources.
    Sources(Vec<DemSourceInfo>),
}

impl MosaicSource {
    /// The sources relevant for a tile with the given EPSG:4326 bounds.
    ///
    /// For merged datasets that is the dataset itself; for per-tile merging
    /// it is the intersecting subset, in input order.
    pub fn intersecting(&self, bounds: (f64, f64, f64, f64)) -> Vec<&DemSourceInfo> {
        match self {
            MosaicSource::Dataset { .. } => Vec::new(),
            MosaicSource::Sources(sources) => sources
                .iter()
                .filter(|s| bounds_intersect(s.bounds_wgs84, bounds))
                .collect(),
        }
    }
}

/// Prepare the mosaic input per the chosen strategy.
///
/// `resolution` is the target degrees/pixel; intermediate files land in
/// `workdir`. Inputs whose CRS differs from the geographic target are warped
/// before merging, so the mosaic output CRS is always the target CRS.
pub fn prepare_mosaic(
    sources: Vec<DemSourceInfo>,
    strategy: MosaicStrategy,
    resolution: f64,
    kernel: ResamplingKernel,
    workdir: &Path,
) -> RasterResult<MosaicSource> {
    if sources.is_empty() {
        return Err(RasterError::Mosaic(String::from("no DEM sources")));
    }

    match strategy {
        MosaicStrategy::PerTile => Ok(MosaicSource::Sources(sources)),
        MosaicStrategy::Materialize => materialize(&sources, resolution, kernel, workdir),
        MosaicStrategy::Virtual => virtual_mosaic(&sources, kernel, workdir),
    }
}

/// Merge the given sources onto a tile canvas, in input order, later
/// sources overwriting earlier ones where they carry data.
///
/// The canvas sentinel is NaN; fill and the backend profile normalize it
/// downstream. `kernel_for` picks a kernel per source resolution.
pub fn merge_tile(
    sources: &[&DemSourceInfo],
    grid: &TileGrid,
    kernel_for: &dyn Fn(f64) -> ResamplingKernel,
) -> RasterResult<(Vec<f32>, f64)> {
    let mut canvas = vec![f32::NAN; grid.pixel_count()];
    for source in sources {
        let ds = open_dataset(&source.path)?;
        let kernel = kernel_for(source.resolution_degrees());
        let (data, nodata) = warp_to_grid(&ds, &source.path, grid, kernel, source.nodata)?;
        for (cell, &sample) in canvas.iter_mut().zip(&data) {
            if !super::is_nodata(sample, Some(nodata)) {
                *cell = sample;
            }
        }
    }
    Ok((canvas, f64::NAN))
}

fn materialize(
    sources: &[DemSourceInfo],
    resolution: f64,
    kernel: ResamplingKernel,
    workdir: &Path,
) -> RasterResult<MosaicSource> {
    let mut union = sources[0].bounds_wgs84;
    for src in &sources[1..] {
        let b = src.bounds_wgs84;
        union = (
            union.0.min(b.0),
            union.1.min(b.1),
            union.2.max(b.2),
            union.3.max(b.3),
        );
    }

    let grid = TileGrid::for_bounds(union, resolution, resolution);
    let nodata = sources.iter().find_map(|s| s.nodata).unwrap_or(f64::NAN);
    let out_path = workdir.join("mosaic.tif");

    // Seed an empty canvas file, then warp every input into it in order so
    // later inputs win where they overlap earlier ones.
    let empty = vec![nodata as f32; grid.pixel_count()];
    write_tile_dem(
        &out_path,
        &grid,
        &empty,
        Some(nodata),
        None,
        Compression::Lzw,
        false,
    )?;

    let dst = super::open_dataset_for_update(&out_path)?;
    for source in sources {
        let src = open_dataset(&source.path)?;
        reproject_into(&src, &dst, kernel, &source.path.display().to_string())?;
    }
    drop(dst);

    info!(
        mosaic = %out_path.display(),
        sources = sources.len(),
        width = grid.width,
        height = grid.height,
        "materialized mosaic"
    );
    Ok(MosaicSource::Dataset {
        path: out_path,
        nodata: Some(nodata),
    })
}

fn virtual_mosaic(
    sources: &[DemSourceInfo],
    kernel: ResamplingKernel,
    workdir: &Path,
) -> RasterResult<MosaicSource> {
    // VRT members must share the target CRS; warp the stragglers first.
    let mut member_paths = Vec::with_capacity(sources.len());
    for (index, source) in sources.iter().enumerate() {
        let geographic = match &source.crs_wkt {
            None => true,
            Some(wkt) => crate::crs::spatial_ref(wkt)?.is_geographic(),
        };
        if geographic {
            member_paths.push(source.path.clone());
            continue;
        }

        let res = source.resolution_degrees();
        let grid = TileGrid::for_bounds(source.bounds_wgs84, res, res);
        let warped_path = workdir.join(format!("warped_{index:03}.tif"));
        let src = open_dataset(&source.path)?;
        let (data, nodata) = warp_to_grid(&src, &source.path, &grid, kernel, source.nodata)?;
        write_tile_dem(
            &warped_path,
            &grid,
            &data,
            Some(nodata),
            None,
            Compression::Lzw,
            false,
        )?;
        debug!(
            src = %source.path.display(),
            warped = %warped_path.display(),
            "pre-warped divergent-CRS source for VRT"
        );
        member_paths.push(warped_path);
    }

    let members: Vec<_> = member_paths
        .iter()
        .map(|p| open_dataset(p))
        .collect::<RasterResult<_>>()?;

    let vrt_path = workdir.join("mosaic.vrt");
    let vrt = build_vrt(Some(&vrt_path), &members, None).map_err(|e| {
        RasterError::Mosaic(format!("VRT construction failed: {e}"))
    })?;
    drop(vrt);

    let nodata = sources.iter().find_map(|s| s.nodata);
    Ok(MosaicSource::Dataset {
        path: vrt_path,
        nodata,
    })
}
