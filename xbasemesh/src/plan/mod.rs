//! Plan-time input resolution.
//!
//! Everything that must fail *before* any tile runs happens here: CRS
//! gating, DEM probing, stack validation, tile-set derivation, mosaic
//! preparation, and tool-version drift. The result is the worker-ready
//! [`BuildInputs`] plus the `build_plan.json` / `build_config.lock.json`
//! documents.

use std::path::PathBuf;

use tracing::{info, warn};

use crate::context::BuildContext;
use crate::crs;
use crate::error::{BuildError, BuildResult};
use crate::raster::{prepare_mosaic, probe_dem, DemSourceInfo};
use crate::report::{
    BuildConfigLock, BuildPlan, PlanOptions, ToolVersion, REPORT_SCHEMA_VERSION,
};
use crate::scheduler::{BuildInputs, InputSource};
use crate::stack::DemStack;
use crate::tile::{Tile, MAX_LAT, MAX_LON, MIN_LAT, MIN_LON};
use crate::tools;

/// The user's DEM input: plain files or a stack file.
#[derive(Debug, Clone)]
pub enum DemRequest {
    Files(Vec<PathBuf>),
    StackFile(PathBuf),
}

/// The user's tile selection: explicit names or everything the inputs
/// cover.
#[derive(Debug, Clone)]
pub enum TileSelection {
    Explicit(Vec<Tile>),
    Auto,
}

/// A fully resolved build: inputs for the scheduler plus the pre-run
/// documents.
pub struct ResolvedBuild {
    pub tiles: Vec<Tile>,
    pub inputs: BuildInputs,
    pub plan: BuildPlan,
    pub lock: BuildConfigLock,
}

/// Resolve and validate a build request. Fails fast with
/// [`BuildError::InvalidInput`]-class errors; nothing has touched the
/// output tree except the mosaic workdir.
pub fn resolve(
    ctx: &BuildContext,
    dems: DemRequest,
    selection: TileSelection,
) -> BuildResult<ResolvedBuild> {
    // The tile grid is geographic-degrees only; a projected target CRS can
    // only produce silently wrong tiles, so it is rejected outright.
    crs::ensure_geographic_target(&ctx.options.target_crs).map_err(|e| {
        BuildError::invalid_with_hint(
            e.to_string(),
            "tile grids are 1°x1°; keep the target CRS geographic (EPSG:4326)",
        )
    })?;

    let (dem_infos, source) = match dems {
        DemRequest::StackFile(path) => {
            let stack = DemStack::load(&path)?;
            stack.validate(ctx.options.default_nodata)?;
            let mut infos = Vec::new();
            for layer in stack.layers() {
                infos.push(probe(ctx, layer.path.clone())?);
            }
            (infos, InputSource::Stack(stack))
        }
        DemRequest::Files(paths) => {
            if paths.is_empty() {
                return Err(BuildError::invalid("no DEM inputs given"));
            }
            if paths.len() > 1 && !ctx.options.normalize {
                // Open question resolved: guessing "already prepared" would
                // silently mis-build on incomplete coverage.
                return Err(BuildError::invalid_with_hint(
                    "multiple DEM inputs require normalization",
                    "drop normalize=false, or describe prepared inputs in a stack file",
                ));
            }
            let mut infos = Vec::new();
            for path in paths {
                infos.push(probe(ctx, path)?);
            }
            let workdir = ctx.mosaic_workdir();
            std::fs::create_dir_all(&workdir).map_err(|source| {
                BuildError::Raster(crate::raster::RasterError::Fs {
                    path: workdir.clone(),
                    source,
                })
            })?;
            let kernel = ctx.options.kernel_for(
                infos
                    .iter()
                    .map(|i| i.resolution_degrees())
                    .fold(f64::INFINITY, f64::min),
            );
            let mosaic = prepare_mosaic(
                infos.clone(),
                ctx.options.mosaic,
                ctx.options.resolution,
                kernel,
                &workdir,
            )?;
            (infos, InputSource::Mosaic(mosaic))
        }
    };

    let tiles = match selection {
        TileSelection::Explicit(tiles) => {
            if tiles.is_empty() {
                return Err(BuildError::invalid("no tiles selected"));
            }
            tiles
        }
        TileSelection::Auto => {
            let tiles = tiles_covering(&dem_infos)?;
            info!(tiles = tiles.len(), "derived tile set from input coverage");
            tiles
        }
    };

    let tool_versions = probe_tool_versions(ctx);
    for drifted in tool_versions.iter().filter(|v| v.drift) {
        warn!(
            tool = %drifted.name,
            pinned = ?drifted.pinned,
            observed = ?drifted.observed,
            "tool version drifts from the pinned version"
        );
    }

    let plan = BuildPlan {
        schema_version: REPORT_SCHEMA_VERSION,
        created_at: ctx.timestamp(),
        output: ctx.output.clone(),
        tiles: tiles.clone(),
        dem_inputs: dem_infos.clone(),
        options: PlanOptions {
            resolution: ctx.options.resolution,
            resampling: ctx
                .options
                .resampling
                .map(|k| k.as_str().to_string())
                .unwrap_or_else(|| String::from("auto")),
            resampling_policy: ctx.options.resampling_policy,
            fill: ctx.options.fill.describe(),
            mosaic_strategy: ctx.options.mosaic.as_str().to_string(),
            nodata_policy: String::from("backend:-32768"),
            coverage_min: ctx.options.coverage_min,
            coverage_hard_fail: ctx.options.coverage_hard_fail,
            validation: ctx.options.validation,
            continue_on_error: ctx.options.continue_on_error,
            workers: ctx.options.workers,
        },
        tool_commands: ctx.tools.plan_commands(),
        tool_versions,
        provenance_mode: ctx.options.provenance,
    };

    let lock = BuildConfigLock {
        schema_version: REPORT_SCHEMA_VERSION,
        created_at: ctx.timestamp(),
        values: ctx.options.lock_values(),
    };

    Ok(ResolvedBuild {
        tiles,
        inputs: BuildInputs {
            dem_infos,
            source,
        },
        plan,
        lock,
    })
}

fn probe(ctx: &BuildContext, path: PathBuf) -> BuildResult<DemSourceInfo> {
    if !path.is_file() {
        return Err(BuildError::invalid(format!(
            "DEM input does not exist: {}",
            path.display()
        )));
    }
    probe_dem(&path, ctx.options.provenance).map_err(|e| {
        BuildError::invalid_with_hint(
            format!("unreadable DEM {}: {e}", path.display()),
            "inputs must be georeferenced rasters readable by GDAL",
        )
    })
}

/// All tiles intersecting the union of input coverage.
fn tiles_covering(infos: &[DemSourceInfo]) -> BuildResult<Vec<Tile>> {
    let mut tiles = Vec::new();
    for info in infos {
        let (west, south, east, north) = info.bounds_wgs84;
        let lat_lo = (south.floor() as i32).clamp(MIN_LAT, MAX_LAT);
        let lat_hi = ((north - 1e-9).floor() as i32).clamp(MIN_LAT, MAX_LAT);
        let lon_lo = (west.floor() as i32).clamp(MIN_LON, MAX_LON);
        let lon_hi = ((east - 1e-9).floor() as i32).clamp(MIN_LON, MAX_LON);
        for lat in lat_lo..=lat_hi {
            for lon in lon_lo..=lon_hi {
                let tile = Tile::new(lat, lon)?;
                if !tiles.contains(&tile) {
                    tiles.push(tile);
                }
            }
        }
    }
    if tiles.is_empty() {
        return Err(BuildError::invalid(
            "inputs cover no tiles; give --tiles explicitly",
        ));
    }
    tiles.sort();
    Ok(tiles)
}

fn probe_tool_versions(ctx: &BuildContext) -> Vec<ToolVersion> {
    let mut versions = Vec::new();
    let mut check = |name: &str, cmd: &Option<crate::tools::ToolCommand>| {
        let observed = cmd.as_ref().and_then(tools::probe_version);
        let pinned = ctx.options.pinned_tool_versions.get(name).cloned();
        versions.push(tools::version_drift(
            name,
            pinned.as_deref(),
            observed.as_deref(),
        ));
    };
    check("dsftool", &ctx.tools.dsftool);
    check("ddstool", &ctx.tools.ddstool);
    check("runner", &ctx.tools.runner);
    check("sevenzip", &ctx.tools.sevenzip);
    versions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Fingerprint;
    use crate::config::BuildOptions;
    use crate::tools::ToolPaths;
    use tempfile::TempDir;

    fn context(temp: &TempDir, options: BuildOptions) -> BuildContext {
        BuildContext::new(
            options,
            ToolPaths {
                dsftool: None,
                ddstool: None,
                runner: None,
                sevenzip: None,
            },
            temp.path().join("out"),
            temp.path().join("backend"),
            None,
        )
    }

    fn info(bounds: (f64, f64, f64, f64)) -> DemSourceInfo {
        DemSourceInfo {
            path: PathBuf::from("/dem/x.tif"),
            crs_wkt: None,
            bounds_native: bounds,
            bounds_wgs84: bounds,
            nodata: None,
            resolution: (0.01, 0.01),
            dtype: String::from("Float32"),
            fingerprint: Fingerprint::Basic { size: 1, mtime_ms: 1 },
        }
    }

    #[test]
    fn test_projected_target_crs_rejected_at_plan_time() {
        let temp = TempDir::new().unwrap();
        let mut options = BuildOptions::default();
        options.target_crs = String::from("EPSG:3857");
        let ctx = context(&temp, options);

        let err = resolve(
            &ctx,
            DemRequest::Files(vec![PathBuf::from("/dem/a.tif")]),
            TileSelection::Auto,
        )
        .unwrap_err();
        assert_eq!(err.reason_code(), "invalid-input");
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_multi_dem_without_normalize_rejected() {
        let temp = TempDir::new().unwrap();
        let mut options = BuildOptions::default();
        options.normalize = false;
        let ctx = context(&temp, options);

        let err = resolve(
            &ctx,
            DemRequest::Files(vec![PathBuf::from("/a.tif"), PathBuf::from("/b.tif")]),
            TileSelection::Auto,
        )
        .unwrap_err();
        assert!(err.to_string().contains("require normalization"));
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, BuildOptions::default());
        assert!(resolve(&ctx, DemRequest::Files(Vec::new()), TileSelection::Auto).is_err());
    }

    #[test]
    fn test_tiles_covering_spans_and_dedups() {
        // One source spanning two tiles plus an overlapping one.
        let infos = vec![
            info((7.4, 46.5, 8.6, 47.2)),
            info((8.0, 47.0, 8.2, 47.1)),
        ];
        let tiles = tiles_covering(&infos).unwrap();
        let names: Vec<String> = tiles.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["+46+007", "+46+008", "+47+007", "+47+008"]);
    }

    #[test]
    fn test_tiles_covering_exact_integer_bounds() {
        // A 1x1 degree source must yield exactly its own tile, not a
        // neighbor strip from the exclusive east/north edge.
        let tiles = tiles_covering(&[info((8.0, 47.0, 9.0, 48.0))]).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].name(), "+47+008");
    }
}
