//! Patch rebuilds.
//!
//! A patch plan names tiles and replacement DEMs. Each listed tile is
//! re-normalized with a transient two-layer stack (the tile's existing
//! normalized artifact as the base, the patch DEM on top at the highest
//! priority, optionally clipped to an AOI) and pushed through the regular
//! per-tile pipeline into a separate patched output tree. Peer tiles are
//! untouched; their artifacts and cache entries are reused as-is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::context::BuildContext;
use crate::normalize::TileInputs;
use crate::raster::probe_dem;
use crate::report::{BuildReport, IssueKind, TileIssue, TileResult};
use crate::scheduler;
use crate::stack::{Aoi, AoiSpec, DemStack, StackLayer};
use crate::tile::Tile;

/// Schema version of the patch plan input and the patch report.
pub const PATCH_SCHEMA_VERSION: u32 = 1;

/// Result type for patch operations.
pub type PatchResult<T> = Result<T, PatchError>;

/// Errors from patch plan handling.
#[derive(Debug, Error)]
pub enum PatchError {
    /// Plan file could not be read.
    #[error("failed to read patch plan {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Plan file is not valid JSON for the schema.
    #[error("failed to parse patch plan {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The plan lists no patches.
    #[error("patch plan has no entries")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct PatchPlanFile {
    #[serde(default)]
    #[allow(dead_code)]
    schema_version: u32,
    patches: Vec<PatchEntrySpec>,
}

#[derive(Debug, Deserialize)]
struct PatchEntrySpec {
    tile: Tile,
    dem: PathBuf,
    #[serde(default)]
    aoi: Option<AoiSpec>,
    #[serde(default)]
    nodata: Option<f64>,
}

/// One tile patch.
#[derive(Debug, Clone)]
pub struct PatchEntry {
    pub tile: Tile,
    pub dem: PathBuf,
    pub aoi: Option<Aoi>,
    pub nodata: Option<f64>,
}

/// A parsed patch plan.
#[derive(Debug, Clone)]
pub struct PatchPlan {
    pub patches: Vec<PatchEntry>,
}

impl PatchPlan {
    /// Load `{schema_version, patches: [{tile, dem, aoi?, nodata?}]}`.
    pub fn load(path: &Path) -> PatchResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| PatchError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: PatchPlanFile =
            serde_json::from_str(&text).map_err(|source| PatchError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if file.patches.is_empty() {
            return Err(PatchError::Empty);
        }
        Ok(Self {
            patches: file
                .patches
                .into_iter()
                .map(|spec| PatchEntry {
                    tile: spec.tile,
                    dem: spec.dem,
                    aoi: spec.aoi.map(Aoi::from),
                    nodata: spec.nodata,
                })
                .collect(),
        })
    }
}

/// The patch report written next to the patched build report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchReport {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// The build tree the patch was based on.
    pub source_output: PathBuf,
    /// The patched build tree.
    pub patched_output: PathBuf,
    pub tiles: Vec<Tile>,
}

/// Default patched output tree: a `-patched` sibling of the source output.
pub fn patched_output_dir(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("output"));
    output.with_file_name(format!("{name}-patched"))
}

/// Apply a patch plan. `ctx.output` is the patched tree; `source_output`
/// is the original build the artifacts come from.
pub fn run_patch(
    ctx: &BuildContext,
    source_output: &Path,
    plan: &PatchPlan,
) -> (BuildReport, PatchReport) {
    let mut report = BuildReport::new(ctx.timestamp());

    for entry in &plan.patches {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let result = patch_one(ctx, source_output, entry);
        report.record(result);
    }
    for entry in &plan.patches {
        if !report.tiles.contains_key(&entry.tile.name()) {
            let mut result = TileResult::new(entry.tile);
            result.status = crate::report::TileStatus::Skipped;
            report.record(result);
        }
    }
    report.finalize(ctx.options.continue_on_error, ctx.cancel.is_cancelled());

    let patch_report = PatchReport {
        schema_version: PATCH_SCHEMA_VERSION,
        created_at: ctx.timestamp(),
        source_output: source_output.to_path_buf(),
        patched_output: ctx.output.clone(),
        tiles: plan.patches.iter().map(|p| p.tile).collect(),
    };
    (report, patch_report)
}

fn patch_one(ctx: &BuildContext, source_output: &Path, entry: &PatchEntry) -> TileResult {
    let base_artifact = entry.tile.normalized_artifact(source_output);
    if !base_artifact.is_file() {
        let mut result = TileResult::new(entry.tile);
        result.push_error(
            TileIssue::new(
                IssueKind::InvalidInput,
                format!(
                    "no normalized artifact for {} under {}",
                    entry.tile,
                    source_output.display()
                ),
            )
            .with_hint("run a full build first; patches rebase on its artifacts"),
        );
        return result;
    }

    // The patch DEM outranks the base artifact; AOI clips it.
    let stack = match DemStack::new(vec![
        StackLayer {
            path: base_artifact,
            priority: 0,
            aoi: None,
            nodata: None,
        },
        StackLayer {
            path: entry.dem.clone(),
            priority: 1,
            aoi: entry.aoi.clone(),
            nodata: entry.nodata,
        },
    ])
    .and_then(|stack| {
        stack
            .validate(entry.nodata.or(ctx.options.default_nodata))
            .map(|()| stack)
    }) {
        Ok(stack) => stack,
        Err(e) => {
            let mut result = TileResult::new(entry.tile);
            result.push_error(TileIssue::new(
                IssueKind::InvalidInput,
                format!("patch stack rejected: {e}"),
            ));
            return result;
        }
    };

    let mut dem_infos = Vec::new();
    for layer in stack.layers() {
        match probe_dem(&layer.path, ctx.options.provenance) {
            Ok(info) => dem_infos.push(info),
            Err(e) => {
                let mut result = TileResult::new(entry.tile);
                result.push_error(TileIssue::new(
                    IssueKind::InvalidInput,
                    format!("unreadable patch input {}: {e}", layer.path.display()),
                ));
                return result;
            }
        }
    }

    info!(tile = %entry.tile, dem = %entry.dem.display(), "rebuilding patched tile");
    scheduler::process_tile(ctx, entry.tile, TileInputs::Stack(&stack), &dem_infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_patched_output_dir_is_sibling() {
        assert_eq!(
            patched_output_dir(Path::new("/builds/alps")),
            Path::new("/builds/alps-patched")
        );
    }

    #[test]
    fn test_plan_parses_both_aoi_shapes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("patch.json");
        std::fs::write(
            &path,
            r#"{
              "schema_version": 1,
              "patches": [
                {"tile": "+47+008", "dem": "/dem/fix.tif", "nodata": -9999,
                 "aoi": "POLYGON((8 47, 9 47, 9 48, 8 48, 8 47))"},
                {"tile": "-03+017", "dem": "/dem/other.tif"}
              ]
            }"#,
        )
        .unwrap();

        let plan = PatchPlan::load(&path).unwrap();
        assert_eq!(plan.patches.len(), 2);
        assert_eq!(plan.patches[0].tile, Tile::parse("+47+008").unwrap());
        assert!(plan.patches[0].aoi.is_some());
        assert!(plan.patches[1].aoi.is_none());
    }

    #[test]
    fn test_empty_plan_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("patch.json");
        std::fs::write(&path, r#"{"schema_version": 1, "patches": []}"#).unwrap();
        assert!(matches!(PatchPlan::load(&path), Err(PatchError::Empty)));
    }

    #[test]
    fn test_bad_tile_name_in_plan_is_a_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("patch.json");
        std::fs::write(
            &path,
            r#"{"schema_version": 1, "patches": [{"tile": "N47E008", "dem": "/d.tif"}]}"#,
        )
        .unwrap();
        assert!(matches!(PatchPlan::load(&path), Err(PatchError::Parse { .. })));
    }
}
