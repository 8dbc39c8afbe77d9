//! The per-tile build scheduler.
//!
//! A bounded pool of OS-thread workers drains a backpressured queue of
//! tiles. Each worker runs the strictly-ordered per-tile pipeline
//! (cache/normalize, stage + invoke backend, validate, enrich) and records
//! its [`TileResult`] in the mutex-guarded report aggregator. A failing tile
//! never aborts its peers; cancellation is cooperative at step boundaries.

use std::path::PathBuf;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::BuildMode;
use crate::context::BuildContext;
use crate::enrich::{self, EnrichError, EnrichRequest};
use crate::normalize::{self, TileInputs};
use crate::raster::{DemSourceInfo, MosaicSource};
use crate::report::{
    BuildReport, EnrichmentOutcome, IssueKind, TileIssue, TileResult, TileStatus, ValidationMode,
};
use crate::runner::{self, RunnerJob};
use crate::stack::DemStack;
use crate::tile::Tile;
use crate::validate;

/// Extra queue slots beyond the worker count; producers block after that.
const QUEUE_SLACK: usize = 2;

/// The prepared DEM input for the whole run.
#[derive(Debug)]
pub enum InputSource {
    Mosaic(MosaicSource),
    Stack(DemStack),
}

/// Everything the workers consume, prepared at plan time.
#[derive(Debug)]
pub struct BuildInputs {
    pub dem_infos: Vec<DemSourceInfo>,
    pub source: InputSource,
}

impl BuildInputs {
    fn tile_inputs(&self) -> TileInputs<'_> {
        match &self.source {
            InputSource::Mosaic(mosaic) => TileInputs::Mosaic(mosaic),
            InputSource::Stack(stack) => TileInputs::Stack(stack),
        }
    }
}

/// Run the build over a tile set and return the final report.
///
/// With `BuildMode::Resume`, prior ok/warning results from `prior` are
/// carried forward untouched and their tiles are not re-run.
pub fn run_build(
    ctx: &BuildContext,
    tiles: &[Tile],
    inputs: &BuildInputs,
    prior: Option<&BuildReport>,
) -> BuildReport {
    let mut report = BuildReport::new(ctx.timestamp());

    let mut todo: Vec<Tile> = Vec::new();
    for tile in tiles {
        match (ctx.options.mode, prior.and_then(|p| p.prior_ok(tile))) {
            (BuildMode::Resume, Some(done)) => {
                info!(tile = %tile, "resume: carrying forward prior result");
                report.record(done.clone());
            }
            _ => todo.push(*tile),
        }
    }

    if !todo.is_empty() {
        let workers = ctx.options.worker_count(todo.len());
        info!(tiles = todo.len(), workers, "scheduling tile builds");

        let aggregator = Mutex::new(&mut report);
        let (tx, rx) = crossbeam_channel::bounded::<Tile>(workers + QUEUE_SLACK);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let aggregator = &aggregator;
                scope.spawn(move || {
                    for tile in rx.iter() {
                        let result = if ctx.cancel.is_cancelled() {
                            skipped(tile)
                        } else {
                            process_tile(ctx, tile, inputs.tile_inputs(), &inputs.dem_infos)
                        };
                        aggregator.lock().record(result);
                    }
                });
            }
            drop(rx);

            for tile in &todo {
                // Stop accepting new tiles once cancelled; queued sends
                // block when the pool is saturated (bounded backpressure).
                if ctx.cancel.is_cancelled() {
                    break;
                }
                if tx.send(*tile).is_err() {
                    break;
                }
            }
            drop(tx);
        });
    }

    // Tiles never dequeued (cancelled early) still appear in the report.
    for tile in tiles {
        if !report.tiles.contains_key(&tile.name()) {
            report.record(skipped(*tile));
        }
    }

    report.finalize(ctx.options.continue_on_error, ctx.cancel.is_cancelled());
    report
}

fn skipped(tile: Tile) -> TileResult {
    let mut result = TileResult::new(tile);
    result.status = TileStatus::Skipped;
    result
}

/// Run the strictly-ordered pipeline for one tile.
///
/// Also used by the patch driver with a transient per-tile stack.
pub fn process_tile(
    ctx: &BuildContext,
    tile: Tile,
    tile_inputs: TileInputs<'_>,
    dem_infos: &[DemSourceInfo],
) -> TileResult {
    let start = Instant::now();
    let mut result = TileResult::new(tile);

    if ctx.options.mode == BuildMode::ValidateOnly {
        let dsf = tile.dsf_path(&ctx.scenery_root());
        result.dsf = Some(dsf.clone());
        run_validation(ctx, tile, &dsf, &mut result);
        finish(ctx, start, &mut result);
        return result;
    }

    // Step 1: normalize (through the cache).
    let normalized = match normalize::normalize_tile(
        tile,
        tile_inputs,
        dem_infos,
        &ctx.options,
        &ctx.cache,
        &ctx.output,
    ) {
        Ok(normalized) => normalized,
        Err(e) => {
            result.push_error(TileIssue::new(
                IssueKind::NormalizationFailure,
                format!("normalization failed: {e}"),
            ));
            finish(ctx, start, &mut result);
            return result;
        }
    };
    result.artifact = Some(normalized.artifact.clone());
    result.nodata = normalized.nodata;
    result.coverage_before = Some(normalized.coverage_before);
    result.coverage_after = Some(normalized.coverage_after);
    result.filled_pixels = normalized.filled_pixels;
    result.cache_hit = normalized.cache_hit;

    if normalized.empty_input {
        result.push_warning(TileIssue::new(
            IssueKind::NormalizationFailure,
            "no input carries data for this tile",
        ));
    }

    let coverage = normalized.coverage_after.valid_ratio;
    if coverage < ctx.options.coverage_min {
        let issue = TileIssue::new(
            IssueKind::CoverageBelowThreshold,
            format!(
                "coverage {:.4} below configured minimum {:.4}",
                coverage, ctx.options.coverage_min
            ),
        )
        .with_hint("add a fallback DEM or lower --coverage-min");
        if ctx.options.coverage_hard_fail {
            result.push_error(issue);
            finish(ctx, start, &mut result);
            return result;
        }
        result.push_warning(issue);
    }

    if ctx.cancel.is_cancelled() {
        result.status = TileStatus::Skipped;
        finish(ctx, start, &mut result);
        return result;
    }

    // Step 2: stage and invoke the backend.
    let runner_cmd = match ctx.tools.runner() {
        Ok(cmd) => cmd,
        Err(e) => {
            result.push_error(TileIssue::new(
                IssueKind::BackendFatal,
                e.to_string(),
            ));
            finish(ctx, start, &mut result);
            return result;
        }
    };
    let mut overrides = ctx.options.runner_overrides();
    overrides.push((
        String::from("custom_build_dir"),
        ctx.scenery_root().display().to_string(),
    ));
    let runner_logs = ctx.runner_logs();
    let job = RunnerJob {
        tile,
        artifact: &normalized.artifact,
        backend_root: &ctx.backend_root,
        source_root: ctx.source_root.as_deref(),
        runner_logs: &runner_logs,
        runner_cmd,
        base_overrides: overrides,
        timeout: ctx.options.timeout,
        watchdog: ctx.options.watchdog,
        grace: ctx.options.grace,
        persist_config: ctx.options.persist_runner_config,
    };

    match runner::run_tile(&job, &ctx.config_lock, &ctx.events, &ctx.cancel) {
        Err(e) => {
            result.push_error(TileIssue::new(
                IssueKind::BackendFatal,
                format!("runner orchestration failed: {e}"),
            ));
            finish(ctx, start, &mut result);
            return result;
        }
        Ok(outcome) => {
            result.attempts = outcome.attempts;
            result.backend_command = outcome.command.clone();
            result.events_log = Some(outcome.event_log.clone());
            for warning in outcome.warnings.clone() {
                result.push_warning(warning);
            }
            if outcome.cancelled {
                result.status = TileStatus::Skipped;
                finish(ctx, start, &mut result);
                return result;
            }
            if let Some(error) = outcome.error.clone() {
                result.push_error(error);
                finish(ctx, start, &mut result);
                return result;
            }
        }
    }
    result.dsf = Some(tile.dsf_path(&ctx.scenery_root()));

    // Step 3: validate.
    if let Some(dsf) = result.dsf.clone() {
        run_validation(ctx, tile, &dsf, &mut result);
        if result.status == TileStatus::Error {
            finish(ctx, start, &mut result);
            return result;
        }
    }

    // Step 4: enrich.
    if let Some(xp12_source) = ctx.options.xp12_source.clone() {
        if let Some(dsf) = result.dsf.clone() {
            run_enrichment(ctx, tile, &dsf, &xp12_source, &mut result);
        }
    }

    finish(ctx, start, &mut result);
    result
}

fn run_validation(ctx: &BuildContext, tile: Tile, dsf: &PathBuf, result: &mut TileResult) {
    if ctx.options.validation == ValidationMode::None {
        return;
    }
    let dsftool = match ctx.tools.dsftool() {
        Ok(cmd) => cmd,
        Err(e) => {
            result.push_error(TileIssue::new(IssueKind::ValidationFailure, e.to_string()));
            return;
        }
    };
    match validate::validate_tile(dsftool, &tile, dsf, ctx.options.validation, &ctx.scratch()) {
        Err(e) => {
            result.push_error(TileIssue::new(
                IssueKind::ValidationFailure,
                format!("validation tooling failed: {e}"),
            ));
        }
        Ok(outcome) => {
            let passed = outcome.passed;
            let details = outcome.details.clone();
            result.validation = Some(outcome);
            if !passed {
                let issue = TileIssue::new(
                    IssueKind::ValidationFailure,
                    details.unwrap_or_else(|| String::from("validation failed")),
                );
                let lenient = ctx.options.validation_lenient
                    && ctx.options.validation == ValidationMode::Bounds;
                if lenient {
                    result.push_warning(issue);
                } else {
                    result.push_error(issue);
                }
            }
        }
    }
}

fn run_enrichment(
    ctx: &BuildContext,
    tile: Tile,
    dsf: &PathBuf,
    xp12_source: &PathBuf,
    result: &mut TileResult,
) {
    let dsftool = match ctx.tools.dsftool() {
        Ok(cmd) => cmd,
        Err(e) => {
            result.push_error(TileIssue::new(IssueKind::EnrichmentFailure, e.to_string()));
            return;
        }
    };
    let scratch = ctx.scratch().join("enrich");
    let request = EnrichRequest {
        tile,
        dsf,
        reference_root: xp12_source,
        scratch: &scratch,
    };
    match enrich::enrich_tile(dsftool, &request) {
        Ok(outcome) => result.enrichment = Some(outcome),
        Err(EnrichError::MissingReference(reference)) => {
            let issue = TileIssue::new(
                IssueKind::EnrichmentFailure,
                format!("no reference DSF at {}", reference.display()),
            )
            .with_hint("point --xp12-source at the XP12 Global Scenery root");
            if ctx.options.xp12_strict {
                result.push_error(issue);
            } else {
                warn!(tile = %tile, "reference tile missing; keeping unenriched DSF");
                result.push_warning(issue);
                result.enrichment = Some(EnrichmentOutcome {
                    applied: false,
                    layers: Vec::new(),
                    reference: Some(reference),
                });
            }
        }
        Err(e) => {
            result.push_error(TileIssue::new(
                IssueKind::EnrichmentFailure,
                e.to_string(),
            ));
        }
    }
}

fn finish(ctx: &BuildContext, start: Instant, result: &mut TileResult) {
    if !ctx.options.deterministic {
        result.duration_ms = Some(start.elapsed().as_millis() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Fingerprint;
    use crate::config::BuildOptions;
    use crate::tools::ToolPaths;
    use std::path::PathBuf;
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

    fn inputs() -> BuildInputs {
        BuildInputs {
            dem_infos: vec![DemSourceInfo {
                path: PathBuf::from("/missing/dem.tif"),
                crs_wkt: None,
                bounds_native: (8.0, 47.0, 9.0, 48.0),
                bounds_wgs84: (8.0, 47.0, 9.0, 48.0),
                nodata: Some(-9999.0),
                resolution: (0.01, 0.01),
                dtype: String::from("Float32"),
                fingerprint: Fingerprint::Basic { size: 1, mtime_ms: 1 },
            }],
            source: InputSource::Mosaic(MosaicSource::Sources(Vec::new())),
        }
    }

    #[test]
    fn test_cancelled_build_reports_all_tiles_skipped() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, BuildOptions::default());
        ctx.cancel.cancel();

        let tiles = vec![
            Tile::parse("+47+008").unwrap(),
            Tile::parse("+47+009").unwrap(),
        ];
        let report = run_build(&ctx, &tiles, &inputs(), None);

        assert_eq!(report.tiles.len(), 2);
        assert!(report
            .tiles
            .values()
            .all(|r| r.status == TileStatus::Skipped));
        assert_eq!(report.exit_code(), 10);
    }

    #[test]
    fn test_resume_carries_prior_results_verbatim() {
        let temp = TempDir::new().unwrap();
        let mut options = BuildOptions::default();
        options.mode = BuildMode::Resume;
        let ctx = context(&temp, options);

        let tile = Tile::parse("+47+008").unwrap();
        let mut prior = BuildReport::new(None);
        let mut done = TileResult::new(tile);
        done.nodata = Some(-32768.0);
        done.attempts = 2;
        prior.record(done);

        // Cancel so the (unbuildable) remainder never actually runs.
        ctx.cancel.cancel();
        let tiles = vec![tile, Tile::parse("+47+009").unwrap()];
        let report = run_build(&ctx, &tiles, &inputs(), Some(&prior));

        let carried = &report.tiles["+47+008"];
        assert_eq!(carried.status, TileStatus::Ok);
        assert_eq!(carried.attempts, 2);
        assert_eq!(carried.nodata, Some(-32768.0));
        assert_eq!(report.tiles["+47+009"].status, TileStatus::Skipped);
    }

    #[test]
    fn test_validate_only_without_dsftool_errors_per_tile() {
        let temp = TempDir::new().unwrap();
        let mut options = BuildOptions::default();
        options.mode = BuildMode::ValidateOnly;
        let ctx = context(&temp, options);

        let tile = Tile::parse("+47+008").unwrap();
        let result = process_tile(
            &ctx,
            tile,
            TileInputs::Mosaic(&MosaicSource::Sources(Vec::new())),
            &[],
        );
        assert_eq!(result.status, TileStatus::Error);
        assert_eq!(result.errors[0].kind, IssueKind::ValidationFailure);
        // Error isolation: the error lives in the result, not a panic.
    }

    #[test]
    fn test_normalization_failure_is_isolated_per_tile() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, BuildOptions::default());

        // Mosaic dataset path that does not exist: normalization fails, the
        // tile records it, nothing panics.
        let source = MosaicSource::Dataset {
            path: temp.path().join("missing-mosaic.tif"),
            nodata: None,
        };
        let tile = Tile::parse("+47+008").unwrap();
        let result = process_tile(&ctx, tile, TileInputs::Mosaic(&source), &[]);

        assert_eq!(result.status, TileStatus::Error);
        assert_eq!(result.errors[0].kind, IssueKind::NormalizationFailure);
        assert!(result.duration_ms.is_some());
    }
}
