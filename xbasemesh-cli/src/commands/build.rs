//! The build command: DEM inputs to DSF tiles.

use std::path::PathBuf;

use clap::Args;

use xbasemesh::config::{BuildMode, DensityPreset};
use xbasemesh::fill::FillStrategy;
use xbasemesh::plan::{self, DemRequest, TileSelection};
use xbasemesh::raster::{Compression, MosaicStrategy, ResamplingKernel};
use xbasemesh::report::{
    self, ValidationMode, BUILD_LOCK_FILE, BUILD_PLAN_FILE, BUILD_REPORT_FILE,
};
use xbasemesh::cache::{ProvenanceMode, VerifyMode};
use xbasemesh::{scheduler, BuildContext, BuildError};

use super::common::{self, Common};

#[derive(Args)]
pub struct BuildArgs {
    /// DEM input file(s); repeatable.
    #[arg(long = "dem", value_name = "PATH")]
    dems: Vec<PathBuf>,

    /// DEM stack file instead of plain inputs.
    #[arg(long, conflicts_with = "dems")]
    stack: Option<PathBuf>,

    /// Tiles to build (e.g. "+47+008,+47+009"); omit for auto-derivation.
    #[arg(long = "tiles", value_name = "NAMES")]
    tiles: Vec<String>,

    /// Output directory (reports, normalized artifacts, scenery).
    #[arg(long)]
    output: PathBuf,

    /// Mesh backend installation root (or `[paths] backend_root`).
    #[arg(long)]
    backend: Option<PathBuf>,

    /// Repository source root for the runner's module path.
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Target resolution in degrees/pixel.
    #[arg(long)]
    resolution: Option<f64>,

    /// Resampling kernel (nearest|bilinear|cubic|average|lanczos).
    #[arg(long)]
    resampling: Option<ResamplingKernel>,

    /// Fill strategy (none|constant:V|interpolate|fallback:PATH).
    #[arg(long)]
    fill: Option<FillStrategy>,

    /// Fallback DEM for interpolate fill.
    #[arg(long)]
    fill_fallback: Option<PathBuf>,

    /// Mosaic strategy (materialize|virtual|per-tile).
    #[arg(long)]
    mosaic: Option<MosaicStrategy>,

    /// Artifact compression (none|lzw|deflate).
    #[arg(long)]
    compression: Option<Compression>,

    /// Worker threads; 0 = auto.
    #[arg(long)]
    workers: Option<usize>,

    /// Mesh density preset (default|high|ultra).
    #[arg(long)]
    density: Option<DensityPreset>,

    /// Skip tiles already ok in the existing report.
    #[arg(long, conflicts_with = "validate_only")]
    resume: bool,

    /// Only re-validate existing DSFs.
    #[arg(long)]
    validate_only: bool,

    /// Keep going when a tile fails (overall status becomes partial).
    #[arg(long)]
    continue_on_error: Option<bool>,

    /// DSF validation mode (none|bounds|roundtrip).
    #[arg(long)]
    validation: Option<ValidationMode>,

    /// Validation pool size; 0 = default.
    #[arg(long)]
    validation_jobs: Option<usize>,

    /// Minimum acceptable coverage ratio after fill.
    #[arg(long)]
    coverage_min: Option<f64>,

    /// Treat low coverage as an error.
    #[arg(long)]
    coverage_hard_fail: bool,

    /// XP12 Global Scenery root for raster enrichment.
    #[arg(long)]
    xp12_source: Option<PathBuf>,

    /// Escalate a missing reference tile to an error.
    #[arg(long)]
    xp12_strict: bool,

    /// Omit timestamps/durations for byte-stable documents.
    #[arg(long)]
    deterministic: bool,

    /// Leave the patched backend config in place (debugging aid).
    #[arg(long)]
    persist_runner_config: bool,

    /// SHA-256 fingerprints instead of size+mtime.
    #[arg(long)]
    strict_provenance: bool,

    /// Re-hash cached artifacts before reuse.
    #[arg(long)]
    verify_cache_content: bool,
}

pub fn run(common: &Common, args: BuildArgs) -> i32 {
    match execute(common, args) {
        Ok(code) => code,
        Err(e) => common.fail(&e),
    }
}

fn execute(common: &Common, args: BuildArgs) -> Result<i32, BuildError> {
    let resolved = common.resolve()?;
    let mut options = resolved.options;

    // CLI flags win over the config file.
    if let Some(v) = args.resolution {
        options.resolution = v;
    }
    if args.resampling.is_some() {
        options.resampling = args.resampling;
    }
    if let Some(fill) = args.fill {
        options.fill = fill;
    }
    if let Some(fallback) = args.fill_fallback {
        options.fill = match options.fill {
            FillStrategy::Interpolate { .. } => FillStrategy::Interpolate {
                fallback: Some(fallback),
            },
            other => other,
        };
    }
    if let Some(v) = args.mosaic {
        options.mosaic = v;
    }
    if let Some(v) = args.compression {
        options.compression = v;
    }
    if let Some(v) = args.workers {
        options.workers = v;
    }
    if let Some(v) = args.density {
        options.density = v;
    }
    if let Some(v) = args.validation {
        options.validation = v;
    }
    if let Some(v) = args.validation_jobs {
        options.validation_jobs = v;
    }
    if let Some(v) = args.coverage_min {
        options.coverage_min = v;
    }
    if let Some(v) = args.continue_on_error {
        options.continue_on_error = v;
    }
    if args.coverage_hard_fail {
        options.coverage_hard_fail = true;
    }
    if args.xp12_source.is_some() {
        options.xp12_source = args.xp12_source.clone();
    }
    if args.xp12_strict {
        options.xp12_strict = true;
    }
    if args.deterministic {
        options.deterministic = true;
    }
    if args.persist_runner_config {
        options.persist_runner_config = true;
    }
    if args.strict_provenance {
        options.provenance = ProvenanceMode::Strict;
    }
    if args.verify_cache_content {
        options.cache_verify = VerifyMode::ContentHash;
    }
    options.mode = if args.resume {
        BuildMode::Resume
    } else if args.validate_only {
        BuildMode::ValidateOnly
    } else {
        BuildMode::Fresh
    };

    let backend_root = common::require_dir(
        args.backend,
        resolved.backend_root,
        "backend root",
        "pass --backend or set [paths] backend_root in xbasemesh.ini",
    )?;
    common::ensure_dir(&args.output)?;
    let _log_guard = xbasemesh::logging::init(Some(&args.output));

    let ctx = BuildContext::new(
        options,
        resolved.tools,
        args.output.clone(),
        backend_root,
        args.source_root.or(resolved.source_root),
    );

    let cancel = ctx.cancel.clone();
    ctrlc::set_handler(move || {
        tracing::warn!("cancellation requested");
        cancel.cancel();
    })
    .map_err(|e| BuildError::invalid(format!("cannot install signal handler: {e}")))?;

    let dems = match args.stack {
        Some(stack) => DemRequest::StackFile(stack),
        None => DemRequest::Files(args.dems.clone()),
    };
    let selection = if args.tiles.is_empty() {
        TileSelection::Auto
    } else {
        TileSelection::Explicit(common::parse_tiles(&args.tiles)?)
    };

    let resolved_build = plan::resolve(&ctx, dems, selection)?;
    report::write_json(&ctx.output.join(BUILD_PLAN_FILE), &resolved_build.plan)?;
    report::write_json(&ctx.output.join(BUILD_LOCK_FILE), &resolved_build.lock)?;

    let report_path = ctx.output.join(BUILD_REPORT_FILE);
    let prior = report::load_report(&report_path)?;
    let final_report = scheduler::run_build(
        &ctx,
        &resolved_build.tiles,
        &resolved_build.inputs,
        prior.as_ref(),
    );
    report::write_json(&report_path, &final_report)?;

    common::print_report_summary(common.json_logs, &final_report);
    Ok(final_report.exit_code())
}
