//! The patch command: rebuild selected tiles with replacement DEMs.

use std::path::PathBuf;

use clap::Args;

use xbasemesh::patch::{self, PatchPlan};
use xbasemesh::report::{self, BUILD_REPORT_FILE, PATCH_REPORT_FILE};
use xbasemesh::{BuildContext, BuildError};

use super::common::{self, Common};

#[derive(Args)]
pub struct PatchArgs {
    /// Patch plan JSON file.
    #[arg(long)]
    plan: PathBuf,

    /// The original build's output directory.
    #[arg(long)]
    output: PathBuf,

    /// Patched build tree (default: `<output>-patched`).
    #[arg(long)]
    into: Option<PathBuf>,

    /// Mesh backend installation root (or `[paths] backend_root`).
    #[arg(long)]
    backend: Option<PathBuf>,

    /// Repository source root for the runner's module path.
    #[arg(long)]
    source_root: Option<PathBuf>,

    /// Omit timestamps/durations for byte-stable documents.
    #[arg(long)]
    deterministic: bool,
}

pub fn run(common: &Common, args: PatchArgs) -> i32 {
    match execute(common, args) {
        Ok(code) => code,
        Err(e) => common.fail(&e),
    }
}

fn execute(common: &Common, args: PatchArgs) -> Result<i32, BuildError> {
    let resolved = common.resolve()?;
    let mut options = resolved.options;
    if args.deterministic {
        options.deterministic = true;
    }

    let backend_root = common::require_dir(
        args.backend,
        resolved.backend_root,
        "backend root",
        "pass --backend or set [paths] backend_root in xbasemesh.ini",
    )?;
    let patched_output = args
        .into
        .unwrap_or_else(|| patch::patched_output_dir(&args.output));
    common::ensure_dir(&patched_output)?;
    let _log_guard = xbasemesh::logging::init(Some(&patched_output));

    let plan = PatchPlan::load(&args.plan)?;
    let ctx = BuildContext::new(
        options,
        resolved.tools,
        patched_output.clone(),
        backend_root,
        args.source_root.or(resolved.source_root),
    );

    let cancel = ctx.cancel.clone();
    ctrlc::set_handler(move || cancel.cancel())
        .map_err(|e| BuildError::invalid(format!("cannot install signal handler: {e}")))?;

    let (build_report, patch_report) = patch::run_patch(&ctx, &args.output, &plan);
    report::write_json(&patched_output.join(PATCH_REPORT_FILE), &patch_report)?;
    report::write_json(&patched_output.join(BUILD_REPORT_FILE), &build_report)?;

    common::print_report_summary(common.json_logs, &build_report);
    Ok(build_report.exit_code())
}
