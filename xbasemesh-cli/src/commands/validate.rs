//! The validate command: check DSFs in an existing scenery tree.

use std::path::PathBuf;

use clap::Args;

use xbasemesh::report::ValidationMode;
use xbasemesh::{validate, BuildError, Tile};

use super::common::{self, Common};

#[derive(Args)]
pub struct ValidateArgs {
    /// Scenery root containing `Earth nav data/`.
    #[arg(long)]
    scenery: PathBuf,

    /// Validation mode (bounds|roundtrip).
    #[arg(long, default_value = "bounds")]
    mode: ValidationMode,

    /// Parallel validation jobs; 0 = default.
    #[arg(long, default_value_t = 0)]
    jobs: usize,

    /// Restrict to specific tiles.
    #[arg(long = "tiles", value_name = "NAMES")]
    tiles: Vec<String>,
}

pub fn run(common: &Common, args: ValidateArgs) -> i32 {
    match execute(common, args) {
        Ok(code) => code,
        Err(e) => common.fail(&e),
    }
}

fn execute(common: &Common, args: ValidateArgs) -> Result<i32, BuildError> {
    let resolved = common.resolve()?;
    let dsftool = resolved.tools.dsftool()?;
    let _log_guard = xbasemesh::logging::init(None);

    let restrict = common::parse_tiles(&args.tiles)?;
    let mut jobs: Vec<(Tile, PathBuf)> = Vec::new();
    for tile in discover_tiles(&args.scenery)? {
        if !restrict.is_empty() && !restrict.contains(&tile) {
            continue;
        }
        jobs.push((tile, tile.dsf_path(&args.scenery)));
    }
    if jobs.is_empty() {
        return Err(BuildError::invalid_with_hint(
            format!("no DSF tiles found under {}", args.scenery.display()),
            "point --scenery at a folder containing 'Earth nav data'",
        ));
    }

    let scratch = std::env::temp_dir().join("xbasemesh-validate");
    let results = validate::validate_many(dsftool, &jobs, args.mode, args.jobs, &scratch);

    let mut failed = 0usize;
    for (tile, outcome) in &results {
        if common.json_logs {
            let line = serde_json::json!({
                "tile": tile.name(),
                "passed": outcome.passed,
                "mode": outcome.mode,
                "details": outcome.details,
            });
            println!("{line}");
        } else if outcome.passed {
            println!("{tile}: ok");
        } else {
            println!(
                "{tile}: FAILED ({})",
                outcome.details.as_deref().unwrap_or("no details")
            );
        }
        if !outcome.passed {
            failed += 1;
        }
    }

    Ok(if failed == 0 {
        0
    } else if failed == results.len() {
        3
    } else {
        2
    })
}

/// Tiles present in the scenery tree, by deterministic bucket layout.
fn discover_tiles(scenery: &PathBuf) -> Result<Vec<Tile>, BuildError> {
    let nav = scenery.join(xbasemesh::tile::EARTH_NAV_DIR);
    let mut tiles = Vec::new();
    let buckets = match std::fs::read_dir(&nav) {
        Err(e) => {
            return Err(BuildError::invalid(format!(
                "cannot read {}: {e}",
                nav.display()
            )))
        }
        Ok(entries) => entries,
    };
    for bucket in buckets.flatten() {
        if !bucket.path().is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(bucket.path()).into_iter().flatten().flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("dsf") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(tile) = Tile::parse(stem) {
                    tiles.push(tile);
                }
            }
        }
    }
    tiles.sort();
    Ok(tiles)
}
