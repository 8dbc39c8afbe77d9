//! DSF validation via DSFTool.
//!
//! `bounds` converts the DSF to text and checks the four tile-bounds
//! properties against the target tile exactly. `roundtrip` additionally
//! re-encodes the text and compares structural invariants of a second
//! conversion. The pass parallelizes on its own rayon pool, sized
//! independently of the scheduler's worker count.

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use thiserror::Error;
use tracing::debug;

use crate::report::{ValidationMode, ValidationOutcome};
use crate::tile::Tile;
use crate::tools::{self, ToolCommand, ToolError};

/// Result type for validation operations.
pub type ValidateResult<T> = Result<T, ValidateError>;

/// Infrastructure errors during validation. A failed *check* is not an
/// error; it is a `ValidationOutcome { passed: false }`.
#[derive(Debug, Error)]
pub enum ValidateError {
    /// DSFTool could not be run.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Scratch-space I/O failed.
    #[error("validation I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Extract `(west, south, east, north)` from DSF text properties.
pub fn parse_bounds(text: &str) -> Option<(f64, f64, f64, f64)> {
    let mut west = None;
    let mut south = None;
    let mut east = None;
    let mut north = None;
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("PROPERTY") {
            continue;
        }
        let (key, value) = (parts.next(), parts.next());
        let Some(value) = value.and_then(|v| v.parse::<f64>().ok()) else {
            continue;
        };
        match key {
            Some("sim/west") => west = Some(value),
            Some("sim/south") => south = Some(value),
            Some("sim/east") => east = Some(value),
            Some("sim/north") => north = Some(value),
            _ => {}
        }
    }
    Some((west?, south?, east?, north?))
}

/// Structural summary used by the roundtrip comparison: sorted property
/// lines plus raster definition lines.
fn structural_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text
        .lines()
        .filter(|l| l.starts_with("PROPERTY") || l.starts_with("RASTER_DEF"))
        .map(str::trim_end)
        .map(String::from)
        .collect();
    lines.sort();
    lines
}

fn dsf2text(dsftool: &ToolCommand, dsf: &Path, txt: &Path) -> ValidateResult<()> {
    tools::run_checked(
        dsftool,
        &[
            String::from("--dsf2text"),
            dsf.display().to_string(),
            txt.display().to_string(),
        ],
        None,
    )?;
    Ok(())
}

fn text2dsf(dsftool: &ToolCommand, txt: &Path, dsf: &Path) -> ValidateResult<()> {
    tools::run_checked(
        dsftool,
        &[
            String::from("--text2dsf"),
            txt.display().to_string(),
            dsf.display().to_string(),
        ],
        None,
    )?;
    Ok(())
}

/// Validate one tile's DSF in the given mode.
pub fn validate_tile(
    dsftool: &ToolCommand,
    tile: &Tile,
    dsf: &Path,
    mode: ValidationMode,
    scratch: &Path,
) -> ValidateResult<ValidationOutcome> {
    if mode == ValidationMode::None {
        return Ok(ValidationOutcome {
            mode,
            passed: true,
            details: None,
        });
    }

    if !dsf.is_file() {
        return Ok(ValidationOutcome {
            mode,
            passed: false,
            details: Some(format!("DSF missing: {}", dsf.display())),
        });
    }

    std::fs::create_dir_all(scratch).map_err(|source| ValidateError::Io {
        path: scratch.to_path_buf(),
        source,
    })?;
    let txt = scratch.join(format!("{}.txt", tile.name()));
    dsf2text(dsftool, dsf, &txt)?;
    let text = std::fs::read_to_string(&txt).map_err(|source| ValidateError::Io {
        path: txt.clone(),
        source,
    })?;

    let expected = tile.bounds();
    let outcome = match parse_bounds(&text) {
        None => ValidationOutcome {
            mode,
            passed: false,
            details: Some(String::from("DSF text carries no bounds properties")),
        },
        Some((west, south, east, north)) => {
            let matches = west == expected.0
                && south == expected.1
                && east == expected.2
                && north == expected.3;
            if !matches {
                ValidationOutcome {
                    mode,
                    passed: false,
                    details: Some(format!(
                        "bounds mismatch: DSF ({west}, {south}, {east}, {north}) vs tile {}",
                        tile
                    )),
                }
            } else if mode == ValidationMode::Bounds {
                ValidationOutcome {
                    mode,
                    passed: true,
                    details: None,
                }
            } else {
                roundtrip(dsftool, tile, &text, &txt, scratch)?
            }
        }
    };

    debug!(tile = %tile, passed = outcome.passed, ?mode, "validated DSF");
    Ok(outcome)
}

/// Re-encode the text and compare a second conversion structurally.
fn roundtrip(
    dsftool: &ToolCommand,
    tile: &Tile,
    original_text: &str,
    txt: &Path,
    scratch: &Path,
) -> ValidateResult<ValidationOutcome> {
    let rebuilt_dsf = scratch.join(format!("{}.roundtrip.dsf", tile.name()));
    let rebuilt_txt = scratch.join(format!("{}.roundtrip.txt", tile.name()));
    text2dsf(dsftool, txt, &rebuilt_dsf)?;

    let size = std::fs::metadata(&rebuilt_dsf)
        .map(|m| m.len())
        .unwrap_or(0);
    if size == 0 {
        return Ok(ValidationOutcome {
            mode: ValidationMode::Roundtrip,
            passed: false,
            details: Some(String::from("re-encoded DSF is empty")),
        });
    }

    dsf2text(dsftool, &rebuilt_dsf, &rebuilt_txt)?;
    let rebuilt = std::fs::read_to_string(&rebuilt_txt).map_err(|source| ValidateError::Io {
        path: rebuilt_txt.clone(),
        source,
    })?;

    let passed = structural_lines(original_text) == structural_lines(&rebuilt);
    Ok(ValidationOutcome {
        mode: ValidationMode::Roundtrip,
        passed,
        details: if passed {
            None
        } else {
            Some(String::from(
                "roundtrip text differs structurally from the original",
            ))
        },
    })
}

/// Validate many tiles on a bounded rayon pool.
///
/// `jobs` is the pool size; `0` uses rayon's default. Tool failures are
/// folded into failed outcomes so one broken tile never aborts the pass.
pub fn validate_many(
    dsftool: &ToolCommand,
    tiles: &[(Tile, PathBuf)],
    mode: ValidationMode,
    jobs: usize,
    scratch: &Path,
) -> Vec<(Tile, ValidationOutcome)> {
    let check = |(tile, dsf): &(Tile, PathBuf)| {
        let outcome =
            validate_tile(dsftool, tile, dsf, mode, scratch).unwrap_or_else(|e| {
                ValidationOutcome {
                    mode,
                    passed: false,
                    details: Some(format!("validation tooling failed: {e}")),
                }
            });
        (*tile, outcome)
    };

    match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
        Ok(pool) => pool.install(|| tiles.par_iter().map(check).collect()),
        Err(e) => {
            debug!(error = %e, "validation pool unavailable, checking serially");
            tiles.iter().map(check).collect()
        }
    }
}
