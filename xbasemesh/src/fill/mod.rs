//! Void fill strategies.
//!
//! All strategies run on the in-memory tile canvas between warp and write,
//! and all of them see voids through [`crate::raster::is_nodata`], so a NaN
//! sentinel behaves exactly like a numeric one.

use std::path::{Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::raster::{
    is_nodata, open_dataset, warp_to_grid, RasterResult, ResamplingKernel, TileGrid,
};

/// Upper bound on dilation passes; voids wider than twice this many pixels
/// fall through to the fallback DEM (or stay void when none is configured).
const MAX_DILATION_PASSES: usize = 64;

/// How voids in a tile canvas are filled.
#[derive(Debug, Clone, PartialEq)]
pub enum FillStrategy {
    /// Write a constant into every void cell.
    Constant(f64),
    /// Nearest-valid iterative dilation; large residual holes fall through
    /// to the optional fallback DEM.
    Interpolate { fallback: Option<PathBuf> },
    /// Sample a fallback DEM at every void cell.
    Fallback(PathBuf),
    /// Leave voids in place (coverage warnings still apply).
    None,
}

impl FillStrategy {
    /// Canonical descriptor, used in CLI parsing, the lock file, and cache
    /// key derivation.
    pub fn describe(&self) -> String {
        match self {
            FillStrategy::Constant(v) => format!("constant:{v}"),
            FillStrategy::Interpolate { fallback: None } => String::from("interpolate"),
            FillStrategy::Interpolate {
                fallback: Some(path),
            } => format!("interpolate+fallback:{}", path.display()),
            FillStrategy::Fallback(path) => format!("fallback:{}", path.display()),
            FillStrategy::None => String::from("none"),
        }
    }
}

impl std::str::FromStr for FillStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" {
            return Ok(FillStrategy::None);
        }
        if s == "interpolate" {
            return Ok(FillStrategy::Interpolate { fallback: None });
        }
        if let Some(rest) = s.strip_prefix("interpolate+fallback:") {
            return Ok(FillStrategy::Interpolate {
                fallback: Some(PathBuf::from(rest)),
            });
        }
        if let Some(value) = s.strip_prefix("constant:") {
            let value: f64 = value
                .parse()
                .map_err(|_| format!("invalid fill constant '{value}'"))?;
            return Ok(FillStrategy::Constant(value));
        }
        if let Some(path) = s.strip_prefix("fallback:") {
            if path.is_empty() {
                return Err(String::from("fallback fill needs a DEM path"));
            }
            return Ok(FillStrategy::Fallback(PathBuf::from(path)));
        }
        Err(format!(
            "unknown fill strategy '{s}' (expected none|constant:V|interpolate|fallback:PATH)"
        ))
    }
}

impl Serialize for FillStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.describe())
    }
}

impl<'de> Deserialize<'de> for FillStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// What a fill pass did to the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FillOutcome {
    /// Cells that received a value.
    pub filled: u64,
    /// Cells still void afterwards.
    pub remaining: u64,
}

/// Apply a fill strategy to a tile canvas in place.
pub fn apply(
    strategy: &FillStrategy,
    data: &mut [f32],
    grid: &TileGrid,
    nodata: Option<f64>,
    kernel: ResamplingKernel,
) -> RasterResult<FillOutcome> {
    let voids = crate::raster::count_nodata(data, nodata);
    if voids == 0 {
        return Ok(FillOutcome::default());
    }

    let outcome = match strategy {
        FillStrategy::None => FillOutcome {
            filled: 0,
            remaining: voids,
        },
        FillStrategy::Constant(value) => {
            let mut filled = 0u64;
            for cell in data.iter_mut() {
                if is_nodata(*cell, nodata) {
                    *cell = *value as f32;
                    filled += 1;
                }
            }
            FillOutcome {
                filled,
                remaining: voids - filled,
            }
        }
        FillStrategy::Interpolate { fallback } => {
            let mut outcome = dilate(data, grid, nodata);
            if outcome.remaining > 0 {
                if let Some(path) = fallback {
                    let from_fallback = fill_from_fallback(data, grid, nodata, path, kernel)?;
                    outcome.filled += from_fallback.filled;
                    outcome.remaining = from_fallback.remaining;
                }
            }
            outcome
        }
        FillStrategy::Fallback(path) => fill_from_fallback(data, grid, nodata, path, kernel)?,
    };

    debug!(
        strategy = %strategy.describe(),
        voids,
        filled = outcome.filled,
        remaining = outcome.remaining,
        "fill pass finished"
    );
    Ok(outcome)
}

/// Iterative nearest-valid dilation.
///
/// Each pass assigns every void cell the mean of its valid 8-neighbors;
/// passes repeat until the canvas stops changing or the bound is hit, so
/// values grow inward from void edges.
fn dilate(data: &mut [f32], grid: &TileGrid, nodata: Option<f64>) -> FillOutcome {
    let width = grid.width;
    let height = grid.height;
    let mut mask = crate::raster::mask(data, nodata);
    let mut filled = 0u64;

    for _pass in 0..MAX_DILATION_PASSES {
        let mut updates: Vec<(usize, f32)> = Vec::new();
        for row in 0..height {
            for col in 0..width {
                let idx = row * width + col;
                if !mask[idx] {
                    continue;
                }
                let mut sum = 0.0f64;
                let mut count = 0u32;
                let row_lo = row.saturating_sub(1);
                let row_hi = (row + 1).min(height - 1);
                let col_lo = col.saturating_sub(1);
                let col_hi = (col + 1).min(width - 1);
                for r in row_lo..=row_hi {
                    for c in col_lo..=col_hi {
                        let n = r * width + c;
                        if n != idx && !mask[n] {
                            sum += f64::from(data[n]);
                            count += 1;
                        }
                    }
                }
                if count > 0 {
                    updates.push((idx, (sum / f64::from(count)) as f32));
                }
            }
        }
        if updates.is_empty() {
            break;
        }
        for (idx, value) in updates {
            data[idx] = value;
            mask[idx] = false;
            filled += 1;
        }
    }

    let remaining = mask.iter().filter(|&&m| m).count() as u64;
    FillOutcome { filled, remaining }
}

/// Warp the fallback DEM onto the tile grid and take its samples at void
/// positions, respecting the fallback's own nodata.
fn fill_from_fallback(
    data: &mut [f32],
    grid: &TileGrid,
    nodata: Option<f64>,
    fallback_path: &Path,
    kernel: ResamplingKernel,
) -> RasterResult<FillOutcome> {
    let fallback_ds = open_dataset(fallback_path)?;
    let (samples, samples_nodata) = warp_to_grid(&fallback_ds, fallback_path, grid, kernel, None)?;
    Ok(overlay_samples(data, nodata, &samples, Some(samples_nodata)))
}

/// Copy `samples` into void cells of `data`; pure core of the fallback fill.
fn overlay_samples(
    data: &mut [f32],
    nodata: Option<f64>,
    samples: &[f32],
    samples_nodata: Option<f64>,
) -> FillOutcome {
    let mut filled = 0u64;
    let mut remaining = 0u64;
    for (cell, &sample) in data.iter_mut().zip(samples) {
        if !is_nodata(*cell, nodata) {
            continue;
        }
        if is_nodata(sample, samples_nodata) {
            remaining += 1;
        } else {
            *cell = sample;
            filled += 1;
        }
    }
    FillOutcome { filled, remaining }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::count_nodata;
    use crate::tile::Tile;

    fn grid_10x10() -> TileGrid {
        TileGrid::for_tile(&Tile::parse("+47+008").unwrap(), 0.1)
    }

    #[test]
    fn test_constant_fill_with_nan_nodata() {
        let grid = grid_10x10();
        let mut data = vec![100.0f32; grid.pixel_count()];
        data[3] = f32::NAN;
        data[42] = f32::NAN;

        let outcome = apply(
            &FillStrategy::Constant(0.0),
            &mut data,
            &grid,
            Some(f64::NAN),
            ResamplingKernel::Bilinear,
        )
        .unwrap();

        assert_eq!(outcome.filled, 2);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(count_nodata(&data, Some(f64::NAN)), 0);
        assert_eq!(data[3], 0.0);
    }

    #[test]
    fn test_interpolate_fills_small_void_with_nan_nodata() {
        let grid = grid_10x10();
        let mut data = vec![200.0f32; grid.pixel_count()];
        // 2x2 hole in the interior
        for idx in [44, 45, 54, 55] {
            data[idx] = f32::NAN;
        }

        let outcome = apply(
            &FillStrategy::Interpolate { fallback: None },
            &mut data,
            &grid,
            Some(f64::NAN),
            ResamplingKernel::Bilinear,
        )
        .unwrap();

        assert_eq!(outcome.filled, 4);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(count_nodata(&data, Some(f64::NAN)), 0);
        assert!((data[44] - 200.0).abs() < 1e-3);
    }

    #[test]
    fn test_interpolate_with_numeric_sentinel() {
        let grid = grid_10x10();
        let mut data = vec![10.0f32; grid.pixel_count()];
        data[0] = -32768.0;

        let outcome = apply(
            &FillStrategy::Interpolate { fallback: None },
            &mut data,
            &grid,
            Some(-32768.0),
            ResamplingKernel::Bilinear,
        )
        .unwrap();

        assert_eq!(outcome.filled, 1);
        assert_eq!(count_nodata(&data, Some(-32768.0)), 0);
    }

    #[test]
    fn test_none_leaves_voids_but_counts_them() {
        let grid = grid_10x10();
        let mut data = vec![5.0f32; grid.pixel_count()];
        data[7] = f32::NAN;

        let outcome = apply(
            &FillStrategy::None,
            &mut data,
            &grid,
            Some(f64::NAN),
            ResamplingKernel::Bilinear,
        )
        .unwrap();

        assert_eq!(outcome.filled, 0);
        assert_eq!(outcome.remaining, 1);
        assert!(data[7].is_nan());
    }

    #[test]
    fn test_overlay_skips_fallback_voids() {
        let mut data = vec![f32::NAN, f32::NAN, 7.0];
        let samples = vec![1.0, f32::NAN, 9.0];
        let outcome = overlay_samples(&mut data, Some(f64::NAN), &samples, Some(f64::NAN));
        assert_eq!(outcome.filled, 1);
        assert_eq!(outcome.remaining, 1);
        assert_eq!(data[0], 1.0);
        assert!(data[1].is_nan());
        assert_eq!(data[2], 7.0);
    }

    #[test]
    fn test_fully_valid_canvas_is_untouched() {
        let grid = grid_10x10();
        let mut data = vec![1.0f32; grid.pixel_count()];
        let outcome = apply(
            &FillStrategy::Constant(0.0),
            &mut data,
            &grid,
            Some(f64::NAN),
            ResamplingKernel::Bilinear,
        )
        .unwrap();
        assert_eq!(outcome, FillOutcome::default());
    }

    #[test]
    fn test_describe_round_trips() {
        for s in [
            "none",
            "interpolate",
            "constant:-32768",
            "fallback:/dem/global.tif",
            "interpolate+fallback:/dem/global.tif",
        ] {
            let strategy: FillStrategy = s.parse().unwrap();
            assert_eq!(strategy.describe(), s);
        }
        assert!("nearest".parse::<FillStrategy>().is_err());
        assert!("fallback:".parse::<FillStrategy>().is_err());
    }
}
