//! Multi-resolution DEM stack blending.
//!
//! A stack is an ordered set of DEM layers blended onto one tile canvas:
//! lowest priority first, each subsequent layer overwriting the canvas where
//! it has valid data, optionally clipped to an area of interest. The result
//! is a single normalized tile artifact indistinguishable from one produced
//! from a single source.

mod aoi;

pub use aoi::Aoi;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::raster::{
    is_nodata, open_dataset, warp_to_grid, RasterError, ResamplingKernel, TileGrid,
};

/// Schema version of the stack input file.
pub const STACK_SCHEMA_VERSION: u32 = 1;

/// Result type for stack operations.
pub type StackResult<T> = Result<T, StackError>;

/// Errors from stack parsing, validation, and blending.
#[derive(Debug, Error)]
pub enum StackError {
    /// Stack file could not be read.
    #[error("failed to read stack file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Stack file is not valid JSON for the schema.
    #[error("failed to parse stack file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The stack has no layers.
    #[error("DEM stack has no layers")]
    Empty,

    /// AOI polygon is unusable.
    #[error("invalid AOI: {0}")]
    InvalidAoi(String),

    /// A layer carries an AOI but no resolvable nodata value, so "outside
    /// the polygon" cannot be represented. Rejected at plan time.
    #[error(
        "stack layer {path}: AOI requires a nodata value (set the layer's \
         nodata or a global default)"
    )]
    AoiWithoutNodata { path: PathBuf },

    /// Raster work on a layer failed.
    #[error(transparent)]
    Raster(#[from] RasterError),
}

/// AOI as written in stack/patch JSON: either a bare WKT string (EPSG:4326)
/// or the full object with a CRS.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AoiSpec {
    Wkt(String),
    Full(Aoi),
}

impl From<AoiSpec> for Aoi {
    fn from(spec: AoiSpec) -> Self {
        match spec {
            AoiSpec::Wkt(wkt) => Aoi { wkt, crs: None },
            AoiSpec::Full(aoi) => aoi,
        }
    }
}

/// One DEM layer of a stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackLayer {
    /// DEM file path.
    pub path: PathBuf,
    /// Blend priority; higher overwrites lower where data exists.
    pub priority: i32,
    /// Optional clip polygon.
    pub aoi: Option<Aoi>,
    /// Nodata override for this layer.
    pub nodata: Option<f64>,
}

impl StackLayer {
    /// Stable token folded into cache keys.
    pub fn key_token(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.path.display(),
            self.priority,
            self.aoi
                .as_ref()
                .map(|a| a.fingerprint_token())
                .unwrap_or_default(),
            self.nodata.map(|n| n.to_string()).unwrap_or_default(),
        )
    }
}

#[derive(Debug, Deserialize)]
struct StackFile {
    #[serde(default)]
    #[allow(dead_code)]
    schema_version: u32,
    layers: Vec<LayerSpec>,
}

#[derive(Debug, Deserialize)]
struct LayerSpec {
    path: PathBuf,
    priority: i32,
    #[serde(default)]
    aoi: Option<AoiSpec>,
    #[serde(default)]
    nodata: Option<f64>,
}

/// An ordered DEM stack, lowest priority first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemStack {
    layers: Vec<StackLayer>,
}

impl DemStack {
    /// Build a stack from layers, sorting ascending by priority. Input order
    /// is preserved among equal priorities.
    pub fn new(mut layers: Vec<StackLayer>) -> StackResult<Self> {
        if layers.is_empty() {
            return Err(StackError::Empty);
        }
        layers.sort_by_key(|l| l.priority);
        Ok(Self { layers })
    }

    /// Load a stack input file (`{schema_version, layers: [...]}`).
    pub fn load(path: &Path) -> StackResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| StackError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: StackFile =
            serde_json::from_str(&text).map_err(|source| StackError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::new(
            file.layers
                .into_iter()
                .map(|spec| StackLayer {
                    path: spec.path,
                    priority: spec.priority,
                    aoi: spec.aoi.map(Aoi::from),
                    nodata: spec.nodata,
                })
                .collect(),
        )
    }

    /// Plan-time validation: AOI polygons must parse, and a layer with an
    /// AOI must have a nodata value resolvable from the layer or the global
    /// default.
    pub fn validate(&self, default_nodata: Option<f64>) -> StackResult<()> {
        for layer in &self.layers {
            if let Some(aoi) = &layer.aoi {
                aoi.validate()?;
                if layer.nodata.or(default_nodata).is_none() {
                    return Err(StackError::AoiWithoutNodata {
                        path: layer.path.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Layers in blend order.
    pub fn layers(&self) -> &[StackLayer] {
        &self.layers
    }

    /// Stack with one extra layer on top of everything, for patch rebuilds.
    pub fn with_top_layer(&self, layer: StackLayer) -> StackResult<Self> {
        let mut layers = self.layers.clone();
        let top = layers.iter().map(|l| l.priority).max().unwrap_or(0);
        layers.push(StackLayer {
            priority: top.saturating_add(1).max(layer.priority),
            ..layer
        });
        Self::new(layers)
    }

    /// Stable token folded into cache keys.
    pub fn key_token(&self) -> String {
        let tokens: Vec<String> = self.layers.iter().map(|l| l.key_token()).collect();
        tokens.join(";")
    }

    /// Blend all layers onto a tile canvas.
    ///
    /// The canvas starts all-nodata (NaN sentinel) and layers are overlaid
    /// ascending by priority; pixels outside a layer's AOI and the layer's
    /// own nodata never reach the canvas. Returns the canvas and its
    /// sentinel.
    pub fn blend_tile(
        &self,
        grid: &TileGrid,
        kernel: ResamplingKernel,
    ) -> StackResult<(Vec<f32>, f64)> {
        let mut canvas = vec![f32::NAN; grid.pixel_count()];

        for layer in &self.layers {
            let ds = open_dataset(&layer.path)?;
            let (data, layer_nodata) =
                warp_to_grid(&ds, &layer.path, grid, kernel, layer.nodata)?;

            let outside = match &layer.aoi {
                None => None,
                Some(aoi) => Some(aoi.outside_mask(grid)?),
            };

            let written = overlay_layer(&mut canvas, &data, Some(layer_nodata), outside.as_deref());
            if written == 0 {
                warn!(
                    layer = %layer.path.display(),
                    priority = layer.priority,
                    "stack layer contributed no pixels to this tile"
                );
            } else {
                debug!(
                    layer = %layer.path.display(),
                    priority = layer.priority,
                    written,
                    "blended stack layer"
                );
            }
        }

        Ok((canvas, f64::NAN))
    }
}

/// Overlay one layer onto the canvas; returns the number of pixels written.
fn overlay_layer(
    canvas: &mut [f32],
    data: &[f32],
    layer_nodata: Option<f64>,
    outside: Option<&[bool]>,
) -> u64 {
    let mut written = 0u64;
    for (idx, (cell, &sample)) in canvas.iter_mut().zip(data).enumerate() {
        if let Some(mask) = outside {
            if mask[idx] {
                continue;
            }
        }
        if is_nodata(sample, layer_nodata) {
            continue;
        }
        *cell = sample;
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(path: &str, priority: i32) -> StackLayer {
        StackLayer {
            path: PathBuf::from(path),
            priority,
            aoi: None,
            nodata: None,
        }
    }

    #[test]
    fn test_layers_sorted_ascending_by_priority() {
        let stack = DemStack::new(vec![
            layer("high.tif", 10),
            layer("low.tif", 1),
            layer("mid.tif", 5),
        ])
        .unwrap();
        let order: Vec<_> = stack
            .layers()
            .iter()
            .map(|l| l.path.to_str().unwrap())
            .collect();
        assert_eq!(order, vec!["low.tif", "mid.tif", "high.tif"]);
    }

    #[test]
    fn test_empty_stack_rejected() {
        assert!(matches!(DemStack::new(Vec::new()), Err(StackError::Empty)));
    }

    #[test]
    fn test_load_accepts_both_aoi_shapes() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("stack.json");
        std::fs::write(
            &path,
            r#"{
              "schema_version": 1,
              "layers": [
                {"path": "base.tif", "priority": 1},
                {"path": "clip.tif", "priority": 2, "nodata": -9999,
                 "aoi": "POLYGON((8 47, 9 47, 9 48, 8 48, 8 47))"},
                {"path": "proj.tif", "priority": 3, "nodata": -9999,
                 "aoi": {"wkt": "POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))", "crs": "EPSG:3857"}}
              ]
            }"#,
        )
        .unwrap();

        let stack = DemStack::load(&path).unwrap();
        assert_eq!(stack.layers().len(), 3);
        assert!(stack.layers()[1].aoi.as_ref().unwrap().crs.is_none());
        assert_eq!(
            stack.layers()[2].aoi.as_ref().unwrap().crs.as_deref(),
            Some("EPSG:3857")
        );
    }

    #[test]
    fn test_aoi_without_nodata_rejected_at_plan_time() {
        let stack = DemStack::new(vec![StackLayer {
            path: PathBuf::from("clip.tif"),
            priority: 1,
            aoi: Some(Aoi {
                wkt: String::from("POLYGON((8 47, 9 47, 9 48, 8 48, 8 47))"),
                crs: None,
            }),
            nodata: None,
        }])
        .unwrap();

        assert!(matches!(
            stack.validate(None),
            Err(StackError::AoiWithoutNodata { .. })
        ));
        // A global default makes the same layer acceptable.
        assert!(stack.validate(Some(-32768.0)).is_ok());
    }

    #[test]
    fn test_overlay_respects_nodata_and_aoi() {
        let mut canvas = vec![f32::NAN; 4];
        let data = vec![1.0, f32::NAN, 3.0, 4.0];
        let outside = vec![false, false, false, true];

        let written = overlay_layer(&mut canvas, &data, Some(f64::NAN), Some(&outside));
        assert_eq!(written, 2);
        assert_eq!(canvas[0], 1.0);
        assert!(canvas[1].is_nan()); // layer void
        assert_eq!(canvas[2], 3.0);
        assert!(canvas[3].is_nan()); // clipped by AOI
    }

    #[test]
    fn test_higher_priority_overwrites() {
        let mut canvas = vec![f32::NAN; 2];
        overlay_layer(&mut canvas, &[10.0, 10.0], Some(f64::NAN), None);
        overlay_layer(&mut canvas, &[20.0, f32::NAN], Some(f64::NAN), None);
        assert_eq!(canvas, vec![20.0, 10.0]);
    }

    #[test]
    fn test_with_top_layer_outranks_all() {
        let stack = DemStack::new(vec![layer("a.tif", 3), layer("b.tif", 9)]).unwrap();
        let patched = stack.with_top_layer(layer("patch.tif", 0)).unwrap();
        let last = patched.layers().last().unwrap();
        assert_eq!(last.path, PathBuf::from("patch.tif"));
        assert!(last.priority > 9);
    }

    #[test]
    fn test_key_token_changes_with_layer_set() {
        let a = DemStack::new(vec![layer("a.tif", 1)]).unwrap();
        let b = DemStack::new(vec![layer("a.tif", 1), layer("b.tif", 2)]).unwrap();
        assert_ne!(a.key_token(), b.key_token());
    }
}
