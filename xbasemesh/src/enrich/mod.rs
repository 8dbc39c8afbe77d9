//! XP12 raster enrichment.
//!
//! X-Plane 12 DSFs carry extra raster layers (soundscape, seasons,
//! bathymetry) that the mesh backend does not produce. This pass grafts them
//! from a reference scenery tree: both DSFs are converted to text, the
//! reference's raster definitions are merged into the target's text, and the
//! merged text is re-encoded.
//!
//! Sidecar discipline is the heart of it: DSFTool resolves `.raw` sidecars
//! by the *name of the text file it is invoked on*. The merged text is
//! written as `<tile>.enriched.txt`, so every sidecar is copied to
//! `<tile>.enriched.txt.<layer>.raw` before the `text2dsf` call. Leaving a
//! sidecar on the pre-merge basename makes the re-encode fail.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::fsio;
use crate::report::EnrichmentOutcome;
use crate::tile::Tile;
use crate::tools::{self, ToolCommand, ToolError};

/// Result type for enrichment operations.
pub type EnrichResult<T> = Result<T, EnrichError>;

/// Errors from the enrichment pass.
#[derive(Debug, Error)]
pub enum EnrichError {
    /// The reference scenery has no DSF for this tile.
    #[error("reference scenery has no DSF for the tile: {0}")]
    MissingReference(PathBuf),

    /// A raster definition references a sidecar that does not exist.
    #[error("sidecar missing for raster layer '{layer}': {path}")]
    SidecarMissing { layer: String, path: PathBuf },

    /// DSFTool failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Scratch I/O failed.
    #[error("enrichment I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One tile enrichment request.
#[derive(Debug)]
pub struct EnrichRequest<'a> {
    pub tile: Tile,
    /// The freshly built DSF to enrich, modified in place on success.
    pub dsf: &'a Path,
    /// Root of the reference scenery tree (XP12 Global Scenery).
    pub reference_root: &'a Path,
    /// Scratch directory for text and sidecar files.
    pub scratch: &'a Path,
}

/// Raster layer names defined in a DSF text, in definition order.
pub fn raster_layers(text: &str) -> Vec<String> {
    let mut layers = Vec::new();
    for line in text.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("RASTER_DEF") {
            continue;
        }
        if let Some(name) = parts.last() {
            if !layers.iter().any(|l| l == name) {
                layers.push(name.to_string());
            }
        }
    }
    layers
}

/// Sidecar path for a raster layer of a given text file:
/// `<text>.<layer>.raw`.
pub fn sidecar_path(text_path: &Path, layer: &str) -> PathBuf {
    let mut name = text_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push('.');
    name.push_str(layer);
    name.push_str(".raw");
    text_path.with_file_name(name)
}

/// Merge the reference's raster definition lines into the target text.
///
/// Layers the target already defines are kept as-is; missing definitions are
/// inserted after the property block. Returns the merged text and the layer
/// names taken from the reference.
pub fn merge_raster_definitions(target_text: &str, reference_text: &str) -> (String, Vec<String>) {
    let existing = raster_layers(target_text);
    let mut added_layers = Vec::new();
    let mut added_lines = Vec::new();
    for line in reference_text.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() != Some("RASTER_DEF") {
            continue;
        }
        let Some(name) = parts.last() else { continue };
        if existing.iter().any(|l| l == name) || added_layers.iter().any(|l| l == name) {
            continue;
        }
        added_layers.push(name.to_string());
        added_lines.push(line.to_string());
    }

    if added_lines.is_empty() {
        return (target_text.to_string(), added_layers);
    }

    // Insert after the last PROPERTY line so definitions precede geometry.
    let mut merged: Vec<&str> = Vec::new();
    let lines: Vec<&str> = target_text.lines().collect();
    let insert_at = lines
        .iter()
        .rposition(|l| l.starts_with("PROPERTY"))
        .map(|i| i + 1)
        .unwrap_or(0);
    merged.extend(&lines[..insert_at]);
    merged.extend(added_lines.iter().map(String::as_str));
    merged.extend(&lines[insert_at..]);
    let mut text = merged.join("\n");
    text.push('\n');
    (text, added_layers)
}

/// Sidecar copies needed so every layer of the merged text resolves against
/// the enriched basename: the target's own layers from the target text's
/// sidecars, the grafted layers from the reference text's sidecars.
pub fn plan_sidecar_copies(
    target_txt: &Path,
    reference_txt: &Path,
    enriched_txt: &Path,
    target_layers: &[String],
    added_layers: &[String],
) -> Vec<(String, PathBuf, PathBuf)> {
    let mut copies = Vec::new();
    for layer in target_layers {
        copies.push((
            layer.clone(),
            sidecar_path(target_txt, layer),
            sidecar_path(enriched_txt, layer),
        ));
    }
    for layer in added_layers {
        copies.push((
            layer.clone(),
            sidecar_path(reference_txt, layer),
            sidecar_path(enriched_txt, layer),
        ));
    }
    copies
}

/// Enrich one tile's DSF from the reference tree.
///
/// The reference DSF is located by bucket path, never by scanning. On
/// success the target DSF is replaced by the enriched re-encode.
pub fn enrich_tile(
    dsftool: &ToolCommand,
    request: &EnrichRequest<'_>,
) -> EnrichResult<EnrichmentOutcome> {
    let reference_dsf = request.tile.dsf_path(request.reference_root);
    if !reference_dsf.is_file() {
        return Err(EnrichError::MissingReference(reference_dsf));
    }

    std::fs::create_dir_all(request.scratch).map_err(|source| EnrichError::Io {
        path: request.scratch.to_path_buf(),
        source,
    })?;
    let tile_name = request.tile.name();
    let target_txt = request.scratch.join(format!("{tile_name}.txt"));
    let reference_txt = request.scratch.join(format!("{tile_name}.ref.txt"));
    let enriched_txt = request.scratch.join(format!("{tile_name}.enriched.txt"));
    let enriched_dsf = request.scratch.join(format!("{tile_name}.enriched.dsf"));

    dsf2text(dsftool, request.dsf, &target_txt)?;
    dsf2text(dsftool, &reference_dsf, &reference_txt)?;

    let read = |path: &Path| -> EnrichResult<String> {
        std::fs::read_to_string(path).map_err(|source| EnrichError::Io {
            path: path.to_path_buf(),
            source,
        })
    };
    let target_text = read(&target_txt)?;
    let reference_text = read(&reference_txt)?;

    let target_layers = raster_layers(&target_text);
    let (merged, added_layers) = merge_raster_definitions(&target_text, &reference_text);
    if added_layers.is_empty() {
        debug!(tile = %request.tile, "reference adds no raster layers; keeping DSF as built");
        return Ok(EnrichmentOutcome {
            applied: false,
            layers: Vec::new(),
            reference: Some(reference_dsf),
        });
    }

    fsio::write_atomic(&enriched_txt, merged.as_bytes()).map_err(|source| EnrichError::Io {
        path: enriched_txt.clone(),
        source,
    })?;

    // Sidecars must track the file text2dsf is invoked on.
    for (layer, src, dst) in plan_sidecar_copies(
        &target_txt,
        &reference_txt,
        &enriched_txt,
        &target_layers,
        &added_layers,
    ) {
        if !src.is_file() {
            return Err(EnrichError::SidecarMissing { layer, path: src });
        }
        fsio::copy_atomic(&src, &dst).map_err(|source| EnrichError::Io {
            path: dst.clone(),
            source,
        })?;
    }

    text2dsf(dsftool, &enriched_txt, &enriched_dsf)?;
    let size = std::fs::metadata(&enriched_dsf).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        return Err(EnrichError::Io {
            path: enriched_dsf,
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "re-encoded DSF is empty",
            ),
        });
    }

    fsio::copy_atomic(&enriched_dsf, request.dsf).map_err(|source| EnrichError::Io {
        path: request.dsf.to_path_buf(),
        source,
    })?;
    info!(
        tile = %request.tile,
        layers = ?added_layers,
        "enriched DSF with reference raster layers"
    );

    Ok(EnrichmentOutcome {
        applied: true,
        layers: added_layers,
        reference: Some(reference_dsf),
    })
}

fn dsf2text(dsftool: &ToolCommand, dsf: &Path, txt: &Path) -> EnrichResult<()> {
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

fn text2dsf(dsftool: &ToolCommand, txt: &Path, dsf: &Path) -> EnrichResult<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "PROPERTY sim/west 8\n\
                          PROPERTY sim/east 9\n\
                          RASTER_DEF elevation\n\
                          BEGIN_PATCH 0\n";

    const REFERENCE: &str = "PROPERTY sim/west 8\n\
                             RASTER_DEF elevation\n\
                             RASTER_DEF soundscape\n\
                             RASTER_DEF spr1\n\
                             RASTER_DEF bathymetry\n";

    #[test]
    fn test_raster_layers_in_order() {
        assert_eq!(
            raster_layers(REFERENCE),
            vec!["elevation", "soundscape", "spr1", "bathymetry"]
        );
    }

    #[test]
    fn test_merge_adds_only_missing_layers() {
        let (merged, added) = merge_raster_definitions(TARGET, REFERENCE);
        assert_eq!(added, vec!["soundscape", "spr1", "bathymetry"]);
        // Existing elevation def is not duplicated.
        assert_eq!(merged.matches("RASTER_DEF elevation").count(), 1);
        // New defs appear before geometry.
        let def_pos = merged.find("RASTER_DEF soundscape").unwrap();
        let patch_pos = merged.find("BEGIN_PATCH").unwrap();
        assert!(def_pos < patch_pos);
    }

    #[test]
    fn test_merge_with_nothing_to_add() {
        let (merged, added) = merge_raster_definitions(REFERENCE, TARGET);
        assert!(added.is_empty());
        assert_eq!(merged, REFERENCE);
    }

    #[test]
    fn test_sidecar_path_tracks_text_basename() {
        assert_eq!(
            sidecar_path(Path::new("/s/+47+008.txt"), "elevation"),
            Path::new("/s/+47+008.txt.elevation.raw")
        );
        assert_eq!(
            sidecar_path(Path::new("/s/+47+008.enriched.txt"), "elevation"),
            Path::new("/s/+47+008.enriched.txt.elevation.raw")
        );
    }

    #[test]
    fn test_sidecar_copies_follow_the_enriched_basename() {
        // Regression guard: text2dsf reads sidecars by the invoked text
        // file's name, so every destination must use the enriched basename.
        let target_txt = Path::new("/s/+47+008.txt");
        let reference_txt = Path::new("/s/+47+008.ref.txt");
        let enriched_txt = Path::new("/s/+47+008.enriched.txt");

        let copies = plan_sidecar_copies(
            target_txt,
            reference_txt,
            enriched_txt,
            &[String::from("elevation")],
            &[String::from("soundscape"), String::from("bathymetry")],
        );

        for (_, _, dst) in &copies {
            assert!(dst
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("+47+008.enriched.txt."));
        }
        assert_eq!(
            copies[0].1,
            PathBuf::from("/s/+47+008.txt.elevation.raw")
        );
        assert_eq!(
            copies[0].2,
            PathBuf::from("/s/+47+008.enriched.txt.elevation.raw")
        );
        assert_eq!(
            copies[1].1,
            PathBuf::from("/s/+47+008.ref.txt.soundscape.raw")
        );
        assert_eq!(copies.len(), 3);
    }

    #[test]
    fn test_missing_reference_is_detected_by_bucket_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let dsftool = ToolCommand::new("dsftool", vec![String::from("DSFTool")]).unwrap();
        let tile = Tile::parse("-03+017").unwrap();
        let dsf = temp.path().join("-03+017.dsf");
        std::fs::write(&dsf, b"dsf").unwrap();

        let err = enrich_tile(
            &dsftool,
            &EnrichRequest {
                tile,
                dsf: &dsf,
                reference_root: temp.path(),
                scratch: &temp.path().join("scratch"),
            },
        )
        .unwrap_err();

        match err {
            EnrichError::MissingReference(path) => {
                // Deterministic bucket lookup, never a tree scan.
                assert!(path.ends_with("Earth nav data/-10+010/-03+017.dsf"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
