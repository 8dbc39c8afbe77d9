//! Build configuration.
//!
//! Options come from three layers, strongest last: built-in defaults, the
//! INI config file (`xbasemesh.ini`), and CLI flags. The merged result is
//! one [`BuildOptions`] value; its normalized form is what gets locked into
//! `build_config.lock.json` for exact replay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

use crate::cache::{ProvenanceMode, VerifyMode};
use crate::fill::FillStrategy;
use crate::raster::{Compression, MosaicStrategy, ResamplingKernel, ResamplingPolicy};
use crate::report::ValidationMode;

/// Default target resolution: 3 arc seconds, the common DEM grid.
pub const DEFAULT_RESOLUTION: f64 = 1.0 / 1200.0;

/// Worker auto-sizing cap; beyond this the pipeline is I/O bound.
const AUTO_WORKER_IO_CAP: usize = 8;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from config file handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read or parsed.
    #[error("config file {path}: {reason}")]
    File { path: PathBuf, reason: String },

    /// A config value is malformed.
    #[error("config value '{key}': {reason}")]
    Value { key: String, reason: String },
}

/// Mesh density presets, mapped onto backend config overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DensityPreset {
    #[default]
    Default,
    High,
    Ultra,
}

impl DensityPreset {
    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DensityPreset::Default => "default",
            DensityPreset::High => "high",
            DensityPreset::Ultra => "ultra",
        }
    }

    /// Backend config overrides implementing the preset.
    pub fn overrides(&self) -> Vec<(String, String)> {
        let pair = |k: &str, v: &str| (k.to_string(), v.to_string());
        match self {
            DensityPreset::Default => vec![pair("curvature_tol", "2.0")],
            DensityPreset::High => vec![
                pair("curvature_tol", "1.0"),
                pair("apt_curv_tol", "0.5"),
            ],
            DensityPreset::Ultra => vec![
                pair("curvature_tol", "0.5"),
                pair("apt_curv_tol", "0.2"),
                pair("mesh_zl", "19"),
            ],
        }
    }
}

impl std::str::FromStr for DensityPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(DensityPreset::Default),
            "high" => Ok(DensityPreset::High),
            "ultra" => Ok(DensityPreset::Ultra),
            other => Err(format!(
                "unknown density preset '{other}' (expected default|high|ultra)"
            )),
        }
    }
}

/// How the scheduler treats prior results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Ignore any prior report; build everything.
    #[default]
    Fresh,
    /// Skip tiles whose prior status was ok.
    Resume,
    /// Only re-validate existing DSFs.
    ValidateOnly,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Fresh => "fresh",
            BuildMode::Resume => "resume",
            BuildMode::ValidateOnly => "validate-only",
        }
    }
}

/// The complete, merged build configuration.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Target CRS for tile grids. Anything non-geographic is rejected at
    /// plan time.
    pub target_crs: String,
    /// Target resolution in degrees/pixel.
    pub resolution: f64,
    /// Explicit kernel; `None` selects from the policy by direction.
    pub resampling: Option<ResamplingKernel>,
    /// Default-kernel policy recorded in the plan.
    pub resampling_policy: ResamplingPolicy,
    pub fill: FillStrategy,
    pub mosaic: MosaicStrategy,
    /// Disabling normalization is only valid for single prepared inputs.
    pub normalize: bool,
    /// Global default nodata for stack layers that declare none.
    pub default_nodata: Option<f64>,
    pub provenance: ProvenanceMode,
    pub cache_verify: VerifyMode,
    pub compression: Compression,
    /// Minimum acceptable valid-data ratio after fill.
    pub coverage_min: f64,
    /// Treat low coverage as an error instead of a warning.
    pub coverage_hard_fail: bool,
    /// Worker count; 0 = auto.
    pub workers: usize,
    pub validation: ValidationMode,
    /// Validation pool size; 0 = rayon default.
    pub validation_jobs: usize,
    /// Downgrade bounds-validation failures to warnings.
    pub validation_lenient: bool,
    pub continue_on_error: bool,
    pub mode: BuildMode,
    pub density: DensityPreset,
    /// Extra backend config overrides from the config file.
    pub backend_overrides: Vec<(String, String)>,
    pub timeout: Duration,
    pub watchdog: Duration,
    pub grace: Duration,
    pub persist_runner_config: bool,
    /// Omit timestamps and durations from all documents.
    pub deterministic: bool,
    /// XP12 global scenery root for enrichment.
    pub xp12_source: Option<PathBuf>,
    /// Escalate a missing reference tile to an error.
    pub xp12_strict: bool,
    /// Pinned tool versions for drift detection.
    pub pinned_tool_versions: BTreeMap<String, String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            target_crs: String::from("EPSG:4326"),
            resolution: DEFAULT_RESOLUTION,
            resampling: None,
            resampling_policy: ResamplingPolicy::default(),
            fill: FillStrategy::Interpolate { fallback: None },
            mosaic: MosaicStrategy::default(),
            normalize: true,
            default_nodata: None,
            provenance: ProvenanceMode::default(),
            cache_verify: VerifyMode::default(),
            compression: Compression::default(),
            coverage_min: 0.98,
            coverage_hard_fail: false,
            workers: 0,
            validation: ValidationMode::default(),
            validation_jobs: 0,
            validation_lenient: false,
            continue_on_error: true,
            mode: BuildMode::default(),
            density: DensityPreset::default(),
            backend_overrides: Vec::new(),
            timeout: Duration::from_secs(3600),
            watchdog: Duration::from_secs(600),
            grace: Duration::from_secs(10),
            persist_runner_config: false,
            deterministic: false,
            xp12_source: None,
            xp12_strict: false,
            pinned_tool_versions: BTreeMap::new(),
        }
    }
}

impl BuildOptions {
    /// Kernel for warping a source of the given resolution, honoring an
    /// explicit choice over the policy.
    pub fn kernel_for(&self, source_resolution: f64) -> ResamplingKernel {
        self.resampling
            .unwrap_or_else(|| self.resampling_policy.select(source_resolution, self.resolution))
    }

    /// Effective worker count for a tile set.
    ///
    /// `0` asks for conservative auto-sizing: physical cores, capped by the
    /// tile count and the I/O heuristic.
    pub fn worker_count(&self, tile_count: usize) -> usize {
        let requested = if self.workers == 0 {
            num_cpus::get_physical().min(AUTO_WORKER_IO_CAP)
        } else {
            self.workers
        };
        requested.clamp(1, tile_count.max(1))
    }

    /// Combined backend config overrides: density preset, then file-level
    /// extras (extras win).
    pub fn runner_overrides(&self) -> Vec<(String, String)> {
        let mut overrides = self.density.overrides();
        overrides.extend(self.backend_overrides.iter().cloned());
        overrides
    }

    /// Normalized key/value view for `build_config.lock.json`.
    pub fn lock_values(&self) -> BTreeMap<String, serde_json::Value> {
        let mut values = BTreeMap::new();
        let mut put = |k: &str, v: serde_json::Value| {
            values.insert(k.to_string(), v);
        };
        put("target_crs", serde_json::json!(self.target_crs));
        put("resolution", serde_json::json!(self.resolution));
        put(
            "resampling",
            serde_json::json!(self.resampling.map(|k| k.as_str())),
        );
        put("fill", serde_json::json!(self.fill.describe()));
        put("mosaic", serde_json::json!(self.mosaic));
        put("normalize", serde_json::json!(self.normalize));
        put("default_nodata", serde_json::json!(self.default_nodata));
        put("provenance", serde_json::json!(self.provenance));
        put("cache_verify", serde_json::json!(self.cache_verify));
        put("compression", serde_json::json!(self.compression));
        put("coverage_min", serde_json::json!(self.coverage_min));
        put("coverage_hard_fail", serde_json::json!(self.coverage_hard_fail));
        put("workers", serde_json::json!(self.workers));
        put("validation", serde_json::json!(self.validation));
        put("validation_jobs", serde_json::json!(self.validation_jobs));
        put("validation_lenient", serde_json::json!(self.validation_lenient));
        put("continue_on_error", serde_json::json!(self.continue_on_error));
        put("mode", serde_json::json!(self.mode.as_str()));
        put("density", serde_json::json!(self.density.as_str()));
        put(
            "backend_overrides",
            serde_json::json!(self
                .backend_overrides
                .iter()
                .cloned()
                .collect::<BTreeMap<_, _>>()),
        );
        put("timeout_secs", serde_json::json!(self.timeout.as_secs()));
        put("watchdog_secs", serde_json::json!(self.watchdog.as_secs()));
        put("grace_secs", serde_json::json!(self.grace.as_secs()));
        put(
            "persist_runner_config",
            serde_json::json!(self.persist_runner_config),
        );
        put("deterministic", serde_json::json!(self.deterministic));
        put("xp12_source", serde_json::json!(self.xp12_source));
        put("xp12_strict", serde_json::json!(self.xp12_strict));
        put(
            "pinned_tool_versions",
            serde_json::json!(self.pinned_tool_versions),
        );
        values
    }
}

/// The INI config file, applied underneath CLI flags.
///
/// ```ini
/// [build]
/// resolution = 0.000833333333
/// fill = interpolate
/// workers = 4
///
/// [runner]
/// density = high
/// timeout = 3600
/// cfg.custom_dem = ""
///
/// [paths]
/// xp12_source = /xplane/Global Scenery/X-Plane 12 Global Scenery
/// ```
#[derive(Debug, Default)]
pub struct ConfigFile {
    ini: Option<Ini>,
}

impl ConfigFile {
    /// Load a config file; a missing file yields an empty config.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self { ini: Some(ini) })
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.ini
            .as_ref()?
            .section(Some(section))
            .and_then(|s| s.get(key))
    }

    fn parse_into<T: std::str::FromStr>(
        &self,
        section: &str,
        key: &str,
        slot: &mut T,
    ) -> ConfigResult<()>
    where
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(section, key) {
            *slot = raw.parse().map_err(|e| ConfigError::Value {
                key: format!("[{section}] {key}"),
                reason: format!("{e}"),
            })?;
        }
        Ok(())
    }

    /// Apply the file's values onto defaults (CLI flags are applied after).
    pub fn apply(&self, options: &mut BuildOptions) -> ConfigResult<()> {
        if let Some(raw) = self.get("build", "target_crs") {
            options.target_crs = raw.to_string();
        }
        self.parse_into("build", "resolution", &mut options.resolution)?;
        if let Some(raw) = self.get("build", "resampling") {
            options.resampling = Some(raw.parse().map_err(|e| ConfigError::Value {
                key: String::from("[build] resampling"),
                reason: e,
            })?);
        }
        self.parse_into("build", "fill", &mut options.fill)?;
        self.parse_into("build", "mosaic", &mut options.mosaic)?;
        self.parse_into("build", "normalize", &mut options.normalize)?;
        self.parse_into("build", "workers", &mut options.workers)?;
        self.parse_into("build", "coverage_min", &mut options.coverage_min)?;
        self.parse_into("build", "coverage_hard_fail", &mut options.coverage_hard_fail)?;
        self.parse_into("build", "validation", &mut options.validation)?;
        self.parse_into("build", "validation_jobs", &mut options.validation_jobs)?;
        self.parse_into("build", "validation_lenient", &mut options.validation_lenient)?;
        self.parse_into("build", "continue_on_error", &mut options.continue_on_error)?;
        if let Some(raw) = self.get("build", "default_nodata") {
            options.default_nodata = Some(raw.parse().map_err(|_| ConfigError::Value {
                key: String::from("[build] default_nodata"),
                reason: format!("'{raw}' is not a number"),
            })?);
        }

        self.parse_into("runner", "density", &mut options.density)?;
        for (key, slot) in [
            ("timeout", &mut options.timeout),
            ("watchdog", &mut options.watchdog),
            ("grace", &mut options.grace),
        ] {
            if let Some(raw) = self.get("runner", key) {
                let secs = raw.parse::<u64>().map_err(|_| ConfigError::Value {
                    key: format!("[runner] {key}"),
                    reason: format!("'{raw}' is not a number of seconds"),
                })?;
                *slot = Duration::from_secs(secs);
            }
        }
        if let Some(ini) = &self.ini {
            if let Some(section) = ini.section(Some("runner")) {
                for (key, value) in section.iter() {
                    if let Some(cfg_key) = key.strip_prefix("cfg.") {
                        options
                            .backend_overrides
                            .push((cfg_key.to_string(), value.to_string()));
                    }
                }
            }
            if let Some(section) = ini.section(Some("pinned_versions")) {
                for (key, value) in section.iter() {
                    options
                        .pinned_tool_versions
                        .insert(key.to_string(), value.to_string());
                }
            }
        }

        if let Some(raw) = self.get("paths", "xp12_source") {
            options.xp12_source = Some(PathBuf::from(raw));
        }
        Ok(())
    }

    /// Tool-paths file location from `[paths] tool_paths`, if set.
    pub fn tool_paths(&self) -> Option<PathBuf> {
        self.get("paths", "tool_paths").map(PathBuf::from)
    }

    /// Backend root from `[paths] backend_root`, if set.
    pub fn backend_root(&self) -> Option<PathBuf> {
        self.get("paths", "backend_root").map(PathBuf::from)
    }

    /// Runner source root from `[paths] source_root`, if set.
    pub fn source_root(&self) -> Option<PathBuf> {
        self.get("paths", "source_root").map(PathBuf::from)
    }
}
