//! Build plan, lock, and report documents.
//!
//! Three JSON documents cross the orchestrator boundary, all written
//! atomically and all carrying a `schema_version`:
//!
//! - `build_plan.json` (pre-run): inputs, resolved tool commands, provenance.
//! - `build_config.lock.json` (pre-run): the normalized option merge for
//!   exact replay.
//! - `build_report.json` (post-run): per-tile outcomes.
//!
//! In deterministic mode timestamps and durations are omitted and every map
//! is a `BTreeMap`, so two runs over identical inputs serialize identically.

mod writer;

pub use writer::{load_report, write_json, ReportError, ReportResult};

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::raster::{Coverage, DemSourceInfo, ResamplingPolicy};
use crate::tile::Tile;

/// Schema version shared by the plan, lock, and report documents.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Filename of the build plan under the output directory.
pub const BUILD_PLAN_FILE: &str = "build_plan.json";
/// Filename of the config lock under the output directory.
pub const BUILD_LOCK_FILE: &str = "build_config.lock.json";
/// Filename of the build report under the output directory.
pub const BUILD_REPORT_FILE: &str = "build_report.json";
/// Filename of the patch report under the patched output directory.
pub const PATCH_REPORT_FILE: &str = "patch_report.json";

/// Error kinds surfaced to users, per tile or globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    InvalidInput,
    CacheInconsistency,
    NormalizationFailure,
    CoverageBelowThreshold,
    BackendTransient,
    BackendFatal,
    ValidationFailure,
    EnrichmentFailure,
    Cancelled,
}

impl IssueKind {
    /// Kebab-case reason code, as emitted in JSON diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::InvalidInput => "invalid-input",
            IssueKind::CacheInconsistency => "cache-inconsistency",
            IssueKind::NormalizationFailure => "normalization-failure",
            IssueKind::CoverageBelowThreshold => "coverage-below-threshold",
            IssueKind::BackendTransient => "backend-transient",
            IssueKind::BackendFatal => "backend-fatal",
            IssueKind::ValidationFailure => "validation-failure",
            IssueKind::EnrichmentFailure => "enrichment-failure",
            IssueKind::Cancelled => "cancelled",
        }
    }
}

/// One warning or error attached to a tile's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileIssue {
    /// Reason code.
    pub kind: IssueKind,
    /// Human-readable message.
    pub message: String,
    /// Remediation hint, when one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl TileIssue {
    /// New issue without a hint.
    pub fn new(kind: IssueKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Per-tile outcome status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TileStatus {
    Ok,
    Warning,
    Error,
    Skipped,
}

/// Overall build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Ok,
    Partial,
    Error,
    Cancelled,
}

/// DSF validation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationMode {
    None,
    #[default]
    Bounds,
    Roundtrip,
}

impl std::str::FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ValidationMode::None),
            "bounds" => Ok(ValidationMode::Bounds),
            "roundtrip" => Ok(ValidationMode::Roundtrip),
            other => Err(format!(
                "unknown validation mode '{other}' (expected none|bounds|roundtrip)"
            )),
        }
    }
}

/// Outcome of the validation pass for one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub mode: ValidationMode,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Outcome of the enrichment pass for one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentOutcome {
    /// Whether the DSF was recomposed with the extra raster layers.
    pub applied: bool,
    /// Raster layer names merged in.
    pub layers: Vec<String>,
    /// Reference DSF the layers came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<PathBuf>,
}

/// Everything known about one tile after its pipeline finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileResult {
    pub tile: Tile,
    pub status: TileStatus,
    /// Tile bounds in degrees, for consumers that do not re-derive them.
    pub bounds: (f64, f64, f64, f64),
    /// Normalized artifact path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    /// Built DSF path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsf: Option<PathBuf>,
    /// Nodata value actually written to the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_before: Option<Coverage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_after: Option<Coverage>,
    /// Void cells filled during normalization.
    pub filled_pixels: u64,
    /// Whether the artifact came from the cache.
    pub cache_hit: bool,
    /// Backend attempts (1 = no retries).
    pub attempts: u32,
    /// The exact backend argv of the final attempt.
    pub backend_command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<EnrichmentOutcome>,
    pub warnings: Vec<TileIssue>,
    pub errors: Vec<TileIssue>,
    /// Event log path under `runner_logs/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_log: Option<PathBuf>,
    /// Wall time; omitted in deterministic mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TileResult {
    /// Fresh result for a tile about to run.
    pub fn new(tile: Tile) -> Self {
        Self {
            tile,
            status: TileStatus::Ok,
            bounds: tile.bounds(),
            artifact: None,
            dsf: None,
            nodata: None,
            coverage_before: None,
            coverage_after: None,
            filled_pixels: 0,
            cache_hit: false,
            attempts: 0,
            backend_command: Vec::new(),
            validation: None,
            enrichment: None,
            warnings: Vec::new(),
            errors: Vec::new(),
            events_log: None,
            duration_ms: None,
        }
    }

    /// Record a warning and degrade `Ok` to `Warning`.
    pub fn push_warning(&mut self, issue: TileIssue) {
        if self.status == TileStatus::Ok {
            self.status = TileStatus::Warning;
        }
        self.warnings.push(issue);
    }

    /// Record an error and set the status to `Error`.
    pub fn push_error(&mut self, issue: TileIssue) {
        self.status = TileStatus::Error;
        self.errors.push(issue);
    }

    /// Whether this tile counts as failed.
    pub fn failed(&self) -> bool {
        self.status == TileStatus::Error
    }
}

/// Pinned-version drift entry for one external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
    /// True when observed and pinned disagree.
    pub drift: bool,
}

/// Option snapshot recorded in the build plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOptions {
    pub resolution: f64,
    pub resampling: String,
    pub resampling_policy: ResamplingPolicy,
    pub fill: String,
    pub mosaic_strategy: String,
    pub nodata_policy: String,
    pub coverage_min: f64,
    pub coverage_hard_fail: bool,
    pub validation: ValidationMode,
    pub continue_on_error: bool,
    pub workers: usize,
}

/// The pre-run build plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildPlan {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub output: PathBuf,
    pub tiles: Vec<Tile>,
    pub dem_inputs: Vec<DemSourceInfo>,
    pub options: PlanOptions,
    /// Resolved tool commands as argv vectors.
    pub tool_commands: BTreeMap<String, Vec<String>>,
    pub tool_versions: Vec<ToolVersion>,
    pub provenance_mode: crate::cache::ProvenanceMode,
}

/// The normalized CLI + config merge, for exact replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfigLock {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub values: BTreeMap<String, serde_json::Value>,
}

/// The post-run build report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub status: BuildStatus,
    /// Per-tile results keyed by tile name; `BTreeMap` keeps output stable.
    pub tiles: BTreeMap<String, TileResult>,
}

impl BuildReport {
    /// Empty report shell.
    pub fn new(created_at: Option<String>) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            created_at,
            status: BuildStatus::Ok,
            tiles: BTreeMap::new(),
        }
    }

    /// Insert (or replace) one tile's result.
    pub fn record(&mut self, result: TileResult) {
        self.tiles.insert(result.tile.name(), result);
    }

    /// A prior `ok` result for the tile, if this report has one. Used by
    /// resume to skip finished tiles.
    pub fn prior_ok(&self, tile: &Tile) -> Option<&TileResult> {
        self.tiles
            .get(&tile.name())
            .filter(|r| matches!(r.status, TileStatus::Ok | TileStatus::Warning))
    }

    /// Derive the overall status from per-tile outcomes.
    ///
    /// `continue_on_error` keeps a partially-failed build at `Partial`;
    /// without it any failure marks the whole build `Error`. A build where
    /// every tile failed is always `Error`.
    pub fn finalize(&mut self, continue_on_error: bool, cancelled: bool) {
        if cancelled {
            self.status = BuildStatus::Cancelled;
            return;
        }
        let total = self.tiles.len();
        let failed = self.tiles.values().filter(|r| r.failed()).count();
        self.status = if failed == 0 {
            BuildStatus::Ok
        } else if failed == total {
            BuildStatus::Error
        } else if continue_on_error {
            BuildStatus::Partial
        } else {
            BuildStatus::Error
        };
    }

    /// Process exit code per the orchestrator contract: 0 success, 2 at
    /// least one tile failed, 3 all tiles failed, 10 cancelled.
    pub fn exit_code(&self) -> i32 {
        if self.status == BuildStatus::Cancelled {
            return 10;
        }
        let total = self.tiles.len();
        let failed = self.tiles.values().filter(|r| r.failed()).count();
        if failed == 0 {
            0
        } else if failed == total && total > 0 {
            3
        } else {
            2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(tile: &str, status: TileStatus) -> TileResult {
        let mut r = TileResult::new(Tile::parse(tile).unwrap());
        r.status = status;
        r
    }

    #[test]
    fn test_issue_escalation() {
        let mut r = TileResult::new(Tile::parse("+47+008").unwrap());
        assert_eq!(r.status, TileStatus::Ok);

        r.push_warning(TileIssue::new(IssueKind::CoverageBelowThreshold, "62%"));
        assert_eq!(r.status, TileStatus::Warning);

        r.push_error(TileIssue::new(IssueKind::BackendFatal, "exit 1"));
        assert_eq!(r.status, TileStatus::Error);

        // Errors are not downgraded by later warnings.
        r.push_warning(TileIssue::new(IssueKind::EnrichmentFailure, "no ref"));
        assert_eq!(r.status, TileStatus::Error);
    }

    #[test]
    fn test_finalize_status_matrix() {
        let mut report = BuildReport::new(None);
        report.record(result("+47+008", TileStatus::Ok));
        report.record(result("+47+009", TileStatus::Error));

        report.finalize(true, false);
        assert_eq!(report.status, BuildStatus::Partial);
        report.finalize(false, false);
        assert_eq!(report.status, BuildStatus::Error);

        let mut all_failed = BuildReport::new(None);
        all_failed.record(result("+47+008", TileStatus::Error));
        all_failed.finalize(true, false);
        assert_eq!(all_failed.status, BuildStatus::Error);

        let mut cancelled = BuildReport::new(None);
        cancelled.finalize(true, true);
        assert_eq!(cancelled.status, BuildStatus::Cancelled);
    }

    #[test]
    fn test_exit_codes() {
        let mut report = BuildReport::new(None);
        report.record(result("+47+008", TileStatus::Ok));
        report.finalize(true, false);
        assert_eq!(report.exit_code(), 0);

        report.record(result("+47+009", TileStatus::Error));
        report.finalize(true, false);
        assert_eq!(report.exit_code(), 2);

        let mut all_failed = BuildReport::new(None);
        all_failed.record(result("+47+008", TileStatus::Error));
        all_failed.finalize(true, false);
        assert_eq!(all_failed.exit_code(), 3);

        let mut cancelled = BuildReport::new(None);
        cancelled.finalize(true, true);
        assert_eq!(cancelled.exit_code(), 10);
    }

    #[test]
    fn test_prior_ok_includes_warnings_only() {
        let mut report = BuildReport::new(None);
        report.record(result("+47+008", TileStatus::Warning));
        report.record(result("+47+009", TileStatus::Error));

        assert!(report.prior_ok(&Tile::parse("+47+008").unwrap()).is_some());
        assert!(report.prior_ok(&Tile::parse("+47+009").unwrap()).is_none());
        assert!(report.prior_ok(&Tile::parse("+00+000").unwrap()).is_none());
    }

    #[test]
    fn test_deterministic_report_serialization_is_stable() {
        let mut a = BuildReport::new(None);
        a.record(result("+47+009", TileStatus::Ok));
        a.record(result("+47+008", TileStatus::Ok));

        let mut b = BuildReport::new(None);
        b.record(result("+47+008", TileStatus::Ok));
        b.record(result("+47+009", TileStatus::Ok));

        // Insertion order must not leak into the serialized document.
        assert_eq!(
            serde_json::to_string_pretty(&a).unwrap(),
            serde_json::to_string_pretty(&b).unwrap()
        );
        assert!(!serde_json::to_string(&a).unwrap().contains("created_at"));
    }
}
