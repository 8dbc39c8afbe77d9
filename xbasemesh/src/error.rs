//! Top-level build errors.
//!
//! Only failures that invalidate the whole run live here; anything scoped
//! to one tile is a value inside its [`crate::report::TileResult`]. The CLI
//! maps these onto the exit-code contract (`1` invalid inputs, `10`
//! cancelled), while per-tile outcomes drive `0/2/3` via
//! [`crate::report::BuildReport::exit_code`].

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::crs::CrsError;
use crate::extract::ExtractError;
use crate::patch::PatchError;
use crate::raster::RasterError;
use crate::report::ReportError;
use crate::stack::StackError;
use crate::tile::TileError;
use crate::tools::ToolError;

/// Result type for whole-build operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// A failure that stops the run before (or instead of) tile execution.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Malformed or inconsistent user input, surfaced before any tile runs.
    #[error("invalid input: {reason}")]
    InvalidInput {
        reason: String,
        hint: Option<String>,
    },

    #[error(transparent)]
    Tile(#[from] TileError),

    #[error(transparent)]
    Crs(#[from] CrsError),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error(transparent)]
    Stack(#[from] StackError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// The run was cancelled before completing.
    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    /// Invalid-input error without a hint.
    pub fn invalid(reason: impl Into<String>) -> Self {
        BuildError::InvalidInput {
            reason: reason.into(),
            hint: None,
        }
    }

    /// Invalid-input error with a remediation hint.
    pub fn invalid_with_hint(reason: impl Into<String>, hint: impl Into<String>) -> Self {
        BuildError::InvalidInput {
            reason: reason.into(),
            hint: Some(hint.into()),
        }
    }

    /// Remediation hint, when one is known.
    pub fn hint(&self) -> Option<&str> {
        match self {
            BuildError::InvalidInput { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }

    /// Kebab-case reason code for structured output.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BuildError::InvalidInput { .. }
            | BuildError::Tile(_)
            | BuildError::Crs(_)
            | BuildError::Stack(_)
            | BuildError::Config(_)
            | BuildError::Patch(_) => "invalid-input",
            BuildError::Cache(_) => "cache-inconsistency",
            BuildError::Raster(_) => "normalization-failure",
            BuildError::Tool(_) => "tool-failure",
            BuildError::Report(_) => "report-failure",
            BuildError::Extract(_) => "extraction-failure",
            BuildError::Cancelled => "cancelled",
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Cancelled => 10,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_maps_to_exit_1() {
        let err = BuildError::invalid_with_hint("projected CRS", "use EPSG:4326");
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.reason_code(), "invalid-input");
        assert_eq!(err.hint(), Some("use EPSG:4326"));
    }

    #[test]
    fn test_cancellation_maps_to_exit_10() {
        assert_eq!(BuildError::Cancelled.exit_code(), 10);
    }

    #[test]
    fn test_tile_errors_are_invalid_input() {
        let err: BuildError = crate::tile::TileError::InvalidTileName(String::from("xx")).into();
        assert_eq!(err.reason_code(), "invalid-input");
    }
}
