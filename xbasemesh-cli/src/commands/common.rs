//! Shared command plumbing: config resolution, tool discovery, diagnostics.

use std::path::{Path, PathBuf};

use xbasemesh::config::{BuildOptions, ConfigFile};
use xbasemesh::tools::ToolPaths;
use xbasemesh::BuildError;

/// Global flags shared by all subcommands.
pub struct Common {
    pub config: Option<PathBuf>,
    pub tool_paths: Option<PathBuf>,
    pub json_logs: bool,
}

/// Config file plus derived paths.
pub struct Resolved {
    pub options: BuildOptions,
    pub tools: ToolPaths,
    pub backend_root: Option<PathBuf>,
    pub source_root: Option<PathBuf>,
}

impl Common {
    /// Load the config file and tool paths, applying the layered defaults.
    pub fn resolve(&self) -> Result<Resolved, BuildError> {
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("xbasemesh.ini"));
        let config = ConfigFile::load(&config_path)?;

        let mut options = BuildOptions::default();
        config.apply(&mut options)?;

        let tool_paths_file = self
            .tool_paths
            .clone()
            .or_else(|| config.tool_paths())
            .or_else(ToolPaths::default_location);
        let tools = match tool_paths_file {
            Some(path) if path.is_file() => ToolPaths::load(&path)?,
            _ => ToolPaths {
                dsftool: None,
                ddstool: None,
                runner: None,
                sevenzip: None,
            },
        };

        Ok(Resolved {
            options,
            tools,
            backend_root: config.backend_root(),
            source_root: config.source_root(),
        })
    }

    /// Report a build-level error on stderr, honoring `--json-logs`, and
    /// return its exit code.
    pub fn fail(&self, error: &BuildError) -> i32 {
        if self.json_logs {
            let line = serde_json::json!({
                "reason": error.reason_code(),
                "message": error.to_string(),
                "hint": error.hint(),
            });
            eprintln!("{line}");
        } else {
            eprintln!("error: {error}");
            if let Some(hint) = error.hint() {
                eprintln!("hint: {hint}");
            }
        }
        error.exit_code()
    }
}

/// Parse a comma- or whitespace-separated tile list.
pub fn parse_tiles(raw: &[String]) -> Result<Vec<xbasemesh::Tile>, BuildError> {
    let mut tiles = Vec::new();
    for chunk in raw {
        for name in chunk.split([',', ' ']).filter(|s| !s.is_empty()) {
            let tile = xbasemesh::Tile::parse(name)?;
            if !tiles.contains(&tile) {
                tiles.push(tile);
            }
        }
    }
    Ok(tiles)
}

/// Print a per-tile summary of a finished report.
pub fn print_report_summary(json_logs: bool, report: &xbasemesh::BuildReport) {
    if json_logs {
        for (name, result) in &report.tiles {
            let line = serde_json::json!({
                "tile": name,
                "status": result.status,
                "attempts": result.attempts,
                "cache_hit": result.cache_hit,
                "warnings": result.warnings.len(),
                "errors": result.errors.iter().map(|e| serde_json::json!({
                    "reason": e.kind,
                    "message": e.message,
                    "hint": e.hint,
                })).collect::<Vec<_>>(),
            });
            println!("{line}");
        }
        return;
    }

    for (name, result) in &report.tiles {
        let status = format!("{:?}", result.status).to_lowercase();
        println!("{name}: {status}");
        for warning in &result.warnings {
            println!("  warning: {}", warning.message);
        }
        for error in &result.errors {
            println!("  error: {}", error.message);
            if let Some(hint) = &error.hint {
                println!("  hint: {hint}");
            }
        }
    }
    println!("overall: {:?}", report.status);
}

/// Require a directory argument or a config-file fallback.
pub fn require_dir(
    flag: Option<PathBuf>,
    fallback: Option<PathBuf>,
    what: &str,
    hint: &str,
) -> Result<PathBuf, BuildError> {
    flag.or(fallback)
        .ok_or_else(|| BuildError::invalid_with_hint(format!("{what} not set"), hint))
}

/// Best-effort directory creation with an invalid-input error.
pub fn ensure_dir(path: &Path) -> Result<(), BuildError> {
    std::fs::create_dir_all(path)
        .map_err(|e| BuildError::invalid(format!("cannot create {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_tiles_mixed_separators() {
        let tiles = parse_tiles(&[
            String::from("+47+008,+47+009"),
            String::from("-03+017 +47+008"),
        ])
        .unwrap();
        let names: Vec<String> = tiles.iter().map(|t| t.name()).collect();
        // Duplicates collapse; order of first occurrence is kept.
        assert_eq!(names, vec!["+47+008", "+47+009", "-03+017"]);
    }

    #[test]
    fn test_parse_tiles_rejects_bad_names() {
        assert!(parse_tiles(&[String::from("N47E008")]).is_err());
    }

    #[test]
    fn test_require_dir_prefers_flag_over_fallback() {
        let dir = require_dir(
            Some(PathBuf::from("/flag")),
            Some(PathBuf::from("/config")),
            "backend root",
            "set it",
        )
        .unwrap();
        assert_eq!(dir, PathBuf::from("/flag"));

        let err = require_dir(None, None, "backend root", "set it").unwrap_err();
        assert_eq!(err.hint(), Some("set it"));
    }

    #[test]
    fn test_resolve_reads_config_and_tool_paths() {
        let temp = TempDir::new().unwrap();
        let config = temp.path().join("xbasemesh.ini");
        let tool_paths = temp.path().join("tool_paths.json");
        std::fs::write(
            &config,
            format!(
                "[build]\nworkers = 3\n[paths]\nbackend_root = /opt/Ortho4XP\ntool_paths = {}\n",
                tool_paths.display()
            ),
        )
        .unwrap();
        std::fs::write(&tool_paths, r#"{"runner": ["/opt/Ortho4XP/Ortho4XP.py"]}"#).unwrap();

        let common = Common {
            config: Some(config),
            tool_paths: None,
            json_logs: false,
        };
        let resolved = common.resolve().unwrap();
        assert_eq!(resolved.options.workers, 3);
        assert_eq!(resolved.backend_root, Some(PathBuf::from("/opt/Ortho4XP")));
        assert!(resolved.tools.runner().is_ok());
    }
}
