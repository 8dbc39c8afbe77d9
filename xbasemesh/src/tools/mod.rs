//! External tool invocation.
//!
//! Every external call in this crate goes through [`ToolCommand`]: an argv
//! vector whose first element is the executable and whose remaining elements
//! are arguments. Commands are values; nothing is ever flattened into a
//! shell string, so wrapper prefixes (`wine`, `nice`, an interpreter) survive
//! verbatim. Stdout is treated as machine output, stderr as human
//! diagnostics; both are captured.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::report::ToolVersion;

/// Default tool-paths filename, looked up next to the config file or under
/// the user config directory.
pub const TOOL_PATHS_FILE: &str = "tool_paths.json";

/// Interpreter used for script tools.
#[cfg(windows)]
pub const SCRIPT_INTERPRETER: &str = "python";
#[cfg(not(windows))]
pub const SCRIPT_INTERPRETER: &str = "python3";

/// Result type for tool operations.
pub type ToolResult<T> = Result<T, ToolError>;

/// Errors from tool configuration and invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool-paths file is missing or malformed.
    #[error("tool paths file {path}: {reason}")]
    PathsFile { path: PathBuf, reason: String },

    /// A required tool has no command configured.
    #[error("tool '{0}' is not configured in the tool paths file")]
    NotConfigured(&'static str),

    /// A command vector was empty.
    #[error("empty command vector for tool '{0}'")]
    EmptyCommand(String),

    /// Spawning the process failed.
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    /// The tool exited unsuccessfully.
    #[error("'{program}' failed ({status}): {stderr_head}")]
    Failed {
        program: String,
        status: String,
        stderr_head: String,
    },
}

/// An external tool command as an argv vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    argv: Vec<String>,
}

impl ToolCommand {
    /// Wrap an argv vector; rejects empty vectors.
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> ToolResult<Self> {
        if argv.is_empty() {
            return Err(ToolError::EmptyCommand(name.into()));
        }
        Ok(Self { argv })
    }

    /// The executable (first argv element).
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// The full argv vector.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Full argv with extra arguments appended.
    pub fn with_args<I, S>(&self, extra: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = self.argv.clone();
        argv.extend(extra.into_iter().map(Into::into));
        argv
    }

    /// Resolve a script tool to interpreter + script.
    ///
    /// If some argv token is a `.py` script not already preceded by an
    /// interpreter, the interpreter is inserted directly before it. Tokens
    /// before the script are user wrapper prefixes and stay in front.
    pub fn resolved(&self) -> ToolCommand {
        let script_index = self
            .argv
            .iter()
            .position(|token| token.to_ascii_lowercase().ends_with(".py"));
        let Some(index) = script_index else {
            return self.clone();
        };
        if index > 0 && self.argv[index - 1].to_ascii_lowercase().contains("python") {
            return self.clone();
        }
        let mut argv = self.argv.clone();
        argv.insert(index, String::from(SCRIPT_INTERPRETER));
        ToolCommand { argv }
    }
}

/// Captured output of a finished tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, when the process exited normally.
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Whether the tool exited zero.
    pub fn success(&self) -> bool {
        self.status_code == Some(0)
    }
}

/// Run a tool to completion, capturing both streams.
pub fn run(
    command: &ToolCommand,
    extra_args: &[String],
    cwd: Option<&Path>,
) -> ToolResult<ToolOutput> {
    let argv = command.resolved().with_args(extra_args.iter().cloned());
    debug!(argv = ?argv, "running tool");

    let mut process = Command::new(&argv[0]);
    process.args(&argv[1..]);
    if let Some(dir) = cwd {
        process.current_dir(dir);
    }

    let output = process.output().map_err(|source| ToolError::Launch {
        program: argv[0].clone(),
        source,
    })?;

    Ok(ToolOutput {
        status_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Like [`run`], but a non-zero exit becomes a [`ToolError::Failed`].
pub fn run_checked(
    command: &ToolCommand,
    extra_args: &[String],
    cwd: Option<&Path>,
) -> ToolResult<ToolOutput> {
    let output = run(command, extra_args, cwd)?;
    if !output.success() {
        let stderr_head: String = output.stderr.lines().take(3).collect::<Vec<_>>().join(" | ");
        return Err(ToolError::Failed {
            program: command.program().to_string(),
            status: output
                .status_code
                .map(|c| format!("exit {c}"))
                .unwrap_or_else(|| String::from("killed")),
            stderr_head,
        });
    }
    Ok(output)
}

#[derive(Debug, Deserialize)]
struct ToolPathsFile {
    #[serde(default)]
    dsftool: Vec<String>,
    #[serde(default)]
    ddstool: Vec<String>,
    #[serde(default)]
    runner: Vec<String>,
    #[serde(default)]
    sevenzip: Vec<String>,
}

/// Resolved external tool commands.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    /// DSFTool (dsf <-> text conversion). Required for validation and
    /// enrichment.
    pub dsftool: Option<ToolCommand>,
    /// DDSTool, used by overlay collaborators; carried for provenance.
    pub ddstool: Option<ToolCommand>,
    /// The mesh-generation runner (Ortho4XP entry point).
    pub runner: Option<ToolCommand>,
    /// 7-Zip for non-tar archives.
    pub sevenzip: Option<ToolCommand>,
}

impl ToolPaths {
    /// Load the tool-paths JSON (`{"dsftool": [...], "runner": [...], ...}`).
    pub fn load(path: &Path) -> ToolResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ToolError::PathsFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file: ToolPathsFile =
            serde_json::from_str(&text).map_err(|e| ToolError::PathsFile {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let opt = |name: &str, argv: Vec<String>| -> ToolResult<Option<ToolCommand>> {
            if argv.is_empty() {
                Ok(None)
            } else {
                ToolCommand::new(name, argv).map(Some)
            }
        };
        Ok(Self {
            dsftool: opt("dsftool", file.dsftool)?,
            ddstool: opt("ddstool", file.ddstool)?,
            runner: opt("runner", file.runner)?,
            sevenzip: opt("sevenzip", file.sevenzip)?,
        })
    }

    /// Default location under the user config directory.
    pub fn default_location() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("xbasemesh").join(TOOL_PATHS_FILE))
    }

    /// The runner command, or a structured error.
    pub fn runner(&self) -> ToolResult<&ToolCommand> {
        self.runner.as_ref().ok_or(ToolError::NotConfigured("runner"))
    }

    /// The DSFTool command, or a structured error.
    pub fn dsftool(&self) -> ToolResult<&ToolCommand> {
        self.dsftool
            .as_ref()
            .ok_or(ToolError::NotConfigured("dsftool"))
    }

    /// Resolved argv vectors for the build plan.
    pub fn plan_commands(&self) -> BTreeMap<String, Vec<String>> {
        let mut map = BTreeMap::new();
        let mut put = |name: &str, cmd: &Option<ToolCommand>| {
            if let Some(cmd) = cmd {
                map.insert(name.to_string(), cmd.resolved().argv().to_vec());
            }
        };
        put("dsftool", &self.dsftool);
        put("ddstool", &self.ddstool);
        put("runner", &self.runner);
        put("sevenzip", &self.sevenzip);
        map
    }
}

/// Probe a tool's version by running it with `--version` and scanning for
/// the first dotted version token. Failures are `None`; version probing
/// never blocks a build.
pub fn probe_version(command: &ToolCommand) -> Option<String> {
    let output = run(command, &[String::from("--version")], None).ok()?;
    let text = if output.stdout.trim().is_empty() {
        &output.stderr
    } else {
        &output.stdout
    };
    extract_version(text)
}

/// First dotted version token in free-form tool output.
pub fn extract_version(text: &str) -> Option<String> {
    let pattern = Regex::new(r"\b(\d+\.\d+(?:\.\d+)?)\b").expect("version regex compiles");
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Compare a pinned version against an observed one.
///
/// Two-part versions are padded before the semver comparison, so `1.3`
/// pins `1.3.0`.
pub fn version_drift(name: &str, pinned: Option<&str>, observed: Option<&str>) -> ToolVersion {
    let normalize = |v: &str| {
        let dots = v.matches('.').count();
        match dots {
            0 => format!("{v}.0.0"),
            1 => format!("{v}.0"),
            _ => v.to_string(),
        }
    };
    let drift = match (pinned, observed) {
        (Some(pinned), Some(observed)) => {
            match (
                semver::Version::parse(&normalize(pinned)),
                semver::Version::parse(&normalize(observed)),
            ) {
                (Ok(p), Ok(o)) => p != o,
                _ => pinned != observed,
            }
        }
        (Some(_), None) => true,
        _ => false,
    };
    ToolVersion {
        name: name.to_string(),
        pinned: pinned.map(String::from),
        observed: observed.map(String::from),
        drift,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cmd(tokens: &[&str]) -> ToolCommand {
        ToolCommand::new("test", tokens.iter().map(|s| s.to_string()).collect()).unwrap()
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            ToolCommand::new("x", Vec::new()),
            Err(ToolError::EmptyCommand(_))
        ));
    }

    #[test]
    fn test_binary_commands_resolve_unchanged() {
        let command = cmd(&["DSFTool", "--dsf2text"]);
        assert_eq!(command.resolved(), command);
    }

    #[test]
    fn test_script_gains_interpreter() {
        let resolved = cmd(&["/opt/Ortho4XP/Ortho4XP.py"]).resolved();
        assert_eq!(
            resolved.argv(),
            &[SCRIPT_INTERPRETER, "/opt/Ortho4XP/Ortho4XP.py"]
        );
    }

    #[test]
    fn test_wrapper_tokens_stay_in_front() {
        let resolved = cmd(&["nice", "Ortho4XP.py"]).resolved();
        assert_eq!(resolved.argv(), &["nice", SCRIPT_INTERPRETER, "Ortho4XP.py"]);
    }

    #[test]
    fn test_explicit_interpreter_not_duplicated() {
        let command = cmd(&["python3.11", "Ortho4XP.py", "--quiet"]);
        assert_eq!(command.resolved(), command);
    }

    #[test]
    fn test_with_args_never_flattens() {
        let argv = cmd(&["wine", "DSFTool.exe"]).with_args(["--dsf2text", "a b.dsf"]);
        assert_eq!(argv, vec!["wine", "DSFTool.exe", "--dsf2text", "a b.dsf"]);
    }

    #[test]
    fn test_tool_paths_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(TOOL_PATHS_FILE);
        std::fs::write(
            &path,
            r#"{
              "dsftool": ["/xp/Resources/DSFTool"],
              "runner": ["/opt/Ortho4XP/Ortho4XP.py"],
              "sevenzip": ["7z"]
            }"#,
        )
        .unwrap();

        let tools = ToolPaths::load(&path).unwrap();
        assert_eq!(tools.dsftool().unwrap().program(), "/xp/Resources/DSFTool");
        assert!(tools.ddstool.is_none());

        let plan = tools.plan_commands();
        assert_eq!(
            plan["runner"],
            vec![SCRIPT_INTERPRETER.to_string(), String::from("/opt/Ortho4XP/Ortho4XP.py")]
        );
    }

    #[test]
    fn test_missing_required_tool() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(TOOL_PATHS_FILE);
        std::fs::write(&path, r#"{"dsftool": ["DSFTool"]}"#).unwrap();
        let tools = ToolPaths::load(&path).unwrap();
        assert!(matches!(
            tools.runner(),
            Err(ToolError::NotConfigured("runner"))
        ));
    }

    #[test]
    fn test_extract_version() {
        assert_eq!(
            extract_version("Ortho4XP v1.40b rev 1.40.5"),
            Some(String::from("1.40"))
        );
        assert_eq!(extract_version("DSFTool 2.3"), Some(String::from("2.3")));
        assert_eq!(extract_version("no digits here"), None);
    }

    #[test]
    fn test_version_drift() {
        assert!(!version_drift("t", Some("1.3"), Some("1.3.0")).drift);
        assert!(version_drift("t", Some("1.3"), Some("1.4")).drift);
        assert!(version_drift("t", Some("1.3"), None).drift);
        assert!(!version_drift("t", None, Some("9.9")).drift);
    }
}
