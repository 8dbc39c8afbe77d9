//! External runner orchestration.
//!
//! Turns a per-tile job into a correct invocation of the mesh backend:
//! stage the normalized DEM, patch the backend's global config, invoke with
//! supervision, climb the retry ladder on recognized transients, and restore
//! the config on every exit path. Config mutations are serialized through
//! the build-wide lock because the backend reads a single global file.

mod config;
mod invoke;
mod retry;
mod staging;

pub use config::{apply_overrides, ConfigGuard, ConfigSnapshot};
pub use invoke::{invoke, EndReason, InvocationResult, InvocationSpec};
pub use retry::{is_transient, ladder, RetryAttempt};
pub use staging::stage_dem;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::events::{EventLog, EventParser};
use crate::report::{write_json, IssueKind, TileIssue};
use crate::tile::Tile;
use crate::tools::ToolCommand;

/// Name of the backend's global config file.
pub const BACKEND_CONFIG_NAME: &str = "Ortho4XP.cfg";

/// Schema version of the preserved per-tile config document.
const TILE_CONFIG_SCHEMA_VERSION: u32 = 1;

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors from runner orchestration. These are infrastructure failures;
/// backend exit codes are data, not errors.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Filesystem failure while staging or logging.
    #[error("runner I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The backend process could not be spawned at all.
    #[error("failed to launch backend '{program}': {source}")]
    Launch {
        program: String,
        source: std::io::Error,
    },

    /// Persisting a report document failed.
    #[error(transparent)]
    Report(#[from] crate::report::ReportError),
}

/// A per-tile backend job.
#[derive(Debug)]
pub struct RunnerJob<'a> {
    pub tile: Tile,
    /// Normalized tile artifact to stage.
    pub artifact: &'a Path,
    /// The backend installation root (holds `Elevation_data/`, the config,
    /// and the output scenery tree).
    pub backend_root: &'a Path,
    /// Repository source root prepended to the interpreter module path.
    pub source_root: Option<&'a Path>,
    /// Log directory (`<output>/runner_logs`).
    pub runner_logs: &'a Path,
    /// The runner command from the tool paths file.
    pub runner_cmd: &'a ToolCommand,
    /// Density-preset and per-tile config overrides.
    pub base_overrides: Vec<(String, String)>,
    pub timeout: Duration,
    pub watchdog: Duration,
    pub grace: Duration,
    /// Skip config restoration (debugging aid).
    pub persist_config: bool,
}

/// What happened to a tile's backend job.
#[derive(Debug)]
pub struct RunnerOutcome {
    /// Attempts performed (1 = no retries).
    pub attempts: u32,
    pub success: bool,
    pub cancelled: bool,
    /// All ladder rungs were burned on recognized transients.
    pub ladder_exhausted: bool,
    pub final_status: Option<i32>,
    /// The exact argv of the final attempt.
    pub command: Vec<String>,
    /// Path of the staged DEM.
    pub staged_dem: PathBuf,
    /// Path of the persisted event log.
    pub event_log: PathBuf,
    /// Retry notices to fold into the tile result as warnings.
    pub warnings: Vec<TileIssue>,
    /// Terminal failure, when the job did not succeed.
    pub error: Option<TileIssue>,
}

#[derive(Serialize)]
struct PreservedTileConfig<'a> {
    schema_version: u32,
    tile: Tile,
    attempts: u32,
    overrides: BTreeMap<&'a str, &'a str>,
    content: &'a str,
}

/// Run the backend for one tile, with staging, retry ladder, and guaranteed
/// config restoration.
pub fn run_tile(
    job: &RunnerJob<'_>,
    config_lock: &Mutex<()>,
    parser: &EventParser,
    cancel: &CancellationToken,
) -> RunnerResult<RunnerOutcome> {
    std::fs::create_dir_all(job.runner_logs).map_err(|source| RunnerError::Io {
        path: job.runner_logs.to_path_buf(),
        source,
    })?;
    let tile_name = job.tile.name();
    let run_log_path = job.runner_logs.join(format!("{tile_name}.run.log"));
    let stdout_log = job.runner_logs.join(format!("{tile_name}.stdout.log"));
    let stderr_log = job.runner_logs.join(format!("{tile_name}.stderr.log"));
    let events_path = job.runner_logs.join(format!("{tile_name}.events.json"));
    let config_copy_path = job.runner_logs.join(format!("{tile_name}.config.json"));
    for stale in [&run_log_path, &stdout_log, &stderr_log] {
        let _ = std::fs::remove_file(stale);
    }

    let staged_dem = stage_dem(&job.tile, job.artifact, job.backend_root)?;

    let config_path = job.backend_root.join(BACKEND_CONFIG_NAME);
    let mut guard = {
        let _serialize = config_lock.lock();
        ConfigGuard::take(&config_path, job.persist_config).map_err(|source| RunnerError::Io {
            path: config_path.clone(),
            source,
        })?
    };

    let mut run_log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&run_log_path)
        .map_err(|source| RunnerError::Io {
            path: run_log_path.clone(),
            source,
        })?;

    let argv = job
        .runner_cmd
        .resolved()
        .with_args([job.tile.lat().to_string(), job.tile.lon().to_string()]);

    let mut event_log = EventLog::new(job.runner_cmd.program(), job.tile);
    let mut warnings = Vec::new();
    let mut attempts = 0u32;
    let mut success = false;
    let mut cancelled = false;
    let mut ladder_exhausted = false;
    let mut final_status = None;
    let mut last_patched = String::new();
    let mut final_overrides: Vec<(String, String)> = Vec::new();

    let rungs = ladder();
    for (index, rung) in rungs.iter().enumerate() {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        attempts += 1;

        let mut overrides = job.base_overrides.clone();
        overrides.extend(rung.overrides.iter().cloned());
        {
            // Patch on top of the pristine snapshot, never on a previous
            // attempt's patch.
            let _serialize = config_lock.lock();
            last_patched = apply_overrides(guard.base_content(), &overrides);
            std::fs::write(&config_path, &last_patched).map_err(|source| RunnerError::Io {
                path: config_path.clone(),
                source,
            })?;
        }
        final_overrides = overrides;

        let _ = writeln!(
            run_log,
            "=== attempt {attempts} ({}) ===\ncommand: {}",
            rung.label,
            argv.join(" ")
        );
        info!(tile = %job.tile, attempt = attempts, label = rung.label, "invoking backend");

        let spec = InvocationSpec {
            argv: argv.clone(),
            cwd: job.backend_root.to_path_buf(),
            source_root: job.source_root.map(Path::to_path_buf),
            timeout: job.timeout,
            watchdog: job.watchdog,
            grace: job.grace,
        };
        let result = invoke(&spec, parser, cancel, &stdout_log, &stderr_log)?;

        let _ = writeln!(
            run_log,
            "attempt {attempts}: end={:?} status={:?} duration={}s events={}",
            result.end_reason,
            result.status_code,
            result.duration.as_secs(),
            result.events.events.len()
        );

        final_status = result.status_code;
        let attempt_success = result.success();
        let transient = is_transient(&result);
        let was_cancelled = result.end_reason == EndReason::Cancelled;
        event_log.push_attempt(result.events);

        if attempt_success {
            success = true;
            break;
        }
        if was_cancelled {
            cancelled = true;
            break;
        }
        if transient && index + 1 < rungs.len() {
            warnings.push(
                TileIssue::new(
                    IssueKind::BackendTransient,
                    format!(
                        "attempt {attempts} failed with a recognized transient; retrying with {}",
                        rungs[index + 1].label
                    ),
                ),
            );
            continue;
        }
        if transient {
            ladder_exhausted = true;
        }
        break;
    }

    // Provenance copy of the per-tile patched config, then restoration.
    // Both happen on every path that patched, success or not.
    if attempts > 0 {
        let preserved = PreservedTileConfig {
            schema_version: TILE_CONFIG_SCHEMA_VERSION,
            tile: job.tile,
            attempts,
            overrides: final_overrides
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            content: &last_patched,
        };
        write_json(&config_copy_path, &preserved)?;
    }
    {
        let _serialize = config_lock.lock();
        if let Err(e) = guard.restore_now() {
            warn!(tile = %job.tile, error = %e, "config restoration failed");
        }
    }

    write_json(&events_path, &event_log)?;
    for (index, attempt) in event_log.attempts.iter().enumerate() {
        let _ = writeln!(
            run_log,
            "attempt {} event summary: {:?}",
            index + 1,
            attempt.kind_counts()
        );
    }
    let _ = writeln!(run_log, "final command: {}", argv.join(" "));

    let error = if success || cancelled {
        None
    } else if ladder_exhausted {
        Some(
            TileIssue::new(
                IssueKind::BackendTransient,
                format!("retry ladder exhausted after {attempts} attempts"),
            )
            .with_hint("inspect the tile's stderr log; the terrain may need a manual min_angle"),
        )
    } else {
        Some(TileIssue::new(
            IssueKind::BackendFatal,
            match final_status {
                Some(code) => format!("backend exited with status {code}"),
                None => String::from("backend was killed before exiting"),
            },
        ))
    };

    Ok(RunnerOutcome {
        attempts,
        success,
        cancelled,
        ladder_exhausted,
        final_status,
        command: argv,
        staged_dem,
        event_log: events_path,
        warnings,
        error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner_script(temp: &TempDir, body: &str) -> ToolCommand {
        let script = temp.path().join("fake_backend.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        ToolCommand::new("runner", vec![script.display().to_string()]).unwrap()
    }

    fn job<'a>(
        tile: &Tile,
        artifact: &'a Path,
        backend_root: &'a Path,
        logs: &'a Path,
        cmd: &'a ToolCommand,
    ) -> RunnerJob<'a> {
        RunnerJob {
            tile: *tile,
            artifact,
            backend_root,
            source_root: None,
            runner_logs: logs,
            runner_cmd: cmd,
            base_overrides: vec![(String::from("curvature_tol"), String::from("2.0"))],
            timeout: Duration::from_secs(20),
            watchdog: Duration::from_secs(20),
            grace: Duration::from_millis(200),
            persist_config: false,
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_successful_run_restores_absent_config() {
        let temp = TempDir::new().unwrap();
        let backend = temp.path().join("backend");
        let logs = temp.path().join("out/runner_logs");
        std::fs::create_dir_all(&backend).unwrap();
        let artifact = temp.path().join("+47+008.tif");
        std::fs::write(&artifact, b"dem").unwrap();

        let cmd = runner_script(&temp, "echo 'Step 1 : ok'; echo 'Time for this tile: 1s'");
        let tile = Tile::parse("+47+008").unwrap();
        let outcome = run_tile(
            &job(&tile, &artifact, &backend, &logs, &cmd),
            &Mutex::new(()),
            &EventParser::new(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.warnings.is_empty());
        assert!(outcome.error.is_none());
        // The config was patched for the run and must be absent again.
        assert!(!backend.join(BACKEND_CONFIG_NAME).exists());
        // Provenance copy, events, and logs all exist.
        assert!(logs.join("+47+008.config.json").exists());
        assert!(logs.join("+47+008.events.json").exists());
        assert!(logs.join("+47+008.stdout.log").exists());
        assert!(outcome.staged_dem.ends_with("Elevation_data/+40+000/N47E008.tif"));
    }

    #[cfg(unix)]
    #[test]
    fn test_fatal_failure_restores_existing_config() {
        let temp = TempDir::new().unwrap();
        let backend = temp.path().join("backend");
        std::fs::create_dir_all(&backend).unwrap();
        let original = "min_angle=17\ncustom=yes\n";
        std::fs::write(backend.join(BACKEND_CONFIG_NAME), original).unwrap();

        let logs = temp.path().join("out/runner_logs");
        let artifact = temp.path().join("+47+008.tif");
        std::fs::write(&artifact, b"dem").unwrap();

        let cmd = runner_script(&temp, "echo 'ERROR: no imagery provider' >&2; exit 2");
        let tile = Tile::parse("+47+008").unwrap();
        let outcome = run_tile(
            &job(&tile, &artifact, &backend, &logs, &cmd),
            &Mutex::new(()),
            &EventParser::new(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.error.as_ref().unwrap().kind, IssueKind::BackendFatal);
        assert_eq!(
            std::fs::read_to_string(backend.join(BACKEND_CONFIG_NAME)).unwrap(),
            original
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_transient_failure_climbs_ladder_then_succeeds() {
        let temp = TempDir::new().unwrap();
        let backend = temp.path().join("backend");
        std::fs::create_dir_all(&backend).unwrap();
        let logs = temp.path().join("out/runner_logs");
        let artifact = temp.path().join("+47+008.tif");
        std::fs::write(&artifact, b"dem").unwrap();

        // Fails with the triangle diagnostic until min_angle is patched low.
        let marker = temp.path().join("attempted");
        let cmd = runner_script(
            &temp,
            &format!(
                "if [ -f {marker} ]; then echo 'Time for this tile: 2s'; exit 0; \
                 else touch {marker}; echo 'ERROR: 17 tiny triangles left' >&2; exit 1; fi",
                marker = marker.display()
            ),
        );

        let tile = Tile::parse("+47+008").unwrap();
        let outcome = run_tile(
            &job(&tile, &artifact, &backend, &logs, &cmd),
            &Mutex::new(()),
            &EventParser::new(),
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.attempts, 2);
        assert!(outcome
            .warnings
            .iter()
            .any(|i| i.kind == IssueKind::BackendTransient));
        assert!(outcome.error.is_none());

        // Event log records both attempts: the failure and the recovery.
        let events: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(outcome.event_log).unwrap()).unwrap();
        assert_eq!(events["attempts"].as_array().unwrap().len(), 2);

        // The preserved per-tile config shows the rung that succeeded.
        let preserved: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(logs.join("+47+008.config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(preserved["overrides"]["min_angle"], "10");
        assert_eq!(preserved["overrides"]["curvature_tol"], "2.0");
    }

    #[cfg(unix)]
    #[test]
    fn test_cancelled_before_start_runs_nothing() {
        let temp = TempDir::new().unwrap();
        let backend = temp.path().join("backend");
        std::fs::create_dir_all(&backend).unwrap();
        let logs = temp.path().join("out/runner_logs");
        let artifact = temp.path().join("+47+008.tif");
        std::fs::write(&artifact, b"dem").unwrap();

        let cmd = runner_script(&temp, "exit 0");
        let token = CancellationToken::new();
        token.cancel();

        let tile = Tile::parse("+47+008").unwrap();
        let outcome = run_tile(
            &job(&tile, &artifact, &backend, &logs, &cmd),
            &Mutex::new(()),
            &EventParser::new(),
            &token,
        )
        .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.attempts, 0);
        assert!(!backend.join(BACKEND_CONFIG_NAME).exists());
    }
}
