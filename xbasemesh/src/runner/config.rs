//! Backend config patch and restore.
//!
//! The mesh backend reads one global `Ortho4XP.cfg` (`key=value` lines).
//! Before an attempt the orchestrator patches it; afterwards the original
//! state is restored exactly, where "the file did not exist" is a distinct
//! state that restores to absence. The guard restores on drop so no exit
//! path can leak a patched config.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Pre-patch state of the backend config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSnapshot {
    /// The file did not exist.
    Absent,
    /// The file existed with exactly this content.
    Present(String),
}

/// Snapshot the current state of a config file.
pub fn snapshot(path: &Path) -> io::Result<ConfigSnapshot> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(ConfigSnapshot::Present(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ConfigSnapshot::Absent),
        Err(e) => Err(e),
    }
}

/// Restore a config file to a snapshot, including absence.
pub fn restore(path: &Path, state: &ConfigSnapshot) -> io::Result<()> {
    match state {
        ConfigSnapshot::Present(content) => std::fs::write(path, content),
        ConfigSnapshot::Absent => match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        },
    }
}

/// Apply `key=value` overrides to config content.
///
/// Existing keys are rewritten in place; new keys are appended. Comments and
/// unrelated lines are preserved byte-for-byte.
pub fn apply_overrides(original: &str, overrides: &[(String, String)]) -> String {
    let mut lines: Vec<String> = if original.is_empty() {
        Vec::new()
    } else {
        original.lines().map(String::from).collect()
    };

    for (key, value) in overrides {
        let mut replaced = false;
        for line in lines.iter_mut() {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                continue;
            }
            if let Some((name, _)) = trimmed.split_once('=') {
                if name.trim() == key {
                    *line = format!("{key}={value}");
                    replaced = true;
                    break;
                }
            }
        }
        if !replaced {
            lines.push(format!("{key}={value}"));
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// RAII guard over a patched config file.
///
/// Taken before the first patch; restores the snapshot when dropped unless
/// `persist` was requested or [`ConfigGuard::restore_now`] already ran.
#[derive(Debug)]
pub struct ConfigGuard {
    path: PathBuf,
    snapshot: ConfigSnapshot,
    persist: bool,
    restored: bool,
}

impl ConfigGuard {
    /// Snapshot the file and arm the guard.
    pub fn take(path: &Path, persist: bool) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            snapshot: snapshot(path)?,
            persist,
            restored: false,
        })
    }

    /// The pre-patch snapshot.
    pub fn snapshot_content(&self) -> &ConfigSnapshot {
        &self.snapshot
    }

    /// Content to patch against: the original file, or empty when absent.
    pub fn base_content(&self) -> &str {
        match &self.snapshot {
            ConfigSnapshot::Present(content) => content,
            ConfigSnapshot::Absent => "",
        }
    }

    /// Restore eagerly, surfacing the error to the caller.
    pub fn restore_now(&mut self) -> io::Result<()> {
        if self.restored || self.persist {
            self.restored = true;
            return Ok(());
        }
        restore(&self.path, &self.snapshot)?;
        self.restored = true;
        Ok(())
    }
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        if self.restored || self.persist {
            return;
        }
        if let Err(e) = restore(&self.path, &self.snapshot) {
            warn!(
                path = %self.path.display(),
                error = %e,
                "failed to restore backend config on drop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn over(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_apply_replaces_and_appends() {
        let original = "# density\ncurvature_tol=2.0\nmin_angle=17\n";
        let patched = apply_overrides(&original, &over(&[("min_angle", "10"), ("apt_smoothing_pix", "8")]));
        assert_eq!(
            patched,
            "# density\ncurvature_tol=2.0\nmin_angle=10\napt_smoothing_pix=8\n"
        );
    }

    #[test]
    fn test_apply_to_empty_content() {
        let patched = apply_overrides("", &over(&[("min_angle", "10")]));
        assert_eq!(patched, "min_angle=10\n");
    }

    #[test]
    fn test_commented_keys_are_not_replaced() {
        let patched = apply_overrides("# min_angle=17\n", &over(&[("min_angle", "10")]));
        assert_eq!(patched, "# min_angle=17\nmin_angle=10\n");
    }

    #[test]
    fn test_guard_restores_present_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Ortho4XP.cfg");
        std::fs::write(&path, "min_angle=17\n").unwrap();

        {
            let _guard = ConfigGuard::take(&path, false).unwrap();
            std::fs::write(&path, "min_angle=5\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "min_angle=17\n");
    }

    #[test]
    fn test_guard_restores_absence() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Ortho4XP.cfg");

        {
            let _guard = ConfigGuard::take(&path, false).unwrap();
            std::fs::write(&path, "min_angle=5\n").unwrap();
        }
        // The file was absent before the run; it must be absent after.
        assert!(!path.exists());
    }

    #[test]
    fn test_guard_persist_keeps_patch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Ortho4XP.cfg");

        {
            let _guard = ConfigGuard::take(&path, true).unwrap();
            std::fs::write(&path, "min_angle=5\n").unwrap();
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "min_angle=5\n");
    }

    #[test]
    fn test_restore_now_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("Ortho4XP.cfg");
        std::fs::write(&path, "a=1\n").unwrap();

        let mut guard = ConfigGuard::take(&path, false).unwrap();
        std::fs::write(&path, "a=2\n").unwrap();
        guard.restore_now().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a=1\n");

        // Mutating again after restore: drop must not clobber it.
        std::fs::write(&path, "a=3\n").unwrap();
        drop(guard);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a=3\n");
    }
}
