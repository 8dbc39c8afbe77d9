//! The build context.
//!
//! Everything a tile worker needs travels in one explicit [`BuildContext`]
//! reference: merged options, resolved tools, output layout, the
//! cancellation token, the artifact cache, the event parser, and the
//! build-wide backend-config lock. There are no module-level singletons;
//! tests construct a fresh context per case.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::cache::NormalizationCache;
use crate::cancel::CancellationToken;
use crate::config::BuildOptions;
use crate::events::EventParser;
use crate::tools::ToolPaths;

/// Shared state for one build run. Workers hold `&BuildContext`.
pub struct BuildContext {
    pub options: BuildOptions,
    pub tools: ToolPaths,
    /// Output root: reports, normalized artifacts, logs, scenery.
    pub output: PathBuf,
    /// Mesh backend installation root.
    pub backend_root: PathBuf,
    /// Repository source root for the runner's module path.
    pub source_root: Option<PathBuf>,
    pub cancel: CancellationToken,
    pub cache: NormalizationCache,
    pub events: EventParser,
    /// Serializes backend config mutations; the backend reads one global
    /// file.
    pub config_lock: Mutex<()>,
}

impl BuildContext {
    /// Assemble a context for one run.
    pub fn new(
        options: BuildOptions,
        tools: ToolPaths,
        output: PathBuf,
        backend_root: PathBuf,
        source_root: Option<PathBuf>,
    ) -> Self {
        let cache = NormalizationCache::new(&output, options.cache_verify);
        Self {
            options,
            tools,
            output,
            backend_root,
            source_root,
            cancel: CancellationToken::new(),
            cache,
            events: EventParser::new(),
            config_lock: Mutex::new(()),
        }
    }

    /// `<output>/runner_logs`.
    pub fn runner_logs(&self) -> PathBuf {
        self.output.join("runner_logs")
    }

    /// `<output>/scratch`, for validation and enrichment round-trips.
    pub fn scratch(&self) -> PathBuf {
        self.output.join("scratch")
    }

    /// `<output>/scenery`, the scenery tree the backend builds into.
    pub fn scenery_root(&self) -> PathBuf {
        self.output.join("scenery")
    }

    /// Working directory for mosaic intermediates.
    pub fn mosaic_workdir(&self) -> PathBuf {
        self.output.join("normalized").join("mosaic")
    }

    /// Current timestamp, unless deterministic mode suppresses it.
    pub fn timestamp(&self) -> Option<String> {
        if self.options.deterministic {
            None
        } else {
            Some(chrono::Utc::now().to_rfc3339())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let ctx = BuildContext::new(
            BuildOptions::default(),
            ToolPaths {
                dsftool: None,
                ddstool: None,
                runner: None,
                sevenzip: None,
            },
            PathBuf::from("/out"),
            PathBuf::from("/backend"),
            None,
        );
        assert_eq!(ctx.runner_logs(), Path::new("/out/runner_logs"));
        assert_eq!(ctx.scenery_root(), Path::new("/out/scenery"));
        assert!(ctx.cache.root().starts_with("/out/normalized"));
    }

    #[test]
    fn test_deterministic_mode_suppresses_timestamps() {
        let mut options = BuildOptions::default();
        options.deterministic = true;
        let ctx = BuildContext::new(
            options,
            ToolPaths {
                dsftool: None,
                ddstool: None,
                runner: None,
                sevenzip: None,
            },
            PathBuf::from("/out"),
            PathBuf::from("/backend"),
            None,
        );
        assert!(ctx.timestamp().is_none());
    }
}
