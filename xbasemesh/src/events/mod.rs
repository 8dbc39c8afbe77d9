//! Structured parsing of mesh-backend output.
//!
//! The backend is chatty and line-oriented; a regex table turns the lines
//! that matter (step transitions, DEM staging notices, triangulation
//! diagnostics, terminal markers) into typed events. Everything else passes
//! through as `generic` so the persisted sequence keeps the full ordering.
//!
//! The per-tile event log is written as JSON
//! (`{schema_version, runner, tile, attempts: [{events: [...]}]}`) for
//! diagnostics bundling downstream.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::tile::Tile;

/// Schema version of the persisted event log.
pub const EVENTS_SCHEMA_VERSION: u32 = 1;

/// Recognized event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Step1,
    Step2,
    Step25,
    Step3,
    Overlay,
    Download,
    TriangleFail,
    Success,
    Failure,
    Generic,
}

/// Which stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerEvent {
    /// Arrival timestamp, RFC 3339.
    pub ts: String,
    pub stream: StreamName,
    /// 1-based line number within its stream.
    pub line_no: u64,
    pub kind: EventKind,
    /// Extracted fields (empty for `generic`).
    pub payload: BTreeMap<String, String>,
}

/// Events of one backend attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvents {
    pub events: Vec<RunnerEvent>,
}

impl AttemptEvents {
    /// Numeric hint of the first triangulation failure, if any.
    ///
    /// `Some(None)` means a failure without an extractable number.
    pub fn triangle_failure(&self) -> Option<Option<f64>> {
        self.events
            .iter()
            .find(|e| e.kind == EventKind::TriangleFail)
            .map(|e| e.payload.get("hint").and_then(|h| h.parse().ok()))
    }

    /// Whether a terminal success marker was seen.
    pub fn saw_success(&self) -> bool {
        self.events.iter().any(|e| e.kind == EventKind::Success)
    }

    /// Count events by kind, for report summaries.
    pub fn kind_counts(&self) -> BTreeMap<String, u64> {
        let mut counts = BTreeMap::new();
        for event in &self.events {
            let key = serde_json::to_value(event.kind)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_else(|| String::from("generic"));
            *counts.entry(key).or_insert(0) += 1;
        }
        counts
    }
}

/// The persisted per-tile event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    pub schema_version: u32,
    /// Name of the runner command, e.g. `Ortho4XP.py`.
    pub runner: String,
    pub tile: Tile,
    pub attempts: Vec<AttemptEvents>,
}

impl EventLog {
    /// New empty log for a tile.
    pub fn new(runner: impl Into<String>, tile: Tile) -> Self {
        Self {
            schema_version: EVENTS_SCHEMA_VERSION,
            runner: runner.into(),
            tile,
            attempts: Vec::new(),
        }
    }

    /// Append one attempt's events.
    pub fn push_attempt(&mut self, attempt: AttemptEvents) {
        self.attempts.push(attempt);
    }
}

#[derive(Clone)]
struct Rule {
    kind: EventKind,
    regex: Regex,
}

/// The regex-table line parser. Compiled once; clones share the compiled
/// automata.
#[derive(Clone)]
pub struct EventParser {
    rules: Vec<Rule>,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventParser {
    /// Build the parser with the built-in rule table.
    ///
    /// Order matters: step 2.5 must be probed before step 2, and terminal
    /// markers before the broad overlay rule.
    pub fn new() -> Self {
        let rule = |kind, pattern: &str| Rule {
            kind,
            regex: Regex::new(pattern).expect("event rule compiles"),
        };
        Self {
            rules: vec![
                rule(EventKind::Step25, r"(?i)^\s*step\s*2\.5\b"),
                rule(EventKind::Step1, r"(?i)^\s*step\s*1\s*:"),
                rule(EventKind::Step2, r"(?i)^\s*step\s*2\s*:"),
                rule(EventKind::Step3, r"(?i)^\s*step\s*3\s*:"),
                // The numeric hint may precede ("42 tiny triangles remain")
                // or follow ("tiny triangles (area 0.031)") the diagnostic;
                // both captures land in the `hint` field.
                rule(
                    EventKind::TriangleFail,
                    r"(?i)(?:(?P<hint>\d+(?:\.\d+)?)\D{0,40})?(?:tiny|degenerate|self-intersecting)\s+triangles?(?:\D*(?P<hint2>\d+(?:\.\d+)?))?",
                ),
                rule(
                    EventKind::Download,
                    r"(?i)(?:downloading|using cached)\s+(?:dem|elevation|srtm)(?:\s+(?P<file>\S+))?",
                ),
                rule(
                    EventKind::Success,
                    r"(?i)(?:tile\s+\S+\s+(?:finished|completed|done))|(?:time for this tile)",
                ),
                rule(
                    EventKind::Failure,
                    r"(?i)^\s*(?:error|fatal|traceback)\b",
                ),
                rule(EventKind::Overlay, r"(?i)\boverlays?\b"),
            ],
        }
    }

    /// Classify one line into an event.
    pub fn parse_line(
        &self,
        ts: String,
        stream: StreamName,
        line_no: u64,
        line: &str,
    ) -> RunnerEvent {
        for rule in &self.rules {
            if let Some(captures) = rule.regex.captures(line) {
                let mut payload = BTreeMap::new();
                for name in rule.regex.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        // Alternate capture positions share a field by
                        // digit suffix (`hint`/`hint2`); first match wins.
                        let field = name.trim_end_matches(|c: char| c.is_ascii_digit());
                        payload
                            .entry(field.to_string())
                            .or_insert_with(|| value.as_str().to_string());
                    }
                }
                return RunnerEvent {
                    ts,
                    stream,
                    line_no,
                    kind: rule.kind,
                    payload,
                };
            }
        }
        RunnerEvent {
            ts,
            stream,
            line_no,
            kind: EventKind::Generic,
            payload: BTreeMap::new(),
        }
    }
}
