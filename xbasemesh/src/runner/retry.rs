//! The retry ladder.
//!
//! Triangulation occasionally collapses on degenerate geometry ("tiny
//! triangles"). The recovery that works in practice is mechanical: lower the
//! minimum triangulation angle, then lower it further and relax the area
//! constraint. Each rung re-patches the backend config on top of the
//! pristine snapshot and re-invokes.

use super::invoke::{EndReason, InvocationResult};

/// One rung of the ladder.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// Short label for logs and the run summary.
    pub label: &'static str,
    /// Config overrides applied on top of the base patch.
    pub overrides: Vec<(String, String)>,
}

/// The fixed ladder: as-configured, lowered min angle, relaxed constraints.
pub fn ladder() -> Vec<RetryAttempt> {
    let pair = |k: &str, v: &str| (k.to_string(), v.to_string());
    vec![
        RetryAttempt {
            label: "initial",
            overrides: Vec::new(),
        },
        RetryAttempt {
            label: "lowered min_angle",
            overrides: vec![pair("min_angle", "10")],
        },
        RetryAttempt {
            label: "relaxed constraints",
            overrides: vec![pair("min_angle", "5"), pair("curvature_tol", "3.0")],
        },
    ]
}

/// Whether a failed attempt is worth another rung.
///
/// Recognized transients: the triangulation diagnostic, the total timeout,
/// and the no-output watchdog. Cancellation and unrecognized failures are
/// terminal.
pub fn is_transient(result: &InvocationResult) -> bool {
    if result.success() {
        return false;
    }
    match result.end_reason {
        EndReason::Cancelled => false,
        EndReason::TimedOut | EndReason::Stalled => true,
        EndReason::Exited => result.events.triangle_failure().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AttemptEvents, EventParser, StreamName};
    use std::time::Duration;

    fn result_with(end_reason: EndReason, status: Option<i32>, lines: &[&str]) -> InvocationResult {
        let parser = EventParser::new();
        let events = AttemptEvents {
            events: lines
                .iter()
                .enumerate()
                .map(|(i, l)| {
                    parser.parse_line(String::from("t"), StreamName::Stderr, i as u64 + 1, l)
                })
                .collect(),
        };
        InvocationResult {
            status_code: status,
            end_reason,
            events,
            stdout_excerpt: Vec::new(),
            stderr_excerpt: Vec::new(),
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_ladder_shape() {
        let ladder = ladder();
        assert_eq!(ladder.len(), 3);
        assert!(ladder[0].overrides.is_empty());
        assert_eq!(ladder[1].overrides[0].0, "min_angle");
        assert_eq!(ladder[2].overrides.len(), 2);
    }

    #[test]
    fn test_triangle_diagnostic_is_transient() {
        let result = result_with(
            EndReason::Exited,
            Some(1),
            &["ERROR: 12 tiny triangles remain"],
        );
        assert!(is_transient(&result));
    }

    #[test]
    fn test_unrecognized_failure_is_terminal() {
        let result = result_with(EndReason::Exited, Some(1), &["ERROR: no such DEM"]);
        assert!(!is_transient(&result));
    }

    #[test]
    fn test_timeout_and_stall_are_transient() {
        assert!(is_transient(&result_with(EndReason::TimedOut, None, &[])));
        assert!(is_transient(&result_with(EndReason::Stalled, None, &[])));
    }

    #[test]
    fn test_cancellation_is_terminal() {
        let result = result_with(EndReason::Cancelled, None, &["tiny triangles"]);
        assert!(!is_transient(&result));
    }

    #[test]
    fn test_success_is_not_retried() {
        let result = result_with(EndReason::Exited, Some(0), &[]);
        assert!(!is_transient(&result));
    }
}
