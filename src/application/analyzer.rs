//! Completion detection over successive agent outputs.
//!
//! Watches each response for completion signals, a structured status
//! block, and degenerate test-only loops, and decides when the loop that
//! owns it should stop. The decision is a pure function of the observation
//! history; `reset()` behaves exactly like a fresh instance.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Case-insensitive phrases that signal the work is done.
const COMPLETION_PHRASES: &[&str] = &[
    "all tasks complete",
    "project complete",
    "implementation complete",
    "nothing left to do",
];

/// Phrases that indicate a test run.
const TEST_PHRASES: &[&str] = &[
    "running tests",
    "running the tests",
    "cargo test",
    "npm test",
    "pytest",
    "test suite",
    "tests pass",
    "tests passed",
    "all tests",
];

/// Verbs that indicate implementation work actually happened.
const IMPLEMENTATION_VERBS: &[&str] = &[
    "created",
    "implemented",
    "modified",
    "wrote",
    "fixed",
    "refactored",
    "added",
    "updated",
    "renamed",
    "deleted",
];

/// Consecutive completion signals required before exiting.
const COMPLETION_STREAK_THRESHOLD: u32 = 2;

/// Consecutive test-only responses tolerated before exiting.
const TEST_ONLY_STREAK_THRESHOLD: u32 = 3;

/// Confidence score at which the analyzer exits.
const CONFIDENCE_EXIT_THRESHOLD: u8 = 80;

/// Bound on retained observations.
const HISTORY_LIMIT: usize = 100;

/// Parsed `---RALPH_STATUS---` block. Fields absent from the block are
/// `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RalphStatus {
    pub status: Option<String>,
    pub exit_signal: Option<bool>,
    pub tasks_completed: Option<i64>,
    pub files_modified: Option<i64>,
    pub tests_passed: Option<String>,
    pub next_step: Option<String>,
}

impl RalphStatus {
    pub fn is_complete(&self) -> bool {
        self.status.as_deref() == Some("COMPLETE")
    }
}

/// Decision for one observed output.
#[derive(Debug, Clone, Default)]
pub struct AnalysisVerdict {
    pub should_exit: bool,
    pub exit_reason: Option<String>,
    pub ralph_status: Option<RalphStatus>,
    pub confidence: u8,
}

/// What one observation looked like, kept for history.
#[derive(Debug, Clone)]
struct Observation {
    completion_signal: bool,
    test_only: bool,
}

/// Stateful completion detector for one agent loop.
#[derive(Debug, Default)]
pub struct ResponseAnalyzer {
    history: Vec<Observation>,
    completion_streak: u32,
    test_only_streak: u32,
}

impl ResponseAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; equivalent to constructing a fresh analyzer.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Observe one output and decide whether the loop should exit.
    pub fn observe(&mut self, output: &str) -> AnalysisVerdict {
        let lower = output.to_lowercase();
        let ralph_status = parse_status_block(output);

        let exit_signal_line = lower
            .lines()
            .any(|l| l.trim().eq_ignore_ascii_case("exit_signal: true"));
        let exit_signal = exit_signal_line
            || ralph_status
                .as_ref()
                .and_then(|s| s.exit_signal)
                .unwrap_or(false);

        let completion_signal = exit_signal
            || COMPLETION_PHRASES.iter().any(|p| lower.contains(p))
            || ralph_status.as_ref().is_some_and(RalphStatus::is_complete);

        let test_mentions = count_occurrences(&lower, TEST_PHRASES);
        let implementation_mentions = count_occurrences(&lower, IMPLEMENTATION_VERBS);
        let test_only = test_mentions > 3 && implementation_mentions == 0;

        // Streaks reset on any negative observation.
        self.completion_streak = if completion_signal {
            self.completion_streak + 1
        } else {
            0
        };
        self.test_only_streak = if test_only { self.test_only_streak + 1 } else { 0 };

        self.history.push(Observation {
            completion_signal,
            test_only,
        });
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }

        let mut confidence: u32 = 0;
        if completion_signal {
            confidence += 40;
        }
        if ralph_status.as_ref().is_some_and(RalphStatus::is_complete) {
            confidence += 30;
        }
        if exit_signal {
            confidence += 20;
        }
        if self.completion_streak >= 2 {
            confidence += 10;
        }
        let confidence = confidence.min(100) as u8;

        let (should_exit, exit_reason) = if exit_signal {
            (true, Some("EXIT_SIGNAL: true received".to_string()))
        } else if self.completion_streak >= COMPLETION_STREAK_THRESHOLD {
            (
                true,
                Some(format!(
                    "completion signal observed {} times in a row",
                    self.completion_streak
                )),
            )
        } else if self.test_only_streak >= TEST_ONLY_STREAK_THRESHOLD {
            (
                true,
                Some(format!(
                    "{} consecutive test-only responses with no implementation",
                    self.test_only_streak
                )),
            )
        } else if confidence >= CONFIDENCE_EXIT_THRESHOLD {
            (true, Some(format!("confidence {confidence} >= {CONFIDENCE_EXIT_THRESHOLD}")))
        } else {
            (false, None)
        };

        debug!(
            should_exit,
            confidence,
            completion_streak = self.completion_streak,
            test_only_streak = self.test_only_streak,
            "analyzed response"
        );

        AnalysisVerdict {
            should_exit,
            exit_reason,
            ralph_status,
            confidence,
        }
    }
}

fn count_occurrences(haystack: &str, needles: &[&str]) -> usize {
    needles
        .iter()
        .map(|needle| haystack.matches(needle).count())
        .sum()
}

/// Parse the delimited status block, tolerating missing fields and junk
/// lines. Returns `None` when no block is present.
fn parse_status_block(output: &str) -> Option<RalphStatus> {
    let start = output.find("---RALPH_STATUS---")?;
    let rest = &output[start + "---RALPH_STATUS---".len()..];
    let end = rest.find("---END_STATUS---").unwrap_or(rest.len());
    let block = &rest[..end];

    let mut status = RalphStatus::default();
    for line in block.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_uppercase().as_str() {
            "STATUS" => status.status = Some(value.to_uppercase()),
            "EXIT_SIGNAL" => status.exit_signal = Some(value.eq_ignore_ascii_case("true")),
            "TASKS_COMPLETED" => status.tasks_completed = value.parse().ok(),
            "FILES_MODIFIED" => status.files_modified = value.parse().ok(),
            "TESTS_PASSED" => status.tests_passed = Some(value.to_string()),
            "NEXT_STEP" => status.next_step = Some(value.to_string()),
            _ => {}
        }
    }
    Some(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ralph_status_exit() {
        let mut analyzer = ResponseAnalyzer::new();
        let verdict = analyzer.observe(
            "Wrapping up.\n---RALPH_STATUS---\nSTATUS: COMPLETE\nEXIT_SIGNAL: true\n---END_STATUS---",
        );

        assert!(verdict.should_exit);
        assert!(verdict.exit_reason.unwrap().contains("EXIT_SIGNAL"));
        let status = verdict.ralph_status.unwrap();
        assert_eq!(status.status.as_deref(), Some("COMPLETE"));
        assert_eq!(status.exit_signal, Some(true));
    }

    #[test]
    fn test_status_block_partial_fields() {
        let status = parse_status_block(
            "---RALPH_STATUS---\nSTATUS: IN_PROGRESS\nTASKS_COMPLETED: 4\nnoise line\n---END_STATUS---",
        )
        .unwrap();
        assert_eq!(status.status.as_deref(), Some("IN_PROGRESS"));
        assert_eq!(status.tasks_completed, Some(4));
        assert!(status.files_modified.is_none());
        assert!(status.exit_signal.is_none());
    }

    #[test]
    fn test_completion_phrase_needs_streak() {
        let mut analyzer = ResponseAnalyzer::new();
        let first = analyzer.observe("I believe all tasks complete now.");
        assert!(!first.should_exit, "single signal is not enough");

        let second = analyzer.observe("Confirmed: project complete.");
        assert!(second.should_exit);
        assert!(second.exit_reason.unwrap().contains("in a row"));
    }

    #[test]
    fn test_streak_resets_on_negative_observation() {
        let mut analyzer = ResponseAnalyzer::new();
        analyzer.observe("all tasks complete");
        analyzer.observe("actually, found another bug; fixed the parser");
        let third = analyzer.observe("all tasks complete");
        assert!(!third.should_exit, "streak must restart after a negative");
    }

    #[test]
    fn test_test_only_loop_detection() {
        let mut analyzer = ResponseAnalyzer::new();
        let test_spam =
            "running tests… cargo test ok. tests passed. running tests again. all tests green.";
        assert!(!analyzer.observe(test_spam).should_exit);
        assert!(!analyzer.observe(test_spam).should_exit);
        let third = analyzer.observe(test_spam);
        assert!(third.should_exit);
        assert!(third.exit_reason.unwrap().contains("test-only"));
    }

    #[test]
    fn test_implementation_work_clears_test_only() {
        let mut analyzer = ResponseAnalyzer::new();
        let verdict = analyzer
            .observe("running tests, cargo test, tests passed, running tests; then I fixed the bug");
        assert!(!verdict.should_exit);
    }

    #[test]
    fn test_confidence_scoring_caps_at_100() {
        let mut analyzer = ResponseAnalyzer::new();
        analyzer.observe("all tasks complete");
        let verdict = analyzer.observe(
            "all tasks complete\n---RALPH_STATUS---\nSTATUS: COMPLETE\nEXIT_SIGNAL: true\n---END_STATUS---",
        );
        assert_eq!(verdict.confidence, 100);
    }

    #[test]
    fn test_exit_signal_line_outside_block() {
        let mut analyzer = ResponseAnalyzer::new();
        let verdict = analyzer.observe("done with everything\nEXIT_SIGNAL: true\n");
        assert!(verdict.should_exit);
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let mut seasoned = ResponseAnalyzer::new();
        seasoned.observe("all tasks complete");
        seasoned.reset();

        let mut fresh = ResponseAnalyzer::new();
        let a = seasoned.observe("all tasks complete");
        let b = fresh.observe("all tasks complete");
        assert_eq!(a.should_exit, b.should_exit);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut analyzer = ResponseAnalyzer::new();
        for _ in 0..500 {
            analyzer.observe("still working on the parser");
        }
        assert!(analyzer.history.len() <= 100);
    }

    #[test]
    fn test_ordinary_output_does_not_exit() {
        let mut analyzer = ResponseAnalyzer::new();
        let verdict =
            analyzer.observe("Implemented the config loader and added tests for the edge cases.");
        assert!(!verdict.should_exit);
        assert_eq!(verdict.confidence, 0);
    }
}
