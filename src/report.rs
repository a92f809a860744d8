//! Stop reports and remediation suggestions.
//!
//! A stop report is rendered whenever the loop ends without success. It is a
//! plain markdown document, printed to stdout and saved as `final_report.md`
//! in the log directory.

use crate::classify::{failure_signature, Classification, FailureCategory, FailureKind};
use crate::runner::{tail, CommandResult, DEFAULT_TAIL_CHARS};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A classified non-success outcome of one cycle step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub category: FailureCategory,
    /// Hash of `(kind, category, exit code, key excerpt)`
    pub signature: String,
    pub command: String,
    pub exit_code: i32,
    pub coverage: Option<f64>,
    pub stdout_tail: String,
    pub stderr_tail: String,
}

impl Failure {
    /// Build a failure from a classified result.
    ///
    /// Returns `None` for [`FailureCategory::Ok`]: success never becomes a
    /// failure.
    #[must_use]
    pub fn from_result(
        kind: FailureKind,
        classification: &Classification,
        command: impl Into<String>,
        result: &CommandResult,
        coverage: Option<f64>,
    ) -> Option<Self> {
        if classification.category.is_ok() {
            return None;
        }
        Some(Self {
            kind,
            category: classification.category,
            signature: failure_signature(
                kind,
                classification.category,
                result.exit_code,
                &classification.key_excerpt,
            ),
            command: command.into(),
            exit_code: result.exit_code,
            coverage,
            stdout_tail: tail(&result.stdout, DEFAULT_TAIL_CHARS).to_string(),
            stderr_tail: tail(&result.stderr, DEFAULT_TAIL_CHARS).to_string(),
        })
    }
}

/// Why the loop stopped without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopReason {
    /// The same blocked failure hit the repeat threshold
    RepeatedBlockedFailure,
    /// Nothing to verify with
    BlockedNoVerifyCommand,
    /// Every quality cycle was used up
    MaxQualityCyclesReached,
}

impl StopReason {
    /// Stable label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedBlockedFailure => "REPEATED_BLOCKED_FAILURE",
            Self::BlockedNoVerifyCommand => "BLOCKED_NO_VERIFY_COMMAND",
            Self::MaxQualityCyclesReached => "MAX_QUALITY_CYCLES_REACHED",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render the stop report.
///
/// Output depends only on the arguments.
#[must_use]
pub fn build_stop_report(
    reason: StopReason,
    failure: &Failure,
    repeats: u32,
    max_repeats: u32,
    logs_dir: &Path,
    suggestions: &[String],
) -> String {
    let coverage = failure
        .coverage
        .map(|c| format!("{c:.1}%"))
        .unwrap_or_else(|| "N/A".to_string());
    let suggestions = if suggestions.is_empty() {
        "- (no suggestions)".to_string()
    } else {
        suggestions
            .iter()
            .map(|s| format!("- {s}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# codex-loop STOP REPORT

## Stop reason
- {reason}
- repeated: {repeats} / {max_repeats}
- failure fingerprint: `{signature}`

## Failure summary
- kind: {kind}
- category: {category}
- cmd: {command}
- exit_code: {exit_code}
- coverage: {coverage}

## Key logs (tail)
### STDOUT

{stdout}

### STDERR

{stderr}

## Suggestions
{suggestions}

## Logs directory
- {logs}
",
        signature = failure.signature,
        kind = failure.kind,
        category = failure.category,
        command = failure.command,
        exit_code = failure.exit_code,
        stdout = tail(&failure.stdout_tail, DEFAULT_TAIL_CHARS),
        stderr = tail(&failure.stderr_tail, DEFAULT_TAIL_CHARS),
        logs = logs_dir.display(),
    )
}

/// Remediation hints for a blocked category. Empty for anything else.
#[must_use]
pub fn suggestions_for_category(category: FailureCategory) -> Vec<String> {
    let hints: &[&str] = match category {
        FailureCategory::EnvMissingAgent => &[
            "The agent executable was not found. Install it and make sure it is on PATH.",
            "Check that `<agent> --help` runs from the repository root.",
        ],
        FailureCategory::EnvMissingRuntime => &[
            "The runtime required by the test command (node) is missing.",
            "Install it or point the loop at a verification command that does not need it.",
        ],
        FailureCategory::ApprovalRequired => &[
            "The approval policy is blocking the agent.",
            "Use `--ask-for-approval on-request` and approve interactively, or relax the policy.",
        ],
        FailureCategory::SandboxDenied => &[
            "The sandbox refused a write or exec.",
            "Pick the narrowest sandbox that allows the work, e.g. `--sandbox workspace-write`.",
        ],
        FailureCategory::PermissionDenied => &[
            "A file or directory permission check failed.",
            "Check ownership, permissions and read-only flags on the affected paths.",
        ],
        FailureCategory::EnvMissingTestTool => &[
            "The verification command cannot run (missing dependency or command).",
            "Run the recommended test command once by hand and install what it needs.",
        ],
        FailureCategory::EnvMissingCoverageTool => &[
            "The coverage flags were not recognized or no coverage total was printed.",
            "Install the coverage plugin (e.g. pytest-cov) or adjust the coverage command.",
        ],
        FailureCategory::NoTestCommand => &[
            "No test command could be determined.",
            "Pass `--verify-cmd`, set `verifyCommand` in .codex-loop/settings.json, or fix tooling detection.",
        ],
        FailureCategory::VerifyTimeout => &[
            "Verification timed out. Look for hanging tests or an oversized test scope.",
            "Raise `--verify-timeout` if the suite is legitimately slow.",
        ],
        FailureCategory::AgentTimeout => &[
            "The agent timed out. Split the request into smaller units of work.",
        ],
        FailureCategory::NoNetChange => &[
            "The agent ran but the working tree did not change (effectively a no-op).",
            "Writes are most likely blocked by approval, permission or sandbox settings. Check them.",
        ],
        FailureCategory::AgentError
        | FailureCategory::TestFailure
        | FailureCategory::CyclesExhausted
        | FailureCategory::Ok => &[],
    };
    hints.iter().map(|s| s.to_string()).collect()
}

/// Generic hints for a run that spent its whole cycle budget.
#[must_use]
pub fn exhausted_suggestions() -> Vec<String> {
    [
        "Split the request into smaller units of work.",
        "Narrow the coverage target if it spans more code than the request touches.",
        "If failing tests span several categories, prioritize and fix them in stages.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_failure() -> Failure {
        let result = CommandResult::new(1, "FAILED test_a", "Traceback: boom");
        let classification = Classification {
            category: FailureCategory::TestFailure,
            key_excerpt: "Traceback: boom".to_string(),
        };
        Failure::from_result(
            FailureKind::Verify,
            &classification,
            "pytest -q --cov=.",
            &result,
            Some(42.5),
        )
        .unwrap()
    }

    #[test]
    fn test_ok_never_becomes_failure() {
        let result = CommandResult::new(0, "", "");
        let ok = Classification {
            category: FailureCategory::Ok,
            key_excerpt: String::new(),
        };
        assert!(Failure::from_result(FailureKind::Agent, &ok, "codex exec", &result, None).is_none());
    }

    #[test]
    fn test_failure_tails_are_bounded() {
        let result = CommandResult::new(1, "x".repeat(10_000), "y".repeat(5_000));
        let classification = Classification {
            category: FailureCategory::TestFailure,
            key_excerpt: String::new(),
        };
        let failure =
            Failure::from_result(FailureKind::Verify, &classification, "t", &result, None).unwrap();
        assert_eq!(failure.stdout_tail.len(), DEFAULT_TAIL_CHARS);
        assert_eq!(failure.stderr_tail.len(), DEFAULT_TAIL_CHARS);
    }

    #[test]
    fn test_report_contains_all_sections() {
        let failure = sample_failure();
        let report = build_stop_report(
            StopReason::RepeatedBlockedFailure,
            &failure,
            3,
            5,
            &PathBuf::from("/repo/logs"),
            &["do the thing".to_string()],
        );
        assert!(report.contains("- REPEATED_BLOCKED_FAILURE"));
        assert!(report.contains("- repeated: 3 / 5"));
        assert!(report.contains(&failure.signature));
        assert!(report.contains("- kind: verify"));
        assert!(report.contains("- category: TEST_FAILURE"));
        assert!(report.contains("- cmd: pytest -q --cov=."));
        assert!(report.contains("- exit_code: 1"));
        assert!(report.contains("- coverage: 42.5%"));
        assert!(report.contains("FAILED test_a"));
        assert!(report.contains("Traceback: boom"));
        assert!(report.contains("- do the thing"));
        assert!(report.contains("- /repo/logs"));
    }

    #[test]
    fn test_report_is_deterministic() {
        let failure = sample_failure();
        let dir = PathBuf::from("logs");
        let a = build_stop_report(StopReason::MaxQualityCyclesReached, &failure, 2, 2, &dir, &[]);
        let b = build_stop_report(StopReason::MaxQualityCyclesReached, &failure, 2, 2, &dir, &[]);
        assert_eq!(a, b);
        assert!(a.contains("- (no suggestions)"));
    }

    #[test]
    fn test_report_coverage_na() {
        let mut failure = sample_failure();
        failure.coverage = None;
        let report = build_stop_report(
            StopReason::BlockedNoVerifyCommand,
            &failure,
            1,
            5,
            &PathBuf::from("logs"),
            &[],
        );
        assert!(report.contains("- coverage: N/A"));
    }

    #[test]
    fn test_suggestions_for_blocked_categories() {
        for category in [
            FailureCategory::EnvMissingAgent,
            FailureCategory::ApprovalRequired,
            FailureCategory::SandboxDenied,
            FailureCategory::PermissionDenied,
            FailureCategory::EnvMissingTestTool,
            FailureCategory::EnvMissingCoverageTool,
            FailureCategory::NoTestCommand,
            FailureCategory::VerifyTimeout,
            FailureCategory::AgentTimeout,
            FailureCategory::NoNetChange,
        ] {
            let hints = suggestions_for_category(category);
            assert!((1..=3).contains(&hints.len()), "{category}");
        }
    }

    #[test]
    fn test_suggestions_empty_for_transient() {
        assert!(suggestions_for_category(FailureCategory::TestFailure).is_empty());
        assert!(suggestions_for_category(FailureCategory::Ok).is_empty());
    }

    #[test]
    fn test_exhausted_suggestions() {
        assert_eq!(exhausted_suggestions().len(), 3);
    }
}
