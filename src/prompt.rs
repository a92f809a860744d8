//! Prompts handed to the agent.
//!
//! Cycle 1 sends the raw request text. Later cycles send a follow-up that
//! carries the previous verification outcome. The agent has no notion of
//! the outer loop, so the follow-up tells it to make one focused attempt and
//! stop.

use crate::runner::{tail, DEFAULT_TAIL_CHARS};
use std::path::Path;

/// Inputs for a follow-up prompt.
#[derive(Debug, Clone, Copy)]
pub struct FollowupContext<'a> {
    /// Request file the task is defined by
    pub request_path: &'a Path,
    /// Cycle whose verification failed
    pub cycle: u32,
    /// Verification command that was run
    pub verify_command: &'a str,
    pub verify_stdout: &'a str,
    pub verify_stderr: &'a str,
    /// Parsed coverage, if any
    pub coverage: Option<f64>,
    pub min_coverage: f64,
}

/// Build the follow-up prompt for the next cycle.
#[must_use]
pub fn build_followup_prompt(ctx: &FollowupContext<'_>) -> String {
    let coverage_line = match ctx.coverage {
        Some(coverage) => format!(
            "Coverage: {coverage:.1}% (target >= {:.1}%)",
            ctx.min_coverage
        ),
        None => format!(
            "Coverage: (could not parse; target >= {:.1}%)",
            ctx.min_coverage
        ),
    };

    format!(
        "You are continuing an implementation defined by:
- REQUEST: {request}

We attempted implementation. Verification failed in cycle {cycle}.

Verification command:
{command}

Result:
- {coverage_line}

Please:
1) Read the REQUEST file and follow its constraints (no scope expansion).
2) Fix failing tests and/or add tests to reach the coverage target.
3) Keep changes minimal.
4) STOP after this attempt (the outer loop reruns verification).

Failure logs (tail):
--- STDOUT ---
{stdout}
--- STDERR ---
{stderr}
",
        request = ctx.request_path.display(),
        cycle = ctx.cycle,
        command = ctx.verify_command,
        stdout = tail(ctx.verify_stdout, DEFAULT_TAIL_CHARS),
        stderr = tail(ctx.verify_stderr, DEFAULT_TAIL_CHARS),
    )
}
