//! Failure classification for agent and verification results.
//!
//! Classification is an ordered table of `(predicate, category)` rules per
//! [`FailureKind`], evaluated top to bottom with the first match winning.
//! Blocking conditions sit above the generic fallbacks, so a text that
//! mentions both a timeout and a permission error is a timeout.
//!
//! ```text
//! CommandResult ──strip ANSI, lowercase──> Signals ──rules──> Classification
//!                                                               │
//!                                          extract_key_excerpt ─┘
//! ```

use crate::fingerprint::text_hash;
use crate::runner::{strip_ansi, CommandResult, EXIT_NOT_FOUND, EXIT_TIMEOUT};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Maximum number of keyword lines kept in a key excerpt.
const MAX_KEY_LINES: usize = 8;

/// Lines kept when no keyword matches.
const FALLBACK_KEY_LINES: usize = 4;

/// Keywords that mark a line as likely carrying the core error.
const KEY_KEYWORDS: &[&str] = &[
    "permission",
    "denied",
    "not allowed",
    "approval",
    "sandbox",
    "command not found",
    "no module named",
    "unknown option",
    "error",
    "traceback",
    "refused",
    "forbidden",
    "unauthorized",
    "eacces",
    "eperm",
];

/// Key excerpt used when the agent produced no change and no output.
const NO_NET_CHANGE_EXCERPT: &str = "No net changes after agent exec";

// ============================================================================
// Categories
// ============================================================================

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    /// The agent executable is not installed or not on PATH
    EnvMissingAgent,
    /// The language runtime needed by the test command is missing
    EnvMissingRuntime,
    /// The test command itself is missing
    EnvMissingTestTool,
    /// Coverage tooling is missing or does not understand its flags
    EnvMissingCoverageTool,
    /// File system permission error
    PermissionDenied,
    /// Sandbox refused a write or exec
    SandboxDenied,
    /// Approval policy blocked the agent
    ApprovalRequired,
    /// No verification command could be determined
    NoTestCommand,
    /// Agent finished without changing the working tree
    NoNetChange,
    /// Agent exceeded its time budget
    AgentTimeout,
    /// Verification exceeded its time budget
    VerifyTimeout,
    /// Agent failed for a reason that is not obviously blocking
    AgentError,
    /// Ordinary failing tests
    TestFailure,
    /// Cycle budget spent; assigned by the loop, never by classification
    CyclesExhausted,
    /// Nothing wrong
    Ok,
}

impl FailureCategory {
    /// Stable label, as used in reports and signatures.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnvMissingAgent => "ENV_MISSING_AGENT",
            Self::EnvMissingRuntime => "ENV_MISSING_RUNTIME",
            Self::EnvMissingTestTool => "ENV_MISSING_TEST_TOOL",
            Self::EnvMissingCoverageTool => "ENV_MISSING_COVERAGE_TOOL",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::SandboxDenied => "SANDBOX_DENIED",
            Self::ApprovalRequired => "APPROVAL_REQUIRED",
            Self::NoTestCommand => "NO_TEST_COMMAND",
            Self::NoNetChange => "NO_NET_CHANGE",
            Self::AgentTimeout => "AGENT_TIMEOUT",
            Self::VerifyTimeout => "VERIFY_TIMEOUT",
            Self::AgentError => "AGENT_ERROR",
            Self::TestFailure => "TEST_FAILURE",
            Self::CyclesExhausted => "MAX_QUALITY_CYCLES_REACHED",
            Self::Ok => "OK",
        }
    }

    /// Whether retrying without operator intervention will reproduce this
    /// failure identically. Blocked categories feed the repeat guard.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        match self {
            Self::EnvMissingAgent
            | Self::EnvMissingRuntime
            | Self::EnvMissingTestTool
            | Self::EnvMissingCoverageTool
            | Self::PermissionDenied
            | Self::SandboxDenied
            | Self::ApprovalRequired
            | Self::NoTestCommand
            | Self::NoNetChange
            | Self::AgentTimeout
            | Self::VerifyTimeout => true,
            Self::AgentError | Self::TestFailure | Self::CyclesExhausted | Self::Ok => false,
        }
    }

    /// Whether this is the success category.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which step of a cycle produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The agent invocation
    Agent,
    /// The verification command
    Verify,
}

impl FailureKind {
    /// Lowercase label.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Verify => "verify",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category plus the canonical excerpt that feeds the failure signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: FailureCategory,
    pub key_excerpt: String,
}

impl Classification {
    fn ok() -> Self {
        Self {
            category: FailureCategory::Ok,
            key_excerpt: String::new(),
        }
    }
}

/// Signature identifying "the same failure recurring".
///
/// # Example
///
/// ```
/// use codex_loop::classify::{failure_signature, FailureCategory, FailureKind};
///
/// let a = failure_signature(FailureKind::Verify, FailureCategory::TestFailure, 1, "E assert");
/// let b = failure_signature(FailureKind::Verify, FailureCategory::TestFailure, 1, "E assert");
/// assert_eq!(a, b);
/// ```
#[must_use]
pub fn failure_signature(
    kind: FailureKind,
    category: FailureCategory,
    exit_code: i32,
    key_excerpt: &str,
) -> String {
    text_hash(&format!("{kind}|{category}|{exit_code}|{key_excerpt}"))
}

// ============================================================================
// Excerpts and coverage
// ============================================================================

/// Pick the lines most likely to carry the core error.
///
/// Up to 8 non-blank lines containing a known keyword; otherwise the first
/// 4 non-blank lines. Lines are trimmed.
#[must_use]
pub fn extract_key_excerpt(text: &str) -> String {
    let clean = strip_ansi(text);
    let lines: Vec<&str> = clean
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let picked: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| {
            let low = line.to_lowercase();
            KEY_KEYWORDS.iter().any(|k| low.contains(k))
        })
        .take(MAX_KEY_LINES)
        .collect();

    if picked.is_empty() {
        lines
            .into_iter()
            .take(FALLBACK_KEY_LINES)
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        picked.join("\n")
    }
}

fn coverage_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // pytest-cov summary: "TOTAL  123  45  63%"
            r"(?m)^TOTAL\s+\d+\s+\d+\s+(\d+(?:\.\d+)?)%\s*$",
            // Any other TOTAL line (branch columns etc.): last percentage wins
            r"(?m)\bTOTAL\b.*\s(\d+(?:\.\d+)?)%",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Parse the total coverage percentage from a coverage summary.
///
/// # Example
///
/// ```
/// use codex_loop::classify::parse_coverage_percent;
///
/// assert_eq!(parse_coverage_percent("TOTAL 120 40 66%"), Some(66.0));
/// assert_eq!(parse_coverage_percent("3 passed"), None);
/// ```
#[must_use]
pub fn parse_coverage_percent(output: &str) -> Option<f64> {
    let clean = strip_ansi(output);
    coverage_patterns()
        .iter()
        .find_map(|re| re.captures(&clean))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

// ============================================================================
// Rules
// ============================================================================

/// Normalized view of a result that rule predicates inspect.
#[derive(Debug, Clone)]
pub struct Signals {
    /// Exit code of the command
    pub exit_code: i32,
    /// ANSI-stripped, lowercased stdout + stderr
    pub text: String,
    /// Lowercased verification command (empty for the agent)
    pub command: String,
    /// Parsed coverage, verification only
    pub coverage: Option<f64>,
    /// Worktree fingerprint unchanged across the agent call
    pub worktree_unchanged: bool,
}

impl Signals {
    fn from_result(result: &CommandResult) -> Self {
        Self {
            exit_code: result.exit_code,
            text: result.combined().to_lowercase(),
            command: String::new(),
            coverage: None,
            worktree_unchanged: false,
        }
    }

    fn has(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }

    fn command_not_found(&self) -> bool {
        self.has("command not found")
    }

    fn mentions_runtime(&self) -> bool {
        self.has("node")
    }

    fn coverage_requested(&self) -> bool {
        self.command.contains("--cov") || self.command.contains("coverage")
    }
}

/// One `(predicate, category)` entry of a rule table.
pub struct Rule {
    /// Short identifier for logs and tests
    pub name: &'static str,
    predicate: fn(&Signals) -> bool,
    /// Category assigned on match
    pub category: FailureCategory,
}

impl Rule {
    /// Whether this rule fires for `signals`.
    #[must_use]
    pub fn matches(&self, signals: &Signals) -> bool {
        (self.predicate)(signals)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}

fn timed_out(s: &Signals) -> bool {
    s.exit_code == EXIT_TIMEOUT || s.has("timeout")
}

fn approval_required(s: &Signals) -> bool {
    s.has("approval") && (s.has("required") || s.has("needs"))
}

fn sandbox_denied(s: &Signals) -> bool {
    s.has("sandbox") && (s.has("denied") || s.has("not allowed"))
}

fn permission_denied(s: &Signals) -> bool {
    s.has("permission denied") || s.has("eacces") || s.has("operation not permitted")
}

fn missing_executable_strict(s: &Signals) -> bool {
    s.exit_code == EXIT_NOT_FOUND && s.command_not_found()
}

fn missing_executable_loose(s: &Signals) -> bool {
    s.exit_code == EXIT_NOT_FOUND || s.command_not_found()
}

fn failed(s: &Signals) -> bool {
    s.exit_code != 0
}

fn worktree_unchanged(s: &Signals) -> bool {
    s.worktree_unchanged
}

fn missing_runtime_strict(s: &Signals) -> bool {
    missing_executable_strict(s) && s.mentions_runtime()
}

fn missing_runtime_loose(s: &Signals) -> bool {
    missing_executable_loose(s) && s.mentions_runtime()
}

fn coverage_flag_rejected(s: &Signals) -> bool {
    (s.command.contains("--cov") || s.has("--cov"))
        && (s.has("unknown option") || s.has("unrecognized arguments"))
}

fn coverage_unparsed(s: &Signals) -> bool {
    s.coverage.is_none() && s.coverage_requested()
}

/// Ordered rules for agent results.
pub const AGENT_RULES: &[Rule] = &[
    Rule {
        name: "missing-agent",
        predicate: missing_executable_strict,
        category: FailureCategory::EnvMissingAgent,
    },
    Rule {
        name: "agent-timeout",
        predicate: timed_out,
        category: FailureCategory::AgentTimeout,
    },
    Rule {
        name: "no-net-change",
        predicate: worktree_unchanged,
        category: FailureCategory::NoNetChange,
    },
    Rule {
        name: "approval-required",
        predicate: approval_required,
        category: FailureCategory::ApprovalRequired,
    },
    Rule {
        name: "sandbox-denied",
        predicate: sandbox_denied,
        category: FailureCategory::SandboxDenied,
    },
    Rule {
        name: "permission-denied",
        predicate: permission_denied,
        category: FailureCategory::PermissionDenied,
    },
    Rule {
        name: "agent-error",
        predicate: failed,
        category: FailureCategory::AgentError,
    },
];

/// Ordered rules for verification results.
pub const VERIFY_RULES: &[Rule] = &[
    Rule {
        name: "missing-runtime",
        predicate: missing_runtime_strict,
        category: FailureCategory::EnvMissingRuntime,
    },
    Rule {
        name: "missing-test-tool",
        predicate: missing_executable_strict,
        category: FailureCategory::EnvMissingTestTool,
    },
    Rule {
        name: "verify-timeout",
        predicate: timed_out,
        category: FailureCategory::VerifyTimeout,
    },
    Rule {
        name: "approval-required",
        predicate: approval_required,
        category: FailureCategory::ApprovalRequired,
    },
    Rule {
        name: "sandbox-denied",
        predicate: sandbox_denied,
        category: FailureCategory::SandboxDenied,
    },
    Rule {
        name: "permission-denied",
        predicate: permission_denied,
        category: FailureCategory::PermissionDenied,
    },
    Rule {
        name: "missing-runtime-loose",
        predicate: missing_runtime_loose,
        category: FailureCategory::EnvMissingRuntime,
    },
    Rule {
        name: "missing-test-tool-loose",
        predicate: missing_executable_loose,
        category: FailureCategory::EnvMissingTestTool,
    },
    Rule {
        name: "coverage-flag-rejected",
        predicate: coverage_flag_rejected,
        category: FailureCategory::EnvMissingCoverageTool,
    },
    Rule {
        name: "coverage-unparsed",
        predicate: coverage_unparsed,
        category: FailureCategory::EnvMissingCoverageTool,
    },
    Rule {
        name: "test-failure",
        predicate: failed,
        category: FailureCategory::TestFailure,
    },
];

/// Evaluate `rules` in order; the first match wins.
#[must_use]
pub fn first_match<'a>(rules: &'a [Rule], signals: &Signals) -> Option<&'a Rule> {
    rules.iter().find(|rule| rule.matches(signals))
}

fn classify_with(rules: &[Rule], signals: &Signals, result: &CommandResult) -> Classification {
    match first_match(rules, signals) {
        Some(rule) => {
            tracing::debug!("Classified by rule '{}' as {}", rule.name, rule.category);
            let mut key_excerpt = extract_key_excerpt(&result.combined());
            if rule.category == FailureCategory::NoNetChange && key_excerpt.is_empty() {
                key_excerpt = NO_NET_CHANGE_EXCERPT.to_string();
            }
            Classification {
                category: rule.category,
                key_excerpt,
            }
        }
        None => Classification::ok(),
    }
}

/// Classify an agent invocation given the worktree fingerprints around it.
#[must_use]
pub fn classify_agent_result(
    result: &CommandResult,
    before_fingerprint: &str,
    after_fingerprint: &str,
) -> Classification {
    let mut signals = Signals::from_result(result);
    signals.worktree_unchanged = before_fingerprint == after_fingerprint;
    classify_with(AGENT_RULES, &signals, result)
}

/// Classify a verification run.
#[must_use]
pub fn classify_verify_result(
    command: &str,
    result: &CommandResult,
    coverage: Option<f64>,
) -> Classification {
    let mut signals = Signals::from_result(result);
    signals.command = command.to_lowercase();
    signals.coverage = coverage;
    classify_with(VERIFY_RULES, &signals, result)
}
