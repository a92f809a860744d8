//! Core implement-verify-repair loop.
//!
//! # Architecture
//!
//! Each cycle:
//! 1. Fingerprints the working tree, runs the agent, fingerprints again
//! 2. Classifies the agent result and feeds the repeat guard
//! 3. Runs the verification command and parses coverage
//! 4. Succeeds, stops on a repeated blocked failure, or builds the
//!    follow-up prompt for the next cycle
//!
//! A run ends in exactly one of `Success`, `StoppedBlocked` or
//! `StoppedExhausted`. Nothing inside a cycle can abort the run early with
//! an error: subprocess faults are already plain results by the time they
//! get here.
//!
//! # Dependency Injection
//!
//! The manager only talks to the outside world through `LoopDependencies`,
//! so whole runs can be scripted with the mocks in [`crate::testing`].
//!
//! # Example
//!
//! ```rust,ignore
//! use codex_loop::config::LoopConfig;
//! use codex_loop::r#loop::{LoopDependencies, LoopManager};
//!
//! let config = LoopConfig::new(".", "docs/request.md").with_verify_command("pytest --cov=.");
//! let deps = LoopDependencies::real(&config);
//! let outcome = LoopManager::new(config, deps)?.run().await;
//! println!("{}", outcome.status);
//! ```

use super::logs::CycleLogs;
use super::operations::{GitWorktree, RealAgentProcess, RealVerifyRunner};
use super::state::{LoopState, LoopStatus};
use crate::classify::{
    classify_agent_result, classify_verify_result, failure_signature, parse_coverage_percent,
    FailureCategory, FailureKind,
};
use crate::config::{LoopConfig, RepeatGuardScope};
use crate::error::{LoopError, Result};
use crate::prompt::{build_followup_prompt, FollowupContext};
use crate::report::{
    build_stop_report, exhausted_suggestions, suggestions_for_category, Failure, StopReason,
};
use crate::runner::{tail, CommandResult, DEFAULT_TAIL_CHARS};
use crate::testing::{AgentProcess, VerifyRunner, WorktreeProbe};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Key excerpt recorded when there is nothing to verify with.
pub const NO_VERIFY_COMMAND_EXCERPT: &str = "No verify command available";

/// Command label used in reports when no verification command exists.
const NO_COMMAND_LABEL: &str = "(none)";

/// External dependencies of the loop.
pub struct LoopDependencies {
    /// Agent process abstraction.
    pub agent: Arc<dyn AgentProcess>,
    /// Verification runner abstraction.
    pub verify: Arc<dyn VerifyRunner>,
    /// Working tree abstraction.
    pub worktree: Arc<dyn WorktreeProbe>,
}

impl std::fmt::Debug for LoopDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopDependencies")
            .field("agent", &"<dyn AgentProcess>")
            .field("verify", &"<dyn VerifyRunner>")
            .field("worktree", &"<dyn WorktreeProbe>")
            .finish()
    }
}

impl LoopDependencies {
    /// Create real dependencies for production use.
    #[must_use]
    pub fn real(config: &LoopConfig) -> Self {
        Self {
            agent: Arc::new(RealAgentProcess::new(
                config.root.clone(),
                config.agent.clone(),
            )),
            verify: Arc::new(RealVerifyRunner::new(
                config.root.clone(),
                config.verify_timeout,
            )),
            worktree: Arc::new(GitWorktree::new(config.root.clone())),
        }
    }

    /// Assemble dependencies from explicit parts (typically mocks).
    #[must_use]
    pub fn new(
        agent: Arc<dyn AgentProcess>,
        verify: Arc<dyn VerifyRunner>,
        worktree: Arc<dyn WorktreeProbe>,
    ) -> Self {
        Self {
            agent,
            verify,
            worktree,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Terminal status
    pub status: LoopStatus,
    /// Number of cycles started
    pub cycles_run: u32,
    /// Coverage from the last verification, if parsed
    pub coverage: Option<f64>,
    /// The failure that stopped the run (`None` on success)
    pub failure: Option<Failure>,
    /// Rendered stop report (`None` on success)
    pub report: Option<String>,
    /// Where the stop report was saved, if writing it succeeded
    pub report_path: Option<PathBuf>,
}

impl LoopOutcome {
    /// Whether the run ended in success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == LoopStatus::Success
    }
}

/// Drives one loop run.
pub struct LoopManager {
    config: LoopConfig,
    deps: LoopDependencies,
    request_text: String,
    logs: CycleLogs,
    state: LoopState,
}

impl LoopManager {
    /// Create a manager for `config`, reading the request file up front.
    ///
    /// # Errors
    ///
    /// `LoopError::InvalidConfig` for bad settings, `LoopError::MissingFile`
    /// if the request file does not exist.
    pub fn new(config: LoopConfig, deps: LoopDependencies) -> Result<Self> {
        config.validate()?;
        let request_text =
            std::fs::read_to_string(&config.request_path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => LoopError::MissingFile {
                    path: config.request_path.clone(),
                },
                _ => LoopError::Io(e),
            })?;
        let logs = CycleLogs::new(config.log_dir.clone());

        Ok(Self {
            config,
            deps,
            request_text,
            logs,
            state: LoopState::new(),
        })
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Configuration the manager runs with.
    #[must_use]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Run cycles until a terminal state is reached.
    pub async fn run(&mut self) -> LoopOutcome {
        let span = info_span!("loop_run", session = %self.state.session_id);
        self.run_cycles().instrument(span).await
    }

    async fn run_cycles(&mut self) -> LoopOutcome {
        self.logs.prepare();
        self.print_banner();
        info!(
            "Starting loop: request={}, min_coverage={:.1}, max_cycles={}, max_repeats={}, scope={}",
            self.config.request_path.display(),
            self.config.min_coverage,
            self.config.max_quality_cycles,
            self.config.max_blocked_repeats,
            self.config.repeat_guard_scope
        );

        let max_cycles = self.config.max_quality_cycles;
        let mut prompt = self.request_text.clone();
        let mut last_verify: Option<(String, CommandResult, Option<f64>)> = None;

        for cycle in 1..=max_cycles {
            self.state.cycle = cycle;
            println!(
                "\n{} {}/{}",
                "=== Cycle".bright_blue().bold(),
                cycle,
                max_cycles
            );

            // --- Agent
            let before = self.deps.worktree.fingerprint().await;
            let last_message = self.logs.agent_last_message_path(cycle);
            println!("   {} {}", "Agent:".cyan().bold(), self.config.agent.binary);
            let agent_result = self.deps.agent.exec(&prompt, &last_message).await;
            let after = self.deps.worktree.fingerprint().await;
            self.logs.write_agent(cycle, &agent_result);

            let agent_class = classify_agent_result(&agent_result, &before, &after);
            debug!("Cycle {} agent: {}", cycle, agent_class.category);
            if let Some(failure) = Failure::from_result(
                FailureKind::Agent,
                &agent_class,
                self.deps.agent.command_line(&last_message),
                &agent_result,
                None,
            ) {
                println!(
                    "   {} agent {} (exit {})",
                    "Warning:".yellow().bold(),
                    failure.category,
                    failure.exit_code
                );
                if let Some(outcome) = self.apply_repeat_guard(failure) {
                    return outcome;
                }
            }

            // --- Verify
            let Some(verify_cmd) = self.config.verify_command.clone() else {
                let failure = loop_failure(
                    FailureCategory::NoTestCommand,
                    NO_VERIFY_COMMAND_EXCERPT,
                    NO_COMMAND_LABEL,
                    &CommandResult::new(0, "", ""),
                    None,
                );
                let count = self.state.repeats.increment(&failure.signature);
                let suggestions = suggestions_for_category(failure.category);
                return self.stop(
                    LoopStatus::StoppedBlocked,
                    StopReason::BlockedNoVerifyCommand,
                    failure,
                    count,
                    self.config.max_blocked_repeats,
                    &suggestions,
                );
            };

            println!("   {} {}", "Verify:".cyan().bold(), verify_cmd);
            let verify_result = self.deps.verify.run(&verify_cmd).await;
            self.logs.write_verify(cycle, &verify_result);
            let coverage = parse_coverage_percent(&verify_result.combined());

            if verify_result.success() && coverage.is_some_and(|c| c >= self.config.min_coverage) {
                return self.succeed(coverage);
            }

            let verify_class = classify_verify_result(&verify_cmd, &verify_result, coverage);
            debug!("Cycle {} verify: {}", cycle, verify_class.category);
            if let Some(failure) = Failure::from_result(
                FailureKind::Verify,
                &verify_class,
                verify_cmd.clone(),
                &verify_result,
                coverage,
            ) {
                if let Some(outcome) = self.apply_repeat_guard(failure) {
                    return outcome;
                }
            }

            self.print_verification_failed(&verify_result, coverage);
            prompt = build_followup_prompt(&FollowupContext {
                request_path: &self.config.request_path,
                cycle,
                verify_command: &verify_cmd,
                verify_stdout: &verify_result.stdout,
                verify_stderr: &verify_result.stderr,
                coverage,
                min_coverage: self.config.min_coverage,
            });
            last_verify = Some((verify_cmd, verify_result, coverage));
        }

        self.exhaust(last_verify)
    }

    /// Count `failure` if the scope says so and stop the run when a blocked
    /// failure reaches the threshold.
    fn apply_repeat_guard(&mut self, failure: Failure) -> Option<LoopOutcome> {
        let blocked = failure.category.is_blocked();
        if !blocked && self.config.repeat_guard_scope != RepeatGuardScope::All {
            return None;
        }

        let count = self.state.repeats.increment(&failure.signature);
        debug!(
            "Repeat guard: {} {} seen {}/{} ({})",
            failure.kind,
            failure.category,
            count,
            self.config.max_blocked_repeats,
            &failure.signature[..12.min(failure.signature.len())]
        );

        if blocked && count >= self.config.max_blocked_repeats {
            let suggestions = suggestions_for_category(failure.category);
            return Some(self.stop(
                LoopStatus::StoppedBlocked,
                StopReason::RepeatedBlockedFailure,
                failure,
                count,
                self.config.max_blocked_repeats,
                &suggestions,
            ));
        }
        None
    }

    fn succeed(&mut self, coverage: Option<f64>) -> LoopOutcome {
        self.state.finish(LoopStatus::Success);
        let shown = coverage.unwrap_or_default();
        info!("Loop succeeded in cycle {} with coverage {:.1}%", self.state.cycle, shown);
        println!(
            "\n   {} tests pass and coverage {:.1}% >= {:.1}%",
            "SUCCESS:".green().bold(),
            shown,
            self.config.min_coverage
        );
        println!("   Logs: {}", self.logs.dir().display());

        LoopOutcome {
            status: LoopStatus::Success,
            cycles_run: self.state.cycle,
            coverage,
            failure: None,
            report: None,
            report_path: None,
        }
    }

    fn exhaust(&mut self, last_verify: Option<(String, CommandResult, Option<f64>)>) -> LoopOutcome {
        let (command, result, coverage) = last_verify.unwrap_or_else(|| {
            (
                NO_COMMAND_LABEL.to_string(),
                CommandResult::new(0, "", ""),
                None,
            )
        });
        let failure = loop_failure(
            FailureCategory::CyclesExhausted,
            "",
            &command,
            &result,
            coverage,
        );
        let cycles = self.config.max_quality_cycles;
        self.stop(
            LoopStatus::StoppedExhausted,
            StopReason::MaxQualityCyclesReached,
            failure,
            cycles,
            cycles,
            &exhausted_suggestions(),
        )
    }

    fn stop(
        &mut self,
        status: LoopStatus,
        reason: StopReason,
        failure: Failure,
        repeats: u32,
        max_repeats: u32,
        suggestions: &[String],
    ) -> LoopOutcome {
        self.state.finish(status);
        warn!(
            "Loop stopped in cycle {}: {} ({})",
            self.state.cycle, reason, failure.category
        );
        println!(
            "\n   {} {} ({})",
            "STOPPED:".red().bold(),
            reason,
            failure.category
        );

        let report = build_stop_report(
            reason,
            &failure,
            repeats,
            max_repeats,
            self.logs.dir(),
            suggestions,
        );
        let report_path = self.logs.write_final_report(&report);

        LoopOutcome {
            status,
            cycles_run: self.state.cycle,
            coverage: failure.coverage,
            failure: Some(failure),
            report: Some(report),
            report_path,
        }
    }

    /// Print the startup banner.
    fn print_banner(&self) {
        println!("{}", "═".repeat(60).bright_blue());
        println!("{}", "     codex-loop - implement, verify, repair".bright_blue().bold());
        println!("{}", "═".repeat(60).bright_blue());
        println!();
        println!("   Root: {}", self.config.root.display());
        println!("   Request: {}", self.config.request_path.display());
        println!(
            "   Verify: {}",
            self.config.verify_command.as_deref().unwrap_or(NO_COMMAND_LABEL)
        );
        println!("   Min coverage: {:.1}%", self.config.min_coverage);
        println!("   Max quality cycles: {}", self.config.max_quality_cycles);
        println!(
            "   Max blocked repeats: {} (scope: {})",
            self.config.max_blocked_repeats, self.config.repeat_guard_scope
        );
        println!("   Logs: {}", self.logs.dir().display());
        println!("   Session: {}", self.state.session_id);
    }

    fn print_verification_failed(&self, result: &CommandResult, coverage: Option<f64>) {
        let mut reasons = Vec::new();
        if !result.success() {
            reasons.push(format!("tests failed (exit={})", result.exit_code));
        }
        match coverage {
            None => reasons.push("coverage unknown (could not parse)".to_string()),
            Some(c) if c < self.config.min_coverage => reasons.push(format!(
                "coverage {:.1}% < {:.1}%",
                c, self.config.min_coverage
            )),
            Some(_) => {}
        }
        info!("Cycle {} verification failed: {}", self.state.cycle, reasons.join(", "));
        println!(
            "\n   {} {}",
            "VERIFICATION FAILED:".red().bold(),
            reasons.join(", ")
        );
    }
}

/// Failure for categories the loop assigns itself rather than the
/// classifier.
fn loop_failure(
    category: FailureCategory,
    key_excerpt: &str,
    command: &str,
    result: &CommandResult,
    coverage: Option<f64>,
) -> Failure {
    Failure {
        kind: FailureKind::Verify,
        category,
        signature: failure_signature(FailureKind::Verify, category, result.exit_code, key_excerpt),
        command: command.to_string(),
        exit_code: result.exit_code,
        coverage,
        stdout_tail: tail(&result.stdout, DEFAULT_TAIL_CHARS).to_string(),
        stderr_tail: tail(&result.stderr, DEFAULT_TAIL_CHARS).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAgentProcess, MockVerifyRunner, MockWorktree};
    use tempfile::TempDir;

    struct Harness {
        _temp: TempDir,
        config: LoopConfig,
    }

    fn harness() -> Harness {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("request.md"), "Implement the widget.").unwrap();
        let config = LoopConfig::new(temp.path(), "request.md")
            .with_verify_command("pytest -q --cov=.")
            .with_log_dir("logs");
        Harness {
            _temp: temp,
            config,
        }
    }

    fn deps(
        agent: MockAgentProcess,
        verify: MockVerifyRunner,
        tree: MockWorktree,
    ) -> (LoopDependencies, Arc<MockAgentProcess>, Arc<MockVerifyRunner>) {
        let agent = Arc::new(agent);
        let verify = Arc::new(verify);
        let deps = LoopDependencies::new(agent.clone(), verify.clone(), Arc::new(tree));
        (deps, agent, verify)
    }

    #[test]
    fn test_missing_request_file() {
        let h = harness();
        let config = LoopConfig::new(&h.config.root, "nope.md");
        let tree = MockWorktree::new();
        let (deps, _, _) = deps(MockAgentProcess::new(), MockVerifyRunner::new(), tree);
        let err = LoopManager::new(config, deps).err().unwrap();
        assert!(matches!(err, LoopError::MissingFile { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let h = harness();
        let tree = MockWorktree::new();
        let (deps, _, _) = deps(MockAgentProcess::new(), MockVerifyRunner::new(), tree);
        let err = LoopManager::new(h.config.clone().with_max_quality_cycles(0), deps)
            .err()
            .unwrap();
        assert!(matches!(err, LoopError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_first_cycle_uses_request_then_followup() {
        let h = harness();
        let tree = MockWorktree::new();
        let agent = MockAgentProcess::new().bound_to(&tree);
        let verify = MockVerifyRunner::new()
            .with_result(CommandResult::new(1, "1 failed\nTOTAL 10 6 40%", ""))
            .with_result(CommandResult::new(0, "TOTAL 10 1 90%", ""));
        let (deps, agent, verify) = deps(agent, verify, tree);

        let outcome = LoopManager::new(h.config.clone(), deps).unwrap().run().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.cycles_run, 2);
        assert_eq!(outcome.coverage, Some(90.0));
        assert!(outcome.report.is_none());

        let prompts = agent.prompts();
        assert_eq!(prompts[0], "Implement the widget.");
        assert!(prompts[1].contains("Verification failed in cycle 1"));
        assert!(prompts[1].contains("Coverage: 40.0% (target >= 80.0%)"));
        assert_eq!(verify.commands(), vec!["pytest -q --cov=."; 2]);
        assert!(!h.config.log_dir.join("final_report.md").exists());
        assert!(h.config.log_dir.join("cycle_02_verify_stdout.txt").exists());
    }

    #[tokio::test]
    async fn test_exit_zero_below_min_continues() {
        let h = harness();
        let tree = MockWorktree::new();
        let agent = MockAgentProcess::new().bound_to(&tree);
        let verify = MockVerifyRunner::new()
            .with_result(CommandResult::new(0, "TOTAL 10 5 50%", ""))
            .with_result(CommandResult::new(0, "TOTAL 10 2 80%", ""));
        let (deps, _, _) = deps(agent, verify, tree);

        let outcome = LoopManager::new(h.config.clone(), deps).unwrap().run().await;
        assert!(outcome.is_success());
        assert_eq!(outcome.cycles_run, 2);
    }

    #[tokio::test]
    async fn test_non_blocked_agent_error_still_verifies() {
        let h = harness();
        let tree = MockWorktree::new();
        let agent = MockAgentProcess::new()
            .bound_to(&tree)
            .with_step(CommandResult::new(2, "", "internal error"));
        let (deps, _, verify) = deps(agent, MockVerifyRunner::new(), tree);

        let outcome = LoopManager::new(h.config.clone(), deps).unwrap().run().await;
        assert!(outcome.is_success());
        assert_eq!(verify.call_count(), 1);
    }

    #[tokio::test]
    async fn test_all_scope_counts_but_never_stops_on_transient() {
        let h = harness();
        let config = h
            .config
            .clone()
            .with_repeat_guard_scope(RepeatGuardScope::All)
            .with_max_blocked_repeats(1)
            .with_max_quality_cycles(3);
        let tree = MockWorktree::new();
        let agent = MockAgentProcess::new().bound_to(&tree);
        let verify =
            MockVerifyRunner::new().with_result(CommandResult::new(1, "FAILED\nTOTAL 10 6 40%", ""));
        let (deps, _, _) = deps(agent, verify, tree);

        let mut manager = LoopManager::new(config, deps).unwrap();
        let outcome = manager.run().await;
        assert_eq!(outcome.status, LoopStatus::StoppedExhausted);
        assert_eq!(outcome.cycles_run, 3);
        assert_eq!(manager.state().repeats.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_verify_stops_at_threshold() {
        let h = harness();
        let config = h.config.clone().with_max_blocked_repeats(2);
        let tree = MockWorktree::new();
        let agent = MockAgentProcess::new().bound_to(&tree);
        let verify = MockVerifyRunner::new().with_result(CommandResult::new(
            127,
            "",
            "sh: 1: pytest: command not found",
        ));
        let (deps, _, _) = deps(agent, verify, tree);

        let outcome = LoopManager::new(config, deps).unwrap().run().await;
        assert_eq!(outcome.status, LoopStatus::StoppedBlocked);
        assert_eq!(outcome.cycles_run, 2);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.category, FailureCategory::EnvMissingTestTool);
        let report = outcome.report.unwrap();
        assert!(report.contains("REPEATED_BLOCKED_FAILURE"));
        assert!(report.contains("- repeated: 2 / 2"));
        assert!(outcome.report_path.unwrap().ends_with("final_report.md"));
    }

    #[tokio::test]
    async fn test_exhaustion_report_uses_last_verify() {
        let h = harness();
        let config = h.config.clone().with_max_quality_cycles(1);
        let tree = MockWorktree::new();
        let agent = MockAgentProcess::new().bound_to(&tree);
        let verify = MockVerifyRunner::new()
            .with_result(CommandResult::new(1, "E   assert 1 == 2\nTOTAL 10 3 70%", ""));
        let (deps, _, _) = deps(agent, verify, tree);

        let outcome = LoopManager::new(config, deps).unwrap().run().await;
        assert_eq!(outcome.status, LoopStatus::StoppedExhausted);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.category, FailureCategory::CyclesExhausted);
        assert_eq!(failure.exit_code, 1);
        assert_eq!(failure.coverage, Some(70.0));
        let report = outcome.report.unwrap();
        assert!(report.contains("MAX_QUALITY_CYCLES_REACHED"));
        assert!(report.contains("- repeated: 1 / 1"));
        assert!(report.contains("assert 1 == 2"));
        assert!(report.contains("Split the request"));
    }
}
