//! Verification command discovery.
//!
//! The loop does not know any toolchain itself. A detector command (by
//! default the repository's `recommend-commands.js --json`) reports the
//! test and coverage commands per ecosystem; the loop picks one.
//!
//! ```json
//! {
//!   "python": { "commands": { "tests": "pytest -q", "testsCoverage": "pytest -q --cov=." } },
//!   "node":   { "commands": { "test": "npm test" } }
//! }
//! ```

use crate::error::{LoopError, Result};
use crate::runner::{run_shell, tail};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Detector output. Unknown fields are ignored and `null`s are tolerated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolingReport {
    #[serde(default)]
    pub python: Option<Ecosystem<PythonCommands>>,
    #[serde(default)]
    pub node: Option<Ecosystem<NodeCommands>>,
}

/// One ecosystem section of the report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ecosystem<C> {
    #[serde(default)]
    pub commands: Option<C>,
}

/// Python commands the loop cares about.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PythonCommands {
    #[serde(default)]
    pub tests: Option<String>,
    #[serde(default)]
    pub tests_coverage: Option<String>,
}

/// Node commands the loop cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeCommands {
    #[serde(default)]
    pub test: Option<String>,
}

fn non_blank(cmd: &Option<String>) -> Option<&str> {
    cmd.as_deref().map(str::trim).filter(|c| !c.is_empty())
}

impl ToolingReport {
    /// Parse detector JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn python(&self) -> Option<&PythonCommands> {
        self.python.as_ref().and_then(|e| e.commands.as_ref())
    }

    fn node(&self) -> Option<&NodeCommands> {
        self.node.as_ref().and_then(|e| e.commands.as_ref())
    }

    /// Choose the verification command.
    ///
    /// Python coverage command, then python tests, then node test, else none.
    #[must_use]
    pub fn select_verify_command(&self) -> Option<String> {
        let python = self.python();
        python
            .and_then(|p| non_blank(&p.tests_coverage))
            .or_else(|| python.and_then(|p| non_blank(&p.tests)))
            .or_else(|| self.node().and_then(|n| non_blank(&n.test)))
            .map(str::to_string)
    }
}

/// Run the detector command in `root` and parse its report.
pub async fn detect_tooling(detector: &str, root: &Path, timeout: Duration) -> Result<ToolingReport> {
    debug!("Detecting tooling with `{}`", detector);
    let result = run_shell(detector, root, timeout).await;
    if !result.success() {
        return Err(LoopError::tooling(format!(
            "`{}` exited with {}\nSTDERR:\n{}",
            detector,
            result.exit_code,
            tail(&result.stderr, 2000)
        )));
    }
    ToolingReport::from_json(&result.stdout).map_err(|_| {
        LoopError::tooling(format!(
            "`{}` did not return JSON\nSTDOUT:\n{}",
            detector,
            tail(&result.stdout, 2000)
        ))
    })
}

/// Resolve the verification command: an explicit one wins, otherwise ask the
/// detector. `Ok(None)` means verification is unavailable.
pub async fn resolve_verify_command(
    explicit: Option<&str>,
    detector: &str,
    root: &Path,
    timeout: Duration,
) -> Result<Option<String>> {
    if let Some(cmd) = explicit {
        let cmd = cmd.trim();
        return Ok((!cmd.is_empty()).then(|| cmd.to_string()));
    }
    let report = detect_tooling(detector, root, timeout).await?;
    Ok(report.select_verify_command())
}
