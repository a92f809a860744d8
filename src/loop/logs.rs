//! Per-cycle log artifacts.
//!
//! Each cycle writes its agent and verification output once, under names
//! keyed by the cycle number. Write failures are logged and otherwise
//! ignored: losing a log file must not end the run.

use crate::runner::CommandResult;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Name of the stop report file.
pub const FINAL_REPORT_FILE: &str = "final_report.md";

/// Log directory handle.
#[derive(Debug, Clone)]
pub struct CycleLogs {
    dir: PathBuf,
}

impl CycleLogs {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory.
    pub fn prepare(&self) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("Failed to create log directory {}: {}", self.dir.display(), e);
        }
    }

    /// `cycle_NN_<stem>` inside the log directory.
    #[must_use]
    pub fn cycle_path(&self, cycle: u32, stem: &str) -> PathBuf {
        self.dir.join(format!("cycle_{cycle:02}_{stem}"))
    }

    /// Where the agent is asked to write its last message.
    #[must_use]
    pub fn agent_last_message_path(&self, cycle: u32) -> PathBuf {
        self.cycle_path(cycle, "agent_last_message.md")
    }

    pub fn write_agent(&self, cycle: u32, result: &CommandResult) {
        self.write(&self.cycle_path(cycle, "agent_stdout.txt"), &result.stdout);
        self.write(&self.cycle_path(cycle, "agent_stderr.txt"), &result.stderr);
    }

    pub fn write_verify(&self, cycle: u32, result: &CommandResult) {
        self.write(&self.cycle_path(cycle, "verify_stdout.txt"), &result.stdout);
        self.write(&self.cycle_path(cycle, "verify_stderr.txt"), &result.stderr);
    }

    /// Save the stop report; returns its path when written.
    pub fn write_final_report(&self, report: &str) -> Option<PathBuf> {
        let path = self.dir.join(FINAL_REPORT_FILE);
        self.write(&path, report).then_some(path)
    }

    fn write(&self, path: &Path, content: &str) -> bool {
        match std::fs::write(path, content) {
            Ok(()) => {
                debug!("Wrote {}", path.display());
                true
            }
            Err(e) => {
                warn!("Failed to write {}: {}", path.display(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cycle_file_names() {
        let logs = CycleLogs::new("/logs");
        assert_eq!(
            logs.cycle_path(3, "verify_stdout.txt"),
            PathBuf::from("/logs/cycle_03_verify_stdout.txt")
        );
        assert_eq!(
            logs.agent_last_message_path(12),
            PathBuf::from("/logs/cycle_12_agent_last_message.md")
        );
    }

    #[test]
    fn test_writes_cycle_files() {
        let temp = TempDir::new().unwrap();
        let logs = CycleLogs::new(temp.path().join("loop"));
        logs.prepare();
        logs.write_agent(1, &CommandResult::new(0, "agent out", "agent err"));
        logs.write_verify(1, &CommandResult::new(1, "verify out", "verify err"));

        let read = |name: &str| std::fs::read_to_string(logs.dir().join(name)).unwrap();
        assert_eq!(read("cycle_01_agent_stdout.txt"), "agent out");
        assert_eq!(read("cycle_01_agent_stderr.txt"), "agent err");
        assert_eq!(read("cycle_01_verify_stdout.txt"), "verify out");
        assert_eq!(read("cycle_01_verify_stderr.txt"), "verify err");

        let report = logs.write_final_report("# report").unwrap();
        assert_eq!(std::fs::read_to_string(report).unwrap(), "# report");
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        // The log "directory" is a regular file, so every write fails.
        let logs = CycleLogs::new(&blocker);
        logs.prepare();
        logs.write_agent(1, &CommandResult::new(0, "", ""));
        assert!(logs.write_final_report("r").is_none());
    }
}
