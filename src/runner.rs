//! Command runner for agent and verification subprocesses.
//!
//! Every invocation produces a [`CommandResult`]. Spawn failures and
//! timeouts are folded into sentinel exit codes so that a cycle can always
//! classify what happened instead of aborting the run:
//!
//! - executable not found → [`EXIT_NOT_FOUND`] (127)
//! - wall-clock timeout → [`EXIT_TIMEOUT`] (124)
//! - any other spawn or I/O fault → [`EXIT_EXCEPTION`] (1)
//!
//! # Example
//!
//! ```rust,ignore
//! use codex_loop::runner::{run_shell, CommandSpec};
//!
//! let result = run_shell("pytest -q", &root, Duration::from_secs(1800)).await;
//! if !result.success() {
//!     println!("{}", result.combined());
//! }
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exit code reported when the executable could not be found.
pub const EXIT_NOT_FOUND: i32 = 127;

/// Exit code reported when the command exceeded its timeout.
pub const EXIT_TIMEOUT: i32 = 124;

/// Exit code reported for any other spawn or I/O fault.
pub const EXIT_EXCEPTION: i32 = 1;

/// Default number of characters kept by [`tail`].
pub const DEFAULT_TAIL_CHARS: usize = 4000;

/// Upper bound for draining pipes after the child exited or was killed.
///
/// A grandchild that left the process group can keep a pipe open after
/// the child itself is gone.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Text helpers
// ============================================================================

fn ansi_regex() -> Option<&'static Regex> {
    static ANSI_RE: OnceLock<Option<Regex>> = OnceLock::new();
    ANSI_RE
        .get_or_init(|| {
            // OSC (hyperlinks, titles) first, then CSI.
            Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b\[[0-9;?]*[ -/]*[@-~]").ok()
        })
        .as_ref()
}

/// Remove ANSI escape sequences (colors, cursor movement) from text.
///
/// # Example
///
/// ```
/// use codex_loop::runner::strip_ansi;
///
/// assert_eq!(strip_ansi("\x1b[31mFAILED\x1b[0m"), "FAILED");
/// ```
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    match ansi_regex() {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Return the last `max_chars` characters of `text`.
///
/// # Example
///
/// ```
/// use codex_loop::runner::tail;
///
/// assert_eq!(tail("abcdef", 3), "def");
/// assert_eq!(tail("abc", 10), "abc");
/// ```
#[must_use]
pub fn tail(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

// ============================================================================
// CommandResult
// ============================================================================

/// Outcome of a single process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Process exit code, or one of the sentinel codes.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error, plus any runner evidence.
    pub stderr: String,
}

impl CommandResult {
    /// Create a result from its parts.
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Whether the process exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr joined by a newline, with ANSI sequences removed.
    #[must_use]
    pub fn combined(&self) -> String {
        strip_ansi(&format!("{}\n{}", self.stdout, self.stderr))
    }

    fn not_found(program: &str, err: &std::io::Error) -> Self {
        Self::new(
            EXIT_NOT_FOUND,
            "",
            format!("COMMAND NOT FOUND: {program}: {err}"),
        )
    }

    fn exception(err: &std::io::Error) -> Self {
        Self::new(EXIT_EXCEPTION, "", format!("EXCEPTION: {err}"))
    }

    fn timed_out(stdout: String, mut stderr: String, timeout: Duration) -> Self {
        stderr.push_str(&format!(
            "\nTIMEOUT: command exceeded {}s",
            timeout.as_secs()
        ));
        Self::new(EXIT_TIMEOUT, stdout, stderr)
    }
}

// ============================================================================
// CommandSpec
// ============================================================================

/// What to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// A command line interpreted by the host shell.
    Shell(String),
    /// An explicit program and argument vector (no shell quoting involved).
    Args { program: String, args: Vec<String> },
}

impl CommandSpec {
    /// Shell command line.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::Shell(command.into())
    }

    /// Program with arguments.
    pub fn args<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Args {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Printable form used in logs and reports.
    #[must_use]
    pub fn display(&self) -> String {
        match self {
            Self::Shell(cmd) => cmd.clone(),
            Self::Args { program, args } => {
                let mut parts = vec![program.clone()];
                parts.extend(args.iter().cloned());
                parts.join(" ")
            }
        }
    }

    fn program(&self) -> &str {
        match self {
            Self::Shell(_) => shell_program(),
            Self::Args { program, .. } => program,
        }
    }

    fn to_command(&self) -> Command {
        match self {
            Self::Shell(cmd) => {
                let mut command = Command::new(shell_program());
                command.arg(shell_flag()).arg(cmd);
                command
            }
            Self::Args { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
        }
    }
}

#[cfg(windows)]
fn shell_program() -> &'static str {
    "cmd"
}

#[cfg(windows)]
fn shell_flag() -> &'static str {
    "/C"
}

#[cfg(not(windows))]
fn shell_program() -> &'static str {
    "sh"
}

#[cfg(not(windows))]
fn shell_flag() -> &'static str {
    "-c"
}

// ============================================================================
// Execution
// ============================================================================

/// Bytes read from a pipe so far, shared with the task that reads them.
type Captured = Arc<Mutex<Vec<u8>>>;

fn drain<R>(pipe: Option<R>) -> Option<(JoinHandle<()>, Captured)>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut reader| {
        let captured: Captured = Arc::default();
        let sink = Arc::clone(&captured);
        let handle = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!("Pipe read ended early: {}", e);
                        break;
                    }
                }
            }
        });
        (handle, captured)
    })
}

/// Wait for a drain task, then return whatever it captured.
///
/// Output read before a capture timeout is kept.
async fn collect(task: Option<(JoinHandle<()>, Captured)>) -> String {
    let Some((handle, captured)) = task else {
        return String::new();
    };
    match tokio::time::timeout(IO_CAPTURE_TIMEOUT, handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Output capture task failed: {}", e),
        Err(_) => warn!(
            "Output capture did not finish within {}s",
            IO_CAPTURE_TIMEOUT.as_secs()
        ),
    }
    let buf = captured.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Kill the child and everything it spawned.
///
/// Children run as leaders of their own process group, so signalling the
/// group also reaches grandchildren started by the shell.
#[cfg(unix)]
async fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!("Killing process group {} failed: {}", pid, e);
        }
    }
    if let Err(e) = child.kill().await {
        debug!("Kill after timeout failed: {}", e);
    }
}

#[cfg(not(unix))]
async fn kill_tree(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("Kill after timeout failed: {}", e);
    }
}

/// Run a command to completion, capturing its output.
///
/// Never fails: see the module docs for how faults are reported.
pub async fn run_command(
    spec: &CommandSpec,
    cwd: &Path,
    stdin: Option<&str>,
    timeout: Duration,
) -> CommandResult {
    debug!(
        "Running `{}` in {} (timeout {}s)",
        spec.display(),
        cwd.display(),
        timeout.as_secs()
    );

    let mut command = spec.to_command();
    command
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return CommandResult::not_found(spec.program(), &e);
        }
        Err(e) => return CommandResult::exception(&e),
    };

    let stdout_task = drain(child.stdout.take());
    let stderr_task = drain(child.stderr.take());

    if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
        // Fed from a task: a child that never reads stdin must not stall us.
        let text = text.to_string();
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(text.as_bytes()).await {
                debug!("Failed to write stdin: {}", e);
            }
            if let Err(e) = pipe.shutdown().await {
                debug!("Failed to close stdin: {}", e);
            }
        });
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let stdout = collect(stdout_task).await;
            let stderr = collect(stderr_task).await;
            CommandResult::new(status.code().unwrap_or(-1), stdout, stderr)
        }
        Ok(Err(e)) => CommandResult::exception(&e),
        Err(_) => {
            warn!(
                "`{}` timed out after {}s, killing it",
                spec.display(),
                timeout.as_secs()
            );
            kill_tree(&mut child).await;
            let stdout = collect(stdout_task).await;
            let stderr = collect(stderr_task).await;
            CommandResult::timed_out(stdout, stderr, timeout)
        }
    }
}

/// Run a shell command line without stdin.
pub async fn run_shell(command: &str, cwd: &Path, timeout: Duration) -> CommandResult {
    run_command(&CommandSpec::shell(command), cwd, None, timeout).await
}

/// Run a program with an argument vector, optionally piping `stdin`.
pub async fn run_args<S: AsRef<str>>(
    program: &str,
    args: &[S],
    cwd: &Path,
    stdin: Option<&str>,
    timeout: Duration,
) -> CommandResult {
    let spec = CommandSpec::args(program, args.iter().map(|a| a.as_ref().to_string()));
    run_command(&spec, cwd, stdin, timeout).await
}
