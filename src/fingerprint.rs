//! Content fingerprints for text and for the working tree.
//!
//! Two uses: failure signatures (hash of a canonical excerpt) and no-op
//! detection (working-tree fingerprint taken before and after an agent run).

use crate::error::{LoopError, Result};
use crate::runner::run_shell;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;

/// Timeout for the git plumbing commands used here.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Deterministic SHA-256 hex digest of `text`.
///
/// # Example
///
/// ```
/// use codex_loop::fingerprint::text_hash;
///
/// assert_eq!(text_hash("abc"), text_hash("abc"));
/// assert_ne!(text_hash("abc"), text_hash("abd"));
/// assert_eq!(text_hash("").len(), 64);
/// ```
#[must_use]
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint of the uncommitted state of the repository at `root`.
///
/// Hashes the tracked diff against HEAD together with the porcelain status,
/// so untracked files count as changes too. Git failures simply contribute
/// their (empty) stdout; the fingerprint is still deterministic.
pub async fn worktree_fingerprint(root: &Path) -> String {
    let diff = run_shell("git diff --no-color", root, GIT_TIMEOUT).await;
    let status = run_shell("git status --porcelain", root, GIT_TIMEOUT).await;
    text_hash(&format!("{}\n---\n{}", diff.stdout, status.stdout))
}

/// Fail unless `root` is inside a git working tree.
pub async fn ensure_git_repo(root: &Path) -> Result<()> {
    let result = run_shell("git rev-parse --is-inside-work-tree", root, GIT_TIMEOUT).await;
    if result.success() && result.stdout.trim() == "true" {
        Ok(())
    } else {
        Err(LoopError::NotGitRepo {
            path: root.to_path_buf(),
        })
    }
}
