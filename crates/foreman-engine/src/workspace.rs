//! Workspace provisioning collaborator.
//!
//! Preparing a working directory for an agent is an external step (checkout,
//! scaffolding, worktrees); the supervisor only needs a path it can hand to
//! the subprocess. The trait seam keeps tests free of real checkouts.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Provides a working directory for a session's subprocess.
pub trait Workspaces: Send + Sync {
    /// Provision (or reuse) the workspace for a session key. Must be
    /// idempotent: a second call for the same key returns the same path.
    fn provision(&self, agent_name: &str, session_key: &str) -> io::Result<PathBuf>;
}

/// Directory-per-session provisioning under a common root.
pub struct DirWorkspaces {
    root: PathBuf,
}

impl DirWorkspaces {
    /// Create a provider rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Workspaces for DirWorkspaces {
    fn provision(&self, agent_name: &str, session_key: &str) -> io::Result<PathBuf> {
        // Session keys may contain separators (`project:x`); flatten them.
        let dir_name: String = session_key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        let path = self.root.join(dir_name);
        std::fs::create_dir_all(&path)?;
        debug!(agent_name, path = %path.display(), "Workspace provisioned");
        Ok(path)
    }
}

/// Test/embedding fallback: every session shares one fixed directory.
pub struct FixedWorkspace {
    path: PathBuf,
}

impl FixedWorkspace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Workspaces for FixedWorkspace {
    fn provision(&self, _agent_name: &str, _session_key: &str) -> io::Result<PathBuf> {
        Ok(self.path.clone())
    }
}

/// Resolve a usable working directory, falling back to the home directory
/// when the provisioned path is missing or empty.
pub(crate) fn usable_working_dir(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() || !path.exists() {
        dirs::home_dir().unwrap_or_else(std::env::temp_dir)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dir_workspaces_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let workspaces = DirWorkspaces::new(root.path());

        let first = workspaces.provision("agent-a", "project:alpha").unwrap();
        let second = workspaces.provision("agent-a", "project:alpha").unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        assert!(first.starts_with(root.path()));
    }

    #[test]
    fn separators_are_flattened() {
        let root = tempfile::tempdir().unwrap();
        let workspaces = DirWorkspaces::new(root.path());

        let path = workspaces.provision("agent-a", "thread:t/1").unwrap();
        assert_eq!(path.parent().unwrap(), root.path());
    }

    #[test]
    fn missing_dir_falls_back_to_home() {
        let fallback = usable_working_dir(Path::new("/definitely/not/here"));
        assert!(fallback.exists());
    }
}
