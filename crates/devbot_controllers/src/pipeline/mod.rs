//! Clone → Bake → Apply
//!
//! The deployment controller drives three external tools: `git` for the
//! workspace, `kustomize` to render manifests and `kubectl` to apply them.
//! [`PipelineTools`] is the seam; [`CommandTools`] runs the real binaries.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use devbot_config::ApplyMode;
use secrecy::SecretString;
use thiserror::Error;

mod command;
mod layout;
mod substitute;

pub use command::CommandTools;
pub use layout::{find_kustomization, KUSTOMIZATION_FILE, OUTPUT_FILE};
pub use substitute::{substitute, Variables};

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How `kubectl apply` talks to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub mode: ApplyMode,
    /// `--as` user, e.g. `system:serviceaccount:team:deployer`.
    pub impersonate: Option<String>,
}

#[async_trait]
pub trait PipelineTools: Send + Sync {
    /// Shallow single-branch clone of `url` into `path`.
    async fn clone_repository(
        &self,
        url: &str,
        branch: &str,
        path: &Path,
        token: Option<&SecretString>,
    ) -> Result<(), ToolError>;

    /// Fetches `branch` and force-checks it out.
    async fn pull(&self, path: &Path, branch: &str, token: Option<&SecretString>) -> Result<(), ToolError>;

    /// Commit SHA of the checked out `HEAD`.
    async fn head(&self, path: &Path) -> Result<String, ToolError>;

    /// Renders the kustomization in `dir`.
    async fn build(&self, dir: &Path) -> Result<String, ToolError>;

    async fn apply(&self, manifest: &Path, options: &ApplyOptions) -> Result<(), ToolError>;
}

/// Workspace directory for a new deployment clone.
pub fn workspace_path(root: &Path, repository_namespace: &str, repository_name: &str, hash: &str) -> PathBuf {
    root.join(repository_namespace).join(repository_name).join(hash)
}
