use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use devbot_config::{ApplyMode, ToolsConfig};
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::debug;

use super::{ApplyOptions, PipelineTools, ToolError};

const FIELD_MANAGER: &str = "devbot";
const AUTH_HEADER_KEY: &str = "http.https://github.com/.extraheader";

/// [`PipelineTools`] backed by the `git`, `kustomize` and `kubectl` binaries.
#[derive(Debug, Clone)]
pub struct CommandTools {
    git: PathBuf,
    kustomize: PathBuf,
    kubectl: PathBuf,
    timeout: Duration,
}

impl CommandTools {
    pub fn new(git: PathBuf, kustomize: PathBuf, kubectl: PathBuf, timeout: Duration) -> Self {
        Self {
            git,
            kustomize,
            kubectl,
            timeout,
        }
    }

    pub fn from_config(tools: &ToolsConfig, timeout: Duration) -> Self {
        Self::new(tools.git.clone(), tools.kustomize.clone(), tools.kubectl.clone(), timeout)
    }

    fn git(&self, token: Option<&SecretString>) -> Command {
        let mut cmd = Command::new(&self.git);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(token) = token {
            for (key, value) in git_auth_env(token) {
                cmd.env(key, value);
            }
        }
        cmd
    }

    /// Runs `cmd` to completion and returns its stdout.
    ///
    /// The child is killed if the deadline passes or the future is dropped.
    async fn run(&self, program: &Path, mut cmd: Command) -> Result<String, ToolError> {
        let program = program_name(program);
        debug!(%program, "running tool");
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: program.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(ToolError::TimedOut {
                    program,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ToolError::Failed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn program_name(program: &Path) -> String {
    program
        .file_name()
        .unwrap_or_else(|| OsStr::new("?"))
        .to_string_lossy()
        .into_owned()
}

/// Git config passed through the environment so the token never shows up in
/// the process list or in `.git/config`.
fn git_auth_env(token: &SecretString) -> [(&'static str, String); 3] {
    let basic = STANDARD.encode(format!("x-access-token:{}", token.expose_secret()));
    [
        ("GIT_CONFIG_COUNT", "1".to_string()),
        ("GIT_CONFIG_KEY_0", AUTH_HEADER_KEY.to_string()),
        ("GIT_CONFIG_VALUE_0", format!("AUTHORIZATION: basic {basic}")),
    ]
}

/// Arguments of `kubectl apply` for `manifest`.
fn apply_args(manifest: &Path, options: &ApplyOptions) -> Vec<String> {
    let mut args = vec![
        "apply".to_string(),
        "-f".to_string(),
        manifest.display().to_string(),
        "--server-side".to_string(),
        format!("--field-manager={FIELD_MANAGER}"),
    ];
    if options.mode == ApplyMode::DryRun {
        args.push("--dry-run=server".to_string());
    }
    if let Some(user) = &options.impersonate {
        args.push(format!("--as={user}"));
    }
    args
}

#[async_trait]
impl PipelineTools for CommandTools {
    async fn clone_repository(
        &self,
        url: &str,
        branch: &str,
        path: &Path,
        token: Option<&SecretString>,
    ) -> Result<(), ToolError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut cmd = self.git(token);
        cmd.args(["clone", "--depth", "1", "--single-branch", "--branch", branch, url])
            .arg(path);
        self.run(&self.git, cmd).await?;
        Ok(())
    }

    async fn pull(&self, path: &Path, branch: &str, token: Option<&SecretString>) -> Result<(), ToolError> {
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        let mut fetch = self.git(token);
        fetch
            .current_dir(path)
            .args(["fetch", "--depth", "1", "origin", &refspec]);
        self.run(&self.git, fetch).await?;

        let remote = format!("refs/remotes/origin/{branch}");
        let mut checkout = self.git(None);
        checkout
            .current_dir(path)
            .args(["checkout", "--force", "-B", branch, &remote]);
        self.run(&self.git, checkout).await?;
        Ok(())
    }

    async fn head(&self, path: &Path) -> Result<String, ToolError> {
        let mut cmd = self.git(None);
        cmd.current_dir(path).args(["rev-parse", "HEAD"]);
        Ok(self.run(&self.git, cmd).await?.trim().to_string())
    }

    async fn build(&self, dir: &Path) -> Result<String, ToolError> {
        let mut cmd = Command::new(&self.kustomize);
        cmd.arg("build").arg(dir);
        self.run(&self.kustomize, cmd).await
    }

    async fn apply(&self, manifest: &Path, options: &ApplyOptions) -> Result<(), ToolError> {
        let mut cmd = Command::new(&self.kubectl);
        cmd.args(apply_args(manifest, options));
        self.run(&self.kubectl, cmd).await?;
        Ok(())
    }
}
