//! Test-Harness für die Controller.
//!
//! [`MockTools`] ersetzt git/kustomize/kubectl durch ein Dateisystem-Modell,
//! [`World`] verdrahtet alle fünf Engines mit [`MemoryStore`] und
//! [`MockGitHub`] und treibt sie bis zur Ruhe.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devbot_api::{
    Application, ApplicationRepository, ApplicationSpec, Deployment, Environment, GitHubAuth,
    GitHubRepositorySpec, ManagedObject, MissingBranchStrategy, ObjectKey, Ref, Repository, RepositorySpec, SecretReference,
};
use devbot_config::ApplyMode;
use devbot_github::test_utils::MockGitHub;
use devbot_reconcile::test_utils::MemoryStore;
use devbot_reconcile::{Engine, ReconcileError};
use secrecy::SecretString;
use tempfile::TempDir;

use crate::pipeline::{ApplyOptions, PipelineTools, ToolError, KUSTOMIZATION_FILE};
use crate::{
    application, deployment, environment, git_ref, repository, ApplicationController, Context,
    DeploymentController, EnvironmentController, RefController, RepositoryController, Settings,
};

pub const NAMESPACE: &str = "team";
pub const OWNER: &str = "acme";
pub const TOKEN: &str = "ghp_test";
pub const SECRET_NAME: &str = "github";
pub const SECRET_KEY: &str = "token";

/// Manifest, das `build` rendert; jede Variable taucht einmal auf.
pub const TEMPLATE: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: ${APPLICATION}-$ENVIRONMENT
data:
  branch: ${BRANCH}
  commit: ${COMMIT_SHA}
";

// ============================================================================
// MockTools
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Clone,
    Pull,
    Head,
    Build,
    Apply,
}

/// Ein `apply`-Aufruf mit dem Manifest-Inhalt zu diesem Zeitpunkt.
#[derive(Debug, Clone)]
pub struct Applied {
    pub manifest: PathBuf,
    pub content: String,
    pub options: ApplyOptions,
}

#[derive(Default)]
struct ToolsState {
    /// Clone-URL → Branch → SHA
    remotes: HashMap<String, BTreeMap<String, String>>,
    /// Checkout-Pfad → Clone-URL
    checkouts: HashMap<PathBuf, String>,
    faults: Vec<(Tool, String)>,
    calls: Vec<Tool>,
    applied: Vec<Applied>,
}

/// Pipeline-Tools auf dem echten Dateisystem.
///
/// Ein Clone ist ein Verzeichnis mit `.git/HEAD` (enthält den SHA) und
/// `.devbot/kustomization.yaml`; ein Pull setzt `HEAD` auf den Remote-SHA.
#[derive(Default)]
pub struct MockTools {
    state: Mutex<ToolsState>,
}

fn head_file(path: &Path) -> PathBuf {
    path.join(".git").join("HEAD")
}

impl MockTools {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ToolsState> {
        self.state.lock().unwrap()
    }

    pub fn set_remote(&self, url: &str, branch: &str, sha: &str) {
        self.lock()
            .remotes
            .entry(url.to_string())
            .or_default()
            .insert(branch.to_string(), sha.to_string());
    }

    pub fn remove_remote_branch(&self, url: &str, branch: &str) {
        if let Some(branches) = self.lock().remotes.get_mut(url) {
            branches.remove(branch);
        }
    }

    /// Der nächste Aufruf von `tool` schlägt mit `message` fehl.
    pub fn fail_next(&self, tool: Tool, message: &str) {
        self.lock().faults.push((tool, message.to_string()));
    }

    pub fn count(&self, tool: Tool) -> usize {
        self.lock().calls.iter().filter(|t| **t == tool).count()
    }

    pub fn applied(&self) -> Vec<Applied> {
        self.lock().applied.clone()
    }

    fn enter(&self, tool: Tool) -> Result<std::sync::MutexGuard<'_, ToolsState>, ToolError> {
        let mut state = self.lock();
        state.calls.push(tool);
        if let Some(pos) = state.faults.iter().position(|(t, _)| *t == tool) {
            let (_, message) = state.faults.remove(pos);
            return Err(ToolError::Io(std::io::Error::other(message)));
        }
        Ok(state)
    }

    fn remote_sha(state: &ToolsState, url: &str, branch: &str) -> Result<String, ToolError> {
        state
            .remotes
            .get(url)
            .and_then(|b| b.get(branch))
            .cloned()
            .ok_or_else(|| ToolError::Io(std::io::Error::other(format!("Remote branch {branch} not found in {url}"))))
    }
}

#[async_trait]
impl PipelineTools for MockTools {
    async fn clone_repository(
        &self,
        url: &str,
        branch: &str,
        path: &Path,
        _token: Option<&SecretString>,
    ) -> Result<(), ToolError> {
        let mut state = self.enter(Tool::Clone)?;
        let sha = Self::remote_sha(&state, url, branch)?;
        std::fs::create_dir_all(path.join(".git"))?;
        std::fs::create_dir_all(path.join(".devbot"))?;
        std::fs::write(head_file(path), &sha)?;
        std::fs::write(path.join(".devbot").join(KUSTOMIZATION_FILE), "resources: []\n")?;
        state.checkouts.insert(path.to_path_buf(), url.to_string());
        Ok(())
    }

    async fn pull(&self, path: &Path, branch: &str, _token: Option<&SecretString>) -> Result<(), ToolError> {
        let state = self.enter(Tool::Pull)?;
        let url = state
            .checkouts
            .get(path)
            .cloned()
            .ok_or_else(|| ToolError::Io(std::io::Error::other("not a checkout")))?;
        let sha = Self::remote_sha(&state, &url, branch)?;
        std::fs::write(head_file(path), sha)?;
        Ok(())
    }

    async fn head(&self, path: &Path) -> Result<String, ToolError> {
        let _state = self.enter(Tool::Head)?;
        Ok(std::fs::read_to_string(head_file(path))?.trim().to_string())
    }

    async fn build(&self, dir: &Path) -> Result<String, ToolError> {
        let _state = self.enter(Tool::Build)?;
        if !dir.join(KUSTOMIZATION_FILE).is_file() {
            return Err(ToolError::Io(std::io::Error::other("missing kustomization")));
        }
        Ok(TEMPLATE.to_string())
    }

    async fn apply(&self, manifest: &Path, options: &ApplyOptions) -> Result<(), ToolError> {
        let mut state = self.enter(Tool::Apply)?;
        let content = std::fs::read_to_string(manifest)?;
        state.applied.push(Applied {
            manifest: manifest.to_path_buf(),
            content,
            options: options.clone(),
        });
        Ok(())
    }
}

// ============================================================================
// World
// ============================================================================

const MAX_ROUNDS: usize = 50;

pub fn clone_url(name: &str) -> String {
    format!("https://github.com/{OWNER}/{name}")
}

/// `acme/<name>`, authentifiziert über das gemeinsame Test-Secret.
pub fn repository_spec(name: &str) -> RepositorySpec {
    RepositorySpec {
        github: Some(GitHubRepositorySpec {
            owner: OWNER.into(),
            name: name.into(),
            auth: Some(GitHubAuth {
                secret_ref: Some(SecretReference {
                    name: SECRET_NAME.into(),
                    namespace: None,
                }),
                key: SECRET_KEY.into(),
            }),
        }),
        refresh_interval: "5m".into(),
    }
}

/// Store, Provider und Tools plus eine Engine pro Art.
pub struct World {
    pub store: Arc<MemoryStore>,
    pub github: Arc<MockGitHub>,
    pub tools: Arc<MockTools>,
    pub workspace: TempDir,
    pub ctx: Context,
    pub repositories: Engine<RepositoryController<MemoryStore>>,
    pub refs: Engine<RefController<MemoryStore>>,
    pub applications: Engine<ApplicationController<MemoryStore>>,
    pub environments: Engine<EnvironmentController<MemoryStore>>,
    pub deployments: Engine<DeploymentController<MemoryStore>>,
}

impl World {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let github = Arc::new(MockGitHub::new().with_token(TOKEN));
        let tools = Arc::new(MockTools::new());
        let workspace = tempfile::tempdir().unwrap();
        let ctx = Context {
            github: github.clone(),
            tools: tools.clone(),
            settings: Settings {
                workspace_root: workspace.path().to_path_buf(),
                volume_claim_name: Some("devbot-data".into()),
                safety_interval: Duration::from_secs(60),
                apply_mode: ApplyMode::DryRun,
            },
        };
        store.put_secret(NAMESPACE, SECRET_NAME, SECRET_KEY, TOKEN);

        Self {
            repositories: repository::engine(store.clone(), &ctx),
            refs: git_ref::engine(store.clone(), &ctx),
            applications: application::engine(store.clone(), &ctx),
            environments: environment::engine(store.clone(), &ctx),
            deployments: deployment::engine(store.clone(), &ctx),
            store,
            github,
            tools,
            workspace,
            ctx,
        }
    }

    /// Remote `acme/<name>` plus ein `Repository`-Objekt `<name>`, das darauf zeigt.
    pub fn add_repository(&self, name: &str, default_branch: &str, branches: &[(&str, &str)]) -> ObjectKey {
        self.github.add_repository(OWNER, name, default_branch, branches);
        for (branch, sha) in branches {
            self.tools.set_remote(&clone_url(name), branch, sha);
        }
        let repo = self.store.insert(Repository::new(name, repository_spec(name)), NAMESPACE);
        ObjectKey::new(NAMESPACE, repo.metadata.name.unwrap_or_default())
    }

    pub fn add_application(&self, name: &str, repositories: &[(&str, MissingBranchStrategy)]) -> ObjectKey {
        let spec = ApplicationSpec {
            repositories: repositories
                .iter()
                .map(|(repo, strategy)| ApplicationRepository {
                    api_version: devbot_api::API_VERSION.into(),
                    kind: "Repository".into(),
                    name: repo.to_string(),
                    namespace: None,
                    missing_branch_strategy: *strategy,
                    path: None,
                })
                .collect(),
            service_account_name: String::new(),
            branch_filter: None,
        };
        self.store.insert(Application::new(name, spec), NAMESPACE);
        ObjectKey::new(NAMESPACE, name)
    }

    /// Setzt `branch` von `acme/<name>` auf dem Remote auf `sha`.
    pub fn push(&self, name: &str, branch: &str, sha: &str) {
        self.github.push(OWNER, name, branch, sha);
        self.tools.set_remote(&clone_url(name), branch, sha);
    }

    pub fn delete_branch(&self, name: &str, branch: &str) {
        self.github.delete_branch(OWNER, name, branch);
        self.tools.remove_remote_branch(&clone_url(name), branch);
    }

    /// Ein Reconcile jedes Objekts, Eltern vor Kindern.
    pub async fn reconcile_all(&self) -> Vec<ReconcileError> {
        let mut errors = Vec::new();
        for key in self.store.keys::<Repository>() {
            errors.extend(self.repositories.reconcile(&key).await.err());
        }
        for key in self.store.keys::<Ref>() {
            errors.extend(self.refs.reconcile(&key).await.err());
        }
        for key in self.store.keys::<Application>() {
            errors.extend(self.applications.reconcile(&key).await.err());
        }
        for key in self.store.keys::<Environment>() {
            errors.extend(self.environments.reconcile(&key).await.err());
        }
        for key in self.store.keys::<Deployment>() {
            errors.extend(self.deployments.reconcile(&key).await.err());
        }
        errors
    }

    /// Reconciled, bis eine volle Runde nichts schreibt; liefert die Anzahl Runden.
    pub async fn converge(&self) -> usize {
        for round in 1..=MAX_ROUNDS {
            let before = self.store.writes();
            self.reconcile_all().await;
            if self.store.writes() == before {
                return round;
            }
        }
        panic!("no convergence after {MAX_ROUNDS} rounds");
    }

    // ------------------------------------------------------------------------
    // Abfragen
    // ------------------------------------------------------------------------

    pub fn repository(&self, name: &str) -> Repository {
        self.store.get_now(&ObjectKey::new(NAMESPACE, name)).unwrap()
    }

    pub fn application(&self, name: &str) -> Application {
        self.store.get_now(&ObjectKey::new(NAMESPACE, name)).unwrap()
    }

    /// Refs des Repositories `name`, nach Branch.
    pub fn refs_of(&self, name: &str) -> BTreeMap<String, Ref> {
        let uid = self.repository(name).metadata.uid.unwrap_or_default();
        self.store
            .list_now::<Ref>(NAMESPACE)
            .into_iter()
            .filter(|r| r.is_controlled_by(&uid))
            .map(|r| (r.branch().to_string(), r))
            .collect()
    }

    /// Environments der Application `name`, nach bevorzugtem Branch.
    pub fn environments_of(&self, name: &str) -> BTreeMap<String, Environment> {
        let uid = self.application(name).metadata.uid.unwrap_or_default();
        self.store
            .list_now::<Environment>(NAMESPACE)
            .into_iter()
            .filter(|e| e.is_controlled_by(&uid))
            .map(|e| (e.preferred_branch().to_string(), e))
            .collect()
    }

    /// Deployments von `environment`, nach Repository-Name.
    pub fn deployments_of(&self, environment: &Environment) -> BTreeMap<String, Deployment> {
        let uid = environment.metadata.uid.clone().unwrap_or_default();
        self.store
            .list_now::<Deployment>(NAMESPACE)
            .into_iter()
            .filter(|d| d.is_controlled_by(&uid))
            .map(|d| (d.spec.repository.name.clone(), d))
            .collect()
    }

    pub fn deployment(&self, application: &str, branch: &str, repository: &str) -> Deployment {
        let envs = self.environments_of(application);
        let env = envs.get(branch).unwrap();
        self.deployments_of(env).remove(repository).unwrap()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}
