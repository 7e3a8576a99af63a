//! Deployment-Controller
//!
//! Lineare Zustandsmaschine pro Reconcile, sichtbar als Reason der
//! `Stale`-Condition:
//!
//! ```text
//! CloneMissing → Cloning ─┬→ Baking → Applying → (Current)
//!                Pulling ─┘
//! ```
//!
//! Fehler landen in `CloneFailed`, `PullFailed`, `BakingFailed` oder
//! `ApplyFailed`. Der Workspace bleibt bei Fehlern erhalten und wird erst
//! beim Löschen des Deployments entfernt.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbot_api::conditions::{InvalidReason, StaleReason, UnauthenticatedReason};
use devbot_api::naming::{random_hash, slugify, HASH_LENGTH};
use devbot_api::{Application, Deployment, Environment, ManagedObject, Repository};
use devbot_reconcile::actions::{
    fetch_controller, AddFinalizer, ControllerLookup, Finalization, FinalizeHook, FinalizeIfDeleted,
    GetController, RequeueAfter,
};
use devbot_reconcile::{Action, Controller, Engine, Outcome, Reconciliation, Store, StoreError};
use kube::ResourceExt;
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::auth::resolve_token;
use crate::pipeline::{
    find_kustomization, substitute, workspace_path, ApplyOptions, PipelineTools, Variables, KUSTOMIZATION_FILE,
    OUTPUT_FILE,
};
use crate::{Context, Settings};

/// Wartezeit vor erneutem Clone, Bake oder Apply nach einem Fehler.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

pub struct DeploymentController<S>(PhantomData<fn() -> S>);

#[derive(Default)]
pub struct DeploymentState {
    pub environment: Option<Environment>,
    pub application: Option<Application>,
    pub repository: Option<Repository>,
    pub token: Option<SecretString>,
    pub head: Option<String>,
    pub manifest: Option<PathBuf>,
}

impl<S: Store> Controller for DeploymentController<S> {
    type Object = Deployment;
    type Store = S;
    type State = DeploymentState;

    const NAME: &'static str = "deployment";
}

pub fn actions<S: Store>(ctx: &Context) -> Vec<Box<dyn Action<DeploymentController<S>>>> {
    let settings = ctx.settings.clone();
    let safety = settings.safety_interval;
    vec![
        Box::new(FinalizeIfDeleted::<DeploymentController<S>>::with_hook(RemoveWorkspace {
            root: settings.workspace_root.clone(),
        })),
        Box::new(AddFinalizer::<DeploymentController<S>>::new()),
        Box::new(GetController::<DeploymentController<S>, Environment>::required(|s, env| {
            s.environment = Some(env)
        })),
        Box::new(ResolveApplication),
        Box::new(SyncResolvedFields {
            volume_claim_name: settings.volume_claim_name.clone(),
        }),
        Box::new(PrepareWorkspace {
            settings: settings.clone(),
        }),
        Box::new(CloneOrPull {
            tools: ctx.tools.clone(),
        }),
        Box::new(Bake {
            tools: ctx.tools.clone(),
            idle: safety,
        }),
        Box::new(Apply {
            tools: ctx.tools.clone(),
            settings,
        }),
        Box::new(RequeueAfter::<DeploymentController<S>>::fixed(safety)),
    ]
}

pub fn engine<S: Store>(store: Arc<S>, ctx: &Context) -> Engine<DeploymentController<S>> {
    Engine::new(store, actions(ctx))
}

/// `namespace/name` des deployten Repositories.
fn resolved_repository(deployment: &Deployment) -> String {
    let namespace = deployment.namespace().unwrap_or_default();
    deployment.spec.repository.key(&namespace).to_string()
}

// ============================================================================
// Finalizer: Workspace aufräumen
// ============================================================================

struct RemoveWorkspace {
    root: PathBuf,
}

#[async_trait]
impl<S: Store> FinalizeHook<DeploymentController<S>> for RemoveWorkspace {
    async fn finalize(&self, rc: &mut Reconciliation<'_, DeploymentController<S>>) -> Result<Finalization, String> {
        let Some(path) = rc.object.clone_path().map(PathBuf::from) else {
            return Ok(Finalization::Complete);
        };
        // nie etwas außerhalb der Workspace-Root anfassen
        if !path.starts_with(&self.root) {
            warn!(path = %path.display(), "clone path outside workspace root, leaving it alone");
            return Ok(Finalization::Complete);
        }
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(path = %path.display(), "removed workspace");
                Ok(Finalization::Complete)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Finalization::Complete),
            Err(e) => Err(format!("Failed removing workspace {}: {e}", path.display())),
        }
    }
}

// ============================================================================
// Application über das Environment auflösen
// ============================================================================

struct ResolveApplication;

#[async_trait]
impl<S: Store> Action<DeploymentController<S>> for ResolveApplication {
    fn name(&self) -> &'static str {
        "resolve-application"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, DeploymentController<S>>) -> Outcome {
        let Some(environment) = rc.state.environment.clone() else {
            return Outcome::Stop;
        };
        match fetch_controller::<_, _, Application>(rc.store, &environment).await {
            Ok(ControllerLookup::Found(application)) => {
                rc.state.application = Some(application);
                Outcome::Continue
            }
            Ok(_) => {
                rc.conditions().set(
                    InvalidReason::ControllerNotFound,
                    format!("Application of environment {} not found", environment.name_any()),
                );
                Outcome::Stop
            }
            Err(e @ StoreError::Forbidden(_)) => {
                rc.conditions().set(
                    InvalidReason::ControllerNotAccessible,
                    format!("Application of environment {} is not accessible: {e}", environment.name_any()),
                );
                Outcome::Requeue
            }
            Err(e) => {
                rc.conditions()
                    .set_maybe(InvalidReason::InternalError, format!("Failed getting application: {e}"));
                Outcome::Error(e.into())
            }
        }
    }
}

// ============================================================================
// Denormalisierte Felder
// ============================================================================

struct SyncResolvedFields {
    volume_claim_name: Option<String>,
}

#[async_trait]
impl<S: Store> Action<DeploymentController<S>> for SyncResolvedFields {
    fn name(&self) -> &'static str {
        "sync-resolved-fields"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, DeploymentController<S>>) -> Outcome {
        let repository = resolved_repository(&rc.object);
        let branch = rc.object.spec.branch.clone();
        rc.status().persistent_volume_claim_name = self.volume_claim_name.clone();

        if rc.status().resolved_repository != repository {
            rc.conditions().set(
                StaleReason::ResolvedRepositoryOutOfSync,
                format!("Resolved repository changed to '{repository}'"),
            );
            rc.status().resolved_repository = repository;
            return Outcome::Requeue;
        }
        if rc.status().branch != branch {
            rc.conditions()
                .set(StaleReason::BranchOutOfSync, format!("Branch changed to '{branch}'"));
            rc.status().branch = branch;
            return Outcome::Requeue;
        }

        rc.conditions().clear_if_due_to_any_of(&[
            StaleReason::ResolvedRepositoryOutOfSync,
            StaleReason::BranchOutOfSync,
        ]);
        Outcome::Continue
    }
}

// ============================================================================
// Workspace vorbereiten
// ============================================================================

const REPOSITORY_REASONS: &[StaleReason] = &[
    StaleReason::RepositoryNotFound,
    StaleReason::RepositoryNotAccessible,
    StaleReason::InternalError,
];

struct PrepareWorkspace {
    settings: Settings,
}

#[async_trait]
impl<S: Store> Action<DeploymentController<S>> for PrepareWorkspace {
    fn name(&self) -> &'static str {
        "prepare-workspace"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, DeploymentController<S>>) -> Outcome {
        let safety = self.settings.safety_interval;
        let reference = rc.object.spec.repository.clone();
        if !reference.is_supported() {
            rc.conditions().set(
                InvalidReason::RepositoryNotSupported,
                format!("Repository kind {}/{} is not supported", reference.api_version, reference.kind),
            );
            return Outcome::Stop;
        }

        let key = reference.key(&rc.namespace());
        let repository = match rc.store.get::<Repository>(&key).await {
            Ok(Some(repository)) => repository,
            Ok(None) => {
                rc.conditions()
                    .set(StaleReason::RepositoryNotFound, format!("Repository {key} not found"));
                return Outcome::RequeueAfter(safety);
            }
            Err(e @ StoreError::Forbidden(_)) => {
                rc.conditions().set(
                    StaleReason::RepositoryNotAccessible,
                    format!("Repository {key} is not accessible: {e}"),
                );
                return Outcome::RequeueAfter(safety);
            }
            Err(e) => {
                rc.conditions()
                    .set_maybe(StaleReason::InternalError, format!("Failed getting repository {key}: {e}"));
                return Outcome::Error(e.into());
            }
        };
        rc.conditions().clear_if_due_to_any_of(REPOSITORY_REASONS);

        if repository.clone_url().is_none() {
            rc.conditions().set(
                InvalidReason::RepositoryNotSupported,
                format!("Repository {key} has no clone URL"),
            );
            return Outcome::Stop;
        }
        rc.conditions()
            .clear_if_due_to_any_of(&[InvalidReason::RepositoryNotSupported]);

        if rc.object.clone_path().is_none() {
            let path = workspace_path(
                &self.settings.workspace_root,
                &key.namespace,
                &key.name,
                &random_hash(HASH_LENGTH),
            );
            debug!(path = %path.display(), "assigned workspace");
            rc.status().clone_path = path.display().to_string();
            rc.conditions()
                .set(StaleReason::CloneMissing, "Workspace assigned, clone pending");
            return Outcome::Requeue;
        }
        if let Some(path) = rc.object.clone_path() {
            if !Path::new(path).exists() {
                rc.conditions().set(StaleReason::CloneMissing, "Clone missing");
            }
        }

        // öffentliche Repositories brauchen kein Token
        if repository.github().is_some_and(|gh| gh.auth.is_some()) {
            match resolve_token(rc.store, &repository).await {
                Ok(token) => rc.state.token = Some(token),
                Err(e) => {
                    warn!(error = %e, "failed resolving clone token");
                    e.record(rc.conditions());
                    return Outcome::RequeueAfter(safety);
                }
            }
        }
        rc.conditions().clear::<UnauthenticatedReason>();
        rc.state.repository = Some(repository);
        Outcome::Continue
    }
}

// ============================================================================
// Clone / Pull
// ============================================================================

struct CloneOrPull {
    tools: Arc<dyn PipelineTools>,
}

#[async_trait]
impl<S: Store> Action<DeploymentController<S>> for CloneOrPull {
    fn name(&self) -> &'static str {
        "clone-or-pull"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, DeploymentController<S>>) -> Outcome {
        let (Some(path), Some(url)) = (
            rc.object.clone_path().map(PathBuf::from),
            rc.state.repository.as_ref().and_then(|r| r.clone_url()),
        ) else {
            return Outcome::Stop;
        };
        let branch = rc.object.spec.branch.clone();
        let token = rc.state.token.clone();

        if !path.join(".git").exists() {
            rc.conditions()
                .set(StaleReason::Cloning, format!("Cloning branch '{branch}'"));
            // Reste eines abgebrochenen Clones
            if path.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                    rc.conditions().set(
                        StaleReason::CloneFailed,
                        format!("Failed removing partial clone: {e}"),
                    );
                    return Outcome::RequeueAfter(RETRY_INTERVAL);
                }
            }
            if let Err(e) = self
                .tools
                .clone_repository(&url, &branch, &path, token.as_ref())
                .await
            {
                warn!(error = %e, "clone failed");
                rc.conditions().set(StaleReason::CloneFailed, e.to_string());
                return Outcome::RequeueAfter(RETRY_INTERVAL);
            }
            info!(%url, %branch, path = %path.display(), "cloned repository");
            return Outcome::Continue;
        }

        rc.conditions()
            .set(StaleReason::Pulling, format!("Pulling branch '{branch}'"));
        if let Err(e) = self.tools.pull(&path, &branch, token.as_ref()).await {
            warn!(error = %e, "pull failed");
            rc.conditions().set(StaleReason::PullFailed, e.to_string());
            return Outcome::RequeueAfter(RETRY_INTERVAL);
        }
        Outcome::Continue
    }
}

// ============================================================================
// Bake
// ============================================================================

struct Bake {
    tools: Arc<dyn PipelineTools>,
    /// Requeue, wenn der Head bereits angewendet ist.
    idle: Duration,
}

impl Bake {
    fn failed<S: Store>(rc: &mut Reconciliation<'_, DeploymentController<S>>, message: String) -> Outcome {
        warn!(error = %message, "baking failed");
        rc.conditions().set(StaleReason::BakingFailed, message);
        Outcome::RequeueAfter(RETRY_INTERVAL)
    }
}

#[async_trait]
impl<S: Store> Action<DeploymentController<S>> for Bake {
    fn name(&self) -> &'static str {
        "bake"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, DeploymentController<S>>) -> Outcome {
        let (Some(path), Some(environment), Some(application)) = (
            rc.object.clone_path().map(PathBuf::from),
            rc.state.environment.clone(),
            rc.state.application.clone(),
        ) else {
            return Outcome::Stop;
        };

        let head = match self.tools.head(&path).await {
            Ok(head) => head,
            Err(e) => return Self::failed(rc, format!("Failed reading HEAD: {e}")),
        };
        if rc.status().last_applied_revision == head {
            debug!(%head, "revision already applied");
            rc.conditions().clear_if_due_to_any_of(StaleReason::PIPELINE);
            return Outcome::RequeueAfter(self.idle);
        }

        let namespace = rc.namespace();
        let app_name = application.name_any();
        let base = match application
            .repository_entry(&rc.object.spec.repository, &namespace)
            .and_then(|e| e.path.as_deref())
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
        {
            Some(sub) => path.join(sub),
            None => path.clone(),
        };
        let Some(dir) = find_kustomization(&base, &app_name, environment.preferred_branch()) else {
            return Self::failed(rc, format!("No {KUSTOMIZATION_FILE} found under {}", base.join(".devbot").display()));
        };

        rc.conditions()
            .set(StaleReason::Baking, format!("Baking revision {head}"));
        let rendered = match self.tools.build(&dir).await {
            Ok(rendered) => rendered,
            Err(e) => return Self::failed(rc, e.to_string()),
        };
        let vars = Variables {
            application: app_name,
            branch: rc.object.spec.branch.clone(),
            commit_sha: head.clone(),
            environment: slugify(environment.preferred_branch()),
        };
        let manifest = dir.join(OUTPUT_FILE);
        if let Err(e) = tokio::fs::write(&manifest, substitute(&rendered, &vars)).await {
            return Self::failed(rc, format!("Failed writing {}: {e}", manifest.display()));
        }

        rc.status().last_attempted_revision = head.clone();
        rc.state.head = Some(head);
        rc.state.manifest = Some(manifest);
        Outcome::Continue
    }
}

// ============================================================================
// Apply
// ============================================================================

struct Apply {
    tools: Arc<dyn PipelineTools>,
    settings: Settings,
}

#[async_trait]
impl<S: Store> Action<DeploymentController<S>> for Apply {
    fn name(&self) -> &'static str {
        "apply"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, DeploymentController<S>>) -> Outcome {
        let (Some(head), Some(manifest), Some(application)) = (
            rc.state.head.clone(),
            rc.state.manifest.clone(),
            rc.state.application.as_ref(),
        ) else {
            return Outcome::Stop;
        };
        let impersonate = Some(application.spec.service_account_name.as_str())
            .filter(|sa| !sa.is_empty())
            .map(|sa| {
                format!(
                    "system:serviceaccount:{}:{sa}",
                    application.namespace().unwrap_or_default()
                )
            });
        let options = ApplyOptions {
            mode: self.settings.apply_mode,
            impersonate,
        };

        rc.conditions()
            .set(StaleReason::Applying, format!("Applying revision {head}"));
        if let Err(e) = self.tools.apply(&manifest, &options).await {
            warn!(error = %e, "apply failed");
            rc.conditions().set(StaleReason::ApplyFailed, e.to_string());
            return Outcome::RequeueAfter(RETRY_INTERVAL);
        }

        info!(revision = %head, mode = ?options.mode, "applied revision");
        rc.status().last_applied_revision = head;
        rc.conditions().clear_if_due_to_any_of(StaleReason::PIPELINE);
        Outcome::Continue
    }
}
