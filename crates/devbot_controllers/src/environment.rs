//! Environment-Controller
//!
//! Hält pro beteiligtem Repository eine Quelle in `status.sources` und
//! materialisiert für jede Quelle mit auflösbarem Branch ein `Deployment`.
//!
//! Branch-Auflösung pro Quelle:
//! 1. `Ref` mit `spec.ref == preferredBranch` existiert → dieser Branch
//! 2. `UseDefaultBranch` → Default-Branch des Repositories
//! 3. sonst kein Branch, ein vorhandenes Deployment wird gelöscht

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbot_api::conditions::{InvalidReason, StaleReason};
use devbot_api::naming::generate_name;
use devbot_api::{
    Application, Deployment, DeploymentReference, DeploymentSpec, Environment, EnvironmentSource, ManagedObject,
    MissingBranchStrategy, ObjectKey, Ref, Repository, RepositoryReference,
};
use devbot_reconcile::actions::{store_failure, AddFinalizer, FinalizeIfDeleted, GetController, GetOwned, RequeueAfter};
use devbot_reconcile::{Action, Controller, Engine, Outcome, Reconciliation, Store, StoreError};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::Context;

pub struct EnvironmentController<S>(PhantomData<fn() -> S>);

#[derive(Default)]
pub struct EnvironmentState {
    pub application: Option<Application>,
    pub deployments: Vec<Deployment>,
}

impl<S: Store> Controller for EnvironmentController<S> {
    type Object = Environment;
    type Store = S;
    type State = EnvironmentState;

    const NAME: &'static str = "environment";
}

pub fn actions<S: Store>(ctx: &Context) -> Vec<Box<dyn Action<EnvironmentController<S>>>> {
    let safety = ctx.settings.safety_interval;
    vec![
        Box::new(FinalizeIfDeleted::<EnvironmentController<S>>::new()),
        Box::new(AddFinalizer::<EnvironmentController<S>>::new()),
        Box::new(GetController::<EnvironmentController<S>, Application>::required(|s, app| {
            s.application = Some(app)
        })),
        Box::new(GetOwned::<EnvironmentController<S>, Deployment>::new(|s, deployments| {
            s.deployments = deployments
        })),
        Box::new(ReconcileSources { retry: safety }),
        Box::new(RequeueAfter::<EnvironmentController<S>>::fixed(safety)),
    ]
}

pub fn engine<S: Store>(store: Arc<S>, ctx: &Context) -> Engine<EnvironmentController<S>> {
    Engine::new(store, actions(ctx))
}

// ============================================================================
// Branch-Auflösung
// ============================================================================

/// Branch, den eine Quelle deployt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Branch(String),
    /// Aus diesem Repository gibt es nichts zu deployen.
    None,
    /// `UseDefaultBranch`, aber das Repository hat noch keinen gemeldet.
    MissingDefaultBranch,
}

/// Wählt den Branch von `repository`, der für `preferred` deployt wird.
///
/// `refs` sind die Refs des Repositories; Refs im Löschvorgang zählen nicht.
pub fn resolve_branch(
    preferred: &str,
    strategy: MissingBranchStrategy,
    repository: &Repository,
    refs: &[Ref],
) -> Resolution {
    if refs
        .iter()
        .any(|r| !r.is_being_deleted() && r.branch() == preferred)
    {
        return Resolution::Branch(preferred.to_string());
    }
    match strategy {
        MissingBranchStrategy::UseDefaultBranch => match repository.default_branch() {
            Some(branch) => Resolution::Branch(branch.to_string()),
            None => Resolution::MissingDefaultBranch,
        },
        MissingBranchStrategy::Ignore => Resolution::None,
    }
}

// ============================================================================
// Quellen
// ============================================================================

const SOURCE_REASONS: &[StaleReason] = &[
    StaleReason::RepositoryAdded,
    StaleReason::DeploymentBranchOutOfSync,
    StaleReason::RepositoryMissingDefaultBranch,
    StaleReason::RepositoryNotFound,
    StaleReason::RepositoryNotAccessible,
    StaleReason::InternalError,
];

/// Sammelt das Ergebnis eines Durchlaufs über alle Quellen.
///
/// Quellen werden auch nach einem Problem zu Ende verarbeitet, damit der
/// Status jeden erfolgten Seiteneffekt zeigt.
#[derive(Default)]
struct Pass {
    requeue: bool,
    failure: Option<Outcome>,
    missing_deployment: bool,
}

impl Pass {
    fn fail(&mut self, outcome: Outcome) {
        if self.failure.is_none() {
            self.failure = Some(outcome);
        }
    }

    fn outcome(self) -> Outcome {
        match (self.failure, self.requeue) {
            (Some(outcome), _) => outcome,
            (None, true) => Outcome::Requeue,
            (None, false) => Outcome::Continue,
        }
    }
}

struct ReconcileSources {
    retry: Duration,
}

impl ReconcileSources {
    /// Lädt das Repository und seine Refs, Fehler landen in `pass`.
    async fn load_repository<S: Store>(
        &self,
        rc: &mut Reconciliation<'_, EnvironmentController<S>>,
        pass: &mut Pass,
        key: &ObjectKey,
    ) -> Option<(Repository, Vec<Ref>)> {
        let repository = match rc.store.get::<Repository>(key).await {
            Ok(Some(repository)) => repository,
            Ok(None) => {
                rc.conditions()
                    .set(StaleReason::RepositoryNotFound, format!("Repository {key} not found"));
                pass.fail(Outcome::RequeueAfter(self.retry));
                return None;
            }
            Err(e @ StoreError::Forbidden(_)) => {
                rc.conditions().set(
                    StaleReason::RepositoryNotAccessible,
                    format!("Repository {key} is not accessible: {e}"),
                );
                pass.fail(Outcome::RequeueAfter(self.retry));
                return None;
            }
            Err(e) => {
                rc.conditions()
                    .set_maybe(StaleReason::InternalError, format!("Failed getting repository {key}: {e}"));
                pass.fail(Outcome::Error(e.into()));
                return None;
            }
        };
        let uid = repository.uid().unwrap_or_default();
        match rc.store.list_owned::<Ref>(&key.namespace, &uid).await {
            Ok(refs) => Some((repository, refs)),
            Err(e) => {
                rc.conditions()
                    .set_maybe(StaleReason::InternalError, format!("Failed listing refs of {key}: {e}"));
                pass.fail(Outcome::Error(e.into()));
                None
            }
        }
    }

    async fn delete_deployment<S: Store>(
        rc: &mut Reconciliation<'_, EnvironmentController<S>>,
        pass: &mut Pass,
        deployment: &Deployment,
    ) -> bool {
        match rc.store.delete::<Deployment>(&deployment.key()).await {
            Ok(()) => {
                info!(deployment = %deployment.name_any(), "deleted deployment");
                true
            }
            Err(e) => {
                pass.fail(store_failure("reconcile-sources", e));
                false
            }
        }
    }

    /// Bringt das Deployment einer beteiligten Quelle in Einklang mit
    /// `resolution`.
    async fn apply<S: Store>(
        &self,
        rc: &mut Reconciliation<'_, EnvironmentController<S>>,
        pass: &mut Pass,
        source: &mut EnvironmentSource,
        deployment: Option<Deployment>,
        resolution: Resolution,
    ) {
        let branch = match resolution {
            Resolution::Branch(branch) => Some(branch),
            Resolution::None => None,
            Resolution::MissingDefaultBranch => {
                rc.conditions().set(
                    StaleReason::RepositoryMissingDefaultBranch,
                    format!("Repository {} has no default branch yet", source.repository.name),
                );
                pass.fail(Outcome::RequeueAfter(self.retry));
                return;
            }
        };

        match (deployment, branch) {
            (Some(deployment), None) => {
                if Self::delete_deployment(rc, pass, &deployment).await {
                    source.deployment = None;
                }
            }
            (None, Some(branch)) => {
                let Some(owner) = rc.object.owner_reference() else {
                    return;
                };
                let mut deployment = Deployment::new(
                    &generate_name(),
                    DeploymentSpec {
                        repository: source.repository.clone(),
                        branch: branch.clone(),
                    },
                );
                deployment.metadata.namespace = Some(rc.namespace());
                deployment.metadata.owner_references = Some(vec![owner]);
                match rc.store.create(&deployment).await {
                    Ok(created) => {
                        info!(deployment = %created.name_any(), %branch, "created deployment");
                        source.deployment = Some(DeploymentReference {
                            name: created.name_any(),
                        });
                    }
                    Err(StoreError::AlreadyExists(_)) => pass.requeue = true,
                    Err(e) => pass.fail(store_failure("reconcile-sources", e)),
                }
            }
            (Some(mut deployment), Some(branch)) if deployment.spec.branch != branch => {
                rc.conditions().set(
                    StaleReason::DeploymentBranchOutOfSync,
                    format!(
                        "Deployment {} switches from '{}' to '{branch}'",
                        deployment.name_any(),
                        deployment.spec.branch
                    ),
                );
                deployment.spec.branch = branch;
                match rc.store.update(&deployment).await {
                    Ok(_) => pass.requeue = true,
                    Err(e) => pass.fail(store_failure("reconcile-sources", e)),
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl<S: Store> Action<EnvironmentController<S>> for ReconcileSources {
    fn name(&self) -> &'static str {
        "reconcile-sources"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, EnvironmentController<S>>) -> Outcome {
        let Some(application) = rc.state.application.clone() else {
            return Outcome::Stop;
        };
        let namespace = rc.namespace();
        let preferred = rc.object.preferred_branch().to_string();
        let owned = std::mem::take(&mut rc.state.deployments);

        let mut pass = Pass::default();
        let mut sources = Vec::new();

        for mut source in rc.object.sources().to_vec() {
            let deployment = match &source.deployment {
                None => None,
                Some(pointer) => match owned.iter().find(|d| d.name_any() == pointer.name) {
                    Some(d) => Some(d.clone()),
                    None => {
                        rc.conditions().set(
                            InvalidReason::DeploymentNotFound,
                            format!("Deployment {} not found", pointer.name),
                        );
                        source.deployment = None;
                        pass.missing_deployment = true;
                        pass.requeue = true;
                        sources.push(source);
                        continue;
                    }
                },
            };

            // nicht mehr Teil der Application
            let Some(entry) = application.repository_entry(&source.repository, &namespace).cloned() else {
                let dropped_name = source.repository.name.clone();
                if let Some(d) = &deployment {
                    if !Self::delete_deployment(rc, &mut pass, d).await {
                        sources.push(source);
                    }
                }
                debug!(repository = %dropped_name, "dropped source");
                continue;
            };

            let key = source.repository.key(&namespace);
            let Some((repository, refs)) = self.load_repository(rc, &mut pass, &key).await else {
                sources.push(source);
                continue;
            };
            let resolution = resolve_branch(&preferred, entry.missing_branch_strategy, &repository, &refs);
            self.apply(rc, &mut pass, &mut source, deployment, resolution).await;
            sources.push(source);
        }

        for entry in &application.spec.repositories {
            let reference = entry.reference().resolved(&namespace);
            if !reference.is_supported() || has_source(&sources, &reference, &namespace) {
                continue;
            }
            rc.conditions().set(
                StaleReason::RepositoryAdded,
                format!("Repository {} added", reference.name),
            );
            sources.push(EnvironmentSource {
                repository: reference,
                deployment: None,
            });
            pass.requeue = true;
        }

        // Deployments, auf die keine Quelle zeigt
        let referenced: BTreeSet<&str> = sources
            .iter()
            .filter_map(|s| s.deployment.as_ref())
            .map(|d| d.name.as_str())
            .collect();
        let orphans: Vec<Deployment> = owned
            .iter()
            .filter(|d| !d.is_being_deleted() && !referenced.contains(d.name_any().as_str()))
            .cloned()
            .collect();
        for orphan in &orphans {
            Self::delete_deployment(rc, &mut pass, orphan).await;
        }

        rc.status().sources = sources;
        if !pass.missing_deployment {
            rc.conditions()
                .clear_if_due_to_any_of(&[InvalidReason::DeploymentNotFound]);
        }
        if !pass.requeue && pass.failure.is_none() {
            rc.conditions().clear_if_due_to_any_of(SOURCE_REASONS);
        }
        pass.outcome()
    }
}

fn has_source(sources: &[EnvironmentSource], reference: &RepositoryReference, namespace: &str) -> bool {
    sources
        .iter()
        .any(|s| s.repository.resolved(namespace) == *reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbot_api::{RefSpec, RepositorySpec};

    fn repository(default_branch: &str) -> Repository {
        let mut repo = Repository::new("web", RepositorySpec::default());
        repo.status_mut().default_branch = default_branch.into();
        repo
    }

    fn refs(branches: &[&str]) -> Vec<Ref> {
        branches
            .iter()
            .map(|b| Ref::new(&format!("ref-{b}"), RefSpec { r#ref: b.to_string() }))
            .collect()
    }

    #[test]
    fn test_preferred_branch_wins() {
        let resolution = resolve_branch(
            "feat1",
            MissingBranchStrategy::Ignore,
            &repository("main"),
            &refs(&["main", "feat1"]),
        );
        assert_eq!(resolution, Resolution::Branch("feat1".into()));
    }

    #[test]
    fn test_falls_back_to_default_branch() {
        let repo = repository("main");
        let refs = refs(&["main", "b1"]);

        assert_eq!(
            resolve_branch("b2", MissingBranchStrategy::UseDefaultBranch, &repo, &refs),
            Resolution::Branch("main".into())
        );
        assert_eq!(
            resolve_branch("b2", MissingBranchStrategy::Ignore, &repo, &refs),
            Resolution::None
        );
        assert_eq!(
            resolve_branch("b2", MissingBranchStrategy::UseDefaultBranch, &repository(""), &refs),
            Resolution::MissingDefaultBranch
        );
    }

    #[test]
    fn test_ref_being_deleted_does_not_count() {
        let mut refs = refs(&["feat1"]);
        refs[0].metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));

        assert_eq!(
            resolve_branch("feat1", MissingBranchStrategy::UseDefaultBranch, &repository("main"), &refs),
            Resolution::Branch("main".into())
        );
    }
}
