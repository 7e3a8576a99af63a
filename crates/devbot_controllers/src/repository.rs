//! Repository-Controller: spiegelt die Branches eines GitHub-Repositories
//! als `Ref`-Objekte.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbot_api::conditions::{InvalidReason, StaleReason};
use devbot_api::naming::generate_name;
use devbot_api::repository::DEFAULT_REFRESH_INTERVAL;
use devbot_api::{ManagedObject, Ref, RefSpec, Repository};
use devbot_github::{GitHubApi, GitHubError, RepositoryInfo};
use devbot_reconcile::actions::{
    store_failure, AddFinalizer, Finalization, FinalizeHook, FinalizeIfDeleted, GetOwned, ParseRefreshInterval,
    RequeueAfter,
};
use devbot_reconcile::{Action, Controller, Engine, Outcome, Reconciliation, Store, StoreError};
use kube::ResourceExt;
use secrecy::SecretString;
use tracing::{info, warn};

use crate::auth::Authenticate;
use crate::Context;

/// Requeue-Intervall, solange das Refresh-Intervall noch unbekannt ist.
pub(crate) const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct RepositoryController<S>(PhantomData<fn() -> S>);

#[derive(Default)]
pub struct RepositoryState {
    pub refs: Vec<Ref>,
    pub refresh_interval: Option<Duration>,
    pub token: Option<SecretString>,
    pub info: Option<RepositoryInfo>,
}

impl<S: Store> Controller for RepositoryController<S> {
    type Object = Repository;
    type Store = S;
    type State = RepositoryState;

    const NAME: &'static str = "repository";
}

/// Refresh-Intervall von `repository`, mit Default, falls nicht gesetzt.
pub(crate) fn refresh_interval_source(repository: &Repository) -> String {
    if repository.spec.refresh_interval.trim().is_empty() {
        DEFAULT_REFRESH_INTERVAL.to_string()
    } else {
        repository.spec.refresh_interval.clone()
    }
}

fn own_repository<'a>(object: &'a Repository, _: &'a RepositoryState) -> Option<&'a Repository> {
    Some(object)
}

pub fn actions<S: Store>(ctx: &Context) -> Vec<Box<dyn Action<RepositoryController<S>>>> {
    vec![
        Box::new(FinalizeIfDeleted::<RepositoryController<S>>::with_hook(DeleteRefs)),
        Box::new(AddFinalizer::<RepositoryController<S>>::new()),
        Box::new(ValidateSpec),
        Box::new(GetOwned::<RepositoryController<S>, Ref>::new(|s, refs| s.refs = refs)),
        Box::new(ParseRefreshInterval::<RepositoryController<S>>::new(
            |o, _| Some(refresh_interval_source(o)),
            |s, d| s.refresh_interval = Some(d),
        )),
        Box::new(Authenticate::<RepositoryController<S>>::new(
            ctx.github.clone(),
            own_repository,
            |s| s.refresh_interval,
            |s, token| s.token = Some(token),
        )),
        Box::new(FetchRepository {
            github: ctx.github.clone(),
        }),
        Box::new(SyncDefaultBranch),
        Box::new(SyncBranches {
            github: ctx.github.clone(),
        }),
        Box::new(RequeueAfter::<RepositoryController<S>>::from_state(
            |s| s.refresh_interval,
            DEFAULT_INTERVAL,
        )),
    ]
}

pub fn engine<S: Store>(store: Arc<S>, ctx: &Context) -> Engine<RepositoryController<S>> {
    Engine::new(store, actions(ctx))
}

fn interval(state: &RepositoryState) -> Duration {
    state.refresh_interval.unwrap_or(DEFAULT_INTERVAL)
}

// ============================================================================
// Finalizer: Refs zuerst löschen
// ============================================================================

struct DeleteRefs;

#[async_trait]
impl<S: Store> FinalizeHook<RepositoryController<S>> for DeleteRefs {
    async fn finalize(&self, rc: &mut Reconciliation<'_, RepositoryController<S>>) -> Result<Finalization, String> {
        let uid = rc.object.uid().unwrap_or_default();
        let refs: Vec<Ref> = rc
            .store
            .list_owned(&rc.namespace(), &uid)
            .await
            .map_err(|e| format!("Failed listing refs: {e}"))?;
        if refs.is_empty() {
            return Ok(Finalization::Complete);
        }

        for r in refs.iter().filter(|r| !r.is_being_deleted()) {
            rc.store
                .delete::<Ref>(&r.key())
                .await
                .map_err(|e| format!("Failed deleting ref {}: {e}", r.name_any()))?;
        }
        Ok(Finalization::Pending(format!("Waiting for {} refs to be deleted", refs.len())))
    }
}

// ============================================================================
// Spec-Validierung
// ============================================================================

const SPEC_REASONS: &[InvalidReason] = &[
    InvalidReason::RepositoryNotSupported,
    InvalidReason::RepositoryOwnerMissing,
    InvalidReason::RepositoryNameMissing,
    InvalidReason::AuthConfigMissing,
    InvalidReason::AuthSecretNameMissing,
    InvalidReason::AuthSecretKeyMissing,
];

/// Erstes Konfigurationsproblem von `repository`, falls vorhanden.
pub fn validate(repository: &Repository) -> Option<(InvalidReason, &'static str)> {
    let Some(gh) = repository.github() else {
        return Some((InvalidReason::RepositoryNotSupported, "Only GitHub repositories are supported"));
    };
    if gh.owner.is_empty() {
        return Some((InvalidReason::RepositoryOwnerMissing, "Repository owner is missing"));
    }
    if gh.name.is_empty() {
        return Some((InvalidReason::RepositoryNameMissing, "Repository name is missing"));
    }
    let Some(auth) = &gh.auth else {
        return Some((InvalidReason::AuthConfigMissing, "Auth configuration is missing"));
    };
    if auth.secret_ref.as_ref().map_or(true, |r| r.name.is_empty()) {
        return Some((InvalidReason::AuthSecretNameMissing, "Auth secret name is missing"));
    }
    if auth.key.is_empty() {
        return Some((InvalidReason::AuthSecretKeyMissing, "Auth secret key is missing"));
    }
    None
}

struct ValidateSpec;

#[async_trait]
impl<S: Store> Action<RepositoryController<S>> for ValidateSpec {
    fn name(&self) -> &'static str {
        "validate-spec"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, RepositoryController<S>>) -> Outcome {
        match validate(&rc.object) {
            Some((reason, message)) => {
                rc.conditions().set(reason, message);
                Outcome::Stop
            }
            None => {
                rc.conditions().clear_if_due_to_any_of(SPEC_REASONS);
                Outcome::Continue
            }
        }
    }
}

// ============================================================================
// Repository-Metadaten
// ============================================================================

const FETCH_REASONS: &[StaleReason] = &[
    StaleReason::RepositoryNotFound,
    StaleReason::RepositoryNotAccessible,
    StaleReason::GitHubApiFailure,
];

struct FetchRepository {
    github: Arc<dyn GitHubApi>,
}

#[async_trait]
impl<S: Store> Action<RepositoryController<S>> for FetchRepository {
    fn name(&self) -> &'static str {
        "fetch-repository"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, RepositoryController<S>>) -> Outcome {
        let (Some(token), Some(gh)) = (rc.state.token.clone(), rc.object.github().cloned()) else {
            return Outcome::Stop;
        };
        let retry = interval(&rc.state);

        match self.github.get_repository(&token, &gh.owner, &gh.name).await {
            Ok(info) => {
                rc.conditions().clear_if_due_to_any_of(FETCH_REASONS);
                rc.status().resolved_name = info.full_name.clone();
                rc.state.info = Some(info);
                Outcome::Continue
            }
            Err(e) if e.is_not_found() => {
                rc.conditions().set(
                    StaleReason::RepositoryNotFound,
                    format!("Repository {}/{} not found", gh.owner, gh.name),
                );
                Outcome::RequeueAfter(retry)
            }
            Err(GitHubError::Forbidden(message)) => {
                rc.conditions().set(
                    StaleReason::RepositoryNotAccessible,
                    format!("Repository {}/{} is not accessible: {message}", gh.owner, gh.name),
                );
                Outcome::RequeueAfter(retry)
            }
            Err(e) => {
                warn!(error = %e, "failed fetching repository");
                rc.conditions()
                    .set_maybe(StaleReason::GitHubApiFailure, format!("Failed fetching repository: {e}"));
                Outcome::RequeueAfter(retry)
            }
        }
    }
}

struct SyncDefaultBranch;

#[async_trait]
impl<S: Store> Action<RepositoryController<S>> for SyncDefaultBranch {
    fn name(&self) -> &'static str {
        "sync-default-branch"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, RepositoryController<S>>) -> Outcome {
        let Some(observed) = rc.state.info.as_ref().map(|i| i.default_branch.clone()) else {
            return Outcome::Stop;
        };
        let current = rc.status().default_branch.clone();
        if current == observed {
            rc.conditions()
                .clear_if_due_to_any_of(&[StaleReason::DefaultBranchOutOfSync]);
            return Outcome::Continue;
        }

        info!(from = %current, to = %observed, "default branch changed");
        rc.conditions().set(
            StaleReason::DefaultBranchOutOfSync,
            format!("Default branch changed from '{current}' to '{observed}'"),
        );
        rc.status().default_branch = observed;
        Outcome::Requeue
    }
}

// ============================================================================
// Branches → Refs
// ============================================================================

/// Anzulegende und zu löschende Refs, damit pro Branch genau ein lebender Ref existiert.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RefPlan {
    pub create: Vec<String>,
    /// Namen der zu löschenden Refs.
    pub delete: Vec<String>,
}

impl RefPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.delete.is_empty()
    }
}

/// Vergleicht `refs` mit den Branch-Namen eines vollständigen Listings.
///
/// Refs, die bereits gelöscht werden, zählen nicht. Von mehreren Refs für
/// einen Branch bleibt der älteste.
pub fn plan_refs(branches: &BTreeSet<String>, refs: &[Ref]) -> RefPlan {
    let mut by_branch: BTreeMap<&str, Vec<&Ref>> = BTreeMap::new();
    for r in refs.iter().filter(|r| !r.is_being_deleted()) {
        by_branch.entry(r.branch()).or_default().push(r);
    }

    let mut plan = RefPlan::default();
    for branch in branches {
        if !by_branch.contains_key(branch.as_str()) {
            plan.create.push(branch.clone());
        }
    }
    for (branch, mut group) in by_branch {
        group.sort_by_key(|r| (r.creation_timestamp().map(|t| t.0), r.name_any()));
        let keep = usize::from(branches.contains(branch));
        plan.delete
            .extend(group.into_iter().skip(keep).map(|r| r.name_any()));
    }
    plan
}

struct SyncBranches {
    github: Arc<dyn GitHubApi>,
}

#[async_trait]
impl<S: Store> Action<RepositoryController<S>> for SyncBranches {
    fn name(&self) -> &'static str {
        "sync-branches"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, RepositoryController<S>>) -> Outcome {
        let (Some(token), Some(gh)) = (rc.state.token.clone(), rc.object.github().cloned()) else {
            return Outcome::Stop;
        };
        let retry = interval(&rc.state);

        // ein fehlgeschlagenes oder unvollständiges Listing löscht nie Refs
        let branches = match self.github.list_branches(&token, &gh.owner, &gh.name).await {
            Ok(branches) => branches,
            Err(e) => {
                warn!(error = %e, "failed listing branches");
                rc.conditions()
                    .set_maybe(StaleReason::GitHubApiFailure, format!("Failed listing branches: {e}"));
                return Outcome::RequeueAfter(retry);
            }
        };

        rc.status().revisions = branches
            .iter()
            .map(|b| (b.name.clone(), b.commit_sha.clone()))
            .collect();
        let names: BTreeSet<String> = branches.into_iter().map(|b| b.name).collect();
        let plan = plan_refs(&names, &rc.state.refs);
        if plan.is_empty() {
            rc.conditions().clear::<StaleReason>();
            return Outcome::Continue;
        }

        let namespace = rc.namespace();
        let Some(owner) = rc.object.owner_reference() else {
            return Outcome::Stop;
        };

        for branch in &plan.create {
            let mut child = Ref::new(&generate_name(), RefSpec { r#ref: branch.clone() });
            child.metadata.namespace = Some(namespace.clone());
            child.metadata.owner_references = Some(vec![owner.clone()]);
            match rc.store.create(&child).await {
                Ok(created) => info!(ref_name = %created.name_any(), %branch, "created ref"),
                // zufälliger Name kollidiert; der nächste Durchlauf wählt einen anderen
                Err(StoreError::AlreadyExists(_)) => return Outcome::Requeue,
                Err(e) => return store_failure("sync-branches", e),
            }
        }
        for name in &plan.delete {
            let key = devbot_api::ObjectKey::new(&namespace, name);
            if let Err(e) = rc.store.delete::<Ref>(&key).await {
                return store_failure("sync-branches", e);
            }
            info!(ref_name = %name, "deleted ref");
        }

        rc.conditions().set(
            StaleReason::BranchesOutOfSync,
            format!("Created {} and deleted {} refs", plan.create.len(), plan.delete.len()),
        );
        Outcome::Requeue
    }
}
