//! Application-Controller: ein `Environment` pro Branch der beteiligten
//! Repositories.

use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbot_api::conditions::{InvalidReason, StaleReason};
use devbot_api::naming::{generate_name, is_dns1123_label, is_dns1123_subdomain};
use devbot_api::{Application, Environment, EnvironmentSpec, ManagedObject, Ref, Repository};
use devbot_reconcile::actions::{store_failure, AddFinalizer, FinalizeIfDeleted, GetOwned, RequeueAfter};
use devbot_reconcile::{Action, Controller, Engine, Outcome, Reconciliation, Store, StoreError};
use kube::ResourceExt;
use regex::Regex;
use tracing::{info, warn};

use crate::Context;

pub struct ApplicationController<S>(PhantomData<fn() -> S>);

#[derive(Default)]
pub struct ApplicationState {
    pub environments: Vec<Environment>,
    pub branch_filter: Option<Regex>,
}

impl<S: Store> Controller for ApplicationController<S> {
    type Object = Application;
    type Store = S;
    type State = ApplicationState;

    const NAME: &'static str = "application";
}

pub fn actions<S: Store>(ctx: &Context) -> Vec<Box<dyn Action<ApplicationController<S>>>> {
    let safety = ctx.settings.safety_interval;
    vec![
        Box::new(FinalizeIfDeleted::<ApplicationController<S>>::new()),
        Box::new(AddFinalizer::<ApplicationController<S>>::new()),
        Box::new(GetOwned::<ApplicationController<S>, Environment>::new(|s, envs| {
            s.environments = envs
        })),
        Box::new(ValidateSpec),
        Box::new(SyncEnvironments { retry: safety }),
        Box::new(RequeueAfter::<ApplicationController<S>>::fixed(safety)),
    ]
}

pub fn engine<S: Store>(store: Arc<S>, ctx: &Context) -> Engine<ApplicationController<S>> {
    Engine::new(store, actions(ctx))
}

// ============================================================================
// Spec-Validierung
// ============================================================================

const SPEC_REASONS: &[InvalidReason] = &[
    InvalidReason::RepositoriesMissing,
    InvalidReason::RepositoryNotSupported,
    InvalidReason::RepositoryReferenceInvalid,
    InvalidReason::InvalidBranchFilter,
];

struct ValidateSpec;

#[async_trait]
impl<S: Store> Action<ApplicationController<S>> for ValidateSpec {
    fn name(&self) -> &'static str {
        "validate-spec"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, ApplicationController<S>>) -> Outcome {
        if rc.object.spec.repositories.is_empty() {
            rc.conditions()
                .set(InvalidReason::RepositoriesMissing, "No repositories configured");
            return Outcome::Stop;
        }

        if let Some(unsupported) = rc
            .object
            .spec
            .repositories
            .iter()
            .find(|r| !r.reference().is_supported())
        {
            let message = format!(
                "Repository {} of kind {}/{} is not supported",
                unsupported.name, unsupported.api_version, unsupported.kind
            );
            rc.conditions().set(InvalidReason::RepositoryNotSupported, message);
            return Outcome::Stop;
        }

        if let Some(malformed) = rc.object.spec.repositories.iter().find(|r| {
            let namespace_ok = r
                .namespace
                .as_deref()
                .filter(|ns| !ns.is_empty())
                .map_or(true, is_dns1123_label);
            !is_dns1123_subdomain(&r.name) || !namespace_ok
        }) {
            let message = format!(
                "Repository reference {}/{} is not a valid object name",
                malformed.namespace.as_deref().unwrap_or_default(),
                malformed.name
            );
            rc.conditions().set(InvalidReason::RepositoryReferenceInvalid, message);
            return Outcome::Stop;
        }

        let filter = match rc.object.spec.branch_filter.as_deref().filter(|f| !f.is_empty()) {
            None => None,
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    rc.conditions()
                        .set(InvalidReason::InvalidBranchFilter, format!("Invalid branch filter: {e}"));
                    return Outcome::Stop;
                }
            },
        };

        rc.conditions().clear_if_due_to_any_of(SPEC_REASONS);
        rc.state.branch_filter = filter;
        Outcome::Continue
    }
}

// ============================================================================
// Environments anlegen
// ============================================================================

/// Branches, die noch kein Environment haben.
///
/// Environments, die gerade gelöscht werden, zählen nicht.
pub fn missing_branches(branches: &BTreeSet<String>, environments: &[Environment]) -> Vec<String> {
    let covered: BTreeSet<&str> = environments
        .iter()
        .filter(|e| !e.is_being_deleted())
        .map(|e| e.preferred_branch())
        .collect();
    branches
        .iter()
        .filter(|b| !covered.contains(b.as_str()))
        .cloned()
        .collect()
}

struct SyncEnvironments {
    retry: Duration,
}

#[async_trait]
impl<S: Store> Action<ApplicationController<S>> for SyncEnvironments {
    fn name(&self) -> &'static str {
        "sync-environments"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, ApplicationController<S>>) -> Outcome {
        let namespace = rc.namespace();
        let references: Vec<_> = rc.object.spec.repositories.iter().map(|r| r.reference()).collect();

        // ein Environment pro Branch, egal wie viele Repositories ihn haben
        let mut branches = BTreeSet::new();
        for reference in references {
            let key = reference.key(&namespace);
            let repository = match rc.store.get::<Repository>(&key).await {
                Ok(Some(repository)) => repository,
                Ok(None) => {
                    rc.conditions()
                        .set(StaleReason::RepositoryNotFound, format!("Repository {key} not found"));
                    return Outcome::RequeueAfter(self.retry);
                }
                Err(e @ StoreError::Forbidden(_)) => {
                    rc.conditions().set(
                        StaleReason::RepositoryNotAccessible,
                        format!("Repository {key} is not accessible: {e}"),
                    );
                    return Outcome::RequeueAfter(self.retry);
                }
                Err(e) => {
                    warn!(error = %e, repository = %key, "failed getting repository");
                    rc.conditions()
                        .set_maybe(StaleReason::InternalError, format!("Failed getting repository {key}: {e}"));
                    return Outcome::RequeueAfter(self.retry);
                }
            };

            let uid = repository.uid().unwrap_or_default();
            let refs = match rc.store.list_owned::<Ref>(&key.namespace, &uid).await {
                Ok(refs) => refs,
                Err(e) => {
                    rc.conditions()
                        .set_maybe(StaleReason::InternalError, format!("Failed listing refs of {key}: {e}"));
                    return Outcome::RequeueAfter(self.retry);
                }
            };
            branches.extend(
                refs.iter()
                    .filter(|r| !r.is_being_deleted())
                    .map(|r| r.branch())
                    .filter(|b| rc.state.branch_filter.as_ref().map_or(true, |f| f.is_match(b)))
                    .map(str::to_string),
            );
        }

        let missing = missing_branches(&branches, &rc.state.environments);
        if !missing.is_empty() {
            let Some(owner) = rc.object.owner_reference() else {
                return Outcome::Stop;
            };
            for branch in missing {
                let mut env = Environment::new(
                    &generate_name(),
                    EnvironmentSpec {
                        preferred_branch: branch.clone(),
                    },
                );
                env.metadata.namespace = Some(namespace.clone());
                env.metadata.owner_references = Some(vec![owner.clone()]);
                match rc.store.create(&env).await {
                    Ok(created) => info!(environment = %created.name_any(), %branch, "created environment"),
                    Err(StoreError::AlreadyExists(_)) => return Outcome::Requeue,
                    Err(e) => return store_failure("sync-environments", e),
                }
            }
        }

        rc.conditions().clear::<StaleReason>();
        Outcome::Continue
    }
}
