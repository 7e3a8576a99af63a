//! Ref-Controller: hält `status.commitSHA` eines Branches aktuell.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbot_api::conditions::{InvalidReason, StaleReason};
use devbot_api::{ManagedObject, Ref, Repository};
use devbot_github::GitHubApi;
use devbot_reconcile::actions::{
    AddFinalizer, FinalizeIfDeleted, GetController, ParseRefreshInterval, RequeueAfter,
};
use devbot_reconcile::{Action, Controller, Engine, Outcome, ReconcileError, Reconciliation, Store};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::auth::Authenticate;
use crate::repository::{refresh_interval_source, DEFAULT_INTERVAL};
use crate::Context;

pub struct RefController<S>(PhantomData<fn() -> S>);

#[derive(Default)]
pub struct RefState {
    pub repository: Option<Repository>,
    pub refresh_interval: Option<Duration>,
    pub token: Option<SecretString>,
}

impl<S: Store> Controller for RefController<S> {
    type Object = Ref;
    type Store = S;
    type State = RefState;

    const NAME: &'static str = "ref";
}

fn parent_repository<'a>(_: &'a Ref, state: &'a RefState) -> Option<&'a Repository> {
    state.repository.as_ref()
}

pub fn actions<S: Store>(ctx: &Context) -> Vec<Box<dyn Action<RefController<S>>>> {
    vec![
        Box::new(FinalizeIfDeleted::<RefController<S>>::new()),
        Box::new(AddFinalizer::<RefController<S>>::new()),
        Box::new(GetController::<RefController<S>, Repository>::required(|s, r| {
            s.repository = Some(r)
        })),
        Box::new(ParseRefreshInterval::<RefController<S>>::new(
            |_, s| s.repository.as_ref().map(refresh_interval_source),
            |s, d| s.refresh_interval = Some(d),
        )),
        Box::new(SyncRepositoryCoordinates),
        Box::new(Authenticate::<RefController<S>>::new(
            ctx.github.clone(),
            parent_repository,
            |s| s.refresh_interval,
            |s, token| s.token = Some(token),
        )),
        Box::new(SyncCommit {
            github: ctx.github.clone(),
        }),
        Box::new(RequeueAfter::<RefController<S>>::from_state(
            |s| s.refresh_interval,
            DEFAULT_INTERVAL,
        )),
    ]
}

pub fn engine<S: Store>(store: Arc<S>, ctx: &Context) -> Engine<RefController<S>> {
    Engine::new(store, actions(ctx))
}

// ============================================================================
// Owner/Name vom Repository übernehmen
// ============================================================================

struct SyncRepositoryCoordinates;

#[async_trait]
impl<S: Store> Action<RefController<S>> for SyncRepositoryCoordinates {
    fn name(&self) -> &'static str {
        "sync-repository-coordinates"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, RefController<S>>) -> Outcome {
        let Some(gh) = rc.state.repository.as_ref().and_then(|r| r.github()).cloned() else {
            rc.conditions()
                .set(InvalidReason::RepositoryNotSupported, "Only GitHub repositories are supported");
            return Outcome::Stop;
        };
        rc.conditions()
            .clear_if_due_to_any_of(&[InvalidReason::RepositoryNotSupported]);

        if rc.status().repository_owner != gh.owner {
            rc.conditions().set(
                StaleReason::RepositoryOwnerOutOfSync,
                format!("Repository owner changed to '{}'", gh.owner),
            );
            rc.status().repository_owner = gh.owner;
            return Outcome::Requeue;
        }
        if rc.status().repository_name != gh.name {
            rc.conditions().set(
                StaleReason::RepositoryNameOutOfSync,
                format!("Repository name changed to '{}'", gh.name),
            );
            rc.status().repository_name = gh.name;
            return Outcome::Requeue;
        }

        rc.conditions().clear_if_due_to_any_of(&[
            StaleReason::RepositoryOwnerOutOfSync,
            StaleReason::RepositoryNameOutOfSync,
        ]);
        Outcome::Continue
    }
}

// ============================================================================
// Commit-SHA
// ============================================================================

struct SyncCommit {
    github: Arc<dyn GitHubApi>,
}

#[async_trait]
impl<S: Store> Action<RefController<S>> for SyncCommit {
    fn name(&self) -> &'static str {
        "sync-commit"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, RefController<S>>) -> Outcome {
        let Some(token) = rc.state.token.clone() else {
            return Outcome::Stop;
        };
        let branch = rc.object.branch().to_string();
        let owner = rc.status().repository_owner.clone();
        let name = rc.status().repository_name.clone();

        let observed = match self.github.get_branch(&token, &owner, &name, &branch).await {
            Ok(b) => b.commit_sha,
            Err(e) if e.is_not_found() => {
                info!(%branch, "branch is gone, deleting ref");
                return match rc.store.delete::<Ref>(&rc.key()).await {
                    Ok(()) => Outcome::Stop,
                    Err(e) => Outcome::Error(e.into()),
                };
            }
            Err(e) => {
                warn!(error = %e, %branch, "failed fetching branch");
                rc.conditions()
                    .set_maybe(StaleReason::InternalError, format!("Failed fetching branch '{branch}': {e}"));
                return Outcome::Error(ReconcileError::action("sync-commit", e.to_string()));
            }
        };

        let current = rc.status().commit_sha.clone();
        if current != observed {
            debug!(from = %current, to = %observed, "commit changed");
            rc.conditions().set(
                StaleReason::CommitShaOutOfSync,
                format!("Commit SHA changed from '{current}' to '{observed}'"),
            );
            rc.status().commit_sha = observed;
            return Outcome::Requeue;
        }

        rc.conditions().clear::<StaleReason>();
        Outcome::Continue
    }
}
