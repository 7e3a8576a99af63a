//! Verdrahtung der Engines mit `kube::runtime`.
//!
//! Jede Art bekommt einen eigenen Runtime-Controller; dieser serialisiert
//! Reconciles pro Objekt und übersetzt Watch-Events anderer Arten in
//! Work-Items:
//!
//! | Art | owns | watches |
//! |-----|------|---------|
//! | Repository | Ref | |
//! | Ref | | Repository → eigene Refs |
//! | Application | Environment | Repository, Ref → Applications, die sie listen |
//! | Environment | Deployment | Application → eigene Environments; Ref → Environments der Applications, die das Repository listen |
//! | Deployment | | Ref → Deployments desselben Repository/Branch |

use std::sync::Arc;
use std::time::Duration;

use devbot_api::{Application, Deployment, Environment, ManagedObject, ObjectKey, Ref, Repository};
use devbot_reconcile::{Controller, Engine, KubeStore, ReconcileError, Requeue};
use futures_util::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action as RuntimeAction, Controller as Runtime};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::{application, deployment, environment, git_ref, repository, Context};

/// Back-off nach einem fehlgeschlagenen Reconcile.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Verzögerung für "sofort erneut".
pub const IMMEDIATE_REQUEUE: Duration = Duration::from_secs(1);
/// Obergrenze für geplante Requeues.
pub const MAX_REQUEUE: Duration = Duration::from_secs(24 * 60 * 60);

/// Übersetzt das Engine-Ergebnis in die Planung der Runtime.
pub fn runtime_action(requeue: Requeue) -> RuntimeAction {
    match requeue {
        Requeue::Never => RuntimeAction::await_change(),
        Requeue::Immediately => RuntimeAction::requeue(IMMEDIATE_REQUEUE),
        Requeue::After(delay) => RuntimeAction::requeue(delay.min(MAX_REQUEUE)),
    }
}

async fn reconcile<C: Controller>(object: Arc<C::Object>, engine: Arc<Engine<C>>) -> Result<RuntimeAction, ReconcileError> {
    let requeue = engine.reconcile(&object.key()).await?;
    Ok(runtime_action(requeue))
}

fn error_policy<C: Controller>(object: Arc<C::Object>, error: &ReconcileError, _: Arc<Engine<C>>) -> RuntimeAction {
    warn!(controller = C::NAME, object = %object.key(), %error, "reconcile failed");
    RuntimeAction::requeue(ERROR_BACKOFF)
}

async fn drive<C: Controller>(runtime: Runtime<C::Object>, engine: Arc<Engine<C>>) {
    runtime
        .shutdown_on_signal()
        .run(reconcile::<C>, error_policy::<C>, engine)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(controller = C::NAME, %object, "reconciled"),
                Err(e) => debug!(controller = C::NAME, error = %e, "reconcile loop error"),
            }
        })
        .await;
}

fn refs_of<K: ManagedObject>(objects: impl IntoIterator<Item = Arc<K>>) -> Vec<ObjectRef<K>> {
    objects.into_iter().map(|o| ObjectRef::from_obj(&*o)).collect()
}

/// Key des Repositories, das `r` kontrolliert.
fn parent_repository(r: &Ref) -> Option<ObjectKey> {
    let owner = r.controller_reference()?;
    (owner.kind == "Repository").then(|| ObjectKey::new(r.namespace().unwrap_or_default(), &owner.name))
}

fn lists_repository(app: &Application, repository: &ObjectKey) -> bool {
    let namespace = app.namespace().unwrap_or_default();
    app.spec
        .repositories
        .iter()
        .any(|entry| entry.reference().refers_to(&namespace, repository))
}

/// Environments der Applications, die das Repository von `r` listen.
fn environments_for_ref(r: &Ref, apps: &[Arc<Application>], envs: Vec<Arc<Environment>>) -> Vec<ObjectRef<Environment>> {
    let Some(key) = parent_repository(r) else {
        return Vec::new();
    };
    let owners: Vec<String> = apps
        .iter()
        .filter(|a| lists_repository(a, &key))
        .filter_map(|a| a.uid())
        .collect();
    refs_of(envs.into_iter().filter(|e| owners.iter().any(|uid| e.is_controlled_by(uid))))
}

/// Führt alle Controller aus, bis ein Terminierungssignal eintrifft.
pub async fn run(client: Client, ctx: Context) {
    let store = Arc::new(KubeStore::new(client.clone()));
    let wc = watcher::Config::default();

    // Repository → Ref
    let repositories = Runtime::new(Api::<Repository>::all(client.clone()), wc.clone())
        .owns(Api::<Ref>::all(client.clone()), wc.clone());

    // Ref ← Repository
    let refs = Runtime::new(Api::<Ref>::all(client.clone()), wc.clone());
    let ref_cache = refs.store();
    let refs = refs.watches(Api::<Repository>::all(client.clone()), wc.clone(), move |repo: Repository| {
        let uid = repo.uid().unwrap_or_default();
        refs_of(ref_cache.state().into_iter().filter(|r| r.is_controlled_by(&uid)))
    });

    // Application ← Repository, Ref
    let applications = Runtime::new(Api::<Application>::all(client.clone()), wc.clone())
        .owns(Api::<Environment>::all(client.clone()), wc.clone());
    let app_cache = applications.store();
    let by_repository = app_cache.clone();
    let apps_of_ref = app_cache.clone();
    let applications = applications
        .watches(Api::<Repository>::all(client.clone()), wc.clone(), move |repo: Repository| {
            let key = repo.key();
            refs_of(by_repository.state().into_iter().filter(|a| lists_repository(a, &key)))
        })
        .watches(Api::<Ref>::all(client.clone()), wc.clone(), move |r: Ref| {
            let Some(key) = parent_repository(&r) else {
                return Vec::new();
            };
            refs_of(app_cache.state().into_iter().filter(|a| lists_repository(a, &key)))
        });

    // Environment ← Application, Ref
    let environments = Runtime::new(Api::<Environment>::all(client.clone()), wc.clone())
        .owns(Api::<Deployment>::all(client.clone()), wc.clone());
    let env_cache = environments.store();
    let envs_of_ref = env_cache.clone();
    let environments = environments
        .watches(Api::<Application>::all(client.clone()), wc.clone(), move |app: Application| {
            let uid = app.uid().unwrap_or_default();
            refs_of(env_cache.state().into_iter().filter(|e| e.is_controlled_by(&uid)))
        })
        .watches(Api::<Ref>::all(client.clone()), wc.clone(), move |r: Ref| {
            environments_for_ref(&r, &apps_of_ref.state(), envs_of_ref.state())
        });

    // Deployment ← Ref
    let deployments = Runtime::new(Api::<Deployment>::all(client.clone()), wc.clone());
    let dep_cache = deployments.store();
    let deployments = deployments.watches(Api::<Ref>::all(client.clone()), wc, move |r: Ref| {
        let Some(key) = parent_repository(&r) else {
            return Vec::new();
        };
        refs_of(dep_cache.state().into_iter().filter(|d| {
            let namespace = d.namespace().unwrap_or_default();
            d.spec.repository.refers_to(&namespace, &key) && d.spec.branch == r.branch()
        }))
    });

    info!("starting controllers");
    tokio::join!(
        drive(repositories, Arc::new(repository::engine(store.clone(), &ctx))),
        drive(refs, Arc::new(git_ref::engine(store.clone(), &ctx))),
        drive(applications, Arc::new(application::engine(store.clone(), &ctx))),
        drive(environments, Arc::new(environment::engine(store.clone(), &ctx))),
        drive(deployments, Arc::new(deployment::engine(store, &ctx))),
    );
    info!("controllers stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbot_api::{ApplicationSpec, EnvironmentSpec, RefSpec, RepositorySpec};

    #[test]
    fn test_requeue_mapping() {
        assert_eq!(runtime_action(Requeue::Never), RuntimeAction::await_change());
        assert_eq!(runtime_action(Requeue::Immediately), RuntimeAction::requeue(IMMEDIATE_REQUEUE));
        assert_eq!(
            runtime_action(Requeue::After(Duration::from_secs(300))),
            RuntimeAction::requeue(Duration::from_secs(300))
        );
        assert_eq!(
            runtime_action(Requeue::After(Duration::from_secs(u64::MAX))),
            RuntimeAction::requeue(MAX_REQUEUE)
        );
    }

    #[test]
    fn test_watch_mappers_match_by_repository() {
        let mut repo = Repository::new("web", RepositorySpec::default());
        repo.metadata.namespace = Some("team".into());
        repo.metadata.uid = Some("uid-1".into());

        let mut r = Ref::new("abc1234", RefSpec { r#ref: "main".into() });
        r.metadata.namespace = Some("team".into());
        r.metadata.owner_references = Some(vec![repo.owner_reference().unwrap()]);
        assert_eq!(parent_repository(&r), Some(ObjectKey::new("team", "web")));

        let mut app = Application::new(
            "shop",
            serde_json::from_value::<ApplicationSpec>(serde_json::json!({
                "repositories": [{"name": "web"}]
            }))
            .unwrap(),
        );
        app.metadata.namespace = Some("team".into());
        assert!(lists_repository(&app, &ObjectKey::new("team", "web")));
        assert!(!lists_repository(&app, &ObjectKey::new("other", "web")));
    }

    #[test]
    fn test_ref_events_reach_environments_of_listing_applications() {
        let mut repo = Repository::new("web", RepositorySpec::default());
        repo.metadata.namespace = Some("team".into());
        repo.metadata.uid = Some("uid-repo".into());

        let mut r = Ref::new("abc1234", RefSpec { r#ref: "main".into() });
        r.metadata.namespace = Some("team".into());
        r.metadata.owner_references = Some(vec![repo.owner_reference().unwrap()]);

        let app = |name: &str, uid: &str, repository: &str| {
            let mut app = Application::new(
                name,
                serde_json::from_value::<ApplicationSpec>(serde_json::json!({
                    "repositories": [{"name": repository}]
                }))
                .unwrap(),
            );
            app.metadata.namespace = Some("team".into());
            app.metadata.uid = Some(uid.into());
            Arc::new(app)
        };
        let shop = app("shop", "uid-shop", "web");
        let docs = app("docs", "uid-docs", "handbook");

        let env = |name: &str, owner: &Application| {
            let mut env = Environment::new(name, EnvironmentSpec { preferred_branch: "main".into() });
            env.metadata.namespace = Some("team".into());
            env.metadata.owner_references = Some(vec![owner.owner_reference().unwrap()]);
            Arc::new(env)
        };
        let envs = vec![env("shop-main", &shop), env("docs-main", &docs)];

        let mapped = environments_for_ref(&r, &[shop.clone(), docs.clone()], envs.clone());
        assert_eq!(mapped, vec![ObjectRef::from_obj(&*envs[0])]);

        let orphan = Ref::new("def5678", RefSpec { r#ref: "main".into() });
        assert!(environments_for_ref(&orphan, &[shop, docs], envs).is_empty());
    }
}
