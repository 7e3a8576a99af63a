//! Standard-Actions, die von mehreren Controllern geteilt werden.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use devbot_api::conditions::{FailedToInitializeReason, FinalizingReason, InvalidReason};
use devbot_api::duration::parse_duration_at_least;
use devbot_api::repository::MIN_REFRESH_INTERVAL;
use devbot_api::{ManagedObject, ObjectKey};
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use crate::engine::{Action, Controller, Outcome, Reconciliation};
use crate::store::{Store, StoreError};
use crate::ReconcileError;

/// Wartezeit, bevor ein Finalizer-Hook mit Fortschritt erneut geprüft wird.
const FINALIZE_POLL_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Finalize-if-deleted
// ============================================================================

/// Fortschritt, den ein [`FinalizeHook`] meldet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalization {
    Complete,
    /// Aufräumen läuft; später erneut prüfen.
    Pending(String),
}

/// Controller-spezifisches Aufräumen, bevor der Finalizer entfernt wird.
#[async_trait]
pub trait FinalizeHook<C: Controller>: Send + Sync {
    async fn finalize(&self, rc: &mut Reconciliation<'_, C>) -> Result<Finalization, String>;
}

pub struct FinalizeIfDeleted<C: Controller> {
    hook: Option<Box<dyn FinalizeHook<C>>>,
}

impl<C: Controller> FinalizeIfDeleted<C> {
    pub fn new() -> Self {
        Self { hook: None }
    }

    pub fn with_hook(hook: impl FinalizeHook<C> + 'static) -> Self {
        Self {
            hook: Some(Box::new(hook)),
        }
    }
}

impl<C: Controller> Default for FinalizeIfDeleted<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Controller> Action<C> for FinalizeIfDeleted<C> {
    fn name(&self) -> &'static str {
        "finalize-if-deleted"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, C>) -> Outcome {
        if !rc.object.is_being_deleted() {
            return Outcome::Continue;
        }
        if !rc.object.has_finalizer() {
            // ein fremder Finalizer hält das Objekt
            return Outcome::Stop;
        }

        rc.conditions().set(FinalizingReason::InProgress, "Finalizing");

        if let Some(hook) = &self.hook {
            match hook.finalize(rc).await {
                Ok(Finalization::Complete) => {}
                Ok(Finalization::Pending(message)) => {
                    rc.conditions().set(FinalizingReason::InProgress, message);
                    return Outcome::RequeueAfter(FINALIZE_POLL_INTERVAL);
                }
                Err(message) => {
                    warn!(error = %message, "finalization failed");
                    rc.conditions().set(FinalizingReason::FinalizationFailed, message);
                    return Outcome::Requeue;
                }
            }
        }

        let mut released = rc.object.clone();
        released
            .finalizers_mut()
            .retain(|f| f != <C::Object as ManagedObject>::FINALIZER);
        match rc.store.update(&released).await {
            Ok(updated) => {
                info!("finalizer removed");
                rc.adopt(updated);
                rc.conditions().clear::<FinalizingReason>();
                Outcome::Stop
            }
            Err(e) if e.is_not_found() => Outcome::Stop,
            Err(e) if e.is_stale_write() => Outcome::Requeue,
            Err(e) => {
                rc.conditions()
                    .set(FinalizingReason::FinalizerRemovalFailed, e.to_string());
                Outcome::Error(e.into())
            }
        }
    }
}

// ============================================================================
// Add-finalizer
// ============================================================================

pub struct AddFinalizer<C>(PhantomData<fn() -> C>);

impl<C: Controller> AddFinalizer<C> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<C: Controller> Default for AddFinalizer<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<C: Controller> Action<C> for AddFinalizer<C> {
    fn name(&self) -> &'static str {
        "add-finalizer"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, C>) -> Outcome {
        if rc.object.has_finalizer() {
            rc.conditions().clear::<FailedToInitializeReason>();
            return Outcome::Continue;
        }

        let mut with_finalizer = rc.object.clone();
        with_finalizer
            .finalizers_mut()
            .push(<C::Object as ManagedObject>::FINALIZER.to_string());
        match rc.store.update(&with_finalizer).await {
            Ok(updated) => {
                debug!("finalizer added");
                rc.adopt(updated);
                rc.conditions().clear::<FailedToInitializeReason>();
                Outcome::Continue
            }
            Err(e) if e.is_not_found() => Outcome::Stop,
            Err(e) if e.is_stale_write() => Outcome::Requeue,
            Err(e @ StoreError::Forbidden(_)) => {
                rc.conditions()
                    .set(FailedToInitializeReason::AddFinalizerFailed, e.to_string());
                Outcome::Error(e.into())
            }
            Err(e) => {
                rc.conditions()
                    .set_maybe(FailedToInitializeReason::InternalError, e.to_string());
                Outcome::Error(e.into())
            }
        }
    }
}

// ============================================================================
// Get-controller
// ============================================================================

/// Ergebnis der Auflösung des Controller-Owners.
#[derive(Debug)]
pub enum ControllerLookup<O> {
    Found(O),
    ReferenceMissing,
    NotFound,
}

/// Löst den Controller-Owner von `object` als Art `O` auf.
///
/// Eine Owner-Referenz anderer Art gilt als fehlend; ein Owner mit anderer
/// uid (gelöscht und neu angelegt) gilt als nicht gefunden.
pub async fn fetch_controller<S, K, O>(store: &S, object: &K) -> Result<ControllerLookup<O>, StoreError>
where
    S: Store,
    K: ManagedObject,
    O: ManagedObject,
{
    let Some(reference) = object
        .controller_reference()
        .filter(|r| r.kind == O::kind(&()) && r.api_version == O::api_version(&()))
    else {
        return Ok(ControllerLookup::ReferenceMissing);
    };
    let key = ObjectKey::new(object.namespace().unwrap_or_default(), &reference.name);
    match store.get::<O>(&key).await? {
        Some(owner) if owner.meta().uid.as_deref() == Some(reference.uid.as_str()) => {
            Ok(ControllerLookup::Found(owner))
        }
        _ => Ok(ControllerLookup::NotFound),
    }
}

/// Lädt den Controller-Owner der Art `O` in den Reconcile-State.
pub struct GetController<C: Controller, O> {
    required: bool,
    assign: fn(&mut C::State, O),
}

impl<C: Controller, O: ManagedObject> GetController<C, O> {
    pub fn required(assign: fn(&mut C::State, O)) -> Self {
        Self { required: true, assign }
    }

    pub fn optional(assign: fn(&mut C::State, O)) -> Self {
        Self { required: false, assign }
    }
}

const CONTROLLER_REASONS: &[InvalidReason] = &[
    InvalidReason::ControllerReferenceMissing,
    InvalidReason::ControllerNotFound,
    InvalidReason::ControllerNotAccessible,
];

#[async_trait]
impl<C: Controller, O: ManagedObject> Action<C> for GetController<C, O> {
    fn name(&self) -> &'static str {
        "get-controller"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, C>) -> Outcome {
        let kind = O::kind(&());
        match fetch_controller::<_, _, O>(rc.store, &rc.object).await {
            Ok(ControllerLookup::Found(owner)) => {
                rc.conditions().clear_if_due_to_any_of(CONTROLLER_REASONS);
                (self.assign)(&mut rc.state, owner);
                Outcome::Continue
            }
            Ok(ControllerLookup::ReferenceMissing) if self.required => {
                rc.conditions().set(
                    InvalidReason::ControllerReferenceMissing,
                    format!("Controller reference to a {kind} is missing"),
                );
                Outcome::Stop
            }
            Ok(ControllerLookup::NotFound) if self.required => {
                rc.conditions()
                    .set(InvalidReason::ControllerNotFound, format!("Controlling {kind} not found"));
                Outcome::Stop
            }
            Ok(_) => {
                rc.conditions().clear_if_due_to_any_of(CONTROLLER_REASONS);
                Outcome::Continue
            }
            Err(e @ StoreError::Forbidden(_)) => {
                rc.conditions().set(
                    InvalidReason::ControllerNotAccessible,
                    format!("Controlling {kind} is not accessible: {e}"),
                );
                Outcome::Requeue
            }
            Err(e) => {
                rc.conditions().set_maybe(
                    InvalidReason::InternalError,
                    format!("Failed getting controlling {kind}: {e}"),
                );
                Outcome::Error(e.into())
            }
        }
    }
}

// ============================================================================
// Get-owned
// ============================================================================

/// Lädt die Objekte der Art `O`, die vom aktuellen Objekt kontrolliert werden.
pub struct GetOwned<C: Controller, O> {
    assign: fn(&mut C::State, Vec<O>),
}

impl<C: Controller, O: ManagedObject> GetOwned<C, O> {
    pub fn new(assign: fn(&mut C::State, Vec<O>)) -> Self {
        Self { assign }
    }
}

#[async_trait]
impl<C: Controller, O: ManagedObject> Action<C> for GetOwned<C, O> {
    fn name(&self) -> &'static str {
        "get-owned"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, C>) -> Outcome {
        let namespace = rc.namespace();
        let uid = rc.object.uid().unwrap_or_default();
        match rc.store.list_owned::<O>(&namespace, &uid).await {
            Ok(owned) => {
                rc.conditions()
                    .clear_if_due_to_any_of(&[InvalidReason::FailedGettingOwnedObjects]);
                (self.assign)(&mut rc.state, owned);
                Outcome::Continue
            }
            Err(e) => {
                rc.conditions().set_maybe(
                    InvalidReason::FailedGettingOwnedObjects,
                    format!("Failed listing owned {} objects: {e}", O::kind(&())),
                );
                Outcome::Error(e.into())
            }
        }
    }
}

// ============================================================================
// Parse-refresh-interval
// ============================================================================

/// Parst ein Refresh-Intervall (mindestens 5s) aus Objekt oder State.
pub struct ParseRefreshInterval<C: Controller> {
    source: fn(&C::Object, &C::State) -> Option<String>,
    assign: fn(&mut C::State, Duration),
}

impl<C: Controller> ParseRefreshInterval<C> {
    pub fn new(
        source: fn(&C::Object, &C::State) -> Option<String>,
        assign: fn(&mut C::State, Duration),
    ) -> Self {
        Self { source, assign }
    }
}

#[async_trait]
impl<C: Controller> Action<C> for ParseRefreshInterval<C> {
    fn name(&self) -> &'static str {
        "parse-refresh-interval"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, C>) -> Outcome {
        let Some(raw) = (self.source)(&rc.object, &rc.state) else {
            return Outcome::Continue;
        };
        match parse_duration_at_least(&raw, MIN_REFRESH_INTERVAL) {
            Ok(interval) => {
                rc.conditions()
                    .clear_if_due_to_any_of(&[InvalidReason::InvalidRefreshInterval]);
                (self.assign)(&mut rc.state, interval);
                Outcome::Continue
            }
            Err(e) => {
                rc.conditions().set(InvalidReason::InvalidRefreshInterval, e.to_string());
                Outcome::Stop
            }
        }
    }
}

// ============================================================================
// Requeue-after
// ============================================================================

/// Terminale Action, plant den nächsten Reconcile.
pub struct RequeueAfter<C: Controller> {
    interval: fn(&C::State) -> Option<Duration>,
    fallback: Duration,
}

impl<C: Controller> RequeueAfter<C> {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval: |_| None,
            fallback: interval,
        }
    }

    /// Nimmt das Intervall aus dem State, sonst `fallback`.
    pub fn from_state(interval: fn(&C::State) -> Option<Duration>, fallback: Duration) -> Self {
        Self { interval, fallback }
    }
}

#[async_trait]
impl<C: Controller> Action<C> for RequeueAfter<C> {
    fn name(&self) -> &'static str {
        "requeue-after"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, C>) -> Outcome {
        Outcome::RequeueAfter((self.interval)(&rc.state).unwrap_or(self.fallback))
    }
}

/// Übersetzt einen fehlgeschlagenen Store-Aufruf in das Outcome für
/// transiente Fehler: veraltete Writes sofort erneut, alles andere mit Back-off.
pub fn store_failure(action: &'static str, e: StoreError) -> Outcome {
    if e.is_stale_write() {
        Outcome::Requeue
    } else {
        Outcome::Error(ReconcileError::action(action, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, Requeue};
    use crate::test_utils::{MemoryStore, Op};
    use devbot_api::conditions::StaleReason;
    use devbot_api::{GitHubRepositorySpec, Ref, RefSpec, Repository, RepositorySpec};
    use std::sync::Arc;

    #[derive(Default)]
    struct RepoState {
        refs: Vec<Ref>,
        interval: Option<Duration>,
    }

    struct RepoController;

    impl Controller for RepoController {
        type Object = Repository;
        type Store = MemoryStore;
        type State = RepoState;
        const NAME: &'static str = "repository";
    }

    #[derive(Default)]
    struct RefState {
        parent: Option<Repository>,
    }

    struct RefController;

    impl Controller for RefController {
        type Object = Ref;
        type Store = MemoryStore;
        type State = RefState;
        const NAME: &'static str = "ref";
    }

    fn repo(interval: &str) -> Repository {
        Repository::new(
            "web",
            RepositorySpec {
                github: Some(GitHubRepositorySpec {
                    owner: "acme".into(),
                    name: "web".into(),
                    auth: None,
                }),
                refresh_interval: interval.into(),
            },
        )
    }

    fn repo_engine(store: &Arc<MemoryStore>, hook: Option<Box<dyn FinalizeHook<RepoController>>>) -> Engine<RepoController> {
        let finalize = match hook {
            Some(hook) => FinalizeIfDeleted { hook: Some(hook) },
            None => FinalizeIfDeleted::new(),
        };
        Engine::new(
            store.clone(),
            vec![
                Box::new(finalize),
                Box::new(AddFinalizer::<RepoController>::new()),
                Box::new(GetOwned::<RepoController, Ref>::new(|s, refs| s.refs = refs)),
                Box::new(ParseRefreshInterval::<RepoController>::new(
                    |o: &Repository, _| Some(o.spec.refresh_interval.clone()),
                    |s, d| s.interval = Some(d),
                )),
                Box::new(RequeueAfter::<RepoController>::from_state(|s: &RepoState| s.interval, Duration::from_secs(60))),
            ],
        )
    }

    fn ref_engine(store: &Arc<MemoryStore>) -> Engine<RefController> {
        Engine::new(
            store.clone(),
            vec![
                Box::new(FinalizeIfDeleted::<RefController>::new()),
                Box::new(AddFinalizer::<RefController>::new()),
                Box::new(GetController::<RefController, Repository>::required(|s, o| s.parent = Some(o))),
                Box::new(RequeueAfter::<RefController>::fixed(Duration::from_secs(30))),
            ],
        )
    }

    struct PendingUntilNoRefs;

    #[async_trait]
    impl FinalizeHook<RepoController> for PendingUntilNoRefs {
        async fn finalize(&self, rc: &mut Reconciliation<'_, RepoController>) -> Result<Finalization, String> {
            let uid = rc.object.uid().unwrap_or_default();
            let refs: Vec<Ref> = rc.store.list_owned(&rc.namespace(), &uid).await.map_err(|e| e.to_string())?;
            if refs.is_empty() {
                return Ok(Finalization::Complete);
            }
            for r in &refs {
                rc.store.delete::<Ref>(&r.key()).await.map_err(|e| e.to_string())?;
            }
            Ok(Finalization::Pending(format!("Waiting for {} refs to be deleted", refs.len())))
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl FinalizeHook<RepoController> for AlwaysFails {
        async fn finalize(&self, _rc: &mut Reconciliation<'_, RepoController>) -> Result<Finalization, String> {
            Err("disk on fire".into())
        }
    }

    // ========================================================================
    // Tests: Finalizer
    // ========================================================================

    #[tokio::test]
    async fn test_adds_finalizer_and_requeues_after_interval() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(repo("2m"), "team").key();

        let result = repo_engine(&store, None).reconcile(&key).await.unwrap();

        assert_eq!(result, Requeue::After(Duration::from_secs(120)));
        let stored: Repository = store.get_now(&key).unwrap();
        assert!(stored.has_finalizer());
        assert_eq!(stored.status.unwrap().observed_generation, Some(1));
    }

    #[tokio::test]
    async fn test_add_finalizer_conflict_requeues() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(repo("5m"), "team").key();
        store.fail_next_for::<Repository>(Op::Update, StoreError::Conflict("rv".into()));

        let result = repo_engine(&store, None).reconcile(&key).await.unwrap();

        assert_eq!(result, Requeue::Immediately);
        assert!(!store.get_now::<Repository>(&key).unwrap().has_finalizer());
    }

    #[tokio::test]
    async fn test_add_finalizer_internal_error() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(repo("5m"), "team").key();
        store.fail_next_for::<Repository>(Op::Update, StoreError::Other("boom".into()));

        assert!(repo_engine(&store, None).reconcile(&key).await.is_err());
        let status = store.get_now::<Repository>(&key).unwrap().status.unwrap();
        assert!(status.conditions.has_reason(FailedToInitializeReason::InternalError));
    }

    #[tokio::test]
    async fn test_finalizer_waits_for_hook_then_releases() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(repo("5m"), "team").key();
        let engine = repo_engine(&store, Some(Box::new(PendingUntilNoRefs)));
        engine.reconcile(&key).await.unwrap();

        let parent: Repository = store.get_now(&key).unwrap();
        let mut child = Ref::new("abc1234", RefSpec { r#ref: "main".into() });
        child.metadata.owner_references = Some(vec![parent.owner_reference().unwrap()]);
        store.insert(child, "team");

        store.delete::<Repository>(&key).await.unwrap();
        let result = engine.reconcile(&key).await.unwrap();
        assert_eq!(result, Requeue::After(FINALIZE_POLL_INTERVAL));
        let pending: Repository = store.get_now(&key).unwrap();
        assert!(pending.status.unwrap().conditions.has_reason(FinalizingReason::InProgress));

        let result = engine.reconcile(&key).await.unwrap();
        assert_eq!(result, Requeue::Never);
        assert!(store.get_now::<Repository>(&key).is_none());
    }

    #[tokio::test]
    async fn test_finalization_failure_keeps_finalizer() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(repo("5m"), "team").key();
        let engine = repo_engine(&store, Some(Box::new(AlwaysFails)));
        engine.reconcile(&key).await.unwrap();
        store.delete::<Repository>(&key).await.unwrap();

        assert_eq!(engine.reconcile(&key).await.unwrap(), Requeue::Immediately);

        let stored: Repository = store.get_now(&key).unwrap();
        assert!(stored.has_finalizer());
        let status = stored.status.unwrap();
        assert!(status.conditions.has_reason(FinalizingReason::FinalizationFailed));
        assert_eq!(status.conditions.get::<FinalizingReason>().unwrap().message, "disk on fire");
    }

    // ========================================================================
    // Tests: Refresh-Interval & Owned
    // ========================================================================

    #[tokio::test]
    async fn test_invalid_refresh_interval_stops() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(repo("1s"), "team").key();

        let result = repo_engine(&store, None).reconcile(&key).await.unwrap();

        assert_eq!(result, Requeue::Never);
        let status = store.get_now::<Repository>(&key).unwrap().status.unwrap();
        assert!(status.conditions.has_reason(InvalidReason::InvalidRefreshInterval));
        assert!(!status.valid);

        store.edit::<Repository>(&key, |r| r.spec.refresh_interval = "10s".into());
        let result = repo_engine(&store, None).reconcile(&key).await.unwrap();
        assert_eq!(result, Requeue::After(Duration::from_secs(10)));
        let status = store.get_now::<Repository>(&key).unwrap().status.unwrap();
        assert!(!status.conditions.is_set::<InvalidReason>());
        assert_eq!(status.observed_generation, Some(2));
    }

    #[tokio::test]
    async fn test_overflowing_refresh_interval_is_invalid() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(repo("99999999999999999999h"), "team").key();

        let result = repo_engine(&store, None).reconcile(&key).await.unwrap();

        assert_eq!(result, Requeue::Never);
        let status = store.get_now::<Repository>(&key).unwrap().status.unwrap();
        assert!(status.conditions.has_reason(InvalidReason::InvalidRefreshInterval));
    }

    #[tokio::test]
    async fn test_get_owned_failure() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(repo("5m"), "team").key();
        store.fail_next_for::<Ref>(Op::List, StoreError::Other("index unavailable".into()));

        assert!(repo_engine(&store, None).reconcile(&key).await.is_err());
        let status = store.get_now::<Repository>(&key).unwrap().status.unwrap();
        assert!(status.conditions.has_reason(InvalidReason::FailedGettingOwnedObjects));
        assert!(!status.conditions.is_set::<StaleReason>());
    }

    // ========================================================================
    // Tests: Get-controller
    // ========================================================================

    #[tokio::test]
    async fn test_missing_controller_reference() {
        let store = Arc::new(MemoryStore::new());
        let key = store.insert(Ref::new("orphan", RefSpec { r#ref: "main".into() }), "team").key();

        assert_eq!(ref_engine(&store).reconcile(&key).await.unwrap(), Requeue::Never);
        let status = store.get_now::<Ref>(&key).unwrap().status.unwrap();
        assert!(status.conditions.has_reason(InvalidReason::ControllerReferenceMissing));
    }

    #[tokio::test]
    async fn test_controller_not_found_and_not_accessible() {
        let store = Arc::new(MemoryStore::new());
        let parent = store.insert(repo("5m"), "team");
        let mut child = Ref::new("abc1234", RefSpec { r#ref: "main".into() });
        child.metadata.owner_references = Some(vec![parent.owner_reference().unwrap()]);
        let key = store.insert(child, "team").key();

        store.fail_next_for::<Repository>(Op::Get, StoreError::Forbidden("rbac".into()));
        assert_eq!(ref_engine(&store).reconcile(&key).await.unwrap(), Requeue::Immediately);
        let status = store.get_now::<Ref>(&key).unwrap().status.unwrap();
        assert!(status.conditions.has_reason(InvalidReason::ControllerNotAccessible));

        assert_eq!(
            ref_engine(&store).reconcile(&key).await.unwrap(),
            Requeue::After(Duration::from_secs(30))
        );
        let status = store.get_now::<Ref>(&key).unwrap().status.unwrap();
        assert!(!status.conditions.is_set::<InvalidReason>());

        // neu angelegter Parent hat eine andere uid
        store.delete::<Repository>(&parent.key()).await.unwrap();
        let mut orphan = Ref::new("def5678", RefSpec { r#ref: "dev".into() });
        orphan.metadata.owner_references = Some(vec![parent.owner_reference().unwrap()]);
        let orphan_key = store.insert(orphan, "team").key();
        store.insert(repo("5m"), "team");

        assert_eq!(ref_engine(&store).reconcile(&orphan_key).await.unwrap(), Requeue::Never);
        let status = store.get_now::<Ref>(&orphan_key).unwrap().status.unwrap();
        assert!(status.conditions.has_reason(InvalidReason::ControllerNotFound));
    }
}
