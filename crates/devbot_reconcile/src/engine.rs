//! Reconcile-Loop: Fetch → Actions → Status-Commit → Requeue

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use devbot_api::{ConditionSet, ManagedObject, ObjectKey, ObjectStatus};
use tracing::{debug, instrument, warn};

use crate::store::{Store, StoreError};
use crate::ReconcileError;

/// Verbindet eine Objektart mit ihrem Store und dem State, den sich die
/// Actions während eines Reconciles teilen.
pub trait Controller: Send + Sync + 'static {
    type Object: ManagedObject;
    type Store: Store;
    /// Pro Reconcile neu.
    type State: Default + Send + Sync;

    const NAME: &'static str;
}

/// Ergebnis einer einzelnen Action.
#[derive(Debug)]
pub enum Outcome {
    /// Nächste Action ausführen.
    Continue,
    /// Fertig; auf das nächste Watch-Event warten.
    Stop,
    /// Sofort erneut reconcilen.
    Requeue,
    RequeueAfter(Duration),
    /// Mit Back-off erneut reconcilen.
    Error(ReconcileError),
}

impl Outcome {
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    fn into_requeue(self) -> Result<Requeue, ReconcileError> {
        match self {
            Self::Continue | Self::Stop => Ok(Requeue::Never),
            Self::Requeue => Ok(Requeue::Immediately),
            Self::RequeueAfter(d) => Ok(Requeue::After(d)),
            Self::Error(e) => Err(e),
        }
    }
}

/// Was der Aufrufer nach einem erfolgreichen Reconcile einplant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Never,
    Immediately,
    After(Duration),
}

/// Arbeitsstand eines Reconciles, den jede Action bekommt.
///
/// `object` trägt die Arbeitskopie des Status; die Engine vergleicht sie mit
/// dem Snapshot vor der ersten Action.
pub struct Reconciliation<'a, C: Controller> {
    pub store: &'a C::Store,
    pub object: C::Object,
    pub state: C::State,
}

impl<'a, C: Controller> Reconciliation<'a, C> {
    pub fn key(&self) -> ObjectKey {
        self.object.key()
    }

    pub fn namespace(&self) -> String {
        self.key().namespace
    }

    pub fn status(&mut self) -> &mut <C::Object as ManagedObject>::Status {
        self.object.status_mut()
    }

    pub fn conditions(&mut self) -> &mut ConditionSet {
        self.object.status_mut().conditions_mut()
    }

    /// Übernimmt Metadaten und Spec aus einem Store-Write, die Arbeitskopie
    /// des Status bleibt erhalten.
    pub fn adopt(&mut self, updated: C::Object) {
        let status = self.object.status().cloned();
        self.object = updated;
        if let Some(status) = status {
            *self.object.status_mut() = status;
        }
    }
}

/// Ein Schritt im Reconcile eines Controllers.
#[async_trait]
pub trait Action<C: Controller>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, rc: &mut Reconciliation<'_, C>) -> Outcome;
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine<C: Controller> {
    store: Arc<C::Store>,
    actions: Vec<Box<dyn Action<C>>>,
}

impl<C: Controller> Engine<C> {
    pub fn new(store: Arc<C::Store>, actions: Vec<Box<dyn Action<C>>>) -> Self {
        Self { store, actions }
    }

    pub fn store(&self) -> &Arc<C::Store> {
        &self.store
    }

    pub fn action_names(&self) -> Vec<&'static str> {
        self.actions.iter().map(|a| a.name()).collect()
    }

    #[instrument(skip_all, fields(controller = C::NAME, namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let object = match self.store.get::<C::Object>(key).await {
            Ok(Some(object)) => object,
            Ok(None) => {
                debug!("object not found");
                return Ok(Requeue::Never);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = object.status().cloned().unwrap_or_default();
        let mut rc = Reconciliation::<C> {
            store: self.store.as_ref(),
            object,
            state: C::State::default(),
        };

        let mut outcome = Outcome::Continue;
        for action in &self.actions {
            debug!(action = action.name(), "executing action");
            outcome = action.execute(&mut rc).await;
            if !outcome.is_continue() {
                debug!(action = action.name(), outcome = ?outcome, "action finished reconcile");
                break;
            }
        }

        match self.commit_status(&mut rc.object, &snapshot, outcome.is_error()).await {
            Ok(()) => outcome.into_requeue(),
            Err(e) if e.is_not_found() => Ok(Requeue::Never),
            Err(e) if e.is_stale_write() => {
                debug!(error = %e, "status update raced with another writer");
                Ok(Requeue::Immediately)
            }
            Err(e) => {
                warn!(error = %e, outcome = ?outcome, "status update failed, action outcome shadowed");
                Err(ReconcileError::StatusUpdate(e))
            }
        }
    }

    async fn commit_status(
        &self,
        object: &mut C::Object,
        snapshot: &<C::Object as ManagedObject>::Status,
        failed: bool,
    ) -> Result<(), StoreError> {
        let generation = object.generation();
        let status = object.status_mut();

        stamp_conditions(status.conditions_mut(), snapshot.conditions(), generation, Utc::now());
        if !failed && generation.is_some() && status.observed_generation() != generation {
            status.set_observed_generation(generation);
        }
        status.refresh_printer_fields();

        if equivalent(status, snapshot) {
            return Ok(());
        }

        debug!("committing status");
        self.store.update_status(object).await?;
        Ok(())
    }
}

/// Füllt Verwaltungsfelder, die die Condition-Setter leer lassen.
///
/// `lastTransitionTime` wird von der vorherigen Condition desselben Typs nur
/// übernommen, wenn sich ihr Status nicht geändert hat.
pub fn stamp_conditions(
    conditions: &mut ConditionSet,
    previous: &ConditionSet,
    generation: Option<i64>,
    now: DateTime<Utc>,
) {
    for condition in conditions.iter_mut() {
        if condition.observed_generation.is_none() {
            condition.observed_generation = generation;
        }
        if condition.last_transition_time.is_none() {
            let inherited = previous
                .find(&condition.r#type)
                .filter(|old| old.status == condition.status)
                .and_then(|old| old.last_transition_time);
            condition.last_transition_time = Some(inherited.unwrap_or(now));
        }
    }
}

/// Status-Gleichheit ohne Condition-Verwaltungsfelder.
fn equivalent<S: ObjectStatus>(current: &S, snapshot: &S) -> bool {
    let mut a = current.clone();
    let mut b = snapshot.clone();
    *a.conditions_mut() = current.conditions().normalized();
    *b.conditions_mut() = snapshot.conditions().normalized();
    a == b
}
