//! Generische Reconcile-Engine für devbot Controller.
//!
//! Ein Controller deklariert eine geordnete Liste von [`Action`]s; die
//! [`Engine`] lädt das Objekt, führt die Actions aus bis eine davon ein
//! terminales [`Outcome`] liefert, und schreibt danach den Status zurück.

use thiserror::Error;

pub mod actions;
pub mod engine;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use engine::{Action, Controller, Engine, Outcome, Reconciliation, Requeue};
pub use store::{KubeStore, Store, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Action {action} failed: {message}")]
    Action { action: &'static str, message: String },

    #[error("Status update failed: {0}")]
    StatusUpdate(#[source] StoreError),
}

impl ReconcileError {
    pub fn action(action: &'static str, message: impl Into<String>) -> Self {
        Self::Action {
            action,
            message: message.into(),
        }
    }
}
