use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::conditions::{ConditionSet, InvalidReason, StaleReason};

/// Namespace and name of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(object: &K) -> Self {
        Self::new(object.namespace().unwrap_or_default(), object.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Status block shared by every devbot kind.
pub trait ObjectStatus:
    Clone + Default + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync
{
    fn conditions(&self) -> &ConditionSet;
    fn conditions_mut(&mut self) -> &mut ConditionSet;
    fn observed_generation(&self) -> Option<i64>;
    fn set_observed_generation(&mut self, generation: Option<i64>);

    /// Recomputes the presentation-only `valid`/`current` fields.
    fn refresh_printer_fields(&mut self);
}

/// A namespaced devbot object with a status subresource and a finalizer.
pub trait ManagedObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    type Status: ObjectStatus;

    const FINALIZER: &'static str;

    fn status(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn key(&self) -> ObjectKey {
        ObjectKey::of(self)
    }

    fn generation(&self) -> Option<i64> {
        self.meta().generation
    }

    fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == Self::FINALIZER)
    }

    /// Owner reference flagged as controller, if any.
    fn controller_reference(&self) -> Option<&OwnerReference> {
        self.meta()
            .owner_references
            .iter()
            .flatten()
            .find(|r| r.controller == Some(true))
    }

    fn is_controlled_by(&self, owner_uid: &str) -> bool {
        self.controller_reference().is_some_and(|r| r.uid == owner_uid)
    }

    /// Controller owner reference pointing at `self`, for objects it creates.
    fn owner_reference(&self) -> Option<OwnerReference> {
        self.controller_owner_ref(&())
    }
}

pub(crate) fn derive_printer_fields(conditions: &ConditionSet) -> (bool, bool) {
    (
        !conditions.is_set::<InvalidReason>(),
        !conditions.is_set::<StaleReason>(),
    )
}

/// Implements [`ManagedObject`] and [`ObjectStatus`] for a kind whose status
/// carries `conditions`, `observed_generation`, `valid` and `current`.
macro_rules! managed_object {
    ($kind:ty, $status:ty, $finalizer:expr) => {
        impl $crate::object::ObjectStatus for $status {
            fn conditions(&self) -> &$crate::conditions::ConditionSet {
                &self.conditions
            }

            fn conditions_mut(&mut self) -> &mut $crate::conditions::ConditionSet {
                &mut self.conditions
            }

            fn observed_generation(&self) -> Option<i64> {
                self.observed_generation
            }

            fn set_observed_generation(&mut self, generation: Option<i64>) {
                self.observed_generation = generation;
            }

            fn refresh_printer_fields(&mut self) {
                let (valid, current) = $crate::object::derive_printer_fields(&self.conditions);
                self.valid = valid;
                self.current = current;
            }
        }

        impl $crate::object::ManagedObject for $kind {
            type Status = $status;

            const FINALIZER: &'static str = $finalizer;

            fn status(&self) -> Option<&Self::Status> {
                self.status.as_ref()
            }

            fn status_mut(&mut self) -> &mut Self::Status {
                self.status.get_or_insert_with(Default::default)
            }
        }
    };
}

pub(crate) use managed_object;
