//! Condition vocabulary shared by all devbot kinds.
//!
//! Every condition axis has a negative pole that is stored on the object
//! (`Invalid`, `Stale`, ...) and a positive pole that is represented by the
//! absence of the negative condition (`Valid`, `Current`, ...). A controller
//! that never looked at an axis therefore never claims the positive pole.
//!
//! The reason enums are generated by [`condition_reasons!`] from a single
//! table, so the setters below are typed per axis:
//!
//! ```
//! use devbot_api::conditions::{ConditionSet, StaleReason};
//!
//! let mut conditions = ConditionSet::new();
//! conditions.set(StaleReason::CommitShaOutOfSync, "commit SHA changed");
//! assert_eq!(conditions.reason::<StaleReason>(), Some("CommitSHAOutOfSync"));
//!
//! conditions.clear_if_due_to_any_of(&[StaleReason::CommitShaOutOfSync]);
//! assert!(!conditions.is_set::<StaleReason>());
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => f.write_str("True"),
            Self::False => f.write_str("False"),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

/// A named observation on an object's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: ConditionStatus,
    /// Generation of the object when this observation was made.
    /// Filled in by the reconciliation engine when left empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Filled in by the reconciliation engine when left empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    /// Returns true if both conditions describe the same observation,
    /// ignoring bookkeeping fields.
    pub fn same_observation(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }

    fn without_bookkeeping(&self) -> Condition {
        Condition {
            observed_generation: None,
            last_transition_time: None,
            ..self.clone()
        }
    }
}

/// A condition axis, identified by the reason enum of its negative pole.
pub trait ConditionReason: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Condition type stored on the object (the negative pole).
    const TYPE: &'static str;
    /// Name of the positive pole, represented by absence of [`Self::TYPE`].
    const POSITIVE: &'static str;

    fn as_str(&self) -> &'static str;
}

/// Ordered set of conditions keyed by type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ConditionSet(Vec<Condition>);

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Condition> {
        self.0.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find(&self, condition_type: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.r#type == condition_type)
    }

    pub fn get<R: ConditionReason>(&self) -> Option<&Condition> {
        self.find(R::TYPE)
    }

    /// Returns true if the negative pole of the axis is present.
    pub fn is_set<R: ConditionReason>(&self) -> bool {
        self.get::<R>().is_some()
    }

    pub fn reason<R: ConditionReason>(&self) -> Option<&str> {
        self.get::<R>().map(|c| c.reason.as_str())
    }

    pub fn has_reason<R: ConditionReason>(&self, reason: R) -> bool {
        self.reason::<R>() == Some(reason.as_str())
    }

    /// Sets the negative pole of the axis with status `True`.
    pub fn set<R: ConditionReason>(&mut self, reason: R, message: impl Into<String>) {
        self.upsert(new_condition(ConditionStatus::True, reason, message.into()));
    }

    /// Sets the negative pole of the axis with status `Unknown`.
    pub fn set_maybe<R: ConditionReason>(&mut self, reason: R, message: impl Into<String>) {
        self.upsert(new_condition(ConditionStatus::Unknown, reason, message.into()));
    }

    /// Moves the axis to its positive pole, whatever the current reason is.
    pub fn clear<R: ConditionReason>(&mut self) {
        self.remove(R::TYPE);
    }

    /// Moves the axis to its positive pole only if the current reason is one
    /// of `reasons`.
    pub fn clear_if_due_to_any_of<R: ConditionReason>(&mut self, reasons: &[R]) {
        let matches = match self.get::<R>() {
            Some(current) => reasons.iter().any(|r| r.as_str() == current.reason),
            None => false,
        };
        if matches {
            self.remove(R::TYPE);
        }
    }

    /// Inserts or replaces the condition with the same type.
    ///
    /// Replacing a condition with an identical observation keeps the
    /// existing bookkeeping fields untouched.
    pub fn upsert(&mut self, condition: Condition) {
        match self.0.iter_mut().find(|c| c.r#type == condition.r#type) {
            Some(existing) if existing.same_observation(&condition) => {}
            Some(existing) => *existing = condition,
            None => self.0.push(condition),
        }
    }

    pub fn remove(&mut self, condition_type: &str) {
        self.0.retain(|c| c.r#type != condition_type);
    }

    /// Copy of the set without `lastTransitionTime` and `observedGeneration`.
    pub fn normalized(&self) -> ConditionSet {
        ConditionSet(self.0.iter().map(Condition::without_bookkeeping).collect())
    }
}

fn new_condition<R: ConditionReason>(status: ConditionStatus, reason: R, message: String) -> Condition {
    Condition {
        r#type: R::TYPE.to_string(),
        status,
        observed_generation: None,
        last_transition_time: None,
        reason: reason.as_str().to_string(),
        message,
    }
}

/// Generates one reason enum per condition axis.
///
/// Each entry names the enum, the negative and positive pole, and the
/// reasons. A reason may carry an explicit wire name when the Rust variant
/// name differs from the string stored on the object.
#[macro_export]
macro_rules! condition_reasons {
    ($(
        $(#[$meta:meta])*
        $name:ident ($negative:literal / $positive:literal) {
            $( $(#[$vmeta:meta])* $variant:ident $(= $wire:literal)? ),* $(,)?
        }
    )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $( $(#[$vmeta])* $variant, )*
            }

            impl $crate::conditions::ConditionReason for $name {
                const TYPE: &'static str = $negative;
                const POSITIVE: &'static str = $positive;

                fn as_str(&self) -> &'static str {
                    match self {
                        $( Self::$variant => $crate::condition_reasons!(@wire $variant $(, $wire)?), )*
                    }
                }
            }

            impl $name {
                pub const ALL: &'static [$name] = &[ $( $name::$variant, )* ];

                /// Looks up a reason by its wire name.
                pub fn parse(value: &str) -> Option<Self> {
                    use $crate::conditions::ConditionReason;
                    Self::ALL.iter().copied().find(|r| r.as_str() == value)
                }
            }

            impl ::std::fmt::Display for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    use $crate::conditions::ConditionReason;
                    f.write_str(self.as_str())
                }
            }
        )*
    };
    (@wire $variant:ident) => { stringify!($variant) };
    (@wire $variant:ident, $wire:literal) => { $wire };
}

condition_reasons! {
    /// Configuration problems; the object waits for a spec change.
    InvalidReason("Invalid" / "Valid") {
        RepositoryNameMissing,
        RepositoryOwnerMissing,
        RepositoriesMissing,
        AuthConfigMissing,
        AuthSecretNameMissing,
        AuthSecretKeyMissing,
        InvalidRefreshInterval,
        InvalidBranchFilter,
        RepositoryNotSupported,
        RepositoryReferenceInvalid,
        ControllerReferenceMissing,
        ControllerNotFound,
        ControllerNotAccessible,
        FailedGettingOwnedObjects,
        DeploymentNotFound,
        InternalError,
    }

    /// Provider credentials could not be resolved or were rejected.
    UnauthenticatedReason("Unauthenticated" / "Authenticated") {
        AuthSecretNotFound,
        AuthSecretForbidden,
        AuthSecretGetFailed,
        AuthSecretKeyNotFound,
        AuthTokenEmpty,
        TokenValidationFailed,
    }

    /// Observed state lags behind the source of truth.
    StaleReason("Stale" / "Current") {
        RepositoryNotFound,
        RepositoryNotAccessible,
        GitHubApiFailure = "GitHubAPIFailure",
        InternalError,
        BranchesOutOfSync,
        DefaultBranchOutOfSync,
        CommitShaOutOfSync = "CommitSHAOutOfSync",
        RepositoryAdded,
        DeploymentBranchOutOfSync,
        RepositoryNameOutOfSync,
        RepositoryOwnerOutOfSync,
        RepositoryMissingDefaultBranch,
        ResolvedRepositoryOutOfSync,
        BranchOutOfSync,
        CloneMissing,
        Cloning,
        CloneFailed,
        Pulling,
        PullFailed,
        Baking,
        BakingFailed,
        Applying,
        ApplyFailed,
    }

    FailedToInitializeReason("FailedToInitialize" / "Initialized") {
        AddFinalizerFailed,
        InternalError,
    }

    FinalizingReason("Finalizing" / "Finalized") {
        InProgress,
        FinalizationFailed,
        FinalizerRemovalFailed,
    }
}

impl StaleReason {
    /// Reasons used by the deployment pipeline state machine.
    pub const PIPELINE: &'static [StaleReason] = &[
        StaleReason::CloneMissing,
        StaleReason::Cloning,
        StaleReason::CloneFailed,
        StaleReason::Pulling,
        StaleReason::PullFailed,
        StaleReason::Baking,
        StaleReason::BakingFailed,
        StaleReason::Applying,
        StaleReason::ApplyFailed,
    ];
}
