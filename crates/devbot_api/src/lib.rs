//! Custom resource types of the `devbot.kfirs.com/v1` API group and the
//! condition vocabulary their controllers speak.

pub mod conditions;
pub mod duration;
pub mod naming;
pub mod object;

pub mod application;
pub mod deployment;
pub mod environment;
pub mod git_ref;
pub mod repository;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use application::{Application, ApplicationRepository, ApplicationSpec, ApplicationStatus, MissingBranchStrategy};
pub use conditions::{Condition, ConditionReason, ConditionSet, ConditionStatus};
pub use deployment::{Deployment, DeploymentSpec, DeploymentStatus};
pub use environment::{DeploymentReference, Environment, EnvironmentSource, EnvironmentSpec, EnvironmentStatus};
pub use git_ref::{Ref, RefSpec, RefStatus};
pub use object::{ManagedObject, ObjectKey, ObjectStatus};
pub use repository::{
    GitHubAuth, GitHubRepositorySpec, Repository, RepositoryReference, RepositorySpec, RepositoryStatus,
    SecretReference,
};

pub const GROUP: &str = "devbot.kfirs.com";
pub const VERSION: &str = "v1";
pub const API_VERSION: &str = "devbot.kfirs.com/v1";

/// Definitions of every devbot kind, in dependency order.
pub fn crds() -> Vec<CustomResourceDefinition> {
    vec![
        Repository::crd(),
        Ref::crd(),
        Application::crd(),
        Environment::crd(),
        Deployment::crd(),
    ]
}
