use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;
use crate::object::managed_object;
use crate::repository::{default_reference_api_version, default_reference_kind, RepositoryReference};

pub const APPLICATION_KIND: &str = "Application";
pub const APPLICATION_FINALIZER: &str = "applications.finalizers.devbot.kfirs.com";

/// A deployable unit sourced from one or more repositories.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devbot.kfirs.com",
    version = "v1",
    kind = "Application",
    plural = "applications",
    shortname = "app",
    namespaced,
    status = "ApplicationStatus",
    printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.valid"}"#,
    printcolumn = r#"{"name":"Current","type":"boolean","jsonPath":".status.current"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default)]
    pub repositories: Vec<ApplicationRepository>,

    /// Service account impersonated when applying manifests.
    #[serde(default)]
    pub service_account_name: String,

    /// Regular expression; only matching branches get an environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_filter: Option<String>,
}

/// What to do when a repository has no branch matching an environment.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum MissingBranchStrategy {
    /// Deploy the repository's default branch instead.
    #[default]
    UseDefaultBranch,
    /// Leave the repository out of the environment.
    Ignore,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRepository {
    #[serde(default = "default_reference_api_version")]
    pub api_version: String,
    #[serde(default = "default_reference_kind")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub missing_branch_strategy: MissingBranchStrategy,

    /// Subdirectory of the repository holding the `.devbot` tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ApplicationRepository {
    pub fn reference(&self) -> RepositoryReference {
        RepositoryReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default, skip_serializing_if = "ConditionSet::is_empty")]
    pub conditions: ConditionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub current: bool,
}

managed_object!(Application, ApplicationStatus, APPLICATION_FINALIZER);

impl Application {
    /// The repository entry matching `reference` after namespace defaulting.
    pub fn repository_entry(
        &self,
        reference: &RepositoryReference,
        default_namespace: &str,
    ) -> Option<&ApplicationRepository> {
        let wanted = reference.resolved(default_namespace);
        self.spec
            .repositories
            .iter()
            .find(|r| r.reference().resolved(default_namespace) == wanted)
    }
}
