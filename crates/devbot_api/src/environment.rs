use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;
use crate::object::managed_object;
use crate::repository::RepositoryReference;

pub const ENVIRONMENT_KIND: &str = "Environment";
pub const ENVIRONMENT_FINALIZER: &str = "environments.finalizers.devbot.kfirs.com";

/// An instantiation of an application for one preferred branch.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devbot.kfirs.com",
    version = "v1",
    kind = "Environment",
    plural = "environments",
    shortname = "env",
    namespaced,
    status = "EnvironmentStatus",
    printcolumn = r#"{"name":"Branch","type":"string","jsonPath":".spec.preferredBranch"}"#,
    printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.valid"}"#,
    printcolumn = r#"{"name":"Current","type":"boolean","jsonPath":".status.current"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    pub preferred_branch: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentReference {
    pub name: String,
}

/// A repository participating in the environment, and the deployment
/// created for it.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSource {
    pub repository: RepositoryReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentReference>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<EnvironmentSource>,

    #[serde(default, skip_serializing_if = "ConditionSet::is_empty")]
    pub conditions: ConditionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub current: bool,
}

managed_object!(Environment, EnvironmentStatus, ENVIRONMENT_FINALIZER);

impl Environment {
    pub fn preferred_branch(&self) -> &str {
        &self.spec.preferred_branch
    }

    pub fn sources(&self) -> &[EnvironmentSource] {
        self.status.as_ref().map(|s| s.sources.as_slice()).unwrap_or(&[])
    }
}
