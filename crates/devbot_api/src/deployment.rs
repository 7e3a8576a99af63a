use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;
use crate::object::managed_object;
use crate::repository::RepositoryReference;

pub const DEPLOYMENT_KIND: &str = "Deployment";
pub const DEPLOYMENT_FINALIZER: &str = "deployments.finalizers.devbot.kfirs.com";

/// Binds one repository branch to an environment and drives the
/// clone, bake and apply pipeline.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "devbot.kfirs.com",
    version = "v1",
    kind = "Deployment",
    plural = "deployments",
    shortname = "dep",
    namespaced,
    status = "DeploymentStatus",
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".status.resolvedRepository"}"#,
    printcolumn = r#"{"name":"Branch","type":"string","jsonPath":".status.branch"}"#,
    printcolumn = r#"{"name":"Applied","type":"string","jsonPath":".status.lastAppliedRevision"}"#,
    printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.valid"}"#,
    printcolumn = r#"{"name":"Current","type":"boolean","jsonPath":".status.current"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub repository: RepositoryReference,
    #[serde(default)]
    pub branch: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// `namespace/name` of the repository being deployed.
    #[serde(default)]
    pub resolved_repository: String,
    #[serde(default)]
    pub branch: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
    /// Location of the working copy on the shared volume.
    #[serde(default)]
    pub clone_path: String,

    #[serde(default)]
    pub last_attempted_revision: String,
    #[serde(default)]
    pub last_applied_revision: String,

    #[serde(default, skip_serializing_if = "ConditionSet::is_empty")]
    pub conditions: ConditionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub current: bool,
}

managed_object!(Deployment, DeploymentStatus, DEPLOYMENT_FINALIZER);

impl Deployment {
    pub fn clone_path(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.clone_path.as_str())
            .filter(|p| !p.is_empty())
    }
}
