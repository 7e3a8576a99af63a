use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;
use crate::object::managed_object;

pub const REF_KIND: &str = "Ref";
pub const REF_FINALIZER: &str = "refs.finalizers.devbot.kfirs.com";

/// A single branch of a repository, owned by that repository.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devbot.kfirs.com",
    version = "v1",
    kind = "Ref",
    plural = "refs",
    namespaced,
    status = "RefStatus",
    printcolumn = r#"{"name":"Ref","type":"string","jsonPath":".spec.ref"}"#,
    printcolumn = r#"{"name":"Commit","type":"string","jsonPath":".status.commitSHA"}"#,
    printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.valid"}"#,
    printcolumn = r#"{"name":"Current","type":"boolean","jsonPath":".status.current"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RefSpec {
    /// Branch name.
    pub r#ref: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefStatus {
    #[serde(default, rename = "commitSHA")]
    pub commit_sha: String,
    #[serde(default)]
    pub repository_owner: String,
    #[serde(default)]
    pub repository_name: String,

    #[serde(default, skip_serializing_if = "ConditionSet::is_empty")]
    pub conditions: ConditionSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub current: bool,
}

managed_object!(Ref, RefStatus, REF_FINALIZER);

impl Ref {
    pub fn branch(&self) -> &str {
        &self.spec.r#ref
    }

    pub fn commit_sha(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.commit_sha.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        let status = RefStatus {
            commit_sha: "abc".into(),
            repository_owner: "kfirs".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["commitSHA"], "abc");
        assert_eq!(json["repositoryOwner"], "kfirs");
        assert!(json.get("conditions").is_none());

        let spec = serde_json::to_value(RefSpec { r#ref: "main".into() }).unwrap();
        assert_eq!(spec["ref"], "main");
    }
}
