use std::collections::BTreeMap;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::ConditionSet;
use crate::duration::{parse_duration_at_least, DurationError};
use crate::object::{managed_object, ObjectKey};
use crate::API_VERSION;

pub const REPOSITORY_KIND: &str = "Repository";
pub const REPOSITORY_FINALIZER: &str = "repositories.finalizers.devbot.kfirs.com";
pub const DEFAULT_REFRESH_INTERVAL: &str = "5m";
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// A source repository hosted by a git provider.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "devbot.kfirs.com",
    version = "v1",
    kind = "Repository",
    plural = "repositories",
    shortname = "repo",
    namespaced,
    status = "RepositoryStatus",
    printcolumn = r#"{"name":"Default Branch","type":"string","jsonPath":".status.defaultBranch"}"#,
    printcolumn = r#"{"name":"Valid","type":"boolean","jsonPath":".status.valid"}"#,
    printcolumn = r#"{"name":"Current","type":"boolean","jsonPath":".status.current"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GitHubRepositorySpec>,

    /// How often the provider is polled, e.g. `5m`.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: String,
}

fn default_refresh_interval() -> String {
    DEFAULT_REFRESH_INTERVAL.to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitHubRepositorySpec {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<GitHubAuth>,
}

/// Points at a secret key holding a personal access token.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitHubAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
    #[serde(default)]
    pub key: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    #[serde(default)]
    pub name: String,
    /// Defaults to the namespace of the referencing object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    #[serde(default)]
    pub default_branch: String,

    /// `owner/name` as reported by the provider.
    #[serde(default)]
    pub resolved_name: String,

    /// Branch name to head commit SHA.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub revisions: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "ConditionSet::is_empty")]
    pub conditions: ConditionSet,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub valid: bool,
    #[serde(default)]
    pub current: bool,
}

managed_object!(Repository, RepositoryStatus, REPOSITORY_FINALIZER);

impl RepositorySpec {
    pub fn refresh_interval(&self) -> Result<Duration, DurationError> {
        parse_duration_at_least(&self.refresh_interval, MIN_REFRESH_INTERVAL)
    }
}

impl Repository {
    pub fn github(&self) -> Option<&GitHubRepositorySpec> {
        self.spec.github.as_ref()
    }

    pub fn default_branch(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.default_branch.as_str())
            .filter(|b| !b.is_empty())
    }

    /// HTTPS clone URL, if the provider coordinates are known.
    pub fn clone_url(&self) -> Option<String> {
        let gh = self.github()?;
        if gh.owner.is_empty() || gh.name.is_empty() {
            return None;
        }
        Some(format!("https://github.com/{}/{}", gh.owner, gh.name))
    }
}

/// Typed pointer to a repository object.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryReference {
    #[serde(default = "default_reference_api_version")]
    pub api_version: String,
    #[serde(default = "default_reference_kind")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

pub(crate) fn default_reference_api_version() -> String {
    API_VERSION.to_string()
}

pub(crate) fn default_reference_kind() -> String {
    REPOSITORY_KIND.to_string()
}

impl RepositoryReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: default_reference_api_version(),
            kind: default_reference_kind(),
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Only `devbot.kfirs.com/v1` `Repository` references are supported.
    pub fn is_supported(&self) -> bool {
        self.api_version == API_VERSION && self.kind == REPOSITORY_KIND
    }

    pub fn namespace_or<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
    }

    pub fn key(&self, default_namespace: &str) -> ObjectKey {
        ObjectKey::new(self.namespace_or(default_namespace), &self.name)
    }

    /// Same reference with the namespace filled in.
    pub fn resolved(&self, default_namespace: &str) -> Self {
        Self {
            namespace: Some(self.namespace_or(default_namespace).to_string()),
            ..self.clone()
        }
    }

    pub fn refers_to(&self, default_namespace: &str, repository: &ObjectKey) -> bool {
        self.is_supported() && &self.key(default_namespace) == repository
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let spec: RepositorySpec =
            serde_json::from_value(serde_json::json!({"github": {"owner": "kfirs", "name": "app"}})).unwrap();
        assert_eq!(spec.refresh_interval, "5m");
        assert_eq!(spec.refresh_interval(), Ok(Duration::from_secs(300)));
        assert!(spec.github.unwrap().auth.is_none());
    }

    #[test]
    fn test_refresh_interval_has_floor() {
        let spec = RepositorySpec {
            refresh_interval: "1s".into(),
            ..Default::default()
        };
        assert!(spec.refresh_interval().is_err());
    }

    #[test]
    fn test_reference_defaults_and_resolution() {
        let r: RepositoryReference = serde_json::from_value(serde_json::json!({"name": "app"})).unwrap();
        assert!(r.is_supported());
        assert_eq!(r.key("team-a"), ObjectKey::new("team-a", "app"));
        assert_eq!(r.resolved("team-a").namespace.as_deref(), Some("team-a"));

        let other = RepositoryReference {
            kind: "GitRepository".into(),
            ..r.clone()
        };
        assert!(!other.is_supported());
        assert!(!other.refers_to("team-a", &ObjectKey::new("team-a", "app")));
    }

    #[test]
    fn test_clone_url() {
        let mut repo = Repository::new(
            "app",
            RepositorySpec {
                github: Some(GitHubRepositorySpec {
                    owner: "kfirs".into(),
                    name: "app".into(),
                    auth: None,
                }),
                refresh_interval: "5m".into(),
            },
        );
        assert_eq!(repo.clone_url().as_deref(), Some("https://github.com/kfirs/app"));

        repo.spec.github = None;
        assert_eq!(repo.clone_url(), None);
    }
}
