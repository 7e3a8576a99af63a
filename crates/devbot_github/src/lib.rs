use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;

pub mod client;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use client::RestClient;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad credentials: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("GitHub API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl GitHubError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Repository metadata as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    /// `owner/name`
    pub full_name: String,
    pub default_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub name: String,
    pub commit_sha: String,
}

// ============================================================================
// GitHubApi trait
// ============================================================================

/// Provider operations used by the repository and ref controllers.
///
/// The token is passed per call; clients keep no credentials.
#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// Cheap authenticated request; fails with [`GitHubError::Unauthorized`]
    /// for rejected tokens.
    async fn validate_token(&self, token: &SecretString) -> Result<(), GitHubError>;

    async fn get_repository(&self, token: &SecretString, owner: &str, name: &str) -> Result<RepositoryInfo, GitHubError>;

    /// All branches, following pagination to the end.
    async fn list_branches(&self, token: &SecretString, owner: &str, name: &str) -> Result<Vec<Branch>, GitHubError>;

    async fn get_branch(
        &self,
        token: &SecretString,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Branch, GitHubError>;
}
