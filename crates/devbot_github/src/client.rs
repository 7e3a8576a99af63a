//! REST client for `api.github.com`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::{Branch, GitHubApi, GitHubError, RepositoryInfo};

const PAGE_SIZE: usize = 100;
const API_VERSION: &str = "2022-11-28";

#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct RepositoryResponse {
    full_name: String,
    #[serde(default)]
    default_branch: String,
}

#[derive(Deserialize)]
struct BranchResponse {
    name: String,
    commit: CommitResponse,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
}

impl From<BranchResponse> for Branch {
    fn from(b: BranchResponse) -> Self {
        Branch {
            name: b.name,
            commit_sha: b.commit.sha,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl RestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GitHubError> {
        let base_url = Url::parse(base_url).map_err(|e| GitHubError::Decode(format!("invalid base URL '{base_url}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("devbot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base_url })
    }

    /// Joins percent-encoded path segments onto the base URL.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(&self, token: &SecretString, url: Url) -> Result<T, GitHubError> {
        debug!(%url, "GET");
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| GitHubError::Decode(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(error_for_status(status.as_u16(), &body))
    }
}

/// Maps a non-success response to the error taxonomy controllers act on.
pub(crate) fn error_for_status(status: u16, body: &str) -> GitHubError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());
    match status {
        401 => GitHubError::Unauthorized(message),
        403 => GitHubError::Forbidden(message),
        404 => GitHubError::NotFound(message),
        _ => GitHubError::Api { status, message },
    }
}

#[async_trait]
impl GitHubApi for RestClient {
    async fn validate_token(&self, token: &SecretString) -> Result<(), GitHubError> {
        let _: serde_json::Value = self.get_json(token, self.url(&["rate_limit"])).await?;
        Ok(())
    }

    async fn get_repository(&self, token: &SecretString, owner: &str, name: &str) -> Result<RepositoryInfo, GitHubError> {
        let repo: RepositoryResponse = self.get_json(token, self.url(&["repos", owner, name])).await?;
        Ok(RepositoryInfo {
            full_name: repo.full_name,
            default_branch: repo.default_branch,
        })
    }

    async fn list_branches(&self, token: &SecretString, owner: &str, name: &str) -> Result<Vec<Branch>, GitHubError> {
        let mut branches = Vec::new();
        let mut page = 1;
        loop {
            let mut url = self.url(&["repos", owner, name, "branches"]);
            url.query_pairs_mut()
                .append_pair("per_page", &PAGE_SIZE.to_string())
                .append_pair("page", &page.to_string());

            let batch: Vec<BranchResponse> = self.get_json(token, url).await?;
            let last = batch.len() < PAGE_SIZE;
            branches.extend(batch.into_iter().map(Branch::from));
            if last {
                break;
            }
            page += 1;
        }
        Ok(branches)
    }

    async fn get_branch(
        &self,
        token: &SecretString,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Branch, GitHubError> {
        let b: BranchResponse = self
            .get_json(token, self.url(&["repos", owner, name, "branches", branch]))
            .await?;
        Ok(b.into())
    }
}
