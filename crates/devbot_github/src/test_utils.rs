//! In-memory GitHub für Tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::{Branch, GitHubApi, GitHubError, RepositoryInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    ValidateToken,
    GetRepository,
    ListBranches,
    GetBranch,
}

#[derive(Default)]
struct MockRepository {
    default_branch: String,
    branches: BTreeMap<String, String>,
}

#[derive(Default)]
struct State {
    tokens: HashSet<String>,
    repositories: HashMap<(String, String), MockRepository>,
    faults: Vec<(Call, GitHubError)>,
    calls: Vec<Call>,
}

/// Mock GitHub: Repositories, Branches und gültige Tokens sind frei
/// veränderbar, alle Aufrufe werden aufgezeichnet.
#[derive(Default)]
pub struct MockGitHub {
    state: Mutex<State>,
}

impl MockGitHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_token(self, token: &str) -> Self {
        self.allow_token(token);
        self
    }

    pub fn allow_token(&self, token: &str) {
        self.lock().tokens.insert(token.to_string());
    }

    pub fn revoke_token(&self, token: &str) {
        self.lock().tokens.remove(token);
    }

    /// Legt ein Repository mit `(branch, sha)`-Paaren an.
    pub fn add_repository(&self, owner: &str, name: &str, default_branch: &str, branches: &[(&str, &str)]) {
        let repo = MockRepository {
            default_branch: default_branch.to_string(),
            branches: branches
                .iter()
                .map(|(b, sha)| (b.to_string(), sha.to_string()))
                .collect(),
        };
        self.lock()
            .repositories
            .insert((owner.to_string(), name.to_string()), repo);
    }

    pub fn remove_repository(&self, owner: &str, name: &str) {
        self.lock()
            .repositories
            .remove(&(owner.to_string(), name.to_string()));
    }

    /// Legt `branch` an oder setzt ihn auf `sha`.
    pub fn push(&self, owner: &str, name: &str, branch: &str, sha: &str) {
        if let Some(repo) = self
            .lock()
            .repositories
            .get_mut(&(owner.to_string(), name.to_string()))
        {
            repo.branches.insert(branch.to_string(), sha.to_string());
        }
    }

    pub fn delete_branch(&self, owner: &str, name: &str, branch: &str) {
        if let Some(repo) = self
            .lock()
            .repositories
            .get_mut(&(owner.to_string(), name.to_string()))
        {
            repo.branches.remove(branch);
        }
    }

    pub fn set_default_branch(&self, owner: &str, name: &str, branch: &str) {
        if let Some(repo) = self
            .lock()
            .repositories
            .get_mut(&(owner.to_string(), name.to_string()))
        {
            repo.default_branch = branch.to_string();
        }
    }

    /// Der nächste `call` schlägt mit `error` fehl.
    pub fn fail_next(&self, call: Call, error: GitHubError) {
        self.lock().faults.push((call, error));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: Call) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    fn enter(&self, call: Call, token: &SecretString) -> Result<std::sync::MutexGuard<'_, State>, GitHubError> {
        let mut state = self.lock();
        state.calls.push(call);
        if let Some(pos) = state.faults.iter().position(|(c, _)| *c == call) {
            return Err(state.faults.remove(pos).1);
        }
        if !state.tokens.contains(token.expose_secret()) {
            return Err(GitHubError::Unauthorized("Bad credentials".into()));
        }
        Ok(state)
    }
}

fn not_found() -> GitHubError {
    GitHubError::NotFound("Not Found".into())
}

#[async_trait]
impl GitHubApi for MockGitHub {
    async fn validate_token(&self, token: &SecretString) -> Result<(), GitHubError> {
        self.enter(Call::ValidateToken, token).map(|_| ())
    }

    async fn get_repository(&self, token: &SecretString, owner: &str, name: &str) -> Result<RepositoryInfo, GitHubError> {
        let state = self.enter(Call::GetRepository, token)?;
        let repo = state
            .repositories
            .get(&(owner.to_string(), name.to_string()))
            .ok_or_else(not_found)?;
        Ok(RepositoryInfo {
            full_name: format!("{owner}/{name}"),
            default_branch: repo.default_branch.clone(),
        })
    }

    async fn list_branches(&self, token: &SecretString, owner: &str, name: &str) -> Result<Vec<Branch>, GitHubError> {
        let state = self.enter(Call::ListBranches, token)?;
        let repo = state
            .repositories
            .get(&(owner.to_string(), name.to_string()))
            .ok_or_else(not_found)?;
        Ok(repo
            .branches
            .iter()
            .map(|(name, sha)| Branch {
                name: name.clone(),
                commit_sha: sha.clone(),
            })
            .collect())
    }

    async fn get_branch(
        &self,
        token: &SecretString,
        owner: &str,
        name: &str,
        branch: &str,
    ) -> Result<Branch, GitHubError> {
        let state = self.enter(Call::GetBranch, token)?;
        let sha = state
            .repositories
            .get(&(owner.to_string(), name.to_string()))
            .and_then(|r| r.branches.get(branch))
            .ok_or_else(not_found)?;
        Ok(Branch {
            name: branch.to_string(),
            commit_sha: sha.clone(),
        })
    }
}
