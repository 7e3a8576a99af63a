//! Controllers of the devbot operator.
//!
//! Each controller is an ordered list of actions run by
//! [`devbot_reconcile::Engine`] against one object kind:
//!
//! | Controller | Kind | Produces |
//! |------------|------|----------|
//! | [`repository`] | `Repository` | `Ref` per branch |
//! | [`git_ref`] | `Ref` | commit SHA of its branch |
//! | [`application`] | `Application` | `Environment` per branch |
//! | [`environment`] | `Environment` | `Deployment` per participating repository |
//! | [`deployment`] | `Deployment` | clone, bake and apply |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devbot_config::{ApplyMode, Config, ConfigError};
use devbot_github::GitHubApi;

pub mod application;
pub mod auth;
pub mod deployment;
pub mod environment;
pub mod git_ref;
pub mod pipeline;
pub mod repository;
pub mod runtime;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use application::ApplicationController;
pub use deployment::DeploymentController;
pub use environment::EnvironmentController;
pub use git_ref::RefController;
pub use repository::RepositoryController;

/// Operator settings the controllers act on.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub workspace_root: PathBuf,
    pub volume_claim_name: Option<String>,
    /// Bounded requeue of applications, environments and deployments.
    pub safety_interval: Duration,
    pub apply_mode: ApplyMode,
}

impl Settings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            workspace_root: config.controller.workspace_root.clone(),
            volume_claim_name: config.controller.volume_claim_name.clone(),
            safety_interval: config.safety_interval()?,
            apply_mode: config.controller.apply_mode,
        })
    }
}

/// Collaborators shared by all controllers.
#[derive(Clone)]
pub struct Context {
    pub github: Arc<dyn GitHubApi>,
    pub tools: Arc<dyn pipeline::PipelineTools>,
    pub settings: Settings,
}
