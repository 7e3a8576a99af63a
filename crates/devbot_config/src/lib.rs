use std::path::{Path, PathBuf};
use std::time::Duration;

use devbot_api::duration::{parse_duration, DurationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_FILE: &str = "devbot.toml";
pub const ENV_PREFIX: &str = "DEVBOT";
/// Separates section and key in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

const MIN_SAFETY_INTERVAL: Duration = Duration::from_secs(5);
const MAX_SAFETY_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid duration for {key}: {source}")]
    Duration {
        key: &'static str,
        #[source]
        source: DurationError,
    },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub github: GitHubConfig,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Root directory for deployment working copies.
    pub workspace_root: PathBuf,
    /// Claim backing `workspace_root`, recorded on deployments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_claim_name: Option<String>,
    /// Bounded requeue interval for applications, environments and deployments.
    pub safety_interval: String,
    pub apply_mode: ApplyMode,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("/data"),
            volume_claim_name: None,
            safety_interval: "1m".to_string(),
            apply_mode: ApplyMode::default(),
        }
    }
}

/// Whether `kubectl apply` mutates the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyMode {
    /// `--server-side --dry-run=server`
    #[default]
    DryRun,
    /// `--server-side`
    Live,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_url: String,
    pub timeout: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub git: PathBuf,
    pub kustomize: PathBuf,
    pub kubectl: PathBuf,
    pub timeout: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            git: PathBuf::from("git"),
            kustomize: PathBuf::from("kustomize"),
            kubectl: PathBuf::from("kubectl"),
            timeout: "5m".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Config {
    /// Reads the file at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_sources(path, None)
    }

    /// [`Config::load`] overlaid with `DEVBOT_<SECTION>__<KEY>` variables from
    /// the process environment, then validated.
    ///
    /// `DEVBOT_CONTROLLER__APPLY_MODE=live` sets `controller.apply_mode`.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::from_sources(path, Some(env_source()))?;
        config.validate()?;
        Ok(config)
    }

    fn from_sources(path: &Path, env: Option<config::Environment>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(
            config::File::new(&path.to_string_lossy(), config::FileFormat::Toml).required(false),
        );
        if let Some(env) = env {
            builder = builder.add_source(env);
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.safety_interval()?;
        self.github_timeout()?;
        self.tools_timeout()?;
        if self.github.api_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "github.api_url",
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn safety_interval(&self) -> Result<Duration, ConfigError> {
        let d = duration("controller.safety_interval", &self.controller.safety_interval)?;
        if !(MIN_SAFETY_INTERVAL..=MAX_SAFETY_INTERVAL).contains(&d) {
            return Err(ConfigError::InvalidValue {
                key: "controller.safety_interval",
                message: format!("must be between {MIN_SAFETY_INTERVAL:?} and {MAX_SAFETY_INTERVAL:?}"),
            });
        }
        Ok(d)
    }

    pub fn github_timeout(&self) -> Result<Duration, ConfigError> {
        duration("github.timeout", &self.github.timeout)
    }

    pub fn tools_timeout(&self) -> Result<Duration, ConfigError> {
        duration("tools.timeout", &self.tools.timeout)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator(ENV_SEPARATOR)
}

fn duration(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|source| ConfigError::Duration { key, source })
}
