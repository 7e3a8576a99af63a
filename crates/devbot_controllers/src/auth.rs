//! Token-Auflösung über das im Repository referenzierte Secret.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbot_api::conditions::{InvalidReason, StaleReason, UnauthenticatedReason};
use devbot_api::{ConditionSet, ObjectKey, Repository};
use devbot_github::{GitHubApi, GitHubError};
use devbot_reconcile::{Action, Controller, Outcome, Reconciliation, Store, StoreError};
use kube::ResourceExt;
use secrecy::SecretString;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Repository has no auth configuration")]
    ConfigMissing,

    #[error("Auth secret name is missing")]
    SecretNameMissing,

    #[error("Auth secret key is missing")]
    SecretKeyMissing,

    #[error("Secret {0} not found")]
    SecretNotFound(ObjectKey),

    #[error("Secret {key} is not accessible: {message}")]
    SecretForbidden { key: ObjectKey, message: String },

    #[error("Failed getting secret {key}: {message}")]
    SecretGetFailed { key: ObjectKey, message: String },

    #[error("Secret {key} has no key '{field}'")]
    KeyNotFound { key: ObjectKey, field: String },

    #[error("Token in secret {0} is empty")]
    TokenEmpty(ObjectKey),
}

impl AuthError {
    /// Kaputte Spec; nur eine Spec-Änderung behebt das.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigMissing | Self::SecretNameMissing | Self::SecretKeyMissing)
    }

    pub fn record(&self, conditions: &mut ConditionSet) {
        let message = self.to_string();
        match self {
            Self::ConfigMissing => conditions.set(InvalidReason::AuthConfigMissing, message),
            Self::SecretNameMissing => conditions.set(InvalidReason::AuthSecretNameMissing, message),
            Self::SecretKeyMissing => conditions.set(InvalidReason::AuthSecretKeyMissing, message),
            Self::SecretNotFound(_) => conditions.set(UnauthenticatedReason::AuthSecretNotFound, message),
            Self::SecretForbidden { .. } => conditions.set(UnauthenticatedReason::AuthSecretForbidden, message),
            Self::SecretGetFailed { .. } => conditions.set_maybe(UnauthenticatedReason::AuthSecretGetFailed, message),
            Self::KeyNotFound { .. } => conditions.set(UnauthenticatedReason::AuthSecretKeyNotFound, message),
            Self::TokenEmpty(_) => conditions.set(UnauthenticatedReason::AuthTokenEmpty, message),
        }
    }
}

const CONFIG_REASONS: &[InvalidReason] = &[
    InvalidReason::AuthConfigMissing,
    InvalidReason::AuthSecretNameMissing,
    InvalidReason::AuthSecretKeyMissing,
];

/// Liest das Token von `repository` aus dessen Auth-Secret.
///
/// Das Secret liegt im Namespace des Repositories, sofern die Referenz
/// keinen anderen nennt.
pub async fn resolve_token<S: Store>(store: &S, repository: &Repository) -> Result<SecretString, AuthError> {
    let auth = repository
        .github()
        .and_then(|gh| gh.auth.as_ref())
        .ok_or(AuthError::ConfigMissing)?;
    let secret_ref = auth
        .secret_ref
        .as_ref()
        .filter(|r| !r.name.is_empty())
        .ok_or(AuthError::SecretNameMissing)?;
    if auth.key.is_empty() {
        return Err(AuthError::SecretKeyMissing);
    }

    let namespace = secret_ref
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .or_else(|| repository.namespace())
        .unwrap_or_default();
    let key = ObjectKey::new(namespace, &secret_ref.name);

    let secret = match store.get_secret(&key).await {
        Ok(Some(secret)) => secret,
        Ok(None) => return Err(AuthError::SecretNotFound(key)),
        Err(StoreError::Forbidden(message)) => return Err(AuthError::SecretForbidden { key, message }),
        Err(e) => {
            return Err(AuthError::SecretGetFailed {
                key,
                message: e.to_string(),
            })
        }
    };

    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&auth.key))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .or_else(|| secret.string_data.as_ref().and_then(|data| data.get(&auth.key)).cloned())
        .ok_or_else(|| AuthError::KeyNotFound {
            key: key.clone(),
            field: auth.key.clone(),
        })?;

    let token = raw.trim();
    if token.is_empty() {
        return Err(AuthError::TokenEmpty(key));
    }
    Ok(SecretString::from(token))
}

// ============================================================================
// Authenticate-Action
// ============================================================================

/// Löst das Repository-Token auf und prüft es gegen den Provider.
///
/// Fehler führen zum Requeue nach dem Refresh-Intervall, Konfigurationsfehler
/// stoppen.
pub struct Authenticate<C: Controller> {
    github: Arc<dyn GitHubApi>,
    repository: for<'a> fn(&'a C::Object, &'a C::State) -> Option<&'a Repository>,
    interval: fn(&C::State) -> Option<Duration>,
    assign: fn(&mut C::State, SecretString),
}

impl<C: Controller> Authenticate<C> {
    pub fn new(
        github: Arc<dyn GitHubApi>,
        repository: for<'a> fn(&'a C::Object, &'a C::State) -> Option<&'a Repository>,
        interval: fn(&C::State) -> Option<Duration>,
        assign: fn(&mut C::State, SecretString),
    ) -> Self {
        Self {
            github,
            repository,
            interval,
            assign,
        }
    }
}

#[async_trait]
impl<C: Controller> Action<C> for Authenticate<C> {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    async fn execute(&self, rc: &mut Reconciliation<'_, C>) -> Outcome {
        let Some(repository) = (self.repository)(&rc.object, &rc.state).cloned() else {
            return Outcome::Stop;
        };
        let retry = (self.interval)(&rc.state).unwrap_or(crate::repository::DEFAULT_INTERVAL);

        let token = match resolve_token(rc.store, &repository).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "failed resolving GitHub token");
                if !e.is_configuration() {
                    rc.conditions().clear_if_due_to_any_of(CONFIG_REASONS);
                }
                e.record(rc.conditions());
                return if e.is_configuration() {
                    Outcome::Stop
                } else {
                    Outcome::RequeueAfter(retry)
                };
            }
        };
        rc.conditions().clear_if_due_to_any_of(CONFIG_REASONS);

        match self.github.validate_token(&token).await {
            Ok(()) => {
                debug!("token valid");
                rc.conditions().clear::<UnauthenticatedReason>();
                rc.conditions()
                    .clear_if_due_to_any_of(&[StaleReason::GitHubApiFailure]);
                (self.assign)(&mut rc.state, token);
                Outcome::Continue
            }
            Err(GitHubError::Unauthorized(message) | GitHubError::Forbidden(message)) => {
                warn!(%message, "GitHub rejected token");
                rc.conditions().set(
                    UnauthenticatedReason::TokenValidationFailed,
                    format!("Token validation failed: {message}"),
                );
                Outcome::RequeueAfter(retry)
            }
            Err(e) => {
                warn!(error = %e, "token validation request failed");
                rc.conditions()
                    .set_maybe(StaleReason::GitHubApiFailure, format!("Token validation request failed: {e}"));
                Outcome::RequeueAfter(retry)
            }
        }
    }
}
