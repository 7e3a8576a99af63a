//! Store - abstrahiert den Zugriff auf den deklarativen Cluster-Store
//!
//! Controller sprechen ausschließlich über [`Store`] mit dem API-Server,
//! damit die komplette Reconcile-Logik gegen den In-Memory-Store getestet
//! werden kann.

use async_trait::async_trait;
use devbot_api::{ManagedObject, ObjectKey};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("failed to encode object: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Conflict oder Gone: der Stand des Aufrufers ist veraltet, neu lesen.
    pub fn is_stale_write(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Gone(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) => match resp.code {
                404 => Self::NotFound(resp.message.clone()),
                409 if resp.reason == "AlreadyExists" => Self::AlreadyExists(resp.message.clone()),
                409 => Self::Conflict(resp.message.clone()),
                410 => Self::Gone(resp.message.clone()),
                403 => Self::Forbidden(resp.message.clone()),
                _ => Self::Other(err.to_string()),
            },
            _ => Self::Other(err.to_string()),
        }
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Zugriff auf devbot-Objekte und Secrets mit optimistischer Nebenläufigkeit.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// `Ok(None)`, wenn das Objekt nicht existiert.
    async fn get<K: ManagedObject>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError>;

    async fn list<K: ManagedObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError>;

    /// Objekte in `namespace`, deren Controller-Referenz auf `owner_uid` zeigt.
    async fn list_owned<K: ManagedObject>(&self, namespace: &str, owner_uid: &str) -> Result<Vec<K>, StoreError> {
        let all = self.list::<K>(namespace).await?;
        Ok(all.into_iter().filter(|o| o.is_controlled_by(owner_uid)).collect())
    }

    async fn create<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError>;

    /// Ersetzt Metadaten und Spec; der Status bleibt unverändert.
    async fn update<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError>;

    /// Ersetzt die Status-Subresource; Spec und Metadaten bleiben unverändert.
    async fn update_status<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError>;

    /// Fordert das Löschen an. Ein fehlendes Objekt zu löschen ist kein Fehler.
    async fn delete<K: ManagedObject>(&self, key: &ObjectKey) -> Result<(), StoreError>;

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, StoreError>;
}

// ============================================================================
// KubeStore - echte API-Server Implementierung
// ============================================================================

/// [`Store`] über den Kubernetes API-Server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: ManagedObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of<K: ManagedObject>(object: &K) -> String {
    object.namespace().unwrap_or_default()
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: ManagedObject>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        Ok(self.api::<K>(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list<K: ManagedObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        Ok(self.api::<K>(namespace).list(&ListParams::default()).await?.items)
    }

    async fn create<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError> {
        let api = self.api::<K>(&namespace_of(object));
        Ok(api.create(&PostParams::default(), object).await?)
    }

    async fn update<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError> {
        let api = self.api::<K>(&namespace_of(object));
        Ok(api.replace(&object.name_any(), &PostParams::default(), object).await?)
    }

    async fn update_status<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError> {
        let api = self.api::<K>(&namespace_of(object));
        let data = serde_json::to_vec(object)?;
        Ok(api.replace_status(&object.name_any(), &PostParams::default(), data).await?)
    }

    async fn delete<K: ManagedObject>(&self, key: &ObjectKey) -> Result<(), StoreError> {
        match self.api::<K>(&key.namespace).delete(&key.name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} happened"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_maps_api_status_codes() {
        assert!(matches!(StoreError::from(api_error(404, "NotFound")), StoreError::NotFound(_)));
        assert!(matches!(StoreError::from(api_error(409, "Conflict")), StoreError::Conflict(_)));
        assert!(matches!(
            StoreError::from(api_error(409, "AlreadyExists")),
            StoreError::AlreadyExists(_)
        ));
        assert!(matches!(StoreError::from(api_error(410, "Gone")), StoreError::Gone(_)));
        assert!(matches!(StoreError::from(api_error(403, "Forbidden")), StoreError::Forbidden(_)));
        assert!(matches!(StoreError::from(api_error(500, "InternalError")), StoreError::Other(_)));
    }

    #[test]
    fn test_stale_write_classification() {
        assert!(StoreError::Conflict("x".into()).is_stale_write());
        assert!(StoreError::Gone("x".into()).is_stale_write());
        assert!(!StoreError::Forbidden("x".into()).is_stale_write());
        assert!(StoreError::NotFound("x".into()).is_not_found());
    }
}
