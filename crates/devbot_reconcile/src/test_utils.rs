//! In-memory [`Store`] für Tests.
//!
//! Bildet die Teile der API-Server Semantik nach, auf die sich die Controller
//! verlassen: `resourceVersion`-Konflikte, Generation-Bumps bei Spec-Änderungen,
//! getrennte Status-Subresource, Finalizer-gesteuertes Löschen und
//! Garbage-Collection über Owner-References.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use devbot_api::{ManagedObject, ObjectKey};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde_json::{json, Value};

use crate::store::{Store, StoreError};

type Key = (String, String, String);

/// Store-Operation, in die ein Fehler injiziert werden kann.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
    GetSecret,
}

struct Fault {
    op: Op,
    kind: Option<String>,
    error: StoreError,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    secrets: BTreeMap<(String, String), Secret>,
    next_id: u64,
    faults: Vec<Fault>,
    writes: usize,
    status_writes: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn kind_of<K: ManagedObject>() -> String {
    K::kind(&()).to_string()
}

fn store_key(kind: &str, key: &ObjectKey) -> Key {
    (kind.to_string(), key.namespace.clone(), key.name.clone())
}

fn encode<K: ManagedObject>(object: &K) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(object)?)
}

fn decode<K: ManagedObject>(value: &Value) -> Result<K, StoreError> {
    Ok(serde_json::from_value(value.clone())?)
}

fn meta_str<'v>(value: &'v Value, field: &str) -> Option<&'v str> {
    value["metadata"][field].as_str()
}

fn owner_uids(value: &Value) -> Vec<String> {
    value["metadata"]["ownerReferences"]
        .as_array()
        .map(|refs| {
            refs.iter()
                .filter_map(|r| r["uid"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl Inner {
    fn take_fault(&mut self, op: Op, kind: &str) -> Result<(), StoreError> {
        let pos = self
            .faults
            .iter()
            .position(|f| f.op == op && f.kind.as_deref().map_or(true, |k| k == kind));
        match pos {
            Some(i) => Err(self.faults.remove(i).error),
            None => Ok(()),
        }
    }

    fn bump_version(&mut self, value: &mut Value) {
        self.next_id += 1;
        value["metadata"]["resourceVersion"] = json!(self.next_id.to_string());
    }

    fn check_version(existing: &Value, incoming: &Value) -> Result<(), StoreError> {
        match meta_str(incoming, "resourceVersion") {
            Some(v) if Some(v) != meta_str(existing, "resourceVersion") => Err(StoreError::Conflict(format!(
                "resourceVersion {v} is outdated for {}",
                meta_str(existing, "name").unwrap_or_default()
            ))),
            _ => Ok(()),
        }
    }

    fn create(&mut self, kind: &str, mut value: Value, keep_status: bool) -> Result<Value, StoreError> {
        let name = meta_str(&value, "name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StoreError::Other("metadata.name is required".into()))?
            .to_string();
        let namespace = meta_str(&value, "namespace")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| StoreError::Other("metadata.namespace is required".into()))?
            .to_string();
        let key = (kind.to_string(), namespace, name.clone());
        if self.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{kind} {name} already exists")));
        }

        self.next_id += 1;
        let meta = &mut value["metadata"];
        meta["uid"] = json!(format!("uid-{}", self.next_id));
        meta["generation"] = json!(1);
        meta["creationTimestamp"] = json!(now());
        if let Some(m) = meta.as_object_mut() {
            m.remove("deletionTimestamp");
        }
        if !keep_status {
            if let Some(o) = value.as_object_mut() {
                o.remove("status");
            }
        }
        self.bump_version(&mut value);
        self.writes += 1;
        self.objects.insert(key, value.clone());
        Ok(value)
    }

    fn update(&mut self, kind: &str, key: &ObjectKey, incoming: Value) -> Result<Value, StoreError> {
        let skey = store_key(kind, key);
        let existing = self
            .objects
            .get(&skey)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{kind} {key}")))?;
        Self::check_version(&existing, &incoming)?;

        let mut next = existing.clone();
        next["spec"] = incoming["spec"].clone();
        for field in ["labels", "annotations", "finalizers", "ownerReferences"] {
            match incoming["metadata"].get(field) {
                Some(v) => next["metadata"][field] = v.clone(),
                None => {
                    if let Some(m) = next["metadata"].as_object_mut() {
                        m.remove(field);
                    }
                }
            }
        }
        if existing["spec"] != next["spec"] {
            let generation = existing["metadata"]["generation"].as_i64().unwrap_or(0) + 1;
            next["metadata"]["generation"] = json!(generation);
        }
        self.bump_version(&mut next);
        self.writes += 1;

        if next["metadata"].get("deletionTimestamp").is_some() && !has_finalizers(&next) {
            self.remove(&skey);
        } else {
            self.objects.insert(skey, next.clone());
        }
        Ok(next)
    }

    fn update_status(&mut self, kind: &str, key: &ObjectKey, incoming: Value) -> Result<Value, StoreError> {
        let skey = store_key(kind, key);
        let mut existing = self
            .objects
            .get(&skey)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{kind} {key}")))?;
        Self::check_version(&existing, &incoming)?;

        existing["status"] = incoming["status"].clone();
        self.bump_version(&mut existing);
        self.writes += 1;
        self.status_writes += 1;
        self.objects.insert(skey, existing.clone());
        Ok(existing)
    }

    fn delete(&mut self, skey: &Key) {
        let Some(existing) = self.objects.get_mut(skey) else {
            return;
        };
        if has_finalizers(existing) {
            if existing["metadata"].get("deletionTimestamp").is_none() {
                existing["metadata"]["deletionTimestamp"] = json!(now());
                let mut value = existing.clone();
                self.bump_version(&mut value);
                self.objects.insert(skey.clone(), value);
                self.writes += 1;
            }
            return;
        }
        self.writes += 1;
        self.remove(skey);
    }

    /// Entfernt das Objekt und löscht die abhängigen Objekte.
    fn remove(&mut self, skey: &Key) {
        let Some(removed) = self.objects.remove(skey) else {
            return;
        };
        let Some(uid) = meta_str(&removed, "uid").map(str::to_string) else {
            return;
        };
        let dependents: Vec<Key> = self
            .objects
            .iter()
            .filter(|(_, v)| owner_uids(v).contains(&uid))
            .map(|(k, _)| k.clone())
            .collect();
        for dependent in dependents {
            self.delete(&dependent);
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    // ========================================================================
    // Seeding & Inspektion
    // ========================================================================

    /// Legt `object` in `namespace` an, inklusive Status.
    pub fn insert<K: ManagedObject>(&self, mut object: K, namespace: &str) -> K {
        object.meta_mut().namespace = Some(namespace.to_string());
        let value = encode(&object).unwrap();
        let stored = self.lock().create(&kind_of::<K>(), value, true).unwrap();
        decode(&stored).unwrap()
    }

    pub fn get_now<K: ManagedObject>(&self, key: &ObjectKey) -> Option<K> {
        let inner = self.lock();
        inner
            .objects
            .get(&store_key(&kind_of::<K>(), key))
            .map(|v| decode(v).unwrap())
    }

    /// Alle Objekte der Art `K` in `namespace`, nach Name sortiert.
    pub fn list_now<K: ManagedObject>(&self, namespace: &str) -> Vec<K> {
        let kind = kind_of::<K>();
        self.lock()
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| decode(v).unwrap())
            .collect()
    }

    /// Keys aller Objekte der Art `K` über alle Namespaces.
    pub fn keys<K: ManagedObject>(&self) -> Vec<ObjectKey> {
        let kind = kind_of::<K>();
        self.lock()
            .objects
            .keys()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, ns, name)| ObjectKey::new(ns, name))
            .collect()
    }

    /// Ändert ein Objekt wie ein Benutzer; Spec-Änderungen erhöhen die Generation.
    pub fn edit<K: ManagedObject>(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) -> K {
        let mut object: K = self.get_now(key).unwrap();
        f(&mut object);
        let value = encode(&object).unwrap();
        let stored = self.lock().update(&kind_of::<K>(), key, value).unwrap();
        decode(&stored).unwrap()
    }

    /// Überschreibt den Status wie ein fremder Schreiber.
    pub fn edit_status<K: ManagedObject>(&self, key: &ObjectKey, f: impl FnOnce(&mut K::Status)) {
        let mut object: K = self.get_now(key).unwrap();
        f(object.status_mut());
        let value = encode(&object).unwrap();
        self.lock().update_status(&kind_of::<K>(), key, value).unwrap();
    }

    pub fn put_secret(&self, namespace: &str, name: &str, key: &str, value: &str) {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), ByteString(value.as_bytes().to_vec()))])),
            ..Default::default()
        };
        self.lock()
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    // ========================================================================
    // Fault Injection & Zähler
    // ========================================================================

    /// Die nächste `op` auf beliebiger Art schlägt mit `error` fehl.
    pub fn fail_next(&self, op: Op, error: StoreError) {
        self.lock().faults.push(Fault { op, kind: None, error });
    }

    /// Die nächste `op` auf Art `K` schlägt mit `error` fehl.
    pub fn fail_next_for<K: ManagedObject>(&self, op: Op, error: StoreError) {
        self.lock().faults.push(Fault {
            op,
            kind: Some(kind_of::<K>()),
            error,
        });
    }

    pub fn fail_next_status_update(&self, error: StoreError) {
        self.fail_next(Op::UpdateStatus, error);
    }

    /// Anzahl der bisher erfolgreichen Schreibzugriffe.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get<K: ManagedObject>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.lock();
        inner.take_fault(Op::Get, &kind)?;
        inner.objects.get(&store_key(&kind, key)).map(decode).transpose()
    }

    async fn list<K: ManagedObject>(&self, namespace: &str) -> Result<Vec<K>, StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.lock();
        inner.take_fault(Op::List, &kind)?;
        inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| decode(v))
            .collect()
    }

    async fn create<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let value = encode(object)?;
        let mut inner = self.lock();
        inner.take_fault(Op::Create, &kind)?;
        decode(&inner.create(&kind, value, false)?)
    }

    async fn update<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let value = encode(object)?;
        let mut inner = self.lock();
        inner.take_fault(Op::Update, &kind)?;
        decode(&inner.update(&kind, &object.key(), value)?)
    }

    async fn update_status<K: ManagedObject>(&self, object: &K) -> Result<K, StoreError> {
        let kind = kind_of::<K>();
        let value = encode(object)?;
        let mut inner = self.lock();
        inner.take_fault(Op::UpdateStatus, &kind)?;
        decode(&inner.update_status(&kind, &object.key(), value)?)
    }

    async fn delete<K: ManagedObject>(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let kind = kind_of::<K>();
        let mut inner = self.lock();
        inner.take_fault(Op::Delete, &kind)?;
        inner.delete(&store_key(&kind, key));
        Ok(())
    }

    async fn get_secret(&self, key: &ObjectKey) -> Result<Option<Secret>, StoreError> {
        let mut inner = self.lock();
        inner.take_fault(Op::GetSecret, "Secret")?;
        Ok(inner
            .secrets
            .get(&(key.namespace.clone(), key.name.clone()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devbot_api::{GitHubRepositorySpec, Ref, RefSpec, Repository, RepositorySpec};

    fn repo(name: &str) -> Repository {
        Repository::new(
            name,
            RepositorySpec {
                github: Some(GitHubRepositorySpec {
                    owner: "acme".into(),
                    name: name.into(),
                    auth: None,
                }),
                refresh_interval: "5m".into(),
            },
        )
    }

    fn child_ref(owner: &Repository, name: &str, branch: &str) -> Ref {
        let mut r = Ref::new(name, RefSpec { r#ref: branch.into() });
        r.metadata.owner_references = Some(vec![owner.owner_reference().unwrap()]);
        r
    }

    #[tokio::test]
    async fn test_create_assigns_metadata_and_drops_status() {
        let store = MemoryStore::new();
        let mut r = repo("web");
        r.metadata.namespace = Some("team".into());
        r.status_mut().default_branch = "main".into();

        let created = store.create(&r).await.unwrap();

        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.status.is_none());
        assert!(matches!(store.create(&r).await, Err(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_update_detects_stale_resource_version() {
        let store = MemoryStore::new();
        let original = store.insert(repo("web"), "team");

        let mut first = original.clone();
        first.spec.refresh_interval = "10m".into();
        let updated = store.update(&first).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));

        let mut second = original.clone();
        second.spec.refresh_interval = "1m".into();
        assert!(matches!(store.update(&second).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_keeps_status_and_status_update_keeps_spec() {
        let store = MemoryStore::new();
        let mut seeded = repo("web");
        seeded.status_mut().default_branch = "main".into();
        let stored = store.insert(seeded, "team");

        let mut spec_change = stored.clone();
        spec_change.status_mut().default_branch = "ignored".into();
        spec_change.metadata.finalizers = Some(vec!["f".into()]);
        let after = store.update(&spec_change).await.unwrap();
        assert_eq!(after.status.as_ref().unwrap().default_branch, "main");
        assert_eq!(after.metadata.generation, Some(1));

        let mut status_change = after.clone();
        status_change.spec.refresh_interval = "1h".into();
        status_change.status_mut().default_branch = "develop".into();
        let after = store.update_status(&status_change).await.unwrap();
        assert_eq!(after.spec.refresh_interval, "5m");
        assert_eq!(after.status.unwrap().default_branch, "develop");
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers_and_cascades() {
        let store = MemoryStore::new();
        let mut parent = repo("web");
        parent.metadata.finalizers = Some(vec!["repositories.finalizers.devbot.kfirs.com".into()]);
        let parent = store.insert(parent, "team");
        store.insert(child_ref(&parent, "abc1234", "main"), "team");

        store.delete::<Repository>(&parent.key()).await.unwrap();
        let pending: Repository = store.get_now(&parent.key()).unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());
        assert_eq!(store.list_now::<Ref>("team").len(), 1);

        let mut released = pending.clone();
        released.metadata.finalizers = Some(vec![]);
        store.update(&released).await.unwrap();

        assert!(store.get_now::<Repository>(&parent.key()).is_none());
        assert!(store.list_now::<Ref>("team").is_empty());
    }

    #[tokio::test]
    async fn test_list_owned_filters_by_controller() {
        let store = MemoryStore::new();
        let a = store.insert(repo("a"), "team");
        let b = store.insert(repo("b"), "team");
        store.insert(child_ref(&a, "r1", "main"), "team");
        store.insert(child_ref(&b, "r2", "main"), "team");

        let owned: Vec<Ref> = store.list_owned("team", a.metadata.uid.as_deref().unwrap()).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].metadata.name.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn test_faults_fire_once() {
        let store = MemoryStore::new();
        let r = store.insert(repo("web"), "team");
        store.fail_next_for::<Repository>(Op::Get, StoreError::Forbidden("rbac".into()));

        assert!(matches!(store.get::<Repository>(&r.key()).await, Err(StoreError::Forbidden(_))));
        assert!(store.get::<Repository>(&r.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_secrets() {
        let store = MemoryStore::new();
        store.put_secret("team", "gh", "token", "s3cr3t");

        let secret = store.get_secret(&ObjectKey::new("team", "gh")).await.unwrap().unwrap();
        assert_eq!(secret.data.unwrap()["token"].0, b"s3cr3t".to_vec());
        assert!(store.get_secret(&ObjectKey::new("team", "nope")).await.unwrap().is_none());
    }
}
