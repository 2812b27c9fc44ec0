//! An in-memory `Store` for tests. It behaves like the api server in the ways that matter to the
//! reconciler: every write bumps `metadata.resourceVersion`, writes carrying a stale
//! resourceVersion are rejected with a conflict, and status is only ever written through
//! `update_status`. It also records every successful write, and allows errors to be injected for
//! the next call of a given operation.
use super::{Store, StoreError};
use crate::k8s_types::K8sType;
use crate::resource::{K8sResource, ObjectId, ObjectIdRef, ResourceJson};

use async_trait::async_trait;
use serde_json::Value;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    List,
    Create,
    Replace,
    UpdateStatus,
    Delete,
}

/// A successful write that was made through the `Store` interface
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub op: StoreOp,
    pub kind: &'static str,
    pub id: ObjectId,
}

type Key = (&'static K8sType, ObjectId);

#[derive(Debug, Default)]
struct State {
    objects: HashMap<Key, Value>,
    last_resource_version: u64,
    last_uid: u64,
    writes: Vec<WriteRecord>,
    injected_errors: HashMap<StoreOp, VecDeque<StoreError>>,
    calls: HashMap<StoreOp, usize>,
}

impl State {
    fn next_resource_version(&mut self) -> String {
        self.last_resource_version += 1;
        self.last_resource_version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.last_uid += 1;
        format!("uid-{}", self.last_uid)
    }

    fn start_call(&mut self, op: StoreOp) -> Result<(), StoreError> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.injected_errors.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_version(&self, id: &ObjectIdRef<'_>, current: &Value, new: &Value) -> Result<(), StoreError> {
        let current_version = current.pointer("/metadata/resourceVersion").and_then(Value::as_str);
        match new.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            Some(v) if Some(v) != current_version => Err(StoreError::Conflict(
                id.to_owned(),
                format!(
                    "resourceVersion '{}' does not match current version '{}'",
                    v,
                    current_version.unwrap_or("")
                ),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("MemoryStore lock was poisoned")
    }

    /// Adds an object directly, as if it were created by something other than the operator.
    /// The `uid` and `resourceVersion` are always assigned by the store. Inserts are not
    /// recorded as writes.
    pub fn insert(&self, k8s_type: &'static K8sType, mut value: Value) -> K8sResource {
        let mut state = self.lock();
        fill_type(k8s_type, &mut value);
        let id = value
            .get_id_ref()
            .expect("inserted object must have a name")
            .to_owned();
        let uid = state.next_uid();
        let version = state.next_resource_version();
        let meta = value.metadata_mut().expect("inserted object must be a json object");
        meta.insert("uid".to_owned(), Value::String(uid));
        meta.insert("resourceVersion".to_owned(), Value::String(version));
        state.objects.insert((k8s_type, id), value.clone());
        K8sResource::from_value(value).expect("inserted object is invalid")
    }

    /// Modifies a stored object the way an external writer would, bumping its resourceVersion.
    /// Returns false if the object doesn't exist. Not recorded as a write.
    pub fn modify<F>(&self, k8s_type: &'static K8sType, id: &ObjectIdRef<'_>, modify: F) -> bool
    where
        F: FnOnce(&mut Value),
    {
        let mut state = self.lock();
        let version = state.next_resource_version();
        match state.objects.get_mut(&(k8s_type, id.to_owned())) {
            Some(obj) => {
                modify(obj);
                if let Some(meta) = obj.metadata_mut() {
                    meta.insert("resourceVersion".to_owned(), Value::String(version));
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, k8s_type: &'static K8sType, id: &ObjectIdRef<'_>) -> Option<Value> {
        self.lock().objects.remove(&(k8s_type, id.to_owned()))
    }

    /// Returns a copy of the stored object, bypassing error injection and call counting
    pub fn peek(&self, k8s_type: &'static K8sType, id: &ObjectIdRef<'_>) -> Option<Value> {
        self.lock().objects.get(&(k8s_type, id.to_owned())).cloned()
    }

    /// The next call of `op` will fail with the given error. Multiple errors for the same
    /// operation are returned in the order they were added.
    pub fn fail_next(&self, op: StoreOp, err: StoreError) {
        self.lock()
            .injected_errors
            .entry(op)
            .or_insert_with(VecDeque::new)
            .push_back(err);
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// The number of times that `op` was called, including calls that failed
    pub fn call_count(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }
}

fn fill_type(k8s_type: &'static K8sType, value: &mut Value) {
    if let Some(obj) = value.as_object_mut() {
        obj.entry("apiVersion")
            .or_insert_with(|| Value::String(k8s_type.api_version.to_owned()));
        obj.entry("kind")
            .or_insert_with(|| Value::String(k8s_type.kind.to_owned()));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<K8sResource, StoreError> {
        let mut state = self.lock();
        state.start_call(StoreOp::Get)?;
        let value = state
            .objects
            .get(&(k8s_type, id.to_owned()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        K8sResource::from_value(value).map_err(Into::into)
    }

    async fn list(
        &self,
        k8s_type: &'static K8sType,
        namespace: Option<&str>,
    ) -> Result<Vec<K8sResource>, StoreError> {
        let mut state = self.lock();
        state.start_call(StoreOp::List)?;
        let mut matching = state
            .objects
            .iter()
            .filter(|((obj_type, id), _)| {
                *obj_type == k8s_type && namespace.map(|ns| ns == id.namespace).unwrap_or(true)
            })
            .map(|((_, id), value)| (id.clone(), value.clone()))
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| a.0.cmp(&b.0));
        matching
            .into_iter()
            .map(|(_, value)| K8sResource::from_value(value).map_err(Into::into))
            .collect()
    }

    async fn create(
        &self,
        k8s_type: &'static K8sType,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let mut state = self.lock();
        state.start_call(StoreOp::Create)?;
        let mut value = resource.clone();
        fill_type(k8s_type, &mut value);
        let id = value
            .get_id_ref()
            .ok_or_else(|| {
                crate::resource::InvalidResourceError::new("missing metadata.name", resource.clone())
            })?
            .to_owned();
        let key = (k8s_type, id.clone());
        if state.objects.contains_key(&key) {
            return Err(StoreError::Conflict(id, "object already exists".to_owned()));
        }
        let uid = state.next_uid();
        let version = state.next_resource_version();
        let meta = value.metadata_mut().ok_or_else(|| {
            crate::resource::InvalidResourceError::new("object must be a json object", resource.clone())
        })?;
        meta.insert("uid".to_owned(), Value::String(uid));
        meta.insert("resourceVersion".to_owned(), Value::String(version));
        state.objects.insert(key, value.clone());
        state.writes.push(WriteRecord {
            op: StoreOp::Create,
            kind: k8s_type.kind,
            id,
        });
        K8sResource::from_value(value).map_err(Into::into)
    }

    async fn replace(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let mut state = self.lock();
        state.start_call(StoreOp::Replace)?;
        let key = (k8s_type, id.to_owned());
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        state.check_version(id, &current, resource)?;

        let mut value = resource.clone();
        fill_type(k8s_type, &mut value);
        let version = state.next_resource_version();
        if let Some(obj) = value.as_object_mut() {
            match current.pointer("/status") {
                Some(status) => obj.insert("status".to_owned(), status.clone()),
                None => obj.remove("status"),
            };
        }
        let uid = current.pointer("/metadata/uid").cloned().unwrap_or(Value::Null);
        let meta = value.metadata_mut().ok_or_else(|| {
            crate::resource::InvalidResourceError::new("object must be a json object", resource.clone())
        })?;
        meta.insert("uid".to_owned(), uid);
        meta.insert("resourceVersion".to_owned(), Value::String(version));
        state.objects.insert(key, value.clone());
        state.writes.push(WriteRecord {
            op: StoreOp::Replace,
            kind: k8s_type.kind,
            id: id.to_owned(),
        });
        K8sResource::from_value(value).map_err(Into::into)
    }

    async fn update_status(
        &self,
        k8s_type: &'static K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        let mut state = self.lock();
        state.start_call(StoreOp::UpdateStatus)?;
        let key = (k8s_type, id.to_owned());
        let mut current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_owned()))?;
        state.check_version(id, &current, resource)?;

        let version = state.next_resource_version();
        let new_status = resource.pointer("/status").cloned().unwrap_or(Value::Null);
        if let Some(obj) = current.as_object_mut() {
            obj.insert("status".to_owned(), new_status);
        }
        if let Some(meta) = current.metadata_mut() {
            meta.insert("resourceVersion".to_owned(), Value::String(version));
        }
        state.objects.insert(key, current.clone());
        state.writes.push(WriteRecord {
            op: StoreOp::UpdateStatus,
            kind: k8s_type.kind,
            id: id.to_owned(),
        });
        K8sResource::from_value(current).map_err(Into::into)
    }

    async fn delete(&self, k8s_type: &'static K8sType, id: &ObjectIdRef<'_>) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.start_call(StoreOp::Delete)?;
        if state.objects.remove(&(k8s_type, id.to_owned())).is_some() {
            state.writes.push(WriteRecord {
                op: StoreOp::Delete,
                kind: k8s_type.kind,
                id: id.to_owned(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types::apps::v1::Deployment;
    use serde_json::json;
    use tokio::runtime;

    fn deployment(name: &str) -> Value {
        json!({
            "metadata": {"namespace": "ns", "name": name},
            "spec": {"replicas": 1},
        })
    }

    #[test]
    fn replace_with_stale_resource_version_is_a_conflict() {
        let store = MemoryStore::new();
        let created = store.insert(Deployment, deployment("gateway-a"));
        let id = created.get_object_id().to_owned();
        store.modify(Deployment, &id.as_id_ref(), |obj| {
            obj["spec"]["replicas"] = json!(3);
        });

        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let stale = created.as_ref().clone();
            let err = store
                .replace(Deployment, &id.as_id_ref(), &stale)
                .await
                .expect_err("expected a conflict");
            assert!(err.is_conflict());
            assert_eq!(0, store.write_count());

            let fresh = store.get(Deployment, &id.as_id_ref()).await.unwrap();
            let replaced = store
                .replace(Deployment, &id.as_id_ref(), fresh.as_ref())
                .await
                .expect("replace with current version failed");
            assert_ne!(fresh.resource_version(), replaced.resource_version());
            assert_eq!(fresh.uid(), replaced.uid());
            assert_eq!(1, store.write_count());
        });
    }

    #[test]
    fn update_status_only_writes_status() {
        let store = MemoryStore::new();
        let created = store.insert(Deployment, deployment("gateway-b"));
        let id = created.get_object_id().to_owned();
        let mut update = created.as_ref().clone();
        update["spec"]["replicas"] = json!(5);
        update["status"] = json!({"readyReplicas": 1});

        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let updated = store
                .update_status(Deployment, &id.as_id_ref(), &update)
                .await
                .unwrap();
            assert_eq!(Some(&json!(1)), updated.pointer("/spec/replicas"));
            assert_eq!(Some(&json!({"readyReplicas": 1})), updated.status());
            assert_eq!(
                vec![WriteRecord {
                    op: StoreOp::UpdateStatus,
                    kind: "Deployment",
                    id: id.clone(),
                }],
                store.writes()
            );
        });
    }

    #[test]
    fn injected_errors_are_returned_once() {
        let store = MemoryStore::new();
        store.insert(Deployment, deployment("gateway-c"));
        store.fail_next(StoreOp::Get, StoreError::Cancelled);
        let id = ObjectIdRef::new("ns", "gateway-c");

        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let err = store.get(Deployment, &id).await.expect_err("expected error");
            assert!(matches!(err, StoreError::Cancelled));
            store.get(Deployment, &id).await.expect("second get should succeed");
            assert_eq!(2, store.call_count(StoreOp::Get));

            let missing = store
                .get(Deployment, &ObjectIdRef::new("ns", "nope"))
                .await
                .expect_err("expected not found");
            assert!(missing.is_not_found());
        });
    }

    #[test]
    fn create_rejects_existing_objects() {
        let store = MemoryStore::new();
        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let created = store.create(Deployment, &deployment("gateway-d")).await.unwrap();
            assert_eq!("apps/v1", created.api_version());
            assert!(!created.uid().is_empty());
            let err = store
                .create(Deployment, &deployment("gateway-d"))
                .await
                .expect_err("expected conflict");
            assert!(err.is_conflict());
            assert_eq!(1, store.list(Deployment, Some("ns")).await.unwrap().len());
            assert!(store.list(Deployment, Some("other")).await.unwrap().is_empty());
        });
    }

    #[test]
    fn delete_is_recorded_only_when_something_was_removed() {
        let store = MemoryStore::new();
        store.insert(Deployment, deployment("gateway-e"));
        let id = ObjectIdRef::new("ns", "gateway-e");
        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            store.delete(Deployment, &id).await.unwrap();
            store.delete(Deployment, &id).await.expect("deleting a missing object is ok");
            assert!(store.peek(Deployment, &id).is_none());
            assert_eq!(2, store.call_count(StoreOp::Delete));
            assert_eq!(1, store.write_count());
            assert_eq!(StoreOp::Delete, store.writes()[0].op);
        });
    }
}
