use crate::config::MANAGED_BY_LABEL;
use crate::error::Error;
use crate::gateway::factory::ResourceFactory;
use crate::gateway::{Gateway, GATEWAY};
use crate::k8s_types::K8sType;
use crate::reconcile::compare::compare_values;
use crate::reconcile::{ConvergenceDelegate, ReconcileResult};
use crate::resource::{InvalidResourceError, ResourceJson};
use crate::store::Store;

use async_trait::async_trait;
use serde_json::{json, Value};

use std::sync::Arc;

/// Adds the owner reference and the managed-by label to a desired child, so that the child is
/// garbage collected along with the gateway, and so that its events are routed back to it.
pub fn add_parent_references(
    operator_name: &str,
    gateway: &Gateway,
    child: &mut Value,
) -> Result<(), InvalidResourceError> {
    if !child.is_object() {
        return Err(InvalidResourceError::new(
            "desired child must be a json object",
            child.clone(),
        ));
    }
    child
        .metadata_object_mut("labels")
        .ok_or_else(|| InvalidResourceError::new("child metadata must be an object", Value::Null))?
        .insert(MANAGED_BY_LABEL.to_owned(), Value::String(operator_name.to_owned()));

    let owner_ref = json!({
        "apiVersion": GATEWAY.api_version,
        "kind": GATEWAY.kind,
        "name": gateway.name(),
        "uid": gateway.uid(),
        "controller": true,
        "blockOwnerDeletion": true,
    });
    let meta = child
        .metadata_mut()
        .ok_or_else(|| InvalidResourceError::new("child metadata must be an object", Value::Null))?;
    let refs = meta
        .entry("ownerReferences")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !refs.is_array() {
        *refs = Value::Array(Vec::new());
    }
    if let Value::Array(refs) = refs {
        refs.retain(|r| r.get("uid").and_then(Value::as_str) != Some(gateway.uid()));
        refs.push(owner_ref);
    }
    Ok(())
}

/// Writes every value of `desired` into `live`, recursing into objects. Arrays and scalars are
/// replaced wholesale. Fields that only exist in `live` are kept, since many of them are filled
/// in by the api server and can't be cleared by an update.
fn merge_desired(live: &mut Value, desired: &Value) {
    match (live, desired) {
        (Value::Object(live_obj), Value::Object(desired_obj)) => {
            for (key, desired_value) in desired_obj {
                match live_obj.get_mut(key) {
                    Some(live_value) => merge_desired(live_value, desired_value),
                    None => {
                        live_obj.insert(key.clone(), desired_value.clone());
                    }
                }
            }
        }
        (live, desired) => *live = desired.clone(),
    }
}

fn list_len(value: &Value, path: &str) -> usize {
    value
        .pointer(path)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0)
}

/// Returns the exclusive lists that have entries in `live` which aren't desired. The superset
/// comparison already ensures that every desired entry is present, so a length mismatch means
/// that something is left over.
fn lists_with_extra_entries(
    live: &Value,
    desired: &Value,
    paths: &'static [&'static str],
) -> Vec<&'static str> {
    paths
        .iter()
        .copied()
        .filter(|path| list_len(live, path) != list_len(desired, path))
        .collect()
}

fn remove_pointer(value: &mut Value, path: &str) {
    if let Some((parent, key)) = path.rsplit_once('/') {
        if let Some(Value::Object(obj)) = value.pointer_mut(parent) {
            obj.remove(key);
        }
    }
}

/// A `ConvergenceDelegate` that writes the children produced by a `ResourceFactory`. Each child
/// is created if it doesn't exist, replaced if the live object differs from the desired one, and
/// otherwise left alone. Children that the gateway controls but no longer wants are deleted. A
/// pass that writes anything asks to be requeued, so that the next pass can observe the results.
/// A pass where everything is already converged does no writes.
pub struct ChildApplier<F: ResourceFactory> {
    store: Arc<dyn Store>,
    factory: F,
    operator_name: String,
}

impl<F: ResourceFactory> ChildApplier<F> {
    pub fn new(store: Arc<dyn Store>, factory: F, operator_name: impl Into<String>) -> Self {
        ChildApplier {
            store,
            factory,
            operator_name: operator_name.into(),
        }
    }

    /// Returns true if anything was written
    async fn apply_child(
        &self,
        gateway: &Gateway,
        k8s_type: &'static K8sType,
        desired: &Value,
    ) -> Result<bool, Error> {
        let id = desired
            .get_id_ref()
            .ok_or_else(|| InvalidResourceError::new("desired child is missing a name", desired.clone()))?
            .to_owned();

        let live = match self.store.get(k8s_type, &id.as_id_ref()).await {
            Ok(live) => live,
            Err(err) if err.is_not_found() => {
                log::info!(
                    "Creating {} '{}' for gateway '{}'",
                    k8s_type.kind,
                    id,
                    gateway.id()
                );
                self.store.create(k8s_type, desired).await?;
                return Ok(true);
            }
            Err(err) => return Err(err.into()),
        };

        let exclusive = self.factory.exclusive_lists(k8s_type);
        let diffs = compare_values(live.as_ref(), desired);
        let extra = lists_with_extra_entries(live.as_ref(), desired, exclusive);
        if diffs.is_empty() && extra.is_empty() {
            log::debug!("{} '{}' is up to date", k8s_type.kind, id);
            return Ok(false);
        }
        log::info!(
            "Updating {} '{}' for gateway '{}', {}, lists with extra entries: {:?}",
            k8s_type.kind,
            id,
            gateway.id(),
            diffs,
            extra
        );
        // the merged object carries the live resourceVersion, so a concurrent change is a conflict
        let mut updated = live.as_ref().clone();
        merge_desired(&mut updated, desired);
        for path in exclusive.iter().filter(|p| desired.pointer(p).is_none()) {
            remove_pointer(&mut updated, path);
        }
        self.store
            .replace(k8s_type, &id.as_id_ref(), &updated)
            .await?;
        Ok(true)
    }

    /// Deletes the child of the given type if it exists and is controlled by the gateway. Returns
    /// true if anything was deleted.
    async fn delete_undesired_child(
        &self,
        gateway: &Gateway,
        k8s_type: &'static K8sType,
    ) -> Result<bool, Error> {
        let id = self.factory.child_id(gateway, k8s_type);
        let existing = match self.store.get(k8s_type, &id.as_id_ref()).await {
            Ok(existing) => existing,
            Err(err) if err.is_not_found() => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let controlled = existing
            .controller_owner()
            .map(|owner| owner.uid == gateway.uid())
            .unwrap_or(false);
        if !controlled {
            log::debug!(
                "Leaving {} '{}' alone since it's not controlled by gateway '{}'",
                k8s_type.kind,
                id,
                gateway.id()
            );
            return Ok(false);
        }
        if existing.is_deletion_timestamp_set() {
            return Ok(false);
        }
        log::info!(
            "Deleting {} '{}' since gateway '{}' no longer needs it",
            k8s_type.kind,
            id,
            gateway.id()
        );
        self.store.delete(k8s_type, &id.as_id_ref()).await?;
        Ok(true)
    }
}

#[async_trait]
impl<F: ResourceFactory> ConvergenceDelegate for ChildApplier<F> {
    async fn apply(&self, gateway: &Gateway) -> Result<ReconcileResult, Error> {
        let mut write_count = 0;
        let desired_children = self.factory.desired_children(gateway);
        for (k8s_type, desired) in desired_children.iter() {
            let mut desired = desired.clone();
            add_parent_references(self.operator_name.as_str(), gateway, &mut desired)?;
            if self.apply_child(gateway, *k8s_type, &desired).await? {
                write_count += 1;
            }
        }
        // deletes happen only once everything that's desired has been written
        for k8s_type in self.factory.child_types() {
            if desired_children.iter().any(|(t, _)| *t == k8s_type) {
                continue;
            }
            if self.delete_undesired_child(gateway, k8s_type).await? {
                write_count += 1;
            }
        }
        if write_count > 0 {
            log::debug!(
                "Wrote {} children for gateway '{}'",
                write_count,
                gateway.id()
            );
            Ok(ReconcileResult::requeue())
        } else {
            Ok(ReconcileResult::done())
        }
    }
}
