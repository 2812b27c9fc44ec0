mod json_ext;
mod object_id;

pub use self::json_ext::ResourceJson;
pub use self::object_id::{ObjectId, ObjectIdRef};

use serde_json::Value;

pub type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl std::fmt::Display for InvalidResourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Invalid Resource: {}", self.message)
    }
}

impl std::error::Error for InvalidResourceError {}

/// A back-reference from a dependent object to the resource that owns it. Only the fields
/// needed to route events back to the owner are kept.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

impl OwnerReference {
    pub fn is_controller(&self) -> bool {
        self.controller.unwrap_or(false)
    }
}

/// A Kubernetes resource as it was read from the store. This is a thin wrapper around the raw
/// json, which is validated to have all of the metadata that the operator relies on.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct K8sResource(Value);

impl K8sResource {
    pub fn from_value(value: Value) -> Result<K8sResource, InvalidResourceError> {
        if let Err(msg) = K8sResource::validate(&value) {
            Err(InvalidResourceError {
                message: msg,
                value,
            })
        } else {
            Ok(K8sResource(value))
        }
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn resource_version(&self) -> &str {
        self.str_value("/metadata/resourceVersion").unwrap_or("")
    }

    pub fn get_label_value(&self, label: &str) -> Option<&str> {
        self.labels()?.get(label).and_then(Value::as_str)
    }

    pub fn labels(&self) -> Option<&JsonObject> {
        self.0.pointer("/metadata/labels")?.as_object()
    }

    pub fn uid(&self) -> &str {
        self.str_value("/metadata/uid").unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.str_value("/metadata/name").unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_value("/metadata/namespace")
    }

    pub fn api_version(&self) -> &str {
        self.str_value("/apiVersion").unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.str_value("/kind").unwrap_or("")
    }

    pub fn status(&self) -> Option<&Value> {
        self.0.pointer("/status")
    }

    pub fn get_object_id(&self) -> ObjectIdRef {
        let ns = self.namespace().unwrap_or("");
        let name = self.name();
        ObjectIdRef::new(ns, name)
    }

    pub fn generation(&self) -> i64 {
        self.0
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(-1)
    }

    pub fn is_deletion_timestamp_set(&self) -> bool {
        self.0.pointer("/metadata/deletionTimestamp").is_some()
    }

    /// Returns all of the owner references that could be parsed. Malformed entries are skipped.
    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.0
            .pointer("/metadata/ownerReferences")
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| serde_json::from_value(r.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the owner reference that is marked as the managing controller, if there is one
    pub fn controller_owner(&self) -> Option<OwnerReference> {
        self.owner_references()
            .into_iter()
            .find(OwnerReference::is_controller)
    }

    fn validate(value: &Value) -> Result<(), &'static str> {
        value
            .pointer("/metadata/resourceVersion")
            .ok_or("missing metadata.resourceVersion")?;
        value.pointer("/metadata/name").ok_or("missing metadata.name")?;
        value.pointer("/metadata/uid").ok_or("missing metadata.uid")?;
        value.pointer("/apiVersion").ok_or("missing apiVersion")?;
        value.pointer("/kind").ok_or("missing kind")?;
        Ok(())
    }

    pub fn str_value(&self, pointer: &str) -> Option<&str> {
        self.0.pointer(pointer).and_then(Value::as_str)
    }

    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }
}

impl std::convert::AsRef<Value> for K8sResource {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl From<K8sResource> for Value {
    fn from(resource: K8sResource) -> Value {
        resource.into_value()
    }
}

impl std::fmt::Display for K8sResource {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
