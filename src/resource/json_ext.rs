use crate::resource::{JsonObject, ObjectIdRef};

use serde_json::Value;

pub static API_VERSION_POINTER: &str = "/apiVersion";
pub static KIND_POINTER: &str = "/kind";
pub static NAMESPACE_POINTER: &str = "/metadata/namespace";
pub static NAME_POINTER: &str = "/metadata/name";
pub static RESOURCE_VERSION_POINTER: &str = "/metadata/resourceVersion";

/// Accessors for the well-known fields of a raw json resource, such as the desired children
/// that are produced by a `ResourceFactory` before they have ever been persisted.
pub trait ResourceJson {
    fn get_api_version(&self) -> Option<&str>;
    fn get_kind(&self) -> Option<&str>;
    fn get_namespace(&self) -> Option<&str>;
    fn get_name(&self) -> Option<&str>;

    /// returns a mutable reference to `metadata`, inserting an empty object if it's missing.
    /// Returns None only if this value is not an object, or if `metadata` is not an object.
    fn metadata_mut(&mut self) -> Option<&mut JsonObject>;

    fn get_id_ref(&self) -> Option<ObjectIdRef> {
        let namespace = self.get_namespace().unwrap_or("");
        let name = self.get_name()?;
        Some(ObjectIdRef::new(namespace, name))
    }

    /// returns a mutable reference to the object stored under `metadata.<key>`, inserting an
    /// empty object if the key is missing or holds something else
    fn metadata_object_mut(&mut self, key: &str) -> Option<&mut JsonObject> {
        let meta = self.metadata_mut()?;
        let needs_reset = meta.get(key).map(|v| !v.is_object()).unwrap_or(true);
        if needs_reset {
            meta.insert(key.to_owned(), Value::Object(JsonObject::new()));
        }
        meta.get_mut(key).and_then(Value::as_object_mut)
    }
}

fn str_value<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

impl ResourceJson for Value {
    fn get_api_version(&self) -> Option<&str> {
        str_value(self, API_VERSION_POINTER)
    }

    fn get_kind(&self) -> Option<&str> {
        str_value(self, KIND_POINTER)
    }

    fn get_namespace(&self) -> Option<&str> {
        str_value(self, NAMESPACE_POINTER)
    }

    fn get_name(&self) -> Option<&str> {
        str_value(self, NAME_POINTER)
    }

    fn metadata_mut(&mut self) -> Option<&mut JsonObject> {
        let obj = self.as_object_mut()?;
        let meta = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(JsonObject::new()));
        meta.as_object_mut()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_object_mut_creates_missing_labels() {
        let mut value = json!({
            "metadata": {
                "name": "foo",
            }
        });
        value
            .metadata_object_mut("labels")
            .expect("labels must be insertable")
            .insert("app".to_owned(), json!("gateway"));
        assert_eq!(Some("gateway"), str_value(&value, "/metadata/labels/app"));
        assert_eq!(Some(ObjectIdRef::new("", "foo")), value.get_id_ref());
    }

    #[test]
    fn metadata_mut_returns_none_for_non_objects() {
        let mut value = json!(["not", "a", "resource"]);
        assert!(value.metadata_mut().is_none());
    }
}
