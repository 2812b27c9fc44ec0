//! The `Gateway` custom resource. Gateways are read from the store as raw json, and then parsed
//! into a typed `GatewaySpec` and `GatewayStatus`. Only the status is ever written back.
pub mod factory;

use crate::k8s_types::K8sType;
use crate::resource::{InvalidResourceError, K8sResource, ObjectId, ObjectIdRef};

use serde_json::Value;

pub static GATEWAY: &K8sType = &K8sType {
    api_version: "apps.gateway-operator.io/v1alpha1",
    kind: "Gateway",
    plural_kind: "gateways",
};

/// Prefix of the names of all the children of a gateway
pub const CHILD_NAME_PREFIX: &str = "gateway-";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedHost {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_configuration_secret_ref: Option<SecretReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_host: Option<ExposedHost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    /// Unset until the first status write, and may be stored as an explicit `null`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_image: Option<String>,
}

/// A gateway as read from the store. The raw resource is kept around so that the status can be
/// written back with its original metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Gateway {
    resource: K8sResource,
    pub spec: GatewaySpec,
    pub status: GatewayStatus,
}

impl Gateway {
    pub fn from_resource(resource: K8sResource) -> Result<Gateway, InvalidResourceError> {
        let spec = match resource.pointer("/spec") {
            Some(spec) => serde_json::from_value(spec.clone()).map_err(|_| {
                InvalidResourceError::new("invalid gateway spec", resource.as_ref().clone())
            })?,
            None => GatewaySpec::default(),
        };
        let status = match resource.status() {
            Some(Value::Null) | None => GatewayStatus::default(),
            Some(status) => serde_json::from_value(status.clone()).map_err(|_| {
                InvalidResourceError::new("invalid gateway status", resource.as_ref().clone())
            })?,
        };
        Ok(Gateway {
            resource,
            spec,
            status,
        })
    }

    pub fn resource(&self) -> &K8sResource {
        &self.resource
    }

    pub fn id(&self) -> ObjectIdRef<'_> {
        self.resource.get_object_id()
    }

    pub fn name(&self) -> &str {
        self.resource.name()
    }

    pub fn namespace(&self) -> &str {
        self.resource.namespace().unwrap_or("")
    }

    pub fn uid(&self) -> &str {
        self.resource.uid()
    }

    pub fn secret_ref_name(&self) -> Option<&str> {
        self.spec
            .embedded_configuration_secret_ref
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .filter(|name| !name.is_empty())
    }

    /// Returns true if this gateway references the secret with the given name
    pub fn references_secret(&self, secret_name: &str) -> bool {
        self.secret_ref_name() == Some(secret_name)
    }

    pub fn exposed_host(&self) -> Option<&str> {
        self.spec
            .exposed_host
            .as_ref()
            .and_then(|h| h.host.as_deref())
            .filter(|host| !host.is_empty())
    }

    /// Builds the body of a status update that sets `deployedImage`. Other fields of the existing
    /// status are preserved, and the current resourceVersion is included so that the write is
    /// rejected if the gateway was modified since it was read.
    pub fn status_update(&self, deployed_image: &str) -> Value {
        let mut status = match self.resource.status() {
            Some(Value::Object(existing)) => existing.clone(),
            _ => serde_json::Map::new(),
        };
        status.insert(
            "deployedImage".to_owned(),
            Value::String(deployed_image.to_owned()),
        );
        serde_json::json!({
            "apiVersion": self.resource.api_version(),
            "kind": self.resource.kind(),
            "metadata": {
                "namespace": self.namespace(),
                "name": self.name(),
                "resourceVersion": self.resource.resource_version(),
            },
            "status": status,
        })
    }
}

/// The name shared by all of the children of the gateway with the given name
pub fn child_name(gateway_name: &str) -> String {
    format!("{}{}", CHILD_NAME_PREFIX, gateway_name)
}

/// The id of the deployment that's managed for the given gateway. This is the single place
/// that this is derived, so that the status converger always looks at the same deployment
/// that the resource factory produces.
pub fn deployment_id(gateway: &Gateway) -> ObjectId {
    ObjectId::new(gateway.namespace().to_owned(), child_name(gateway.name()))
}

pub fn service_id(gateway: &Gateway) -> ObjectId {
    ObjectId::new(gateway.namespace().to_owned(), child_name(gateway.name()))
}

pub fn ingress_id(gateway: &Gateway) -> ObjectId {
    ObjectId::new(gateway.namespace().to_owned(), child_name(gateway.name()))
}

#[cfg(test)]
pub(crate) fn gateway_json(namespace: &str, name: &str, spec: Value) -> Value {
    serde_json::json!({
        "apiVersion": GATEWAY.api_version,
        "kind": GATEWAY.kind,
        "metadata": {
            "namespace": namespace,
            "name": name,
        },
        "spec": spec,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn gateway(spec: Value, status: Option<Value>) -> Gateway {
        let mut value = gateway_json("ns", "foo", spec);
        value["metadata"]["uid"] = json!("gw-uid");
        value["metadata"]["resourceVersion"] = json!("7");
        if let Some(s) = status {
            value["status"] = s;
        }
        Gateway::from_resource(K8sResource::from_value(value).unwrap()).unwrap()
    }

    #[test]
    fn parses_spec_and_status() {
        let gw = gateway(
            json!({
                "embeddedConfigurationSecretRef": {"name": "config"},
                "exposedHost": {"host": "gw.example.com"},
                "replicas": 2,
            }),
            Some(json!({"deployedImage": "img:1"})),
        );
        assert_eq!(Some("config"), gw.secret_ref_name());
        assert!(gw.references_secret("config"));
        assert!(!gw.references_secret("other"));
        assert_eq!(Some("gw.example.com"), gw.exposed_host());
        assert_eq!(Some(2), gw.spec.replicas);
        assert_eq!(Some("img:1"), gw.status.deployed_image.as_deref());
        assert_eq!(ObjectIdRef::new("ns", "foo"), gw.id());
    }

    #[test]
    fn missing_and_empty_references_are_none() {
        let gw = gateway(
            json!({"embeddedConfigurationSecretRef": {"name": ""}, "exposedHost": {}}),
            None,
        );
        assert_eq!(None, gw.secret_ref_name());
        assert_eq!(None, gw.exposed_host());
        assert_eq!(None, gw.status.deployed_image);
    }

    #[test]
    fn null_deployed_image_is_unset() {
        let gw = gateway(json!({}), Some(json!({"deployedImage": null})));
        assert_eq!(None, gw.status.deployed_image);
        assert_eq!(
            Some(&json!({"deployedImage": "img:2"})),
            gw.status_update("img:2").pointer("/status")
        );
    }

    #[test]
    fn children_share_the_prefixed_name() {
        let gw = gateway(json!({}), None);
        let expected = ObjectId::new("ns".to_owned(), "gateway-foo".to_owned());
        assert_eq!(expected, deployment_id(&gw));
        assert_eq!(expected, service_id(&gw));
        assert_eq!(expected, ingress_id(&gw));
    }

    #[test]
    fn status_update_preserves_other_fields_and_version() {
        let gw = gateway(json!({}), Some(json!({"deployedImage": "old", "other": true})));
        let update = gw.status_update("new");
        assert_eq!(Some(&json!("7")), update.pointer("/metadata/resourceVersion"));
        assert_eq!(
            Some(&json!({"deployedImage": "new", "other": true})),
            update.pointer("/status")
        );
        assert_eq!(Some(&json!("Gateway")), update.pointer("/kind"));
    }

    #[test]
    fn invalid_spec_is_rejected() {
        let mut value = gateway_json("ns", "foo", json!({"replicas": "lots"}));
        value["metadata"]["uid"] = json!("gw-uid");
        value["metadata"]["resourceVersion"] = json!("1");
        let err = Gateway::from_resource(K8sResource::from_value(value).unwrap())
            .expect_err("expected invalid spec");
        assert_eq!("invalid gateway spec", err.message);
    }
}
