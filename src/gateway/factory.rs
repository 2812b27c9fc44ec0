//! Computes the desired state of the children of a gateway. The factory is a pure function of the
//! gateway. It never reads from the store, and it doesn't set owner references, which are added
//! by the `ChildApplier` when the children are written.
use crate::gateway::{child_name, deployment_id, ingress_id, service_id, Gateway};
use crate::k8s_types::apps::v1::Deployment;
use crate::k8s_types::core::v1::Service;
use crate::k8s_types::networking_k8s_io::v1::Ingress;
use crate::k8s_types::K8sType;
use crate::resource::ObjectId;

use serde_json::{json, Value};

pub const GATEWAY_PORT: u16 = 8080;
pub const MANAGEMENT_PORT: u16 = 8090;
pub const CONTAINER_NAME: &str = "gateway";
pub const CONFIG_VOLUME_NAME: &str = "gateway-configuration";
pub const CONFIG_MOUNT_PATH: &str = "/opt/gateway/config";
pub const CONFIG_FILE_KEY: &str = "config.json";

/// Lists in the deployment that only ever hold what the gateway spec asks for
const DEPLOYMENT_EXCLUSIVE_LISTS: &[&str] = &[
    "/spec/template/spec/volumes",
    "/spec/template/spec/containers/0/env",
    "/spec/template/spec/containers/0/volumeMounts",
];

/// Produces the desired children of a gateway
pub trait ResourceFactory: Send + Sync + 'static {
    fn deployment(&self, gateway: &Gateway) -> Value;

    fn service(&self, gateway: &Gateway) -> Value;

    /// Returns `None` when the gateway shouldn't be exposed outside of the cluster
    fn ingress(&self, gateway: &Gateway) -> Option<Value>;

    /// All of the desired children, in the order they should be applied
    fn desired_children(&self, gateway: &Gateway) -> Vec<(&'static K8sType, Value)> {
        let mut children = vec![
            (Deployment, self.deployment(gateway)),
            (Service, self.service(gateway)),
        ];
        if let Some(ingress) = self.ingress(gateway) {
            children.push((Ingress, ingress));
        }
        children
    }

    /// Every type of child that can be produced. Children of these types that are controlled by
    /// the gateway, but are missing from `desired_children`, are deleted.
    fn child_types(&self) -> Vec<&'static K8sType> {
        vec![Deployment, Service, Ingress]
    }

    /// The id that a child of the given type has, whether or not it's currently desired
    fn child_id(&self, gateway: &Gateway, _k8s_type: &'static K8sType) -> ObjectId {
        ObjectId::new(gateway.namespace().to_owned(), child_name(gateway.name()))
    }

    /// Json pointers to lists that must hold exactly the desired entries, and that are removed
    /// when the desired child doesn't have them. All other lists only need to contain the desired
    /// entries, since the api server may add its own.
    fn exclusive_lists(&self, _k8s_type: &'static K8sType) -> &'static [&'static str] {
        &[]
    }
}

/// The factory that's used by the operator binary. Gateways run as a single container
/// deployment, with the embedded configuration secret mounted as a volume when one is
/// referenced.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultGatewayFactory {
    default_image: String,
}

impl DefaultGatewayFactory {
    pub fn new(default_image: impl Into<String>) -> DefaultGatewayFactory {
        DefaultGatewayFactory {
            default_image: default_image.into(),
        }
    }

    fn image<'a>(&'a self, gateway: &'a Gateway) -> &'a str {
        gateway
            .spec
            .image
            .as_deref()
            .filter(|image| !image.is_empty())
            .unwrap_or(self.default_image.as_str())
    }
}

fn selector_labels(gateway: &Gateway) -> Value {
    json!({
        "app.kubernetes.io/name": "gateway",
        "app.kubernetes.io/instance": gateway.name(),
    })
}

impl ResourceFactory for DefaultGatewayFactory {
    fn exclusive_lists(&self, k8s_type: &'static K8sType) -> &'static [&'static str] {
        if k8s_type == Deployment {
            DEPLOYMENT_EXCLUSIVE_LISTS
        } else {
            &[]
        }
    }

    fn deployment(&self, gateway: &Gateway) -> Value {
        let id = deployment_id(gateway);
        let labels = selector_labels(gateway);

        let mut container = json!({
            "name": CONTAINER_NAME,
            "image": self.image(gateway),
            "ports": [
                {"name": "proxy", "containerPort": GATEWAY_PORT, "protocol": "TCP"},
                {"name": "management", "containerPort": MANAGEMENT_PORT, "protocol": "TCP"},
            ],
            "readinessProbe": {
                "httpGet": {"path": "/status/ready", "port": MANAGEMENT_PORT},
                "initialDelaySeconds": 5,
                "periodSeconds": 10,
            },
            "livenessProbe": {
                "httpGet": {"path": "/status/live", "port": MANAGEMENT_PORT},
                "initialDelaySeconds": 10,
                "periodSeconds": 10,
            },
        });
        let mut pod_spec = json!({
            "containers": [],
        });

        if let Some(secret_name) = gateway.secret_ref_name() {
            container["env"] = json!([{
                "name": "GATEWAY_CONFIGURATION_FILE",
                "value": format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_FILE_KEY),
            }]);
            container["volumeMounts"] = json!([{
                "name": CONFIG_VOLUME_NAME,
                "mountPath": CONFIG_MOUNT_PATH,
                "readOnly": true,
            }]);
            pod_spec["volumes"] = json!([{
                "name": CONFIG_VOLUME_NAME,
                "secret": {"secretName": secret_name},
            }]);
        }
        pod_spec["containers"] = json!([container]);

        json!({
            "apiVersion": Deployment.api_version,
            "kind": Deployment.kind,
            "metadata": {
                "namespace": id.namespace,
                "name": id.name,
                "labels": labels.clone(),
            },
            "spec": {
                "replicas": gateway.spec.replicas.unwrap_or(1),
                "selector": {"matchLabels": labels.clone()},
                "template": {
                    "metadata": {"labels": labels},
                    "spec": pod_spec,
                },
            },
        })
    }

    fn service(&self, gateway: &Gateway) -> Value {
        let id = service_id(gateway);
        let labels = selector_labels(gateway);
        json!({
            "apiVersion": Service.api_version,
            "kind": Service.kind,
            "metadata": {
                "namespace": id.namespace,
                "name": id.name,
                "labels": labels.clone(),
            },
            "spec": {
                "selector": labels,
                "ports": [
                    {"name": "proxy", "port": GATEWAY_PORT, "targetPort": GATEWAY_PORT, "protocol": "TCP"},
                    {"name": "management", "port": MANAGEMENT_PORT, "targetPort": MANAGEMENT_PORT, "protocol": "TCP"},
                ],
            },
        })
    }

    fn ingress(&self, gateway: &Gateway) -> Option<Value> {
        let host = gateway.exposed_host()?;
        let id = ingress_id(gateway);
        let service_name = service_id(gateway).name;
        Some(json!({
            "apiVersion": Ingress.api_version,
            "kind": Ingress.kind,
            "metadata": {
                "namespace": id.namespace,
                "name": id.name,
                "labels": selector_labels(gateway),
            },
            "spec": {
                "rules": [{
                    "host": host,
                    "http": {
                        "paths": [{
                            "path": "/",
                            "pathType": "Prefix",
                            "backend": {
                                "service": {
                                    "name": service_name,
                                    "port": {"number": GATEWAY_PORT},
                                },
                            },
                        }],
                    },
                }],
            },
        }))
    }
}
