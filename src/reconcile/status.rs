use crate::error::Error;
use crate::gateway::{deployment_id, Gateway, GATEWAY};
use crate::k8s_types::apps::v1::Deployment;
use crate::reconcile::ReconcileResult;
use crate::resource::{K8sResource, ObjectId};
use crate::store::Store;

use serde_json::Value;

use std::fmt::{self, Display};
use std::sync::Arc;

/// The image of a deployment could not be determined
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentImageError {
    pub deployment: ObjectId,
    pub reason: &'static str,
}

impl Display for DeploymentImageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Cannot determine image of deployment '{}': {}",
            self.deployment, self.reason
        )
    }
}

impl std::error::Error for DeploymentImageError {}

/// Returns the image of the first container in the deployment's pod template. Gateways only ever
/// run a single container, so any extra containers (injected sidecars, for example) are ignored.
pub fn deployed_image(deployment: &K8sResource) -> Result<&str, DeploymentImageError> {
    let err = |reason| DeploymentImageError {
        deployment: deployment.get_object_id().to_owned(),
        reason,
    };
    let containers = deployment
        .pointer("/spec/template/spec/containers")
        .and_then(Value::as_array)
        .ok_or_else(|| err("pod template has no containers"))?;
    let first = containers
        .first()
        .ok_or_else(|| err("pod template has no containers"))?;
    if containers.len() > 1 {
        log::warn!(
            "Deployment '{}' has {} containers, using the image of the first one",
            deployment.get_object_id(),
            containers.len()
        );
    }
    first
        .get("image")
        .and_then(Value::as_str)
        .ok_or_else(|| err("first container has no image"))
}

/// Keeps `status.deployedImage` of a gateway in line with the image that's actually running in
/// its deployment.
pub struct StatusConverger {
    store: Arc<dyn Store>,
}

impl StatusConverger {
    pub fn new(store: Arc<dyn Store>) -> StatusConverger {
        StatusConverger { store }
    }

    pub async fn converge(&self, gateway: &Gateway) -> Result<ReconcileResult, Error> {
        let id = deployment_id(gateway);
        let deployment = match self.store.get(Deployment, &id.as_id_ref()).await {
            Ok(d) => d,
            Err(err) if err.is_not_found() => {
                log::debug!(
                    "Deployment '{}' for gateway '{}' does not exist yet",
                    id,
                    gateway.id()
                );
                return Ok(ReconcileResult::requeue());
            }
            Err(err) => return Err(err.into()),
        };

        let image = deployed_image(&deployment)?;
        let current = gateway.status.deployed_image.as_deref();
        if current == Some(image) {
            return Ok(ReconcileResult::done());
        }

        log::info!(
            "Updating deployedImage of gateway '{}' from '{}' to '{}'",
            gateway.id(),
            current.unwrap_or(""),
            image
        );
        let update = gateway.status_update(image);
        self.store
            .update_status(GATEWAY, &gateway.id(), &update)
            .await?;
        Ok(ReconcileResult::requeue())
    }
}
