use crate::gateway::{Gateway, GATEWAY};
use crate::label_selector::LabelSelector;
use crate::reconcile::ReconcileRequest;
use crate::resource::K8sResource;
use crate::store::Store;

use std::sync::Arc;

/// Returns a request for every gateway that references the secret with the given name. Only the
/// name is considered, never the contents of the secret.
pub fn map_secret_to_requests<'a, I>(secret_name: &str, gateways: I) -> Vec<ReconcileRequest>
where
    I: IntoIterator<Item = &'a Gateway>,
{
    gateways
        .into_iter()
        .filter(|gw| gw.references_secret(secret_name))
        .map(|gw| ReconcileRequest::from(gw.id()))
        .collect()
}

/// Turns events on secrets into reconcile requests for the gateways that reference them.
/// Secrets that don't match the label selector are ignored entirely.
///
/// The selector is evaluated against the secret's labels at the time of the event, so removing
/// the label from a secret means that changes to it will no longer trigger reconciliation of the
/// gateways that use it.
pub struct EventMapper {
    store: Arc<dyn Store>,
    selector: LabelSelector,
}

impl EventMapper {
    pub fn new(store: Arc<dyn Store>, selector: LabelSelector) -> EventMapper {
        EventMapper { store, selector }
    }

    /// The label predicate that gates whether `map` is invoked for a secret
    pub fn accepts(&self, secret: &K8sResource) -> bool {
        self.selector.matches_resource(secret.as_ref())
    }

    /// Applies the label predicate, and then maps the secret if it matches
    pub async fn map_event(&self, secret: &K8sResource) -> Vec<ReconcileRequest> {
        if self.accepts(secret) {
            self.map(secret).await
        } else {
            log::trace!(
                "Ignoring secret '{}' since it does not match selector '{}'",
                secret.get_object_id(),
                self.selector
            );
            Vec::new()
        }
    }

    /// Returns requests for every gateway in the secret's namespace that references the secret.
    /// Failures to list the gateways are logged, and result in no requests.
    pub async fn map(&self, secret: &K8sResource) -> Vec<ReconcileRequest> {
        let secret_id = secret.get_object_id();
        let gateways = match self.store.list(GATEWAY, secret_id.namespace()).await {
            Ok(list) => list,
            Err(err) => {
                log::error!(
                    "Failed to list gateways while mapping secret '{}': {}",
                    secret_id,
                    err
                );
                return Vec::new();
            }
        };
        let gateways = gateways
            .into_iter()
            .filter_map(|resource| match Gateway::from_resource(resource) {
                Ok(gw) => Some(gw),
                Err(err) => {
                    log::warn!("Skipping invalid gateway while mapping secret: {}", err);
                    None
                }
            })
            .collect::<Vec<_>>();
        let requests = map_secret_to_requests(secret_id.name(), gateways.iter());
        log::debug!(
            "Secret '{}' is referenced by {} gateway(s)",
            secret_id,
            requests.len()
        );
        requests
    }
}
