//! Watches that turn changes in the cluster into reconcile requests. Each informer lists all the
//! objects of one type, and then watches for changes starting from the resourceVersion of the
//! list. Every listed object and every watch event is routed to the gateways that it concerns,
//! and those are added to the work queue.
use crate::gateway::GATEWAY;
use crate::k8s_types::K8sType;
use crate::reconcile::{EventMapper, ReconcileRequest};
use crate::resource::{InvalidResourceError, K8sResource};
use crate::runner::client::{ApiError, Client, Error as ClientError, ObjectList, WatchEvent};
use crate::runner::metrics::WatcherMetrics;
use crate::runner::queue::WorkQueue;

use serde_json::Value;

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

/// How long to wait before listing again after an error
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Decides which gateways an event on an object concerns
pub enum EventRouter {
    /// Events on gateways reconcile the gateway itself
    Gateway,
    /// Events on deployments, services, and ingresses reconcile their controlling gateway
    Dependent,
    /// Events on secrets are mapped to the gateways that reference them
    Secret(Arc<EventMapper>),
}

impl EventRouter {
    pub async fn requests_for(&self, resource: &K8sResource) -> Vec<ReconcileRequest> {
        match self {
            EventRouter::Gateway => vec![ReconcileRequest::from(resource.get_object_id())],
            EventRouter::Dependent => owner_request(resource).into_iter().collect(),
            EventRouter::Secret(mapper) => mapper.map_event(resource).await,
        }
    }
}

/// Returns a request for the gateway that controls the given object, if there is one. Objects
/// that are owned by anything else are ignored.
pub fn owner_request(resource: &K8sResource) -> Option<ReconcileRequest> {
    let owner = resource.controller_owner()?;
    if !GATEWAY.is_type(owner.api_version.as_str(), owner.kind.as_str()) {
        log::trace!(
            "Ignoring '{}' since it is controlled by a {}",
            resource.get_object_id(),
            owner.kind
        );
        return None;
    }
    let namespace = resource.namespace().unwrap_or("");
    Some(ReconcileRequest::new(namespace, owner.name))
}

#[derive(Debug)]
enum InformerError {
    Client(ClientError),
    ResourceVersionExpired,
    InvalidResource(InvalidResourceError),
    Api(ApiError),
}

impl InformerError {
    fn is_resource_version_expired(&self) -> bool {
        matches!(self, InformerError::ResourceVersionExpired)
    }
}

impl Display for InformerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InformerError::Client(err) => write!(f, "Client Error: {}", err),
            InformerError::ResourceVersionExpired => {
                f.write_str("Resource Version has expired, watcher is out of sync")
            }
            InformerError::InvalidResource(e) => {
                write!(f, "Invalid resource returned from api server: {}", e)
            }
            InformerError::Api(e) => write!(f, "Watcher received api error: {}", e),
        }
    }
}

impl From<ApiError> for InformerError {
    fn from(err: ApiError) -> InformerError {
        if err.code == 410 {
            InformerError::ResourceVersionExpired
        } else {
            InformerError::Api(err)
        }
    }
}

impl From<InvalidResourceError> for InformerError {
    fn from(err: InvalidResourceError) -> InformerError {
        InformerError::InvalidResource(err)
    }
}

impl From<ClientError> for InformerError {
    fn from(err: ClientError) -> InformerError {
        if err.is_http_410() {
            InformerError::ResourceVersionExpired
        } else {
            InformerError::Client(err)
        }
    }
}

pub struct Informer {
    client: Client,
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    router: EventRouter,
    queue: WorkQueue<ReconcileRequest>,
    metrics: WatcherMetrics,
}

impl Informer {
    pub fn new(
        client: Client,
        k8s_type: &'static K8sType,
        namespace: Option<String>,
        router: EventRouter,
        queue: WorkQueue<ReconcileRequest>,
        metrics: WatcherMetrics,
    ) -> Informer {
        Informer {
            client,
            k8s_type,
            namespace,
            router,
            queue,
            metrics,
        }
    }

    /// Runs until the work queue is shut down
    pub async fn run(self) {
        log::info!(
            "Starting to watch {} in namespace: {:?}",
            self.k8s_type,
            self.namespace
        );
        while !self.queue.is_shutting_down() {
            let result = match self.list().await {
                Ok(resource_version) => self.watch_from(resource_version).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                self.handle_error(err).await;
            }
        }
        log::info!("Stopped watching {}", self.k8s_type);
    }

    async fn handle_error(&self, error: InformerError) {
        if error.is_resource_version_expired() {
            log::info!(
                "ResourceVersion is too old for {}, listing again",
                self.k8s_type
            );
        } else {
            log::error!(
                "Error watching {}, will retry in {:?}: {}",
                self.k8s_type,
                ERROR_RETRY_DELAY,
                error
            );
            self.metrics.error();
            tokio::time::sleep(ERROR_RETRY_DELAY).await;
        }
    }

    /// Lists all the objects and enqueues them, returning the resourceVersion of the list
    async fn list(&self) -> Result<String, InformerError> {
        self.metrics.request_started();
        let ObjectList { metadata, items } = self
            .client
            .list_all(self.k8s_type, self.namespace.as_deref(), None)
            .await?;
        let resource_version = metadata.resource_version.ok_or_else(|| {
            InvalidResourceError::new(
                "list result from api server is missing metadata.resourceVersion",
                Value::Null,
            )
        })?;
        log::debug!(
            "Listed {} {} at resourceVersion: {}",
            items.len(),
            self.k8s_type,
            resource_version
        );
        for item in items {
            let resource = K8sResource::from_value(item)?;
            self.enqueue(&resource).await;
        }
        Ok(resource_version)
    }

    /// Watches until an error occurs. Watches that are closed by the api server are restarted
    /// from the last seen resourceVersion.
    async fn watch_from(&self, mut resource_version: String) -> Result<(), InformerError> {
        while !self.queue.is_shutting_down() {
            self.metrics.request_started();
            let mut events = self
                .client
                .watch(
                    self.k8s_type,
                    self.namespace.as_deref(),
                    Some(resource_version.as_str()),
                    None,
                )
                .await?;
            while let Some(result) = events.next().await {
                self.metrics.event_received();
                if let Some(version) = self.handle_event(result?).await? {
                    resource_version = version;
                }
            }
            log::debug!(
                "Watch of {} ended at resourceVersion: {}",
                self.k8s_type,
                resource_version
            );
        }
        Ok(())
    }

    async fn handle_event(&self, event: WatchEvent) -> Result<Option<String>, InformerError> {
        let (event_type, object) = match event {
            WatchEvent::Added(obj) => ("ADDED", obj),
            WatchEvent::Modified(obj) => ("MODIFIED", obj),
            WatchEvent::Deleted(obj) => ("DELETED", obj),
            WatchEvent::Bookmark(obj) => {
                let version = obj
                    .pointer("/metadata/resourceVersion")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                return Ok(version);
            }
            WatchEvent::Error(err) => return Err(err.into()),
        };
        let resource = K8sResource::from_value(object)?;
        log::trace!(
            "Got {} event for {} '{}'",
            event_type,
            self.k8s_type.kind,
            resource.get_object_id()
        );
        self.enqueue(&resource).await;
        Ok(Some(resource.resource_version().to_owned()))
    }

    async fn enqueue(&self, resource: &K8sResource) {
        for request in self.router.requests_for(resource).await {
            self.queue.add(request);
        }
    }
}
