//! The reconciliation core. A `Reconciler` is invoked with a `ReconcileRequest` (the namespace and
//! name of a gateway), and drives that gateway's children and status toward the desired state:
//!
//! 1. fetch the gateway. If it's gone, there's nothing to do
//! 2. let the `ConvergenceDelegate` create or update the children
//! 3. re-read the gateway and let the `StatusConverger` update `status.deployedImage`
//!
//! Update conflicts from either step are never treated as errors. They just mean that the pass
//! was working with outdated data, so the request is requeued and the next pass starts over with
//! fresh reads. Every pass re-reads everything it needs, so passes are safe to repeat, to run
//! out of order, or to abandon part way through.
mod apply;
pub mod compare;
mod mapper;
mod status;

pub use self::apply::{add_parent_references, ChildApplier};
pub use self::mapper::{map_secret_to_requests, EventMapper};
pub use self::status::{deployed_image, DeploymentImageError, StatusConverger};

use crate::error::{classify, Error, ErrorClass};
use crate::gateway::{Gateway, GATEWAY};
use crate::resource::{ObjectId, ObjectIdRef};
use crate::runner::metrics::ReconcileMetrics;
use crate::store::Store;

use async_trait::async_trait;

use std::fmt::{self, Display};
use std::sync::Arc;

/// A request to reconcile the gateway with the given namespace and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReconcileRequest {
    pub id: ObjectId,
}

impl ReconcileRequest {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> ReconcileRequest {
        ReconcileRequest {
            id: ObjectId::new(namespace.into(), name.into()),
        }
    }

    pub fn id_ref(&self) -> ObjectIdRef<'_> {
        self.id.as_id_ref()
    }
}

impl From<ObjectId> for ReconcileRequest {
    fn from(id: ObjectId) -> ReconcileRequest {
        ReconcileRequest { id }
    }
}

impl<'a> From<ObjectIdRef<'a>> for ReconcileRequest {
    fn from(id: ObjectIdRef<'a>) -> ReconcileRequest {
        ReconcileRequest { id: id.to_owned() }
    }
}

impl Display for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.id, f)
    }
}

/// The outcome of a successful reconciliation pass. When `requeue` is true, the dispatcher
/// should schedule another pass for the same gateway after a backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileResult {
    pub requeue: bool,
}

impl ReconcileResult {
    pub fn done() -> ReconcileResult {
        ReconcileResult { requeue: false }
    }

    pub fn requeue() -> ReconcileResult {
        ReconcileResult { requeue: true }
    }
}

/// Creates and updates the children of a gateway. The delegate is given a gateway that was
/// freshly read from the store. Returning `requeue: true` stops the current pass before the
/// status is looked at. Errors that carry a `StoreError::Conflict` are turned into a requeue by
/// the `Reconciler`, and any other error is passed on to the dispatcher.
#[async_trait]
pub trait ConvergenceDelegate: Send + Sync + 'static {
    async fn apply(&self, gateway: &Gateway) -> Result<ReconcileResult, Error>;
}

/// How a single step of the pass ended, used for logging and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Requeue,
    Conflict,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Requeue => "requeue",
            Outcome::Conflict => "conflict",
            Outcome::Error => "error",
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    delegate: Arc<dyn ConvergenceDelegate>,
    status: StatusConverger,
    metrics: Option<ReconcileMetrics>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, delegate: Arc<dyn ConvergenceDelegate>) -> Reconciler {
        let status = StatusConverger::new(store.clone());
        Reconciler {
            store,
            delegate,
            status,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ReconcileMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs a single reconciliation pass for the given gateway
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconcileResult, Error> {
        let (outcome, result) = match self.reconcile_inner(request).await {
            Ok((outcome, result)) => (outcome, Ok(result)),
            Err(err) => (Outcome::Error, Err(err)),
        };
        if let Some(metrics) = self.metrics.as_ref() {
            metrics.reconcile_finished(outcome);
        }
        result
    }

    async fn reconcile_inner(
        &self,
        request: &ReconcileRequest,
    ) -> Result<(Outcome, ReconcileResult), Error> {
        log::info!("Reconciling gateway '{}'", request);

        let gateway = match self.fetch_gateway(request).await? {
            Some(gw) => gw,
            None => {
                log::info!("Gateway '{}' not found", request);
                return Ok((Outcome::Done, ReconcileResult::done()));
            }
        };

        if log::log_enabled!(log::Level::Debug) {
            let as_json = serde_json::to_string_pretty(gateway.resource())?;
            log::debug!("Fetched gateway '{}': {}", request, as_json);
        }

        let result = self.delegate.apply(&gateway).await;
        if let Some(early_return) = interpret(request, "children", result)? {
            return Ok(early_return);
        }
        log::info!("Children of gateway '{}' are reconciled", request);

        // the delegate may have written things that changed the gateway, so read it again
        let gateway = match self.fetch_gateway(request).await? {
            Some(gw) => gw,
            None => {
                log::info!("Gateway '{}' was deleted during reconciliation", request);
                return Ok((Outcome::Done, ReconcileResult::done()));
            }
        };
        let result = self.status.converge(&gateway).await;
        if let Some(early_return) = interpret(request, "status", result)? {
            return Ok(early_return);
        }
        log::info!("Status of gateway '{}' is reconciled", request);
        Ok((Outcome::Done, ReconcileResult::done()))
    }

    async fn fetch_gateway(&self, request: &ReconcileRequest) -> Result<Option<Gateway>, Error> {
        match self.store.get(GATEWAY, &request.id_ref()).await {
            Ok(resource) => Gateway::from_resource(resource).map(Some).map_err(Into::into),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => {
                log::error!("Error getting gateway '{}': {}", request, err);
                Err(err.into())
            }
        }
    }
}

/// Applies the conflict and requeue rules to the result of one step. Returns `Ok(None)` when
/// the pass should continue with the next step.
fn interpret(
    request: &ReconcileRequest,
    step: &str,
    result: Result<ReconcileResult, Error>,
) -> Result<Option<(Outcome, ReconcileResult)>, Error> {
    match result {
        Ok(r) if r.requeue => {
            log::info!("Requeuing gateway '{}' after {} step", request, step);
            Ok(Some((Outcome::Requeue, r)))
        }
        Ok(_) => Ok(None),
        Err(err) => match classify(&err) {
            ErrorClass::Conflict => {
                log::info!(
                    "Update conflict for gateway '{}' during {} step, requeueing: {}",
                    request,
                    step,
                    err
                );
                Ok(Some((Outcome::Conflict, ReconcileResult::requeue())))
            }
            _ => {
                log::error!(
                    "Error reconciling {} of gateway '{}': {}",
                    step,
                    request,
                    err
                );
                Err(err)
            }
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gateway::gateway_json;
    use crate::k8s_types::apps::v1::Deployment;
    use crate::store::{MemoryStore, StoreError, StoreOp};

    use serde_json::json;
    use tokio::runtime;

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A delegate that returns canned results and counts calls
    struct Scripted {
        calls: AtomicUsize,
        result: fn() -> Result<ReconcileResult, Error>,
    }

    #[async_trait]
    impl ConvergenceDelegate for Scripted {
        async fn apply(&self, _gateway: &Gateway) -> Result<ReconcileResult, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn scripted(result: fn() -> Result<ReconcileResult, Error>) -> Arc<Scripted> {
        Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            result,
        })
    }

    fn setup(store: &MemoryStore, image: &str, deployed: &str) {
        let mut gw = gateway_json("ns", "foo", json!({}));
        gw["status"] = json!({ "deployedImage": deployed });
        store.insert(GATEWAY, gw);
        store.insert(
            Deployment,
            json!({
                "metadata": {"namespace": "ns", "name": "gateway-foo"},
                "spec": {"template": {"spec": {"containers": [{"name": "gateway", "image": image}]}}},
            }),
        );
    }

    fn run<F: std::future::Future>(f: F) -> F::Output {
        runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn missing_gateway_is_done_without_calling_delegate() {
        let store = Arc::new(MemoryStore::new());
        let delegate = scripted(|| Ok(ReconcileResult::requeue()));
        let reconciler = Reconciler::new(store.clone(), delegate.clone());
        let result = run(reconciler.reconcile(&ReconcileRequest::new("ns", "gone")));
        assert_eq!(ReconcileResult::done(), result.unwrap());
        assert_eq!(0, delegate.calls.load(Ordering::SeqCst));
    }

    #[test]
    fn delegate_requeue_skips_status_step() {
        let store = Arc::new(MemoryStore::new());
        setup(&store, "img:2", "img:1");
        let delegate = scripted(|| Ok(ReconcileResult::requeue()));
        let reconciler = Reconciler::new(store.clone(), delegate.clone());
        let result = run(reconciler.reconcile(&ReconcileRequest::new("ns", "foo")));
        assert_eq!(ReconcileResult::requeue(), result.unwrap());
        assert_eq!(0, store.call_count(StoreOp::UpdateStatus));
    }

    #[test]
    fn delegate_conflict_is_a_requeue_without_error() {
        let store = Arc::new(MemoryStore::new());
        setup(&store, "img:1", "img:1");
        let delegate = scripted(|| {
            Err(StoreError::Conflict(
                ObjectId::new("ns".to_owned(), "gateway-foo".to_owned()),
                "stale".to_owned(),
            )
            .into())
        });
        let reconciler = Reconciler::new(store.clone(), delegate);
        let result = run(reconciler.reconcile(&ReconcileRequest::new("ns", "foo")));
        assert_eq!(ReconcileResult::requeue(), result.unwrap());
    }

    #[test]
    fn other_delegate_errors_are_propagated() {
        let store = Arc::new(MemoryStore::new());
        setup(&store, "img:1", "img:1");
        let delegate = scripted(|| Err(StoreError::Cancelled.into()));
        let reconciler = Reconciler::new(store.clone(), delegate);
        let err = run(reconciler.reconcile(&ReconcileRequest::new("ns", "foo")))
            .expect_err("expected an error");
        assert!(err.is_type::<StoreError>());
        assert_eq!(0, store.call_count(StoreOp::UpdateStatus));
    }

    #[test]
    fn status_conflict_is_a_requeue_without_error() {
        let store = Arc::new(MemoryStore::new());
        setup(&store, "img:2", "img:1");
        store.fail_next(
            StoreOp::UpdateStatus,
            StoreError::Conflict(ObjectId::new("ns".to_owned(), "foo".to_owned()), "stale".to_owned()),
        );
        let reconciler = Reconciler::new(store.clone(), scripted(|| Ok(ReconcileResult::done())));
        let result = run(reconciler.reconcile(&ReconcileRequest::new("ns", "foo")));
        assert_eq!(ReconcileResult::requeue(), result.unwrap());
        assert_eq!(0, store.write_count());
    }

    #[test]
    fn status_step_reads_the_gateway_again() {
        let store = Arc::new(MemoryStore::new());
        setup(&store, "img:1", "img:1");
        let reconciler = Reconciler::new(store.clone(), scripted(|| Ok(ReconcileResult::done())));
        let result = run(reconciler.reconcile(&ReconcileRequest::new("ns", "foo")));
        assert_eq!(ReconcileResult::done(), result.unwrap());
        // gateway, gateway again, then the deployment
        assert_eq!(3, store.call_count(StoreOp::Get));
        assert_eq!(0, store.write_count());
    }
}
