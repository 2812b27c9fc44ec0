//! Everything that's needed to run the operator against a real cluster: the api server client,
//! the informers that feed the work queue, the reconcile workers, and the metrics and health
//! server.
pub mod client;
pub mod controller;
pub mod informer;
pub mod metrics;
pub mod queue;
mod server;

use crate::config::{ClientConfig, OperatorConfig};
use crate::error::Error;
use crate::gateway::factory::DefaultGatewayFactory;
use crate::gateway::GATEWAY;
use crate::k8s_types::apps::v1::Deployment;
use crate::k8s_types::core::v1::{Secret, Service};
use crate::k8s_types::networking_k8s_io::v1::Ingress;
use crate::k8s_types::K8sType;
use crate::reconcile::{ChildApplier, EventMapper, Reconciler};
use crate::store::Store;
use client::Client;
use controller::Controller;
use informer::{EventRouter, Informer};
use metrics::Metrics;
use queue::{ExponentialBackoffPolicy, WorkQueue};

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;

/// How long to wait for in-flight tasks when the runtime is shut down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct UnexpectedShutdownError {
    component: String,
}

impl Display for UnexpectedShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Operator shutdown due to an unexpected error in: {}",
            self.component
        )
    }
}

impl std::error::Error for UnexpectedShutdownError {}

/// Starts the operator and blocks the current thread until it shuts down. Returns `Ok` when the
/// operator was stopped by an interrupt signal, and an error if it could not be started or if
/// one of its watches stopped unexpectedly.
pub fn run_operator(config: OperatorConfig, client_config: ClientConfig) -> Result<(), Error> {
    let metrics = Metrics::new()?;
    let client = Client::new(client_config, metrics.client_metrics())?;
    let runtime = Runtime::new()?;
    let result = runtime.block_on(run_with_client(config, client, metrics));
    log::info!("Operator stopped, shutting down runtime");
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    result
}

/// Runs the operator on the current runtime until it's interrupted
pub async fn run_with_client(
    config: OperatorConfig,
    client: Client,
    metrics: Metrics,
) -> Result<(), Error> {
    log::info!("Starting operator with config: {:?}", config);
    let store: Arc<dyn Store> = Arc::new(client.clone());

    let applier = ChildApplier::new(
        store.clone(),
        DefaultGatewayFactory::new(config.default_image.clone()),
        config.operator_name.clone(),
    );
    let reconciler = Reconciler::new(store.clone(), Arc::new(applier))
        .with_metrics(metrics.reconcile_metrics());

    let queue = WorkQueue::with_depth_gauge(
        ExponentialBackoffPolicy::new(config.backoff.clone()),
        metrics.queue_depth(),
    );
    let mapper = EventMapper::new(store, config.secret_label_selector.clone());

    let watches: Vec<(&'static K8sType, EventRouter)> = vec![
        (GATEWAY, EventRouter::Gateway),
        (Deployment, EventRouter::Dependent),
        (Service, EventRouter::Dependent),
        (Ingress, EventRouter::Dependent),
        (Secret, EventRouter::Secret(Arc::new(mapper))),
    ];
    let informers = watches
        .into_iter()
        .map(|(k8s_type, router)| {
            let informer = Informer::new(
                client.clone(),
                k8s_type,
                config.namespace.clone(),
                router,
                queue.clone(),
                metrics.watcher_metrics(k8s_type),
            );
            tokio::spawn(informer.run())
        })
        .collect::<Vec<JoinHandle<()>>>();

    if config.expose_metrics || config.expose_health {
        tokio::spawn(server::start(
            config.server_port,
            metrics.clone(),
            config.expose_metrics,
            config.expose_health,
        ));
    }

    let controller = Controller::new(Arc::new(reconciler), queue.clone(), config.reconcile_timeout)
        .with_metrics(metrics.reconcile_metrics());
    let workers = Arc::new(controller).start_workers(config.worker_count);

    let result: Result<(), Error> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => log::info!("Received interrupt signal, shutting down"),
                Err(err) => log::error!("Failed to listen for interrupt signal: {}", err),
            }
            Ok(())
        }
        (stopped, index, _) = futures::future::select_all(informers) => {
            if let Err(err) = stopped {
                log::error!("Informer task failed: {}", err);
            }
            Err(UnexpectedShutdownError {
                component: format!("informer {}", index),
            }.into())
        }
    };

    // let the workers finish whatever they're in the middle of
    queue.shut_down();
    for worker in workers {
        if let Err(err) = worker.await {
            log::error!("Reconcile worker failed: {}", err);
        }
    }
    result
}
