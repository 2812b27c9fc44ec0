use crate::reconcile::{ReconcileRequest, Reconciler};
use crate::runner::metrics::ReconcileMetrics;
use crate::runner::queue::WorkQueue;

use tokio::task::JoinHandle;

use std::sync::Arc;
use std::time::Duration;

/// Takes reconcile requests from the work queue and runs them through the `Reconciler`. Each
/// worker handles one request at a time, and the queue guarantees that no two workers ever
/// reconcile the same gateway concurrently.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: WorkQueue<ReconcileRequest>,
    reconcile_timeout: Duration,
    metrics: Option<ReconcileMetrics>,
}

impl Controller {
    pub fn new(
        reconciler: Arc<Reconciler>,
        queue: WorkQueue<ReconcileRequest>,
        reconcile_timeout: Duration,
    ) -> Controller {
        Controller {
            reconciler,
            queue,
            reconcile_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ReconcileMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Spawns `count` workers onto the current runtime
    pub fn start_workers(self: Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker_id| {
                let controller = self.clone();
                tokio::spawn(async move { controller.run_worker(worker_id).await })
            })
            .collect()
    }

    pub async fn run_worker(&self, worker_id: usize) {
        log::debug!("Starting reconcile worker {}", worker_id);
        while self.process_next().await {}
        log::debug!("Reconcile worker {} stopped", worker_id);
    }

    /// Processes a single request from the queue. Returns false once the queue is shut down.
    pub async fn process_next(&self) -> bool {
        let request = match self.queue.get().await {
            Some(r) => r,
            None => return false,
        };
        self.process(&request).await;
        self.queue.done(&request);
        true
    }

    async fn process(&self, request: &ReconcileRequest) {
        let _timer = self.metrics.as_ref().map(ReconcileMetrics::reconcile_started);
        let result =
            tokio::time::timeout(self.reconcile_timeout, self.reconciler.reconcile(request)).await;
        match result {
            Ok(Ok(r)) if !r.requeue => {
                self.queue.forget(request);
            }
            Ok(Ok(_)) => {
                self.queue.add_rate_limited(request.clone());
            }
            Ok(Err(err)) => {
                log::error!("Failed to reconcile gateway '{}': {}", request, err);
                self.queue.add_rate_limited(request.clone());
            }
            Err(_) => {
                log::warn!(
                    "Reconciliation of gateway '{}' did not finish within {:?}, abandoning it",
                    request,
                    self.reconcile_timeout
                );
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.reconcile_timed_out();
                }
                self.queue.add_rate_limited(request.clone());
            }
        }
    }
}
