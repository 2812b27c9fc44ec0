use crate::k8s_types::K8sType;
use crate::reconcile::Outcome;

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, HistogramTimer, IntCounter, IntCounterVec,
    IntGauge, Opts, Registry,
};

use std::fmt::{self, Debug};

const API_VERSION_AND_KIND: &[&str] = &["apiVersion", "kind"];
const OUTCOME: &[&str] = &["outcome"];

/// All of the operator's metrics, exposed at `/metrics` in the prometheus text format. The
/// individual components get handles to the subset that they update.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    api_server_request_times: Histogram,
    reconcile_count_by_outcome: IntCounterVec,
    reconcile_times: Histogram,
    reconcile_timeouts: IntCounter,
    queue_depth: IntGauge,
    watcher_requests_by_type: IntCounterVec,
    watcher_errors_by_type: IntCounterVec,
    watch_events_by_type: IntCounterVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        // 5ms, 10ms, 20ms, ... 10.24s
        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12)?);
        let api_server_request_times = Histogram::with_opts(request_time_opts)?;
        registry.register(Box::new(api_server_request_times.clone()))?;

        let reconcile_count_opts = Opts::new(
            "reconcile_total",
            "the number of reconciliation passes, by how they ended",
        );
        let reconcile_count_by_outcome = IntCounterVec::new(reconcile_count_opts, OUTCOME)?;
        registry.register(Box::new(reconcile_count_by_outcome.clone()))?;

        let reconcile_time_opts = HistogramOpts::new(
            "reconcile_duration_seconds",
            "the time taken by each reconciliation pass",
        )
        .buckets(exponential_buckets(0.005, 2.0, 14)?);
        let reconcile_times = Histogram::with_opts(reconcile_time_opts)?;
        registry.register(Box::new(reconcile_times.clone()))?;

        let timeout_opts = Opts::new(
            "reconcile_timeouts",
            "the number of reconciliation passes that were abandoned for taking too long",
        );
        let reconcile_timeouts = IntCounter::with_opts(timeout_opts)?;
        registry.register(Box::new(reconcile_timeouts.clone()))?;

        let queue_depth_opts = Opts::new(
            "work_queue_depth",
            "the number of gateways waiting to be reconciled",
        );
        let queue_depth = IntGauge::with_opts(queue_depth_opts)?;
        registry.register(Box::new(queue_depth.clone()))?;

        let watcher_request_opts =
            Opts::new("watcher_requests", "number of requests from watchers");
        let watcher_requests_by_type =
            IntCounterVec::new(watcher_request_opts, API_VERSION_AND_KIND)?;
        registry.register(Box::new(watcher_requests_by_type.clone()))?;

        let watcher_error_opts = Opts::new("watcher_errors", "number of errors from watchers");
        let watcher_errors_by_type = IntCounterVec::new(watcher_error_opts, API_VERSION_AND_KIND)?;
        registry.register(Box::new(watcher_errors_by_type.clone()))?;

        let watcher_event_opts = Opts::new(
            "watch_events",
            "number of watch events received by watchers",
        );
        let watch_events_by_type = IntCounterVec::new(watcher_event_opts, API_VERSION_AND_KIND)?;
        registry.register(Box::new(watch_events_by_type.clone()))?;

        Ok(Metrics {
            registry,
            api_server_request_times,
            reconcile_count_by_outcome,
            reconcile_times,
            reconcile_timeouts,
            queue_depth,
            watcher_requests_by_type,
            watcher_errors_by_type,
            watch_events_by_type,
        })
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self.api_server_request_times.clone(),
        }
    }

    pub fn reconcile_metrics(&self) -> ReconcileMetrics {
        ReconcileMetrics {
            count_by_outcome: self.reconcile_count_by_outcome.clone(),
            durations: self.reconcile_times.clone(),
            timeouts: self.reconcile_timeouts.clone(),
        }
    }

    pub fn watcher_metrics(&self, k8s_type: &K8sType) -> WatcherMetrics {
        let labels = &[k8s_type.api_version, k8s_type.kind];
        WatcherMetrics {
            watcher_requests: self.watcher_requests_by_type.with_label_values(labels),
            watcher_errors: self.watcher_errors_by_type.with_label_values(labels),
            watch_events: self.watch_events_by_type.with_label_values(labels),
        }
    }

    pub fn queue_depth(&self) -> IntGauge {
        self.queue_depth.clone()
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

pub struct ClientMetrics {
    api_server_request_times: Histogram,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> HistogramTimer {
        self.api_server_request_times.start_timer()
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    count_by_outcome: IntCounterVec,
    durations: Histogram,
    timeouts: IntCounter,
}

impl Debug for ReconcileMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ReconcileMetrics")
    }
}

impl ReconcileMetrics {
    pub fn reconcile_finished(&self, outcome: Outcome) {
        self.count_by_outcome
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Observes the duration of the pass when the timer is dropped
    pub fn reconcile_started(&self) -> HistogramTimer {
        self.durations.start_timer()
    }

    pub fn reconcile_timed_out(&self) {
        self.timeouts.inc();
    }
}

pub struct WatcherMetrics {
    watcher_requests: IntCounter,
    watcher_errors: IntCounter,
    watch_events: IntCounter,
}

impl Debug for WatcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WatcherMetrics")
    }
}

impl WatcherMetrics {
    pub fn request_started(&self) {
        self.watcher_requests.inc();
    }

    pub fn event_received(&self) {
        self.watch_events.inc();
    }

    pub fn error(&self) {
        self.watcher_errors.inc();
    }
}
