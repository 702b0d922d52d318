use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub service: Service,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Service {
    Advertise,
    UploadPack,
    ReceivePack,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MaterializeLabels {
    pub outcome: MaterializeOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum MaterializeOutcome {
    Cloned,
    Refreshed,
    Unchanged,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub code: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- requests --
    pub requests_total: Family<RequestLabels, Counter>,
    pub request_errors_total: Family<ErrorLabels, Counter>,

    // -- mirrors --
    pub materialize_total: Family<MaterializeLabels, Counter>,
    pub clone_duration_seconds: Histogram,
    pub fetch_duration_seconds: Histogram,
    pub stale_serves: Counter,

    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_waits: Counter,
    pub lock_timeouts: Counter,
    pub lock_handles: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "mirrorcache_requests",
            "Smart-HTTP requests by service",
            requests_total.clone(),
        );

        let request_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "mirrorcache_request_errors",
            "Failed requests by error code",
            request_errors_total.clone(),
        );

        let materialize_total = Family::<MaterializeLabels, Counter>::default();
        registry.register(
            "mirrorcache_materialize",
            "Mirror materializations by outcome",
            materialize_total.clone(),
        );

        let clone_duration_seconds = Histogram::new(exponential_buckets(0.1, 2.0, 15));
        registry.register(
            "mirrorcache_clone_duration_seconds",
            "Upstream clone latency in seconds",
            clone_duration_seconds.clone(),
        );

        let fetch_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 15));
        registry.register(
            "mirrorcache_fetch_duration_seconds",
            "Upstream fetch latency in seconds",
            fetch_duration_seconds.clone(),
        );

        let stale_serves = Counter::default();
        registry.register(
            "mirrorcache_stale_serves",
            "Requests served from a mirror whose refresh failed",
            stale_serves.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "mirrorcache_lock_acquisitions",
            "Mirror lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_waits = Counter::default();
        registry.register(
            "mirrorcache_lock_waits",
            "Mirror lock acquisitions that had to wait",
            lock_waits.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "mirrorcache_lock_timeouts",
            "Mirror lock waits that timed out",
            lock_timeouts.clone(),
        );

        let lock_handles: Gauge = Gauge::default();
        registry.register(
            "mirrorcache_lock_handles",
            "Mirrors with a lock handle in the registry",
            lock_handles.clone(),
        );

        Self {
            requests_total,
            request_errors_total,
            materialize_total,
            clone_duration_seconds,
            fetch_duration_seconds,
            stale_serves,
            lock_acquisitions,
            lock_waits,
            lock_timeouts,
            lock_handles,
        }
    }

    pub fn record_request(&self, service: Service) {
        self.requests_total
            .get_or_create(&RequestLabels { service })
            .inc();
    }

    pub fn record_error(&self, code: &str) {
        self.request_errors_total
            .get_or_create(&ErrorLabels {
                code: code.to_string(),
            })
            .inc();
    }

    pub fn record_materialize(&self, outcome: MaterializeOutcome) {
        self.materialize_total
            .get_or_create(&MaterializeLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`](crate::AppState).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
