use std::{net::SocketAddr, sync::Arc, time::Duration};

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};
use trust_dns_proto::op::ResponseCode;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UpstreamLabels {
    to: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RcodeLabels {
    to: String,
    rcode: String,
}

/// Forwarding metrics, labelled per upstream.
pub struct ForwardMetrics {
    requests: Family<UpstreamLabels, Counter>,
    rcodes: Family<RcodeLabels, Counter>,
    duration: Family<UpstreamLabels, Histogram, fn() -> Histogram>,
    healthcheck_failures: Family<UpstreamLabels, Counter>,
    healthcheck_broken_total: Counter,
    sockets: Family<UpstreamLabels, Gauge>,
}

// === impl ForwardMetrics ===

impl ForwardMetrics {
    pub fn register(prom: &mut Registry) -> Arc<Self> {
        let requests = Family::default();
        prom.register(
            "request",
            "Count of requests made per upstream",
            requests.clone(),
        );

        let rcodes = Family::default();
        prom.register(
            "response_rcode",
            "Count of responses per rcode and upstream",
            rcodes.clone(),
        );

        let duration: Family<UpstreamLabels, Histogram, fn() -> Histogram> =
            Family::new_with_constructor(new_duration_histogram);
        prom.register(
            "request_duration_seconds",
            "Histogram of the time each upstream exchange took",
            duration.clone(),
        );

        let healthcheck_failures = Family::default();
        prom.register(
            "healthcheck_failure",
            "Count of failed healthchecks per upstream",
            healthcheck_failures.clone(),
        );

        let healthcheck_broken_total = Counter::default();
        prom.register(
            "healthcheck_broken",
            "Count of times every upstream was down at once",
            healthcheck_broken_total.clone(),
        );

        let sockets = Family::default();
        prom.register(
            "sockets_open",
            "Gauge of pooled sockets per upstream",
            sockets.clone(),
        );

        Arc::new(Self {
            requests,
            rcodes,
            duration,
            healthcheck_failures,
            healthcheck_broken_total,
            sockets,
        })
    }

    pub(crate) fn observe_exchange(&self, to: &SocketAddr, rcode: ResponseCode, elapsed: Duration) {
        let to = to.to_string();
        self.requests
            .get_or_create(&UpstreamLabels { to: to.clone() })
            .inc();
        self.rcodes
            .get_or_create(&RcodeLabels {
                to: to.clone(),
                rcode: format!("{:?}", rcode),
            })
            .inc();
        self.duration
            .get_or_create(&UpstreamLabels { to })
            .observe(elapsed.as_secs_f64());
    }

    pub(crate) fn healthcheck_failed(&self, to: &SocketAddr) {
        self.healthcheck_failures
            .get_or_create(&UpstreamLabels { to: to.to_string() })
            .inc();
    }

    pub(crate) fn healthcheck_broken(&self) {
        self.healthcheck_broken_total.inc();
    }

    #[cfg(test)]
    pub(crate) fn healthcheck_broken_count(&self) -> u64 {
        self.healthcheck_broken_total.get()
    }

    pub(crate) fn set_open_sockets(&self, to: &SocketAddr, count: usize) {
        self.sockets
            .get_or_create(&UpstreamLabels { to: to.to_string() })
            .set(count as i64);
    }
}

impl std::fmt::Debug for ForwardMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardMetrics").finish_non_exhaustive()
    }
}

fn new_duration_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.00025, 2.0, 16))
}
