use std::sync::Arc;

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventLabels {
    result: String,
}

/// Counters for both directions of the push protocol.
pub struct PushMetrics {
    events: Family<EventLabels, Counter>,
    updates: Family<EventLabels, Counter>,
}

impl std::fmt::Debug for PushMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushMetrics").finish_non_exhaustive()
    }
}

// === impl PushMetrics ===

impl PushMetrics {
    pub fn register(prom: &mut Registry) -> Arc<Self> {
        let events = Family::default();
        prom.register(
            "events",
            "Count of outbound push events by result",
            events.clone(),
        );

        let updates = Family::default();
        prom.register(
            "updates_received",
            "Count of inbound push updates by result",
            updates.clone(),
        );

        Arc::new(Self { events, updates })
    }

    pub(crate) fn event_sent(&self) {
        self.event("sent");
    }

    pub(crate) fn event_dropped(&self) {
        self.event("dropped");
    }

    pub(crate) fn event_retried(&self) {
        self.event("retried");
    }

    pub(crate) fn update_applied(&self) {
        self.update("applied");
    }

    pub(crate) fn update_rejected(&self) {
        self.update("rejected");
    }

    fn event(&self, result: &str) {
        self.events
            .get_or_create(&EventLabels {
                result: result.to_string(),
            })
            .inc();
    }

    fn update(&self, result: &str) {
        self.updates
            .get_or_create(&EventLabels {
                result: result.to_string(),
            })
            .inc();
    }
}
