use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use parking_lot::RwLock;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

use crate::SharedIndex;

/// Wraps the watcher index so every apply/delete/reset is counted and the
/// table sizes are kept as gauges.
pub struct IndexMetrics {
    inner: SharedIndex,

    applies: Counter,
    deletes: Counter,
    resets: Counter,
    table_size: Gauge,
    local_size: Gauge,
}

impl IndexMetrics {
    pub fn register(inner: SharedIndex, prom: &mut Registry) -> Arc<RwLock<Self>> {
        let applies = Counter::default();
        prom.register(
            "service_applies",
            "Count of service applies to the index",
            applies.clone(),
        );

        let deletes = Counter::default();
        prom.register(
            "service_deletes",
            "Count of service deletes to the index",
            deletes.clone(),
        );

        let resets = Counter::default();
        prom.register(
            "service_resets",
            "Count of watch resets applied to the index",
            resets.clone(),
        );

        let table_size = Gauge::default();
        prom.register(
            "table_size",
            "Gauge of the number of services in the service table",
            table_size.clone(),
        );

        let local_size = Gauge::default();
        prom.register(
            "local_services",
            "Gauge of the number of locally hosted services",
            local_size.clone(),
        );

        Arc::new(RwLock::new(Self {
            inner,
            applies,
            deletes,
            resets,
            table_size,
            local_size,
        }))
    }

    fn update_gauges(&self) {
        let inner = self.inner.read();
        self.table_size.set(inner.table_size() as i64);
        self.local_size.set(inner.local_size() as i64);
    }
}

impl kubert::index::IndexNamespacedResource<Service> for IndexMetrics {
    fn apply(&mut self, resource: Service) {
        self.applies.inc();
        self.inner.write().apply(resource);
        self.update_gauges();
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.deletes.inc();
        self.inner.write().delete(namespace, name);
        self.update_gauges();
    }

    fn reset(&mut self, resources: Vec<Service>, removed: kubert::index::NamespacedRemoved) {
        self.resets.inc();
        self.inner.write().reset(resources, removed);
        self.update_gauges();
    }
}
