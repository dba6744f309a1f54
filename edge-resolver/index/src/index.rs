use std::sync::Arc;

use ahash::AHashSet as HashSet;
use edge_resolver_core::{service_fqdn, EventKind, ServiceEvent, Site};
use k8s_openapi::api::core::v1::Service;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{LocalServiceSet, ServiceTable};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Converts the local cluster's `Service` watch into service events.
///
/// Every event mutates the [`LocalServiceSet`], asserts (or retracts) the
/// self-site in the [`ServiceTable`] so that local services take part in
/// nearest-site selection like remote ones, and is fanned out to every
/// upstream push queue.
#[derive(Debug)]
pub struct Index {
    site: Site,
    local: Arc<LocalServiceSet>,
    table: Arc<ServiceTable>,
    outboxes: Vec<mpsc::UnboundedSender<ServiceEvent>>,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("service object carries no name")]
    MissingName,

    #[error("service object carries no namespace")]
    MissingNamespace,
}

// === impl Index ===

impl Index {
    pub fn shared(
        site: Site,
        local: Arc<LocalServiceSet>,
        table: Arc<ServiceTable>,
        outboxes: Vec<mpsc::UnboundedSender<ServiceEvent>>,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            site,
            local,
            table,
            outboxes,
        }))
    }

    pub(crate) fn table_size(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn local_size(&self) -> usize {
        self.local.len()
    }

    fn record(&mut self, event: ServiceEvent) {
        match event.kind {
            EventKind::Add => {
                self.local.add(&event.service);
                self.table.add(self.site, &event.service);
            }
            EventKind::Delete => {
                self.local.remove(&event.service);
                self.table.remove(&self.site, &event.service);
            }
        }
        tracing::debug!(services = self.local.len(), ?event, "local services updated");

        for outbox in &self.outboxes {
            // A closed outbox means its sender task is shutting down.
            let _ = outbox.send(event.clone());
        }
    }
}

impl kubert::index::IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, service: Service) {
        match fqdn_of(&service) {
            Ok(fqdn) => self.record(ServiceEvent::add(fqdn)),
            Err(error) => tracing::warn!(%error, "skipping unparseable service event"),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.record(ServiceEvent::delete(service_fqdn(&name, &namespace)));
    }

    fn reset(&mut self, services: Vec<Service>, _removed: kubert::index::NamespacedRemoved) {
        // The watch stream was re-established; diff the relisted world
        // against the local set and emit the implied events.
        let mut desired = HashSet::with_capacity(services.len());
        for service in &services {
            match fqdn_of(service) {
                Ok(fqdn) => {
                    desired.insert(fqdn);
                }
                Err(error) => tracing::warn!(%error, "skipping unparseable service event"),
            }
        }

        for fqdn in self.local.snapshot() {
            if !desired.contains(&fqdn) {
                self.record(ServiceEvent::delete(fqdn));
            }
        }
        for fqdn in desired {
            self.record(ServiceEvent::add(fqdn));
        }
    }
}

fn fqdn_of(service: &Service) -> Result<String, IndexError> {
    let meta = &service.metadata;
    let name = meta.name.as_deref().ok_or(IndexError::MissingName)?;
    let namespace = meta.namespace.as_deref().ok_or(IndexError::MissingNamespace)?;
    Ok(service_fqdn(name, namespace))
}
