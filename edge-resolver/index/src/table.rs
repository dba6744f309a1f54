use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use edge_resolver_core::Site;
use parking_lot::RwLock;

/// Maps federated service names to the set of sites currently asserting
/// them.
///
/// A service key is present exactly as long as its site set is non-empty;
/// removing the last site removes the key. Insertion is idempotent and
/// removing an absent site is a no-op, so update streams may be replayed or
/// reordered without corrupting the table.
#[derive(Debug, Default)]
pub struct ServiceTable {
    entries: RwLock<HashMap<String, HashSet<Site>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the sites running `service`, or `None` if the
    /// service is unknown. The snapshot is detached from the table, so a
    /// caller can never observe a partial mutation.
    pub fn lookup(&self, service: &str) -> Option<Vec<Site>> {
        self.entries
            .read()
            .get(service)
            .map(|sites| sites.iter().copied().collect())
    }

    pub fn add(&self, site: Site, service: &str) {
        let mut entries = self.entries.write();
        entries.entry(service.to_string()).or_default().insert(site);
        tracing::trace!(%site, service, "table add");
    }

    pub fn remove(&self, site: &Site, service: &str) {
        let mut entries = self.entries.write();
        if let Some(sites) = entries.get_mut(service) {
            sites.remove(site);
            if sites.is_empty() {
                entries.remove(service);
            }
            tracing::trace!(%site, service, "table remove");
        }
    }

    /// Number of services with at least one site.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
