use ahash::AHashSet as HashSet;
use parking_lot::RwLock;

/// The service names hosted by this node.
///
/// Mutated only by the watcher index; read on the query path and snapshotted
/// for debug logging and push catch-up.
#[derive(Debug, Default)]
pub struct LocalServiceSet {
    items: RwLock<HashSet<String>>,
}

impl LocalServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, service: &str) {
        self.items.write().insert(service.to_string());
    }

    pub fn remove(&self, service: &str) {
        self.items.write().remove(service);
    }

    pub fn contains(&self, service: &str) -> bool {
        self.items.read().contains(service)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.items.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}
