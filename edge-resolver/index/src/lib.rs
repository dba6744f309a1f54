//! Service location state for an edge-resolver node.
//!
//! Two shared structures hold everything a node knows about service
//! placement: the [`ServiceTable`] maps federated service names to the sites
//! asserting them (fed by the local watcher and by downstream push updates),
//! and the [`LocalServiceSet`] holds the names this node hosts itself. The
//! [`Index`] drives both from the local cluster's `Service` watch and fans
//! the resulting events out to the per-upstream push queues.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod local;
pub mod metrics;
mod table;

pub use self::{
    index::{Index, IndexError, SharedIndex},
    local::LocalServiceSet,
    table::ServiceTable,
};
