//! Core value types shared by every edge-resolver crate.
//!
//! A federation node advertises the application services it runs to its
//! upstream peers as a stream of [`ServiceEvent`]s, each tagged with the
//! advertising [`Site`]. Everything on the wire and in the shared tables is
//! built from the types in this crate.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod event;
mod geo;
mod site;

pub use self::{
    event::{EventKind, ServiceEvent, ServiceTableUpdate},
    geo::Point,
    site::Site,
};

/// The fixed suffix of every federated service name.
pub const CLUSTER_SUFFIX: &str = "svc.cluster.external";

/// Formats the federated DNS name of a service, e.g.
/// `web.prod.svc.cluster.external`.
pub fn service_fqdn(name: &str, namespace: &str) -> String {
    format!("{}.{}.{}", name, namespace, CLUSTER_SUFFIX)
}

/// Strips the trailing dot a query name carries at ingress. Table keys are
/// stored without it.
pub fn strip_root_dot(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}
