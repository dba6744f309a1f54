//! The peer-to-peer push protocol.
//!
//! Service events travel between federation members as HTTP `POST /`
//! requests carrying one JSON [`ServiceTableUpdate`] each. The receiver
//! acknowledges an applied update with the `X-Edge-Ack: ok` header; the
//! sender uses that sentinel to tell a real push receiver apart from some
//! unrelated HTTP server that happens to be listening on the port.
//!
//! [`ServiceTableUpdate`]: edge_resolver_core::ServiceTableUpdate

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
pub mod receiver;
mod sender;

#[cfg(test)]
mod tests;

pub use self::{metrics::PushMetrics, sender::Sender};

/// Response header acknowledging that an update was applied.
pub const ACK_HEADER: &str = "x-edge-ack";

/// The only accepted value of [`ACK_HEADER`].
pub const ACK_VALUE: &str = "ok";

/// Default port for the push endpoint.
pub const DEFAULT_PUSH_PORT: u16 = 8053;
