//! The query-facing half of edge-resolver: the DNS serve loops and the
//! resolution pipeline.
//!
//! Every query runs through the [`Pipeline`]: names outside the base domain
//! fall through to the next [`Handler`] in the chain, local services answer
//! with the self IP, known remote services answer with the nearest
//! advertising site, and everything else is forwarded upstream with this
//! node's coordinates carried in the message as a trailing LOC record.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod loc;
mod pipeline;
mod scrub;
mod serve;

#[cfg(test)]
mod tests;

pub use self::{
    pipeline::Pipeline,
    serve::{serve_tcp, serve_udp},
};

use edge_resolver_forward::Protocol;
use std::net::SocketAddr;
use trust_dns_proto::op::Message;

/// A DNS query in flight through the handler chain.
#[derive(Debug)]
pub struct Request {
    pub message: Message,
    pub src: SocketAddr,
    pub proto: Protocol,
}

/// One link of the resolution chain.
///
/// A handler either produces the full response message or delegates to the
/// handler behind it; the serve loop turns errors into ServFail replies.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: &mut Request) -> anyhow::Result<Message>;
}
