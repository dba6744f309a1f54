//! Upstream DNS forwarding for edge-resolver.
//!
//! A [`Forwarder`] owns the configured upstream proxies. Each [`Proxy`]
//! keeps a pooled connection cache per transport protocol, an atomic failure
//! counter maintained by a debounced health probe, and is ordered per query
//! by the configured selection [`Policy`].

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod health;
mod message;
mod metrics;
mod policy;
mod proxy;
mod transport;
mod truncated;


pub use self::{
    message::reply_with_code,
    metrics::ForwardMetrics,
    policy::{InvalidPolicy, Policy},
    proxy::Proxy,
    transport::{Protocol, TlsClient, Transport},
};

use std::{io, sync::Arc};

use rand::Rng;
use trust_dns_proto::op::{Message, ResponseCode};

/// Errors raised while exchanging messages with upstream proxies.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no healthy upstream proxies")]
    NoHealthy,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for the upstream")]
    Timeout,

    #[error("truncated response could not be decoded")]
    Truncated,

    #[error("malformed dns message: {0}")]
    Proto(#[from] trust_dns_proto::error::ProtoError),

    #[error("invalid tls server name: {0}")]
    TlsName(#[from] rustls::client::InvalidDnsNameError),
}

/// The ordered set of upstream proxies plus the shared forwarding settings.
#[derive(Debug)]
pub struct Forwarder {
    proxies: Vec<Arc<Proxy>>,
    policy: Policy,
    max_fails: u32,
    force_tcp: bool,
    metrics: Arc<ForwardMetrics>,
}

// === impl Forwarder ===

impl Forwarder {
    pub fn new(
        proxies: Vec<Arc<Proxy>>,
        policy: Policy,
        max_fails: u32,
        force_tcp: bool,
        metrics: Arc<ForwardMetrics>,
    ) -> Self {
        Self {
            proxies,
            policy,
            max_fails,
            force_tcp,
            metrics,
        }
    }

    pub fn proxies(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Spawns the periodic, debounce-gated health probe for every proxy.
    pub fn spawn_probes(&self, interval: tokio::time::Duration, shutdown: drain::Watch) {
        for proxy in &self.proxies {
            tokio::spawn(health::run_probe(
                proxy.clone(),
                interval,
                self.metrics.clone(),
                shutdown.clone(),
            ));
        }
    }

    /// Forwards `request` to the first upstream that produces a usable
    /// reply, in policy order.
    ///
    /// Proxies marked down are skipped until every proxy looks down; then
    /// the probes themselves are suspect and a random proxy is tried as a
    /// last resort. A reply whose question does not echo the request's is
    /// replaced by a FormErr response.
    pub async fn forward(&self, request: &Message, client_proto: Protocol) -> Result<Message, Error> {
        let ordered = self.policy.order(&self.proxies);
        if ordered.is_empty() {
            return Err(Error::NoHealthy);
        }

        let mut fails = 0;
        let mut upstream_err = None;
        for proxy in &ordered {
            let mut proxy = proxy.clone();
            if proxy.down(self.max_fails) {
                fails += 1;
                if fails < ordered.len() {
                    continue;
                }
                // Every upstream looks down, so the healthchecking cannot be
                // trusted; pick an upstream at random as a last resort.
                proxy = ordered[rand::thread_rng().gen_range(0..ordered.len())].clone();
                self.metrics.healthcheck_broken();
            }

            let mut result = proxy
                .connect(request, client_proto, self.force_tcp, &self.metrics)
                .await;
            if is_eof(&result) {
                // A pooled connection may have been half-closed by the peer
                // while cached; retry this proxy once on a fresh socket.
                result = proxy
                    .connect(request, client_proto, self.force_tcp, &self.metrics)
                    .await;
            }

            match truncated::recover(request, result) {
                Err(error) => {
                    tracing::debug!(%error, to = %proxy.addr(), "upstream exchange failed");
                    proxy.healthcheck();
                    upstream_err = Some(error);
                    if fails < ordered.len() {
                        continue;
                    }
                    break;
                }
                Ok(reply) => {
                    if !message::is_reply_to(&reply, request) {
                        return Ok(reply_with_code(request, ResponseCode::FormErr));
                    }
                    return Ok(reply);
                }
            }
        }

        Err(upstream_err.unwrap_or(Error::NoHealthy))
    }
}

fn is_eof(result: &Result<Message, Error>) -> bool {
    matches!(result, Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof)
}
