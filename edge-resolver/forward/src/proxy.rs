use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};

use tokio::sync::mpsc;
use trust_dns_proto::op::Message;

use crate::{
    metrics::ForwardMetrics,
    transport::{Protocol, Transport, EXCHANGE_TIMEOUT, MIN_UDP_SIZE},
    Error,
};

/// A configured upstream DNS peer.
///
/// Holds the connection cache for its address and the failure counter
/// maintained by its health probe. The counter is read lock-free on the
/// forwarding path.
#[derive(Debug)]
pub struct Proxy {
    transport: Transport,
    fails: AtomicU32,
    probe: mpsc::Sender<()>,
    probe_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
}

// === impl Proxy ===

impl Proxy {
    pub fn new(transport: Transport) -> Self {
        // A one-slot channel coalesces concurrent healthcheck requests into
        // a single pending probe.
        let (probe, rx) = mpsc::channel(1);
        Self {
            transport,
            fails: AtomicU32::new(0),
            probe,
            probe_rx: parking_lot::Mutex::new(Some(rx)),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.transport.addr()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// True iff this proxy has failed more than `max_fails` consecutive
    /// health probes. `max_fails == 0` disables the check.
    pub fn down(&self, max_fails: u32) -> bool {
        max_fails != 0 && self.fails.load(Ordering::Relaxed) > max_fails
    }

    pub fn fail_count(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn set_fail_count(&self, fails: u32) {
        self.fails.store(fails, Ordering::Relaxed);
    }

    /// Requests an out-of-band health probe; concurrent requests coalesce.
    pub fn healthcheck(&self) {
        let _ = self.probe.try_send(());
    }

    pub(crate) fn take_probe_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.probe_rx.lock().take()
    }

    /// Exchanges `request` with this upstream over a pooled connection.
    ///
    /// The connection is returned to the pool only after a clean exchange;
    /// any error leaves it dropped.
    pub(crate) async fn connect(
        &self,
        request: &Message,
        client_proto: Protocol,
        force_tcp: bool,
        metrics: &ForwardMetrics,
    ) -> Result<Message, Error> {
        let proto = if self.transport.is_tls() {
            Protocol::Tls
        } else if force_tcp {
            Protocol::Tcp
        } else {
            client_proto
        };

        let started = Instant::now();
        let mut conn = self.transport.dial(proto).await?;
        conn.set_udp_size(advertised_udp_size(request));

        conn.write_message(request, EXCHANGE_TIMEOUT).await?;
        let reply = conn.read_message(EXCHANGE_TIMEOUT).await?;
        self.transport.yield_conn(conn);

        metrics.observe_exchange(&self.addr(), reply.response_code(), started.elapsed());
        metrics.set_open_sockets(&self.addr(), self.transport.open_connections());
        Ok(reply)
    }

    /// Runs one health probe: `. IN NS`, no recursion, 1 s deadlines.
    /// Getting any message back at all counts as healthy.
    pub(crate) async fn check(&self, metrics: &ForwardMetrics) {
        match self.send_probe().await {
            Ok(()) => self.fails.store(0, Ordering::Relaxed),
            Err(error) => {
                self.fails.fetch_add(1, Ordering::Relaxed);
                metrics.healthcheck_failed(&self.addr());
                tracing::debug!(%error, to = %self.addr(), "healthcheck failed");
            }
        }
    }

    async fn send_probe(&self) -> Result<(), Error> {
        use trust_dns_proto::{
            op::Query,
            rr::{Name, RecordType},
        };

        let mut ping = Message::new();
        ping.set_id(rand::random());
        ping.set_recursion_desired(false);
        ping.add_query(Query::query(Name::root(), RecordType::NS));

        let proto = if self.transport.is_tls() {
            Protocol::Tls
        } else {
            Protocol::Udp
        };
        let mut conn = self.transport.dial(proto).await?;
        conn.set_udp_size(MIN_UDP_SIZE);

        let deadline = crate::health::PROBE_TIMEOUT;
        conn.write_message(&ping, deadline).await?;
        match conn.read_message(deadline).await {
            Ok(_) => {
                self.transport.yield_conn(conn);
                Ok(())
            }
            // A truncated datagram still proves something answered.
            Err(Error::Truncated) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Drops pooled connections; called on shutdown.
    pub fn close(&self) {
        self.transport.close();
    }
}

fn advertised_udp_size(request: &Message) -> u16 {
    request
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload())
        .unwrap_or(MIN_UDP_SIZE)
        .max(MIN_UDP_SIZE)
}
