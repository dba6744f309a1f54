use std::{sync::Arc, time::Duration};

use edge_resolver_core::{ServiceEvent, ServiceTableUpdate, Site};
use edge_resolver_index::LocalServiceSet;
use hyper::{header, Body, Method, Request, StatusCode, Uri};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{metrics::PushMetrics, ACK_HEADER, ACK_VALUE};

/// How long to wait before resending an event whose 200 response lacked the
/// ack sentinel.
const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Delivers this node's service events to one upstream's push receiver.
///
/// Events arrive on a queue fed by the service watcher, so a slow peer never
/// blocks indexing. Delivery is at-least-once with no cross-event ordering
/// requirement; a transport error or a non-200 status drops the event, while
/// a 200 without the ack sentinel is retried against the same endpoint until
/// it is acknowledged or the node shuts down.
pub struct Sender {
    endpoint: Uri,
    site: Site,
    local: Arc<LocalServiceSet>,
    events: mpsc::UnboundedReceiver<ServiceEvent>,
    catch_up: Duration,
    retry_delay: Duration,
    client: hyper::Client<hyper::client::HttpConnector>,
    metrics: Arc<PushMetrics>,
}

enum Delivery {
    Done,
    Shutdown,
}

// === impl Sender ===

impl Sender {
    pub fn new(
        endpoint: Uri,
        site: Site,
        local: Arc<LocalServiceSet>,
        events: mpsc::UnboundedReceiver<ServiceEvent>,
        catch_up: Duration,
        metrics: Arc<PushMetrics>,
    ) -> Self {
        Self {
            endpoint,
            site,
            local,
            events,
            catch_up,
            retry_delay: RETRY_DELAY,
            client: hyper::Client::new(),
            metrics,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }

    /// Drains the event queue until shutdown. Every `catch_up` the full
    /// local snapshot is re-advertised; adds are idempotent, so this only
    /// repairs whatever a peer may have missed.
    pub async fn run(mut self, shutdown: drain::Watch) {
        let mut catch_up = tokio::time::interval(self.catch_up);
        catch_up.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => Some(event),
                    None => return,
                },
                _ = catch_up.tick() => None,
                _ = shutdown.clone().signaled() => return,
            };

            match event {
                Some(event) => {
                    if let Delivery::Shutdown = self.deliver(event, &shutdown).await {
                        return;
                    }
                }
                None => {
                    for service in self.local.snapshot() {
                        let event = ServiceEvent::add(service);
                        if let Delivery::Shutdown = self.deliver(event, &shutdown).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn deliver(&self, event: ServiceEvent, shutdown: &drain::Watch) -> Delivery {
        let update = ServiceTableUpdate {
            meta: self.site,
            event,
        };
        let body = match serde_json::to_vec(&update) {
            Ok(body) => body,
            Err(error) => {
                warn!(%error, "failed to encode push update");
                return Delivery::Done;
            }
        };

        loop {
            let request = match Request::builder()
                .method(Method::POST)
                .uri(self.endpoint.clone())
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.clone()))
            {
                Ok(request) => request,
                Err(error) => {
                    warn!(%error, "failed to build push request");
                    return Delivery::Done;
                }
            };

            let response = match self.client.request(request).await {
                Ok(response) => response,
                Err(error) => {
                    warn!(%error, peer = %self.endpoint, "push transport error; dropping event");
                    self.metrics.event_dropped();
                    return Delivery::Done;
                }
            };

            let status = response.status();
            let acked = response
                .headers()
                .get(ACK_HEADER)
                .map(|value| value.as_bytes() == ACK_VALUE.as_bytes())
                .unwrap_or(false);
            // Consume the body so the connection can be reused.
            let _ = hyper::body::to_bytes(response.into_body()).await;

            if status != StatusCode::OK {
                warn!(%status, peer = %self.endpoint, "push rejected; dropping event");
                self.metrics.event_dropped();
                return Delivery::Done;
            }
            if acked {
                debug!(peer = %self.endpoint, event = ?update.event, "pushed service event");
                self.metrics.event_sent();
                return Delivery::Done;
            }

            // 200 but no sentinel: whatever answered is not a push
            // receiver. Wait it out and resend the same event.
            warn!(peer = %self.endpoint, "push not acknowledged; retrying");
            self.metrics.event_retried();
            tokio::select! {
                _ = tokio::time::sleep(self.retry_delay) => {}
                _ = shutdown.clone().signaled() => return Delivery::Shutdown,
            }
        }
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("endpoint", &self.endpoint)
            .field("site", &self.site)
            .finish_non_exhaustive()
    }
}
