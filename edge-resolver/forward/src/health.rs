use std::{sync::Arc, time::Duration};

use crate::{metrics::ForwardMetrics, Proxy};

pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Drives a proxy's health probe: one check per `interval` tick, plus any
/// checks requested through the proxy's debounced trigger.
pub(crate) async fn run_probe(
    proxy: Arc<Proxy>,
    interval: Duration,
    metrics: Arc<ForwardMetrics>,
    shutdown: drain::Watch,
) {
    let mut kicks = match proxy.take_probe_rx() {
        Some(rx) => rx,
        None => {
            tracing::error!(to = %proxy.addr(), "probe already running for this proxy");
            return;
        }
    };

    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticks.tick() => {}
            kicked = kicks.recv() => {
                if kicked.is_none() {
                    return;
                }
            }
            _ = shutdown.clone().signaled() => {
                tracing::debug!(to = %proxy.addr(), "stopping health probe");
                return;
            }
        }

        proxy.check(&metrics).await;
    }
}
