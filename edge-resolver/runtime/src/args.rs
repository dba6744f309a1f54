use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use edge_resolver_core::{Point, Site};
use edge_resolver_forward::{ForwardMetrics, Forwarder, Policy, Proxy, TlsClient, Transport};
use edge_resolver_index::{metrics::IndexMetrics, Index, LocalServiceSet, ServiceTable};
use edge_resolver_push::{receiver, PushMetrics, Sender, DEFAULT_PUSH_PORT};
use edge_resolver_server::{serve_tcp, serve_udp, Handler, Pipeline};
use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::sync::mpsc;
use tracing::{error, info_span, Instrument};

use crate::config;

#[derive(Debug, Parser)]
#[clap(
    name = "edge-resolver",
    about = "A geo-aware DNS resolution overlay for edge federations"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "edge_resolver=info,warn",
        env = "EDGE_RESOLVER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Public IP of this node; local services answer with it.
    #[clap(long)]
    self_ip: IpAddr,

    /// Longitude of this node in decimal degrees.
    #[clap(long, allow_hyphen_values = true)]
    lon: f64,

    /// Latitude of this node in decimal degrees.
    #[clap(long, allow_hyphen_values = true)]
    lat: f64,

    /// Domain this node answers for; everything else falls through.
    #[clap(long, default_value = "svc.cluster.external")]
    base_domain: String,

    /// Upstream proxies as `[dns://|tls://]host[:port]`; may be repeated.
    #[clap(long = "upstream")]
    upstreams: Vec<String>,

    /// Subdomains of the base domain to pass through untouched.
    #[clap(long = "except")]
    except: Vec<String>,

    /// Address of the DNS listener.
    #[clap(long, default_value = "0.0.0.0:1053")]
    dns_addr: SocketAddr,

    /// Port of the push endpoint, ours and our peers' alike.
    #[clap(long, default_value_t = DEFAULT_PUSH_PORT)]
    push_port: u16,

    /// Probe failures after which an upstream counts as down; 0 disables.
    #[clap(long, default_value = "2")]
    max_fails: u32,

    /// Interval between upstream health probes.
    #[clap(long, default_value = "500")]
    health_check_ms: u64,

    /// How often the local service snapshot is logged.
    #[clap(long, default_value = "60")]
    svc_read_interval_secs: u64,

    /// How often the full local snapshot is re-pushed upstream.
    #[clap(long, default_value = "60")]
    svc_push_interval_secs: u64,

    /// Idle time after which pooled upstream connections are dropped.
    #[clap(long, default_value = "10")]
    expire_secs: u64,

    /// Always exchange with upstreams over TCP.
    #[clap(long)]
    force_tcp: bool,

    /// TLS material for tls:// upstreams: a CA; a cert and key; or a cert,
    /// key and CA.
    #[clap(long, num_args = 1..=3, value_names = ["CERT", "KEY", "CA"])]
    tls: Vec<String>,

    /// Server name presented by tls:// upstreams.
    #[clap(long)]
    tls_servername: Option<String>,

    /// Upstream selection policy: `random` or `round_robin`.
    #[clap(long, default_value = "random")]
    policy: String,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            self_ip,
            lon,
            lat,
            base_domain,
            upstreams,
            except,
            dns_addr,
            push_port,
            max_fails,
            health_check_ms,
            svc_read_interval_secs,
            svc_push_interval_secs,
            expire_secs,
            force_tcp,
            tls,
            tls_servername,
            policy,
        } = self;

        if upstreams.len() > config::MAX_UPSTREAMS {
            bail!(
                "more than {} upstreams configured: {}",
                config::MAX_UPSTREAMS,
                upstreams.len()
            );
        }
        let upstreams = upstreams
            .iter()
            .map(|raw| config::parse_upstream(raw))
            .collect::<Result<Vec<_>>>()?;
        let policy = policy.parse::<Policy>()?;

        let site = Site::new(self_ip, Point::new(lon, lat));
        let base_domain = config::normalize_domain(&base_domain);
        let except = except
            .iter()
            .map(|name| config::normalize_domain(name))
            .collect::<Vec<_>>();

        let tls_client = if upstreams.iter().any(|u| u.scheme == config::Scheme::Tls) {
            let server_name = tls_servername
                .as_deref()
                .ok_or_else(|| anyhow!("tls:// upstreams require --tls-servername"))?;
            Some(TlsClient::new(config::client_tls_config(&tls)?, server_name)?)
        } else {
            None
        };

        // Shared state and metric registries.
        let mut prom = <Registry>::default();
        let forward_metrics = ForwardMetrics::register(prom.sub_registry_with_prefix("forward"));
        let push_metrics = PushMetrics::register(prom.sub_registry_with_prefix("push"));

        let local = Arc::new(LocalServiceSet::new());
        let table = Arc::new(ServiceTable::new());

        // One push queue per upstream, fed by the watcher index.
        let mut outboxes = Vec::with_capacity(upstreams.len());
        let mut inboxes = Vec::with_capacity(upstreams.len());
        for _ in &upstreams {
            let (tx, rx) = mpsc::unbounded_channel();
            outboxes.push(tx);
            inboxes.push(rx);
        }

        let index = Index::shared(site, local.clone(), table.clone(), outboxes);
        let index_metrics = IndexMetrics::register(index, prom.sub_registry_with_prefix("index"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        let shutdown = runtime.shutdown_handle();

        // Teardown happens in stages: the watcher quiesces before the push
        // receiver, and both before the per-proxy senders and probes, so
        // nothing feeds a queue whose consumer is already gone.
        let (watcher_stop, watcher_shutdown) = drain::channel();
        let (receiver_stop, receiver_shutdown) = drain::channel();
        let (proxies_stop, proxies_shutdown) = drain::channel();

        // Watch the local cluster's services into the index.
        let services = runtime.watch_all::<Service>(watcher::Config::default());
        {
            let index =
                kubert::index::namespaced(index_metrics, services).instrument(info_span!("services"));
            tokio::spawn(async move {
                tokio::select! {
                    _ = index => {}
                    _ = watcher_shutdown.signaled() => {}
                }
            });
        }

        // Upstream proxies and their health probes.
        let expire = Duration::from_secs(expire_secs);
        let mut proxies = Vec::with_capacity(upstreams.len());
        for upstream in &upstreams {
            let tls = (upstream.scheme == config::Scheme::Tls)
                .then(|| tls_client.clone())
                .flatten();
            let mut transport = Transport::new(upstream.addr, tls);
            transport.set_expire(expire);
            proxies.push(Arc::new(Proxy::new(transport)));
        }
        let forwarder = Arc::new(Forwarder::new(
            proxies,
            policy,
            max_fails,
            force_tcp,
            forward_metrics,
        ));
        forwarder.spawn_probes(Duration::from_millis(health_check_ms), proxies_shutdown.clone());

        // Push receiver for downstream peers.
        {
            let table = table.clone();
            let metrics = push_metrics.clone();
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, push_port));
            tokio::spawn(async move {
                if let Err(error) = receiver::serve(addr, table, metrics, receiver_shutdown).await {
                    error!(%error, "push receiver failed");
                }
            });
        }

        // One queue-draining push sender per upstream.
        for (upstream, inbox) in upstreams.iter().zip(inboxes.into_iter()) {
            let endpoint: hyper::Uri =
                format!("http://{}/", SocketAddr::new(upstream.addr.ip(), push_port)).parse()?;
            let sender = Sender::new(
                endpoint,
                site,
                local.clone(),
                inbox,
                Duration::from_secs(svc_push_interval_secs),
                push_metrics.clone(),
            );
            tokio::spawn(
                sender
                    .run(proxies_shutdown.clone())
                    .instrument(info_span!("push", peer = %upstream.addr.ip())),
            );
        }
        // Only the probe and sender tasks may hold this tier's watch, or
        // draining it below would never complete.
        drop(proxies_shutdown);

        // The resolution pipeline behind the DNS listeners.
        let pipeline: Arc<dyn Handler> = Arc::new(Pipeline::new(
            site,
            &base_domain,
            &except,
            local.clone(),
            table,
            forwarder.clone(),
            None,
        )?);

        let udp = tokio::net::UdpSocket::bind(dns_addr).await?;
        let tcp = tokio::net::TcpListener::bind(dns_addr).await?;
        {
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(error) = serve_udp(udp, pipeline, shutdown).await {
                    error!(%error, "udp server failed");
                }
            });
        }
        {
            let pipeline = pipeline.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(error) = serve_tcp(tcp, pipeline, shutdown).await {
                    error!(%error, "tcp server failed");
                }
            });
        }

        tokio::spawn(log_service_snapshots(
            local,
            Duration::from_secs(svc_read_interval_secs),
            shutdown.clone(),
        ));

        // The serve loops and snapshot logger hold the runtime's own watch;
        // releasing ours lets `run` drain them on signal.
        drop(shutdown);

        // `run` returns once the host signal has fired and the query-facing
        // tasks have drained.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        // Quiesce the rest in dependency order: the watcher first so the
        // push queues stop filling, then the receiver, then each proxy's
        // sender and probe, and finally the pooled connections.
        watcher_stop.drain().await;
        receiver_stop.drain().await;
        proxies_stop.drain().await;
        for proxy in forwarder.proxies() {
            proxy.close();
        }

        Ok(())
    }
}

async fn log_service_snapshots(
    local: Arc<LocalServiceSet>,
    interval: Duration,
    shutdown: drain::Watch,
) {
    let mut ticks = tokio::time::interval(interval);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => {
                tracing::debug!(services = ?local.snapshot(), "local service snapshot");
            }
            _ = shutdown.clone().signaled() => return,
        }
    }
}
