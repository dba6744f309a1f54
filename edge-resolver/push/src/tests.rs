use std::{
    collections::VecDeque,
    convert::Infallible,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use edge_resolver_core::{Point, ServiceEvent, ServiceTableUpdate, Site};
use edge_resolver_index::{LocalServiceSet, ServiceTable};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode, Uri,
};
use tokio::sync::mpsc;

use crate::{receiver, PushMetrics, Sender, ACK_HEADER, ACK_VALUE};

fn metrics() -> Arc<PushMetrics> {
    PushMetrics::register(&mut prometheus_client::registry::Registry::default())
}

fn site(ip: &str) -> Site {
    Site::new(ip.parse().unwrap(), Point::new(13.4, 52.5))
}

fn update(ip: &str, event: ServiceEvent) -> ServiceTableUpdate {
    ServiceTableUpdate {
        meta: site(ip),
        event,
    }
}

async fn spawn_receiver(table: Arc<ServiceTable>) -> (SocketAddr, drain::Signal) {
    let (signal, watch) = drain::channel();
    let (addr, serve) = receiver::bind(
        &"127.0.0.1:0".parse().unwrap(),
        table,
        metrics(),
        watch,
    )
    .unwrap();
    tokio::spawn(serve);
    (addr, signal)
}

async fn post(addr: SocketAddr, body: Vec<u8>) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}/", addr))
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    hyper::Client::new().request(request).await.unwrap()
}

async fn post_update(addr: SocketAddr, update: &ServiceTableUpdate) -> Response<Body> {
    post(addr, serde_json::to_vec(update).unwrap()).await
}

#[tokio::test]
async fn receiver_acks_applied_updates() {
    let table = Arc::new(ServiceTable::new());
    let (addr, _signal) = spawn_receiver(table.clone()).await;

    let svc = "web.prod.svc.cluster.external";
    let response = post_update(addr, &update("10.1.0.3", ServiceEvent::add(svc))).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(ACK_HEADER).unwrap().to_str().unwrap(),
        ACK_VALUE
    );
    assert_eq!(table.lookup(svc).unwrap(), vec![site("10.1.0.3")]);
}

#[tokio::test]
async fn receiver_converges_regardless_of_replays() {
    let table = Arc::new(ServiceTable::new());
    let (addr, _signal) = spawn_receiver(table.clone()).await;
    let svc = "api.prod.svc.cluster.external";

    post_update(addr, &update("10.1.0.3", ServiceEvent::add(svc))).await;
    post_update(addr, &update("10.1.0.3", ServiceEvent::add(svc))).await;
    post_update(addr, &update("10.2.0.3", ServiceEvent::add(svc))).await;
    post_update(addr, &update("10.1.0.3", ServiceEvent::delete(svc))).await;

    assert_eq!(table.lookup(svc).unwrap(), vec![site("10.2.0.3")]);

    post_update(addr, &update("10.2.0.3", ServiceEvent::delete(svc))).await;
    assert!(table.lookup(svc).is_none());
}

#[tokio::test]
async fn receiver_rejects_malformed_updates() {
    let table = Arc::new(ServiceTable::new());
    let (addr, _signal) = spawn_receiver(table.clone()).await;

    let response = post(addr, b"{not json".to_vec()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.headers().get(ACK_HEADER).is_none());

    let unknown_kind =
        br#"{"meta":{"ip":"10.0.0.9","lon":0.0,"lat":0.0},"event":{"type":"replace","service":"x"}}"#;
    let response = post(addr, unknown_kind.to_vec()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(table.is_empty());
}

#[tokio::test]
async fn receiver_only_accepts_posts() {
    let table = Arc::new(ServiceTable::new());
    let (addr, _signal) = spawn_receiver(table).await;

    let request = Request::builder()
        .method(Method::GET)
        .uri(format!("http://{}/", addr))
        .body(Body::empty())
        .unwrap();
    let response = hyper::Client::new().request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

/// An HTTP stub whose scripted responses run out into "200 + ack".
struct Stub {
    responses: Mutex<VecDeque<(StatusCode, bool)>>,
    seen: Mutex<Vec<ServiceTableUpdate>>,
}

impl Stub {
    fn scripted(responses: Vec<(StatusCode, bool)>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<ServiceTableUpdate> {
        self.seen.lock().unwrap().clone()
    }
}

async fn spawn_stub(stub: Arc<Stub>) -> SocketAddr {
    let make = make_service_fn(move |_conn| {
        let stub = stub.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let stub = stub.clone();
                async move {
                    let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
                    let update = serde_json::from_slice(&body).unwrap();
                    stub.seen.lock().unwrap().push(update);
                    let (status, ack) = stub
                        .responses
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or((StatusCode::OK, true));
                    let mut response = Response::builder().status(status);
                    if ack {
                        response = response.header(ACK_HEADER, ACK_VALUE);
                    }
                    Ok::<_, Infallible>(response.body(Body::empty()).unwrap())
                }
            }))
        }
    });
    let server = hyper::server::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

fn spawn_sender(
    addr: SocketAddr,
    local: Arc<LocalServiceSet>,
    catch_up: Duration,
) -> (mpsc::UnboundedSender<ServiceEvent>, drain::Signal) {
    let endpoint: Uri = format!("http://{}/", addr).parse().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut sender = Sender::new(endpoint, site("10.0.0.1"), local, rx, catch_up, metrics());
    sender.set_retry_delay(Duration::from_millis(50));
    let (signal, watch) = drain::channel();
    tokio::spawn(sender.run(watch));
    (tx, signal)
}

#[tokio::test]
async fn sender_retries_until_the_sentinel_appears() {
    let stub = Stub::scripted(vec![(StatusCode::OK, false), (StatusCode::OK, true)]);
    let addr = spawn_stub(stub.clone()).await;
    let (tx, _signal) = spawn_sender(addr, Arc::new(LocalServiceSet::new()), Duration::from_secs(3600));

    tx.send(ServiceEvent::add("web.prod.svc.cluster.external"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let seen = stub.seen();
    assert_eq!(seen.len(), 2, "expected one unacked send and one retry");
    assert_eq!(seen[0], seen[1]);
}

#[tokio::test]
async fn sender_drops_events_on_non_200() {
    let stub = Stub::scripted(vec![(StatusCode::INTERNAL_SERVER_ERROR, false)]);
    let addr = spawn_stub(stub.clone()).await;
    let (tx, _signal) = spawn_sender(addr, Arc::new(LocalServiceSet::new()), Duration::from_secs(3600));

    tx.send(ServiceEvent::add("web.prod.svc.cluster.external"))
        .unwrap();
    // Longer than the retry delay, so a retry would have shown up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(stub.seen().len(), 1);
}

#[tokio::test]
async fn sender_periodically_re_advertises_the_snapshot() {
    let stub = Stub::scripted(Vec::new());
    let addr = spawn_stub(stub.clone()).await;

    let local = Arc::new(LocalServiceSet::new());
    local.add("web.prod.svc.cluster.external");
    let (_tx, _signal) = spawn_sender(addr, local, Duration::from_millis(50));

    tokio::time::sleep(Duration::from_millis(200)).await;

    let seen = stub.seen();
    assert!(seen.len() >= 2, "expected repeated catch-up pushes");
    for update in seen {
        assert_eq!(update.event, ServiceEvent::add("web.prod.svc.cluster.external"));
    }
}
