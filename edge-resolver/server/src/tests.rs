use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use edge_resolver_core::{Point, Site};
use edge_resolver_forward::{reply_with_code, ForwardMetrics, Forwarder, Policy, Protocol, Proxy, Transport};
use edge_resolver_index::{LocalServiceSet, ServiceTable};
use tokio::net::UdpSocket;
use trust_dns_proto::{
    op::{Message, MessageType, Query, ResponseCode},
    rr::{Name, RData, RecordType},
};

use crate::{loc, pipeline::nearest_site, scrub, Handler, Pipeline, Request};

const BASE_DOMAIN: &str = "cluster.external.";

fn site(ip: &str, lon: f64, lat: f64) -> Site {
    Site::new(ip.parse().unwrap(), Point::new(lon, lat))
}

fn forwarder(proxies: Vec<Arc<Proxy>>) -> Arc<Forwarder> {
    let metrics = ForwardMetrics::register(&mut prometheus_client::registry::Registry::default());
    Arc::new(Forwarder::new(proxies, Policy::Random, 0, false, metrics))
}

fn query_message(name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(7);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
    message
}

fn request(message: Message) -> Request {
    Request {
        message,
        src: "198.51.100.7:53000".parse().unwrap(),
        proto: Protocol::Udp,
    }
}

/// Marks fallthrough by answering Refused.
struct NextMarker(Arc<AtomicBool>);

#[async_trait::async_trait]
impl Handler for NextMarker {
    async fn handle(&self, request: &mut Request) -> anyhow::Result<Message> {
        self.0.store(true, Ordering::SeqCst);
        Ok(reply_with_code(&request.message, ResponseCode::Refused))
    }
}

struct TestNode {
    local: Arc<LocalServiceSet>,
    table: Arc<ServiceTable>,
    next_called: Arc<AtomicBool>,
}

impl TestNode {
    fn new() -> Self {
        Self {
            local: Arc::new(LocalServiceSet::new()),
            table: Arc::new(ServiceTable::new()),
            next_called: Arc::new(AtomicBool::new(false)),
        }
    }

    fn pipeline(&self, self_site: Site, forwarder: Arc<Forwarder>) -> Pipeline {
        Pipeline::new(
            self_site,
            BASE_DOMAIN,
            &[],
            self.local.clone(),
            self.table.clone(),
            forwarder,
            Some(Arc::new(NextMarker(self.next_called.clone()))),
        )
        .unwrap()
    }
}

fn answer_ip(reply: &Message) -> Option<RData> {
    reply.answers().first().and_then(|r| r.data().cloned())
}

#[tokio::test]
async fn local_service_answers_with_the_self_ip() {
    let node = TestNode::new();
    node.local.add("web.ns.svc.cluster.external");
    let pipeline = node.pipeline(site("10.0.0.1", 10.0, 10.0), forwarder(Vec::new()));

    let mut req = request(query_message("web.ns.svc.cluster.external.", RecordType::A));
    let reply = pipeline.handle(&mut req).await.unwrap();

    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(reply.authoritative());
    assert_eq!(answer_ip(&reply), Some(RData::A("10.0.0.1".parse().unwrap())));
    assert!(!node.next_called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn table_hit_answers_with_the_site_nearest_the_origin() {
    let node = TestNode::new();
    node.table.add(site("1.1.1.1", 0.0, 0.0), "api.ns.svc.cluster.external");
    node.table
        .add(site("2.2.2.2", 50.0, 50.0), "api.ns.svc.cluster.external");
    let pipeline = node.pipeline(site("10.0.0.1", 10.0, 10.0), forwarder(Vec::new()));

    // The query was forwarded by a hop at (49, 49); 2.2.2.2 is closest.
    let mut message = query_message("api.ns.svc.cluster.external.", RecordType::A);
    let annotation = loc::annotation_record(&Point::new(49.0, 49.0)).unwrap();
    loc::annotate(&mut message, annotation);

    let reply = pipeline.handle(&mut request(message)).await.unwrap();
    assert_eq!(answer_ip(&reply), Some(RData::A("2.2.2.2".parse().unwrap())));
}

#[tokio::test]
async fn annotated_queries_skip_the_local_answer() {
    let node = TestNode::new();
    // The watcher registered the service locally and in the table.
    node.local.add("api.ns.svc.cluster.external");
    node.table.add(site("10.0.0.1", 10.0, 10.0), "api.ns.svc.cluster.external");
    node.table
        .add(site("2.2.2.2", 50.0, 50.0), "api.ns.svc.cluster.external");
    let pipeline = node.pipeline(site("10.0.0.1", 10.0, 10.0), forwarder(Vec::new()));

    let mut message = query_message("api.ns.svc.cluster.external.", RecordType::A);
    let annotation = loc::annotation_record(&Point::new(49.0, 49.0)).unwrap();
    loc::annotate(&mut message, annotation);

    // Nearest-site selection sees both sites and the origin's reference
    // point, rather than short-circuiting on the local set.
    let reply = pipeline.handle(&mut request(message)).await.unwrap();
    assert_eq!(answer_ip(&reply), Some(RData::A("2.2.2.2".parse().unwrap())));
}

#[tokio::test]
async fn names_outside_the_base_domain_fall_through() {
    let node = TestNode::new();
    let pipeline = node.pipeline(site("10.0.0.1", 10.0, 10.0), forwarder(Vec::new()));

    let mut req = request(query_message("example.com.", RecordType::A));
    let reply = pipeline.handle(&mut req).await.unwrap();

    assert!(node.next_called.load(Ordering::SeqCst));
    assert_eq!(reply.response_code(), ResponseCode::Refused);
}

#[tokio::test]
async fn unknown_services_fall_through_without_proxies() {
    let node = TestNode::new();
    let pipeline = node.pipeline(site("10.0.0.1", 10.0, 10.0), forwarder(Vec::new()));

    let mut req = request(query_message("ghost.ns.svc.cluster.external.", RecordType::A));
    let _ = pipeline.handle(&mut req).await.unwrap();
    assert!(node.next_called.load(Ordering::SeqCst));
}

/// An upstream that records the message it received and echoes NoError.
async fn spawn_capturing_upstream() -> (SocketAddr, Arc<Mutex<Option<Message>>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(None));
    let capture = captured.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(received) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            let mut reply = Message::new();
            reply.set_id(received.id());
            reply.set_message_type(MessageType::Response);
            reply.set_response_code(ResponseCode::NoError);
            for q in received.queries() {
                reply.add_query(q.clone());
            }
            *capture.lock().unwrap() = Some(received);
            let _ = socket.send_to(&reply.to_vec().unwrap(), src).await;
        }
    });
    (addr, captured)
}

#[tokio::test]
async fn misses_are_forwarded_with_a_trailing_annotation() {
    let (upstream, captured) = spawn_capturing_upstream().await;
    let node = TestNode::new();
    let proxies = vec![Arc::new(Proxy::new(Transport::new(upstream, None)))];
    let pipeline = node.pipeline(site("10.0.0.1", 10.0, 10.0), forwarder(proxies));

    let mut req = request(query_message("ghost.ns.svc.cluster.external.", RecordType::A));
    let reply = pipeline.handle(&mut req).await.unwrap();

    // The upstream's reply came back verbatim.
    assert_eq!(reply.id(), 7);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(!node.next_called.load(Ordering::SeqCst));

    // The outbound message carried exactly one annotation, at the end of
    // the Additional section, encoding the forwarder's coordinates.
    let outbound = captured.lock().unwrap().clone().unwrap();
    let extras = outbound.additionals();
    assert_eq!(extras.len(), 1);
    let last = extras.last().unwrap();
    assert_eq!(last.name().to_ascii(), loc::ANNOTATION_OWNER);
    let origin = loc::decode(last).unwrap();
    assert!((origin.lon - 10.0).abs() < 1e-6);
    assert!((origin.lat - 10.0).abs() < 1e-6);
}

#[test]
fn annotation_round_trips_within_rounding() {
    for (lon, lat) in [
        (0.0, 0.0),
        (13.4050, 52.5200),
        (-0.1278, 51.5074),
        (151.2093, -33.8688),
        (-180.0, -90.0),
        (180.0, 90.0),
    ] {
        let record = loc::annotation_record(&Point::new(lon, lat)).unwrap();
        let decoded = loc::decode(&record).unwrap();
        assert!((decoded.lon - lon).abs() < 1e-6, "lon {}", lon);
        assert!((decoded.lat - lat).abs() < 1e-6, "lat {}", lat);
    }
}

#[test]
fn out_of_range_coordinates_are_rejected() {
    assert!(loc::annotation_record(&Point::new(181.0, 0.0)).is_err());
    assert!(loc::annotation_record(&Point::new(0.0, 91.0)).is_err());
}

#[test]
fn annotation_is_consumed_only_when_last() {
    let point = Point::new(13.4, 52.5);
    let annotation = loc::annotation_record(&point).unwrap();

    // Last entry: consumed.
    let mut message = query_message("api.ns.svc.cluster.external.", RecordType::A);
    loc::annotate(&mut message, annotation.clone());
    let origin = loc::extract_annotation(&mut message).unwrap();
    assert!((origin.lat - 52.5).abs() < 1e-6);
    assert!(message.additionals().is_empty());

    // Followed by another record: left untouched.
    let mut message = query_message("api.ns.svc.cluster.external.", RecordType::A);
    loc::annotate(&mut message, annotation);
    let trailing = trust_dns_proto::rr::Record::from_rdata(
        Name::from_ascii("other.example.").unwrap(),
        0,
        RData::A("192.0.2.1".parse().unwrap()),
    );
    message.add_additional(trailing);
    assert!(loc::extract_annotation(&mut message).is_none());
    assert_eq!(message.additionals().len(), 2);

    // No additionals at all.
    let mut message = query_message("api.ns.svc.cluster.external.", RecordType::A);
    assert!(loc::extract_annotation(&mut message).is_none());
}

#[test]
fn nearest_site_breaks_ties_by_lowest_ip() {
    let reference = Point::new(0.0, 0.0);
    let sites = [
        site("9.9.9.9", 10.0, 0.0),
        site("1.2.3.4", -10.0, 0.0),
    ];
    let closest = nearest_site(&sites, &reference).unwrap();
    assert_eq!(closest.ip, "1.2.3.4".parse::<std::net::IpAddr>().unwrap());

    // Order of the candidates must not matter.
    let reversed = [sites[1], sites[0]];
    assert_eq!(nearest_site(&reversed, &reference).unwrap().ip, closest.ip);
}

#[test]
fn oversized_udp_responses_are_truncated() {
    let request = query_message("api.ns.svc.cluster.external.", RecordType::A);
    let mut reply = reply_with_code(&request, ResponseCode::NoError);
    for i in 0..100 {
        let name = Name::from_ascii(format!("r{}.api.ns.svc.cluster.external.", i)).unwrap();
        let record = trust_dns_proto::rr::Record::from_rdata(
            name,
            0,
            RData::A("192.0.2.1".parse().unwrap()),
        );
        reply.add_answer(record);
    }

    scrub::scrub(&mut reply, Protocol::Udp, 512);
    assert!(reply.truncated());
    assert!(reply.answers().is_empty());

    // TCP responses are never scrubbed.
    let mut tcp_reply = reply_with_code(&request, ResponseCode::NoError);
    for i in 0..100 {
        let name = Name::from_ascii(format!("r{}.api.ns.svc.cluster.external.", i)).unwrap();
        tcp_reply.add_answer(trust_dns_proto::rr::Record::from_rdata(
            name,
            0,
            RData::A("192.0.2.1".parse().unwrap()),
        ));
    }
    scrub::scrub(&mut tcp_reply, Protocol::Tcp, 512);
    assert!(!tcp_reply.truncated());
    assert_eq!(tcp_reply.answers().len(), 100);
}
