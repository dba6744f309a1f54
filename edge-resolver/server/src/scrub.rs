use trust_dns_proto::op::Message;

use edge_resolver_forward::Protocol;

const MIN_UDP_SIZE: u16 = 512;

/// Shrinks `response` to fit the client's transport.
///
/// Over UDP, a response larger than the client's advertised EDNS payload
/// (floor 512) has its sections emptied and TC set so the client retries
/// over TCP. TCP responses are never scrubbed.
pub(crate) fn scrub(response: &mut Message, proto: Protocol, advertised: u16) {
    if proto != Protocol::Udp {
        return;
    }
    let limit = usize::from(advertised.max(MIN_UDP_SIZE));

    match response.to_vec() {
        Ok(encoded) if encoded.len() <= limit => {}
        Ok(_) => {
            response.take_answers();
            response.take_name_servers();
            response.take_additionals();
            response.set_truncated(true);
        }
        // An unencodable response fails later on the write path; nothing to
        // scrub here.
        Err(_) => {}
    }
}

/// The EDNS payload size a client advertised, floored at 512.
pub(crate) fn advertised_size(request: &Message) -> u16 {
    request
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload())
        .unwrap_or(MIN_UDP_SIZE)
        .max(MIN_UDP_SIZE)
}
