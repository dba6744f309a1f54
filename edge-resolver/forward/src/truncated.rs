use trust_dns_proto::op::{Message, ResponseCode};

use crate::{message, Error};

/// Maps a truncated exchange onto something the client can act on.
///
/// A reply that decoded with TC set passes through untouched. An
/// undecodable truncated datagram becomes a minimal reply with TC set so
/// the client retries over TCP.
pub(crate) fn recover(request: &Message, result: Result<Message, Error>) -> Result<Message, Error> {
    match result {
        Err(Error::Truncated) => {
            let mut reply = message::reply_with_code(request, ResponseCode::NoError);
            reply.set_truncated(true);
            Ok(reply)
        }
        other => other,
    }
}
