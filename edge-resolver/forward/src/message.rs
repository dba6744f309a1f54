use trust_dns_proto::op::{Message, MessageType, ResponseCode};

/// Builds an authoritative reply to `request` carrying only `code`.
pub fn reply_with_code(request: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_authoritative(true);
    reply.set_response_code(code);
    for query in request.queries() {
        reply.add_query(query.clone());
    }
    reply
}

/// True iff `reply` echoes the id and question of `request`.
pub(crate) fn is_reply_to(reply: &Message, request: &Message) -> bool {
    if reply.id() != request.id() {
        return false;
    }
    let questions = request.queries();
    let echoed = reply.queries();
    questions.len() == echoed.len()
        && questions.iter().zip(echoed).all(|(q, e)| {
            q.query_type() == e.query_type()
                && q.query_class() == e.query_class()
                && q.name().to_lowercase() == e.name().to_lowercase()
        })
}
