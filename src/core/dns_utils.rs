/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Shared DNS-level helpers used across plugins and executors.

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::opt::EdnsCode;
use hickory_proto::rr::{Name, RecordType};

/// Smallest UDP payload a client is assumed to accept (RFC 1035)
pub const MIN_UDP_SIZE: u16 = 512;

/// Build a minimal DNS response from request, preserving id/opcode/query.
pub fn build_response_from_request(request: &Message, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_op_code(request.op_code());
    response.set_message_type(MessageType::Response);
    response.set_recursion_desired(request.recursion_desired());
    response.set_response_code(rcode);
    *response.queries_mut() = request.queries().to_vec();
    response
}

/// Build a recursive query for `name`/`rtype` with a zero id
pub fn build_query(name: Name, rtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, rtype));
    msg
}

/// Whether the message carries an OPT record holding `code`
pub fn has_edns_option(message: &Message, code: EdnsCode) -> bool {
    message
        .extensions()
        .as_ref()
        .is_some_and(|edns: &Edns| edns.option(code).is_some())
}

/// UDP payload size the client advertised, floored at [`MIN_UDP_SIZE`]
pub fn advertised_udp_size(message: &Message) -> u16 {
    message
        .extensions()
        .as_ref()
        .map(|edns| edns.max_payload())
        .unwrap_or(MIN_UDP_SIZE)
        .max(MIN_UDP_SIZE)
}
