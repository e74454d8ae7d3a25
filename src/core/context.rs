/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS request/response context management
//!
//! Provides a container for one exchange as it flows from an ingress
//! listener through the entry executor.

use crate::network::upstream::Protocol;
use hickory_proto::op::Message;
use std::net::SocketAddr;

/// Context object for a DNS request/response lifecycle
#[derive(Debug)]
pub struct DnsContext {
    /// Client's socket address
    pub src_addr: SocketAddr,

    /// Address of the listener that received the request
    pub local_addr: SocketAddr,

    /// Transport family the client used, as seen by upstream protocol selection
    pub protocol: Protocol,

    /// DNS request message from the client
    pub request: Message,

    /// DNS response message (populated by executors)
    pub response: Option<Message>,
}

impl DnsContext {
    pub fn new(
        src_addr: SocketAddr,
        local_addr: SocketAddr,
        protocol: Protocol,
        request: Message,
    ) -> Self {
        Self {
            src_addr,
            local_addr,
            protocol,
            request,
            response: None,
        }
    }
}
