/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream DNS relay infrastructure
//!
//! A [`Proxy`] relays queries to exactly one upstream address over pooled,
//! reusable connections.
//!
//! # Supported Protocols
//! - **UDP**: plain DNS over UDP (port 53)
//! - **TCP**: DNS over TCP (port 53)
//! - **DoT**: DNS over TLS (port 853), forced whenever TLS material is configured
//!
//! # Connection Management
//! - **Broker** (`broker.rs`): one coordinator task owns the idle cache; callers
//!   borrow connections through a request/response channel pair and dial
//!   outside of it with an adaptive timeout
//! - **Relay** (`connect.rs`): query-ID rewriting, write/read deadlines,
//!   spoofed reply rejection and stale connection detection
//! - **Health** (`health.rs`): optional in-band `. IN NS` probing

use crate::core::dns_utils::advertised_udp_size;
use hickory_proto::op::Message;
use std::fmt::{Display, Formatter};

pub mod addr;
pub mod broker;
pub mod conn;
mod connect;
pub mod dialer;
pub mod health;
pub mod metrics;
#[cfg(test)]
pub(crate) mod mock;
mod proxy;

pub use addr::UpstreamAddr;
pub use proxy::{Proxy, ProxyConfig};

/// Wire protocol used to talk to an upstream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
    TcpTls,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::TcpTls => "tcp-tls",
        }
    }

    /// Returns the default port for each protocol
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Udp | Protocol::Tcp => 53,
            Protocol::TcpTls => 853,
        }
    }

    pub fn is_stream(&self) -> bool {
        !matches!(self, Protocol::Udp)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call transport preferences of the relay
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Always use TCP towards the upstream; wins over `prefer_udp`
    pub force_tcp: bool,
    /// Use UDP towards the upstream even if the client came in over a stream
    pub prefer_udp: bool,
}

/// The client query being relayed, plus the protocol it arrived on
///
/// The request is borrowed mutably because its ID is replaced while it is on
/// the wire; it is restored before the relay returns.
#[derive(Debug)]
pub struct RequestState<'a> {
    pub req: &'a mut Message,
    pub proto: Protocol,
}

impl<'a> RequestState<'a> {
    pub fn new(req: &'a mut Message, proto: Protocol) -> Self {
        Self { req, proto }
    }

    /// Receive buffer hint: the client's advertised UDP size, at least 512
    pub fn size(&self) -> u16 {
        advertised_udp_size(self.req)
    }
}

/// Pick the upstream protocol for one exchange
///
/// `force_tcp` wins over `prefer_udp`, which wins over the client's protocol.
/// An explicit scheme on the upstream address overrides all three. SCION
/// upstreams carry no scheme and keep the choice made from the options.
pub fn select_protocol(addr: &UpstreamAddr, client: Protocol, opts: Options) -> Protocol {
    let proto = if opts.force_tcp {
        Protocol::Tcp
    } else if opts.prefer_udp {
        Protocol::Udp
    } else {
        client
    };
    addr.scheme().unwrap_or(proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Edns;

    #[test]
    fn test_option_precedence() {
        let plain: UpstreamAddr = "192.0.2.1:53".parse().unwrap();
        // client protocol is the fallback
        assert_eq!(
            select_protocol(&plain, Protocol::Tcp, Options::default()),
            Protocol::Tcp
        );
        // prefer_udp beats the client protocol
        let prefer_udp = Options {
            prefer_udp: true,
            ..Default::default()
        };
        assert_eq!(
            select_protocol(&plain, Protocol::Tcp, prefer_udp),
            Protocol::Udp
        );
        // force_tcp beats prefer_udp
        let both = Options {
            force_tcp: true,
            prefer_udp: true,
        };
        assert_eq!(select_protocol(&plain, Protocol::Udp, both), Protocol::Tcp);
    }

    #[test]
    fn test_scheme_overrides_options() {
        let tls: UpstreamAddr = "tls://192.0.2.1".parse().unwrap();
        let force_tcp = Options {
            force_tcp: true,
            ..Default::default()
        };
        assert_eq!(
            select_protocol(&tls, Protocol::Udp, force_tcp),
            Protocol::TcpTls
        );

        let udp: UpstreamAddr = "dns://192.0.2.1".parse().unwrap();
        assert_eq!(
            select_protocol(&udp, Protocol::Tcp, force_tcp),
            Protocol::Udp
        );
    }

    #[test]
    fn test_scion_keeps_caller_choice() {
        let scion: UpstreamAddr = "19-ffaa:1:1067,127.0.0.1:8853".parse().unwrap();
        let force_tcp = Options {
            force_tcp: true,
            ..Default::default()
        };
        assert_eq!(
            select_protocol(&scion, Protocol::Udp, force_tcp),
            Protocol::Tcp
        );
        assert_eq!(
            select_protocol(&scion, Protocol::Udp, Options::default()),
            Protocol::Udp
        );
    }

    #[test]
    fn test_request_state_size() {
        let mut msg = Message::new();
        assert_eq!(RequestState::new(&mut msg, Protocol::Udp).size(), 512);

        let mut edns = Edns::new();
        edns.set_max_payload(4096);
        msg.set_edns(edns);
        assert_eq!(RequestState::new(&mut msg, Protocol::Udp).size(), 4096);
    }

    #[test]
    fn test_protocol_ports() {
        assert_eq!(Protocol::Udp.default_port(), 53);
        assert_eq!(Protocol::TcpTls.default_port(), 853);
        assert_eq!(Protocol::TcpTls.to_string(), "tcp-tls");
        assert!(Protocol::Tcp.is_stream());
        assert!(!Protocol::Udp.is_stream());
    }
}
