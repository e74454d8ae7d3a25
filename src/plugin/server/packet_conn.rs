/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Packet connections the QUIC listener runs on
//!
//! The plain DoQ listener binds an ordinary UDP socket. The SCION listener
//! binds the end-host underlay socket named by a SCION listen address.

use crate::core::error::{DnsError, Result};
use crate::network::upstream::addr::{IsdAs, parse_scion_listen};
use quinn::{AsyncUdpSocket, Runtime, TokioRuntime};
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Source of the datagram socket a QUIC endpoint is built on
pub trait PacketConnProvider: Debug + Send + Sync + 'static {
    /// URL scheme served over this provider (`quic` or `squic`)
    fn scheme(&self) -> &'static str;

    /// Check a listen address without binding
    fn validate(&self, addr: &str) -> Result<()>;

    fn listen_packet(&self, addr: &str) -> Result<Arc<dyn AsyncUdpSocket>>;
}

/// Plain UDP on `ip:port`
#[derive(Debug, Default)]
pub struct UdpPacketConn;

impl PacketConnProvider for UdpPacketConn {
    fn scheme(&self) -> &'static str {
        "quic"
    }

    fn validate(&self, addr: &str) -> Result<()> {
        SocketAddr::from_str(addr)
            .map(|_| ())
            .map_err(|_| DnsError::config(format!("Invalid listen address: {}", addr)))
    }

    fn listen_packet(&self, addr: &str) -> Result<Arc<dyn AsyncUdpSocket>> {
        let addr = SocketAddr::from_str(addr)
            .map_err(|_| DnsError::config(format!("Invalid listen address: {}", addr)))?;
        bind_udp(addr)
    }
}

/// SCION end-host underlay: `[ISD-AS,][ip]:port`
#[derive(Debug, Default)]
pub struct ScionPacketConn;

impl ScionPacketConn {
    pub fn parse(addr: &str) -> Result<(Option<IsdAs>, SocketAddr)> {
        parse_scion_listen(addr)
            .map_err(|e| DnsError::config(format!("Invalid SCION listen address {}: {}", addr, e)))
    }
}

impl PacketConnProvider for ScionPacketConn {
    fn scheme(&self) -> &'static str {
        "squic"
    }

    fn validate(&self, addr: &str) -> Result<()> {
        Self::parse(addr).map(|_| ())
    }

    fn listen_packet(&self, addr: &str) -> Result<Arc<dyn AsyncUdpSocket>> {
        let (ia, underlay) = Self::parse(addr)?;
        let socket = bind_udp(underlay)?;
        match ia {
            Some(ia) => info!(%ia, %underlay, "SCION packet connection bound"),
            None => info!(%underlay, "SCION packet connection bound (local AS)"),
        }
        Ok(socket)
    }
}

fn bind_udp(addr: SocketAddr) -> Result<Arc<dyn AsyncUdpSocket>> {
    let sock = if addr.is_ipv4() {
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?
    } else {
        let s = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        s.set_only_v6(true)?;
        s
    };
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;

    Ok(TokioRuntime.wrap_udp_socket(sock.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_bind_ephemeral() {
        let socket = UdpPacketConn.listen_packet("127.0.0.1:0").unwrap();
        let local = socket.local_addr().unwrap();
        assert!(local.ip().is_loopback());
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_udp_rejects_scion_form() {
        assert!(UdpPacketConn.validate("127.0.0.1:8853").is_ok());
        assert!(UdpPacketConn.validate(":8853").is_err());
        assert!(
            UdpPacketConn
                .validate("19-ffaa:1:1067,127.0.0.1:8853")
                .is_err()
        );
    }

    #[test]
    fn test_scion_listen_forms() {
        let (ia, addr) = ScionPacketConn::parse(":8853").unwrap();
        assert!(ia.is_none());
        assert_eq!(addr, "0.0.0.0:8853".parse().unwrap());

        let (ia, addr) = ScionPacketConn::parse("19-ffaa:1:1067,127.0.0.1:8853").unwrap();
        assert_eq!(ia.unwrap().to_string(), "19-ffaa:1:1067");
        assert_eq!(addr, "127.0.0.1:8853".parse().unwrap());

        assert!(ScionPacketConn.validate("not-an-address").is_err());
    }

    #[tokio::test]
    async fn test_scion_bind_underlay() {
        let socket = ScionPacketConn
            .listen_packet("1-ff00:0:110,127.0.0.1:0")
            .unwrap();
        assert!(socket.local_addr().unwrap().ip().is_loopback());
    }
}
