/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Dialers create fresh upstream connections
//!
//! The broker never dials by itself; it hands the protocol and address to a
//! [`Dialer`]. [`NetDialer`] covers UDP, TCP and TLS over IP.

use crate::core::error::{DnsError, Result};
use crate::network::tls_config::UpstreamTls;
use crate::network::upstream::Protocol;
use crate::network::upstream::addr::{Target, UpstreamAddr};
use crate::network::upstream::conn::{DnsConn, StreamConn, UdpConn};
use async_trait::async_trait;
use socket2::{Domain, Socket, Type};
use std::fmt::Debug;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio_rustls::TlsConnector;
use tracing::debug;

#[async_trait]
pub trait Dialer: Send + Sync + Debug + 'static {
    /// Open a new connection. Deadlines are applied by the caller.
    async fn dial(
        &self,
        proto: Protocol,
        addr: &UpstreamAddr,
        tls: Option<&UpstreamTls>,
    ) -> Result<Box<dyn DnsConn>>;
}

/// Dialer for IP upstreams
#[derive(Debug, Default)]
pub struct NetDialer;

impl NetDialer {
    async fn resolve(addr: &UpstreamAddr) -> Result<SocketAddr> {
        match addr.target() {
            Target::Socket(sock) => Ok(*sock),
            Target::Host { name, port } => lookup_host((name.as_str(), *port))
                .await?
                .next()
                .ok_or_else(|| DnsError::config(format!("no address found for {name}"))),
            Target::Scion(_) => Err(DnsError::config(format!(
                "SCION upstream {addr} requires a SCION-capable dialer"
            ))),
        }
    }
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(
        &self,
        proto: Protocol,
        addr: &UpstreamAddr,
        tls: Option<&UpstreamTls>,
    ) -> Result<Box<dyn DnsConn>> {
        let remote = Self::resolve(addr).await?;
        debug!(%remote, %proto, "Dialing upstream");

        match proto {
            Protocol::Udp => {
                let socket = connect_udp(remote).await?;
                Ok(Box::new(UdpConn::new(socket)))
            }
            Protocol::Tcp => {
                let stream = TcpStream::connect(remote).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(StreamConn::new(stream, Protocol::Tcp)))
            }
            Protocol::TcpTls => {
                let tls = tls.ok_or_else(|| {
                    DnsError::config(format!("no TLS configuration for upstream {addr}"))
                })?;
                let stream = TcpStream::connect(remote).await?;
                stream.set_nodelay(true)?;
                let connector = TlsConnector::from(tls.config.clone());
                let stream = connector.connect(tls.server_name.clone(), stream).await?;
                Ok(Box::new(StreamConn::new(stream, Protocol::TcpTls)))
            }
        }
    }
}

/// Bind an unspecified local address of the remote's family and connect it
async fn connect_udp(remote: SocketAddr) -> Result<UdpSocket> {
    let (domain, local): (Domain, SocketAddr) = if remote.is_ipv4() {
        (Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into())
    } else {
        (Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into())
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;

    let socket = UdpSocket::from_std(socket.into())?;
    socket.connect(remote).await?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dns_utils::build_query;
    use hickory_proto::rr::{Name, RecordType};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_udp_and_tcp() {
        let udp_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr: UpstreamAddr = udp_server.local_addr().unwrap().to_string().parse().unwrap();
        let mut conn = NetDialer.dial(Protocol::Udp, &addr, None).await.unwrap();
        assert_eq!(conn.protocol(), Protocol::Udp);
        conn.write_msg(&build_query(Name::root(), RecordType::NS))
            .await
            .unwrap();
        let mut buf = [0u8; 512];
        assert!(udp_server.recv_from(&mut buf).await.unwrap().0 >= 17);

        let tcp_server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: UpstreamAddr = tcp_server.local_addr().unwrap().to_string().parse().unwrap();
        let conn = NetDialer.dial(Protocol::Tcp, &addr, None).await.unwrap();
        assert_eq!(conn.protocol(), Protocol::Tcp);
    }

    #[tokio::test]
    async fn test_tls_requires_material() {
        let addr: UpstreamAddr = "127.0.0.1:853".parse().unwrap();
        let err = NetDialer
            .dial(Protocol::TcpTls, &addr, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Config(_)));
    }

    #[tokio::test]
    async fn test_scion_needs_scion_dialer() {
        let addr: UpstreamAddr = "19-ffaa:1:1067,127.0.0.1:8853".parse().unwrap();
        let err = NetDialer.dial(Protocol::Udp, &addr, None).await.unwrap_err();
        assert!(matches!(err, DnsError::Config(_)));
    }
}
