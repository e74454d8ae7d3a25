/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream connections
//!
//! A [`DnsConn`] moves whole DNS messages over one socket. Datagram
//! connections send one message per packet; stream connections use the
//! 2-byte length framing. Connections carry no deadlines of their own; the
//! relay bounds every call with a timeout.

use crate::core::error::{DnsError, Result};
use crate::network::transport::{read_framed, write_framed};
use crate::network::upstream::Protocol;
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;

/// One live connection to one upstream over one protocol
#[async_trait]
pub trait DnsConn: Send + Sync + Debug {
    /// Send one complete message
    async fn write_msg(&mut self, msg: &Message) -> Result<()>;

    /// Receive one complete message
    ///
    /// Undecodable input is reported as a protocol error, everything the
    /// socket reports as an I/O error.
    async fn read_msg(&mut self) -> Result<Message>;

    /// Largest datagram the next read should accept
    fn set_udp_size(&mut self, size: u16);

    fn protocol(&self) -> Protocol;
}

/// Connected UDP socket
pub struct UdpConn {
    socket: UdpSocket,
    udp_size: u16,
}

impl UdpConn {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            udp_size: crate::core::dns_utils::MIN_UDP_SIZE,
        }
    }
}

impl Debug for UdpConn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpConn")
            .field("peer", &self.socket.peer_addr().ok())
            .field("udp_size", &self.udp_size)
            .finish()
    }
}

#[async_trait]
impl DnsConn for UdpConn {
    async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.to_bytes()?;
        let sent = self.socket.send(&bytes).await?;
        if sent != bytes.len() {
            return Err(DnsError::Io(std::io::Error::new(
                ErrorKind::WriteZero,
                format!("partial UDP send: {} of {} bytes", sent, bytes.len()),
            )));
        }
        Ok(())
    }

    async fn read_msg(&mut self) -> Result<Message> {
        let mut buf = vec![0u8; self.udp_size as usize];
        let n = self.socket.recv(&mut buf).await?;
        Ok(Message::from_bytes(&buf[..n])?)
    }

    fn set_udp_size(&mut self, size: u16) {
        self.udp_size = size.max(crate::core::dns_utils::MIN_UDP_SIZE);
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }
}

/// Length-framed stream (TCP or TLS over TCP)
pub struct StreamConn<S> {
    stream: S,
    proto: Protocol,
}

impl<S> StreamConn<S> {
    pub fn new(stream: S, proto: Protocol) -> Self {
        Self { stream, proto }
    }
}

impl<S> Debug for StreamConn<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConn")
            .field("proto", &self.proto)
            .finish()
    }
}

#[async_trait]
impl<S> DnsConn for StreamConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        let bytes = msg.to_bytes()?;
        write_framed(&mut self.stream, &bytes).await
    }

    async fn read_msg(&mut self) -> Result<Message> {
        let bytes = read_framed(&mut self.stream).await?;
        Ok(Message::from_bytes(&bytes)?)
    }

    // Stream messages are length-delimited
    fn set_udp_size(&mut self, _size: u16) {}

    fn protocol(&self) -> Protocol {
        self.proto
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A pooled connection with its last-use timestamp
#[derive(Debug)]
pub struct PersistConn {
    pub id: u64,
    pub conn: Box<dyn DnsConn>,
    /// Set when the connection is yielded back to the pool
    pub used: Instant,
}

impl PersistConn {
    pub fn new(conn: Box<dyn DnsConn>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            conn,
            used: Instant::now(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.conn.protocol()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dns_utils::build_query;
    use hickory_proto::rr::{Name, RecordType};
    use tokio::io::AsyncWriteExt;

    fn query(id: u16) -> Message {
        let mut msg = build_query(Name::root(), RecordType::NS);
        msg.set_id(id);
        msg
    }

    #[tokio::test]
    async fn test_udp_conn_exchange() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();
        let mut conn = UdpConn::new(client);

        conn.write_msg(&query(7)).await.unwrap();
        let mut buf = [0u8; 512];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        let received = Message::from_bytes(&buf[..n]).unwrap();
        assert_eq!(received.id(), 7);

        server.send_to(&buf[..n], from).await.unwrap();
        assert_eq!(conn.read_msg().await.unwrap().id(), 7);
    }

    #[tokio::test]
    async fn test_udp_garbage_is_not_network_error() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();
        let local = client.local_addr().unwrap();
        let mut conn = UdpConn::new(client);

        server.send_to(&[0xde, 0xad], local).await.unwrap();
        let err = conn.read_msg().await.unwrap_err();
        assert!(!err.is_network());
    }

    #[tokio::test]
    async fn test_stream_conn_framing() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = StreamConn::new(client, Protocol::Tcp);

        conn.write_msg(&query(99)).await.unwrap();
        let body = read_framed(&mut server).await.unwrap();
        assert_eq!(Message::from_bytes(&body).unwrap().id(), 99);

        write_framed(&mut server, &body).await.unwrap();
        assert_eq!(conn.read_msg().await.unwrap().id(), 99);
    }

    #[tokio::test]
    async fn test_stream_conn_peer_close() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut conn = StreamConn::new(client, Protocol::Tcp);
        server.shutdown().await.unwrap();
        drop(server);
        let err = conn.read_msg().await.unwrap_err();
        assert!(err.is_closed());
    }

    #[test]
    fn test_persist_conn_ids_unique() {
        let (a, _) = tokio::io::duplex(16);
        let (b, _) = tokio::io::duplex(16);
        let a = PersistConn::new(Box::new(StreamConn::new(a, Protocol::Tcp)));
        let b = PersistConn::new(Box::new(StreamConn::new(b, Protocol::Tcp)));
        assert_ne!(a.id, b.id);
        assert_eq!(a.protocol(), Protocol::Tcp);
    }
}
