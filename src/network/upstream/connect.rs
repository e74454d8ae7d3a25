/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Query relay: one exchange with the upstream over a pooled connection

use crate::core::error::{DnsError, Result};
use crate::network::upstream::proxy::Proxy;
use crate::network::upstream::{Options, Protocol, RequestState, select_protocol};
use hickory_proto::op::Message;
use std::ops::Deref;
use std::time::{Duration, Instant};
use tokio::time::{timeout, timeout_at};
use tracing::{Level, debug, event_enabled};

/// Write deadline for one query
pub const MAX_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Replaces the query ID with a random one and puts the client's ID back
/// when dropped
struct IdGuard<'a> {
    req: &'a mut Message,
    original: u16,
}

impl<'a> IdGuard<'a> {
    fn new(req: &'a mut Message) -> Self {
        let original = req.id();
        req.set_id(rand::random());
        Self { req, original }
    }
}

impl Deref for IdGuard<'_> {
    type Target = Message;

    fn deref(&self) -> &Message {
        self.req
    }
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        self.req.set_id(self.original);
    }
}

/// Peer-closed on a connection taken from the cache becomes the retryable
/// stale error; everything else is passed through
fn stale_or(err: DnsError, cached: bool) -> DnsError {
    if cached && err.is_closed() {
        DnsError::CachedClosed
    } else {
        err
    }
}

impl Proxy {
    /// Relay the request to this upstream and wait for the matching reply
    ///
    /// The reply carries the client's original ID. On any error the
    /// connection is discarded; only a fully successful exchange returns it
    /// to the pool.
    pub async fn connect(&self, state: RequestState<'_>, opts: Options) -> Result<Message> {
        let start = Instant::now();
        let proto = select_protocol(self.addr(), state.proto, opts);
        let size = state.size();

        let (mut pc, cached) = self.transport.dial(proto).await?;
        let proto = pc.protocol();
        pc.conn.set_udp_size(size);

        let query = IdGuard::new(state.req);
        let query_id = query.id();
        let original_id = query.original;

        match timeout(MAX_WRITE_TIMEOUT, pc.conn.write_msg(&query)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = pc.id, upstream = %self.addr(), cached, "Upstream write failed: {}", e);
                return Err(stale_or(e, cached));
            }
            Err(_) => {
                return Err(DnsError::timeout(format!(
                    "write to {} timed out",
                    self.addr()
                )));
            }
        }

        let deadline = tokio::time::Instant::now() + self.read_timeout;
        let mut reply = loop {
            let read = match timeout_at(deadline, pc.conn.read_msg()).await {
                Ok(read) => read,
                Err(_) => {
                    return Err(DnsError::timeout(format!(
                        "no reply from {} within {:?}",
                        self.addr(),
                        self.read_timeout
                    )));
                }
            };

            match read {
                Ok(reply) if reply.id() == query_id => break reply,
                Ok(reply) => {
                    // Out of order or spoofed
                    self.metrics.mismatched_reply();
                    debug!(
                        conn_id = pc.id,
                        upstream = %self.addr(),
                        expected = query_id,
                        got = reply.id(),
                        "Dropping reply with mismatched id"
                    );
                }
                // A malformed datagram must not cut the wait short for the real reply
                Err(e) if proto == Protocol::Udp && !e.is_network() => {
                    debug!(conn_id = pc.id, upstream = %self.addr(), "Ignoring bad datagram: {}", e);
                }
                Err(e) => {
                    debug!(conn_id = pc.id, upstream = %self.addr(), cached, "Upstream read failed: {}", e);
                    return Err(stale_or(e, cached));
                }
            }
        };

        drop(query);
        reply.set_id(original_id);
        self.transport.yield_conn(pc);

        let elapsed = start.elapsed();
        self.metrics.record_request(reply.response_code(), elapsed);
        if event_enabled!(Level::DEBUG) {
            debug!(
                upstream = %self.addr(),
                %proto,
                cached,
                rcode = %reply.response_code(),
                elapsed_us = elapsed.as_micros() as u64,
                "Upstream exchange complete"
            );
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dns_utils::build_query;
    use crate::network::upstream::ProxyConfig;
    use crate::network::upstream::mock::{MockDialer, Read, ScriptedConn};
    use hickory_proto::op::{Edns, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};
    use std::io::ErrorKind;
    use std::str::FromStr;
    use std::sync::Arc;

    fn query(id: u16) -> Message {
        let mut msg = build_query(Name::from_str("example.com.").unwrap(), RecordType::A);
        msg.set_id(id);
        msg
    }

    fn proxy(dialer: Arc<MockDialer>, read_timeout: Duration) -> Arc<Proxy> {
        Proxy::new(
            "192.0.2.1:53".parse().unwrap(),
            None,
            dialer,
            ProxyConfig {
                read_timeout,
                ..Default::default()
            },
        )
    }

    async fn exchange(proxy: &Proxy, msg: &mut Message) -> Result<Message> {
        proxy
            .connect(RequestState::new(msg, Protocol::Udp), Options::default())
            .await
    }

    #[tokio::test]
    async fn test_reply_carries_client_id() {
        let conn = ScriptedConn::new(Protocol::Udp, [Read::Matching(ResponseCode::NoError)]);
        let written = conn.written_ids.clone();
        let proxy = proxy(MockDialer::with_scripts([conn]), DEFAULT_TIMEOUT);

        let mut msg = query(0x1234);
        let reply = exchange(&proxy, &mut msg).await.unwrap();

        assert_eq!(reply.id(), 0x1234);
        assert_eq!(msg.id(), 0x1234);
        assert_eq!(written.lock().unwrap().len(), 1);
        assert_eq!(proxy.metrics().requests, 1);
    }

    #[tokio::test]
    async fn test_request_id_restored_on_error() {
        let proxy = proxy(
            MockDialer::with_scripts([ScriptedConn::new(Protocol::Udp, [Read::Closed])]),
            DEFAULT_TIMEOUT,
        );
        let mut msg = query(77);
        let err = exchange(&proxy, &mut msg).await.unwrap_err();
        assert_eq!(msg.id(), 77);
        // a freshly dialed connection reports the raw close
        assert!(matches!(err, DnsError::Io(_)), "{err:?}");
        assert!(!matches!(err, DnsError::CachedClosed));
    }

    #[tokio::test]
    async fn test_mismatched_replies_skipped() {
        let conn = ScriptedConn::new(
            Protocol::Udp,
            [
                Read::Mismatched,
                Read::Mismatched,
                Read::Matching(ResponseCode::NXDomain),
            ],
        );
        let proxy = proxy(MockDialer::with_scripts([conn]), DEFAULT_TIMEOUT);

        let reply = exchange(&proxy, &mut query(9)).await.unwrap();
        assert_eq!(reply.response_code(), ResponseCode::NXDomain);
        assert_eq!(proxy.metrics().mismatched_replies, 2);
    }

    #[tokio::test]
    async fn test_stale_cached_connection() {
        // the first exchange parks the connection, the second finds it closed
        let conn = ScriptedConn::new(
            Protocol::Udp,
            [Read::Matching(ResponseCode::NoError), Read::Closed],
        );
        let dialer = MockDialer::with_scripts([conn]);
        let proxy = proxy(dialer.clone(), DEFAULT_TIMEOUT);

        exchange(&proxy, &mut query(1)).await.unwrap();
        let err = exchange(&proxy, &mut query(2)).await.unwrap_err();
        assert!(matches!(err, DnsError::CachedClosed));
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_cached_connection_on_write() {
        let mut conn = ScriptedConn::new(Protocol::Udp, [Read::Matching(ResponseCode::NoError)]);
        conn.fail_write_after = Some(1);
        let dialer = MockDialer::with_scripts([conn]);
        let proxy = proxy(dialer.clone(), DEFAULT_TIMEOUT);

        exchange(&proxy, &mut query(4)).await.unwrap();
        let mut msg = query(5);
        let err = exchange(&proxy, &mut msg).await.unwrap_err();
        assert!(matches!(err, DnsError::CachedClosed), "{err:?}");
        assert_eq!(msg.id(), 5);
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test]
    async fn test_fresh_connection_closed_is_not_stale() {
        let proxy = proxy(
            MockDialer::with_scripts([ScriptedConn::failing_write(
                Protocol::Udp,
                ErrorKind::BrokenPipe,
            )]),
            DEFAULT_TIMEOUT,
        );
        let err = exchange(&proxy, &mut query(3)).await.unwrap_err();
        assert!(matches!(err, DnsError::Io(_)));
    }

    #[tokio::test]
    async fn test_malformed_datagram_ignored_on_udp() {
        let conn = ScriptedConn::new(
            Protocol::Udp,
            [Read::Malformed, Read::Matching(ResponseCode::NoError)],
        );
        let proxy = proxy(MockDialer::with_scripts([conn]), DEFAULT_TIMEOUT);
        assert!(exchange(&proxy, &mut query(4)).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_frame_fails_on_tcp() {
        let conn = ScriptedConn::new(
            Protocol::Tcp,
            [Read::Malformed, Read::Matching(ResponseCode::NoError)],
        );
        let proxy = proxy(MockDialer::with_scripts([conn]), DEFAULT_TIMEOUT);
        let mut msg = query(5);
        let err = proxy
            .connect(
                RequestState::new(&mut msg, Protocol::Tcp),
                Options::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_timeout_discards_connection() {
        let dialer = MockDialer::with_scripts([ScriptedConn::new(Protocol::Udp, [Read::Hang])]);
        let proxy = proxy(dialer.clone(), Duration::from_millis(50));

        let err = exchange(&proxy, &mut query(6)).await.unwrap_err();
        assert!(matches!(err, DnsError::Timeout(_)));

        // the hung connection was not parked, so the next exchange dials again
        exchange(&proxy, &mut query(7)).await.unwrap();
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_connection_reused_after_success() {
        let dialer = MockDialer::with_scripts([]);
        let proxy = proxy(dialer.clone(), DEFAULT_TIMEOUT);
        for id in 0..3 {
            exchange(&proxy, &mut query(id)).await.unwrap();
        }
        assert_eq!(dialer.dial_count(), 1);
        let metrics = proxy.metrics();
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.cache_hits, 2);
    }

    #[tokio::test]
    async fn test_udp_size_follows_client() {
        let conn = ScriptedConn::new(Protocol::Udp, [Read::Matching(ResponseCode::NoError)]);
        let udp_size = conn.udp_size.clone();
        let proxy = proxy(MockDialer::with_scripts([conn]), DEFAULT_TIMEOUT);

        let mut msg = query(8);
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        msg.set_edns(edns);
        exchange(&proxy, &mut msg).await.unwrap();
        assert_eq!(*udp_size.lock().unwrap(), 1232);
    }

    #[tokio::test]
    async fn test_dial_failure_propagates() {
        let dialer = Arc::new(MockDialer {
            refuse: true,
            ..Default::default()
        });
        let proxy = proxy(dialer, DEFAULT_TIMEOUT);
        let err = exchange(&proxy, &mut query(10)).await.unwrap_err();
        assert!(err.is_network());
    }

    const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
}
