/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Scripted connections and dialers for relay and broker tests

use crate::core::dns_utils::build_response_from_request;
use crate::core::error::{DnsError, Result};
use crate::network::tls_config::UpstreamTls;
use crate::network::upstream::Protocol;
use crate::network::upstream::addr::UpstreamAddr;
use crate::network::upstream::conn::DnsConn;
use crate::network::upstream::dialer::Dialer;
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the next `read_msg` call does
#[derive(Debug, Clone, Copy)]
pub enum Read {
    /// Answer the last written query with its own ID
    Matching(ResponseCode),
    /// Answer with an ID that does not match
    Mismatched,
    /// Undecodable datagram
    Malformed,
    /// Peer closed the connection
    Closed,
    /// Never answer
    Hang,
}

#[derive(Debug)]
pub struct ScriptedConn {
    pub proto: Protocol,
    pub write_error: Option<ErrorKind>,
    /// Writes after this many succeed fail with a broken pipe
    pub fail_write_after: Option<usize>,
    writes: usize,
    pub reads: VecDeque<Read>,
    last_query: Option<Message>,
    /// IDs seen on the wire, shared with the test
    pub written_ids: Arc<Mutex<Vec<u16>>>,
    pub udp_size: Arc<Mutex<u16>>,
}

impl ScriptedConn {
    pub fn new(proto: Protocol, reads: impl IntoIterator<Item = Read>) -> Self {
        Self {
            proto,
            write_error: None,
            fail_write_after: None,
            writes: 0,
            reads: reads.into_iter().collect(),
            last_query: None,
            written_ids: Arc::new(Mutex::new(Vec::new())),
            udp_size: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing_write(proto: Protocol, kind: ErrorKind) -> Self {
        let mut conn = Self::new(proto, []);
        conn.write_error = Some(kind);
        conn
    }

    fn reply(&self, id: u16, rcode: ResponseCode) -> Message {
        let mut response = match &self.last_query {
            Some(query) => build_response_from_request(query, rcode),
            None => Message::new(),
        };
        response.set_id(id);
        response
    }
}

#[async_trait]
impl DnsConn for ScriptedConn {
    async fn write_msg(&mut self, msg: &Message) -> Result<()> {
        if let Some(kind) = self.write_error {
            return Err(DnsError::Io(std::io::Error::from(kind)));
        }
        if self.fail_write_after.is_some_and(|limit| self.writes >= limit) {
            return Err(DnsError::Io(std::io::Error::from(ErrorKind::BrokenPipe)));
        }
        self.writes += 1;
        if let Ok(mut ids) = self.written_ids.lock() {
            ids.push(msg.id());
        }
        self.last_query = Some(msg.clone());
        Ok(())
    }

    async fn read_msg(&mut self) -> Result<Message> {
        let id = self.last_query.as_ref().map(|q| q.id()).unwrap_or(0);
        match self.reads.pop_front().unwrap_or(Read::Hang) {
            Read::Matching(rcode) => Ok(self.reply(id, rcode)),
            Read::Mismatched => Ok(self.reply(id.wrapping_add(1), ResponseCode::NoError)),
            Read::Malformed => Err(DnsError::protocol("malformed datagram")),
            Read::Closed => Err(DnsError::Io(std::io::Error::from(ErrorKind::UnexpectedEof))),
            Read::Hang => std::future::pending().await,
        }
    }

    fn set_udp_size(&mut self, size: u16) {
        if let Ok(mut udp_size) = self.udp_size.lock() {
            *udp_size = size;
        }
    }

    fn protocol(&self) -> Protocol {
        self.proto
    }
}

/// Hands out scripted connections in order, then endless answering ones
#[derive(Debug, Default)]
pub struct MockDialer {
    pub scripts: Mutex<VecDeque<ScriptedConn>>,
    pub dials: AtomicUsize,
    pub delay: Option<Duration>,
    pub refuse: bool,
}

impl MockDialer {
    pub fn with_scripts(scripts: impl IntoIterator<Item = ScriptedConn>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Default::default()
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        proto: Protocol,
        _addr: &UpstreamAddr,
        _tls: Option<&UpstreamTls>,
    ) -> Result<Box<dyn DnsConn>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.refuse {
            return Err(DnsError::Io(std::io::Error::from(
                ErrorKind::ConnectionRefused,
            )));
        }
        let scripted = self.scripts.lock().ok().and_then(|mut s| s.pop_front());
        let conn = scripted.unwrap_or_else(|| {
            ScriptedConn::new(proto, std::iter::repeat_n(Read::Matching(ResponseCode::NoError), 64))
        });
        Ok(Box::new(conn))
    }
}
