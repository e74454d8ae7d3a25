/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! QUIC DNS server plugins
//!
//! One listener serves DNS over QUIC on whatever packet connection its
//! [`PacketConnProvider`] binds: `quic_server` on plain UDP, `squic_server`
//! on a SCION end-host underlay socket.
//!
//! Each bidirectional stream carries exactly one framed query, terminated
//! by the client's FIN, and at most one framed response. Malformed input
//! only costs its own stream. A query carrying the EDNS TCP keepalive
//! option is a protocol violation and aborts the whole session.

use crate::config::types::PluginConfig;
use crate::core::dns_utils::has_edns_option;
use crate::core::error::{DnsError, Result};
use crate::network::tls_config::load_tls_config;
use crate::network::transport::buffer_pool::BufferPool;
use crate::network::transport::{LENGTH_PREFIX_SIZE, MIN_DNS_PACKET_SIZE, frame, unframe};
use crate::network::upstream::Protocol;
use crate::plugin::server::packet_conn::{PacketConnProvider, ScionPacketConn, UdpPacketConn};
use crate::plugin::server::{CapturingWriter, RequestHandle, ServeDns, Server};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::rdata::opt::EdnsCode;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use quinn::{
    Connection, Endpoint, EndpointConfig, IdleTimeout, Incoming, RecvStream, SendStream,
    TokioRuntime, TransportConfig, VarInt,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

/// ALPN token for DNS over QUIC
pub const DOQ_ALPN: &[u8] = b"doq";

/// Default QUIC transport idle timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Application error code for DoQ protocol violations
const DOQ_PROTOCOL_ERROR: u32 = 0x2;
const DOQ_NO_ERROR: u32 = 0x0;

/// A framed query never exceeds a length prefix plus the largest DNS message
const MAX_QUERY_FRAME_SIZE: usize = LENGTH_PREFIX_SIZE + u16::MAX as usize;
/// One spare byte so a maximum-size frame still leaves room to observe FIN
const STREAM_BUF_SIZE: usize = MAX_QUERY_FRAME_SIZE + 1;
const STREAM_BUF_POOL_SIZE: usize = 256;

/// QUIC server configuration
#[derive(Debug, Deserialize)]
pub struct QuicServerConfig {
    /// Entry executor plugin tag to process incoming requests.
    ///
    /// Must name an executor listed before this server.
    entry: String,

    /// Listen address. `ip:port` for `quic_server`; for `squic_server` the
    /// SCION form `[ISD-AS,][ip]:port`.
    listen: String,

    /// Path to TLS certificate file (PEM format). DoQ requires TLS.
    cert: Option<String>,

    /// Path to TLS private key file (PEM format).
    key: Option<String>,

    /// QUIC transport-level idle timeout in milliseconds (default 5 minutes)
    idle_timeout_ms: Option<u64>,
}

impl QuicServerConfig {
    fn parse(plugin_config: &PluginConfig) -> Result<Self> {
        let args = plugin_config.args.clone().ok_or_else(|| {
            DnsError::plugin("QUIC Server must configure 'listen' and 'entry' in config file")
        })?;
        serde_yml::from_value(args)
            .map_err(|e| DnsError::plugin(format!("QUIC Server config parsing failed: {}", e)))
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT)
    }
}

/// Lifecycle of one listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    Closed,
}

#[derive(Debug, Default)]
pub struct QuicServerMetrics {
    sessions: AtomicU64,
    streams: AtomicU64,
    /// Streams abandoned without a response: short, misframed, undecodable,
    /// or failed mid-exchange
    dropped_streams: AtomicU64,
    /// Sessions aborted for a forbidden EDNS option
    aborted_sessions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuicServerMetricsSnapshot {
    pub sessions: u64,
    pub streams: u64,
    pub dropped_streams: u64,
    pub aborted_sessions: u64,
}

impl QuicServerMetrics {
    pub fn snapshot(&self) -> QuicServerMetricsSnapshot {
        QuicServerMetricsSnapshot {
            sessions: self.sessions.load(Ordering::Relaxed),
            streams: self.streams.load(Ordering::Relaxed),
            dropped_streams: self.dropped_streams.load(Ordering::Relaxed),
            aborted_sessions: self.aborted_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Bind a QUIC endpoint on a packet connection from `provider`
///
/// Fails with a configuration error when no TLS material is given.
pub fn listen(
    provider: &dyn PacketConnProvider,
    addr: &str,
    tls: Option<rustls::ServerConfig>,
    idle_timeout: Duration,
) -> Result<Endpoint> {
    let mut tls = tls.ok_or_else(|| {
        DnsError::config(format!(
            "{}://{} requires TLS certificate and key",
            provider.scheme(),
            addr
        ))
    })?;
    tls.alpn_protocols = vec![DOQ_ALPN.to_vec()];

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(tls))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(IdleTimeout::try_from(idle_timeout)?));
    server_config.transport_config(Arc::new(transport));

    let socket = provider.listen_packet(addr)?;
    Ok(Endpoint::new_with_abstract_socket(
        EndpointConfig::default(),
        Some(server_config),
        socket,
        Arc::new(TokioRuntime),
    )?)
}

/// QUIC DNS server plugin
#[derive(Debug)]
pub struct QuicServer {
    tag: String,
    listen: String,
    provider: Arc<dyn PacketConnProvider>,
    tls: Option<rustls::ServerConfig>,
    idle_timeout: Duration,
    handler: Arc<dyn ServeDns>,
    metrics: Arc<QuicServerMetrics>,

    endpoint: Option<Endpoint>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    state: Mutex<ListenerState>,
}

impl QuicServer {
    pub fn new(
        tag: String,
        listen: String,
        provider: Arc<dyn PacketConnProvider>,
        tls: Option<rustls::ServerConfig>,
        idle_timeout: Duration,
        handler: Arc<dyn ServeDns>,
    ) -> Self {
        Self {
            tag,
            listen,
            provider,
            tls,
            idle_timeout,
            handler,
            metrics: Arc::new(QuicServerMetrics::default()),
            endpoint: None,
            local_addr: None,
            accept_task: None,
            state: Mutex::new(ListenerState::Idle),
        }
    }

    pub fn metrics(&self) -> QuicServerMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn state(&self) -> ListenerState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(ListenerState::Closed)
    }

    fn set_state(&self, next: ListenerState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }
}

#[async_trait]
impl Plugin for QuicServer {
    fn tag(&self) -> &str {
        self.tag.as_str()
    }

    async fn init(&mut self) -> Result<()> {
        let endpoint = listen(
            self.provider.as_ref(),
            &self.listen,
            self.tls.take(),
            self.idle_timeout,
        )?;
        let local_addr = endpoint.local_addr()?;

        let listener = Arc::new(Listener {
            handler: self.handler.clone(),
            buffers: BufferPool::new(STREAM_BUF_POOL_SIZE, STREAM_BUF_SIZE),
            metrics: self.metrics.clone(),
            local_addr,
        });
        self.accept_task = Some(tokio::spawn(run_server(endpoint.clone(), listener)));
        self.endpoint = Some(endpoint);
        self.local_addr = Some(local_addr);
        self.set_state(ListenerState::Listening);

        info!(
            tag = %self.tag,
            "{} server listening on {}",
            self.provider.scheme(),
            local_addr
        );
        Ok(())
    }

    async fn destroy(&self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.close(VarInt::from_u32(DOQ_NO_ERROR), b"server shutdown");
        }
        if let Some(task) = &self.accept_task {
            task.abort();
        }
        self.set_state(ListenerState::Closed);
        debug!(tag = %self.tag, metrics = ?self.metrics(), "QUIC server stopped");
    }
}

impl Server for QuicServer {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// State shared by every session and stream task of one listener
#[derive(Debug)]
struct Listener {
    handler: Arc<dyn ServeDns>,
    buffers: Arc<BufferPool>,
    metrics: Arc<QuicServerMetrics>,
    local_addr: SocketAddr,
}

async fn run_server(endpoint: Endpoint, listener: Arc<Listener>) {
    debug!("QUIC server event loop started on {}", listener.local_addr);

    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                match incoming {
                    Some(incoming) => {
                        sessions.spawn(handle_session(incoming, listener.clone()));
                    }
                    None => break,
                }
            }

            // Reap finished sessions
            Some(result) = sessions.join_next() => {
                if let Err(e) = result {
                    warn!("QUIC session task panicked: {:?}", e);
                }
            }
        }
    }

    debug!(
        "QUIC server on {} closed ({} sessions still open)",
        listener.local_addr,
        sessions.len()
    );
}

/// Accept streams on one session until it ends
async fn handle_session(incoming: Incoming, listener: Arc<Listener>) {
    let remote_addr = incoming.remote_address();
    let connection = match incoming.await {
        Ok(c) => c,
        Err(e) => {
            warn!("QUIC handshake failed for {}: {}", remote_addr, e);
            return;
        }
    };

    listener.metrics.sessions.fetch_add(1, Ordering::Relaxed);
    debug!("QUIC connection established with {}", remote_addr);

    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let listener = listener.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    listener
                        .handle_stream(connection, send, recv, remote_addr)
                        .await
                });
            }
            Err(e) => {
                debug!("QUIC connection closed by {}: {}", remote_addr, e);
                return;
            }
        }
    }
}

/// How one stream ended
#[derive(Debug, PartialEq, Eq)]
enum StreamOutcome {
    Answered,
    NoResponse,
    Dropped(&'static str),
    SessionAborted,
}

impl Listener {
    async fn handle_stream(
        &self,
        connection: Connection,
        mut send: SendStream,
        mut recv: RecvStream,
        remote_addr: SocketAddr,
    ) {
        self.metrics.streams.fetch_add(1, Ordering::Relaxed);

        match self
            .exchange(&connection, &mut send, &mut recv, remote_addr)
            .await
        {
            Ok(StreamOutcome::Answered) | Ok(StreamOutcome::NoResponse) => {}
            Ok(StreamOutcome::Dropped(reason)) => {
                self.metrics.dropped_streams.fetch_add(1, Ordering::Relaxed);
                debug!(remote = %remote_addr, "Dropping DoQ stream: {}", reason);
            }
            Ok(StreamOutcome::SessionAborted) => {
                self.metrics.aborted_sessions.fetch_add(1, Ordering::Relaxed);
                warn!(remote = %remote_addr, "Aborted QUIC session: EDNS TCP keepalive is forbidden on DoQ");
            }
            Err(e) => {
                self.metrics.dropped_streams.fetch_add(1, Ordering::Relaxed);
                warn!("DoQ stream error ({}): {}", remote_addr, e);
            }
        }

        // Closed on every path; fails harmlessly once the session is gone
        let _ = send.finish();
    }

    async fn exchange(
        &self,
        connection: &Connection,
        send: &mut SendStream,
        recv: &mut RecvStream,
        remote_addr: SocketAddr,
    ) -> Result<StreamOutcome> {
        let mut buf = self.buffers.acquire();
        let len = read_to_fin(recv, &mut buf).await?;
        if len < MIN_DNS_PACKET_SIZE {
            trace!(remote = %remote_addr, len, "Short DoQ query");
            return Ok(StreamOutcome::Dropped("query shorter than a DNS header and question"));
        }

        let Some(payload) = unframe(&buf[..len]) else {
            return Ok(StreamOutcome::Dropped("length prefix does not match payload"));
        };
        let request = match Message::from_bytes(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!(remote = %remote_addr, "Failed to decode DoQ query: {}", e);
                return Ok(StreamOutcome::Dropped("undecodable DNS message"));
            }
        };
        drop(buf);

        if has_edns_option(&request, EdnsCode::Keepalive) {
            connection.close(
                VarInt::from_u32(DOQ_PROTOCOL_ERROR),
                b"edns-tcp-keepalive not allowed",
            );
            return Ok(StreamOutcome::SessionAborted);
        }

        let mut writer = CapturingWriter::new(self.local_addr, remote_addr, Protocol::Udp);
        self.handler.serve_dns(&mut writer, request).await;
        let Some(response) = writer.take() else {
            return Ok(StreamOutcome::NoResponse);
        };

        let bytes = response.to_bytes()?;
        if bytes.len() > u16::MAX as usize {
            return Err(DnsError::protocol(format!(
                "response too large for DoQ ({} bytes)",
                bytes.len()
            )));
        }
        send.write_all(&frame(&bytes))
            .await
            .map_err(|e| DnsError::protocol(format!("failed to write DoQ response: {}", e)))?;
        Ok(StreamOutcome::Answered)
    }
}

/// Read until the peer's FIN
///
/// `buf` holds one byte more than [`MAX_QUERY_FRAME_SIZE`], so filling it is
/// a violation while a maximum-size frame can still reach FIN.
async fn read_to_fin(recv: &mut RecvStream, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    loop {
        if filled == buf.len() {
            return Err(DnsError::protocol("DoQ query exceeds maximum message size"));
        }
        match recv.read(&mut buf[filled..]).await {
            Ok(Some(n)) => filled += n,
            Ok(None) => return Ok(filled),
            Err(e) => {
                return Err(DnsError::protocol(format!(
                    "failed to read DoQ query: {}",
                    e
                )));
            }
        }
    }
}

/// Shared creation path of both QUIC server types
fn create_server(
    plugin_config: &PluginConfig,
    registry: Arc<PluginRegistry>,
    provider: Arc<dyn PacketConnProvider>,
) -> Result<UninitializedPlugin> {
    let config = QuicServerConfig::parse(plugin_config)?;

    let entry = registry.get_plugin(&config.entry).ok_or_else(|| {
        DnsError::plugin(format!(
            "QUIC Server [{}] entry plugin [{}] not found",
            plugin_config.tag, config.entry
        ))
    })?;

    let tls = load_tls_config(&config.cert, &config.key).transpose()?;
    let idle_timeout = config.idle_timeout();

    Ok(UninitializedPlugin::Server(Box::new(QuicServer::new(
        plugin_config.tag.clone(),
        config.listen,
        provider,
        tls,
        idle_timeout,
        Arc::new(RequestHandle {
            entry_executor: entry.to_executor()?,
        }),
    ))))
}

fn validate_server(plugin_config: &PluginConfig, provider: &dyn PacketConnProvider) -> Result<()> {
    let config = QuicServerConfig::parse(plugin_config)?;
    provider.validate(&config.listen)?;

    if config.entry.is_empty() {
        return Err(DnsError::plugin(
            "QUIC Server 'entry' field cannot be empty",
        ));
    }
    if config.cert.is_none() || config.key.is_none() {
        return Err(DnsError::plugin(format!(
            "QUIC Server [{}] requires both 'cert' and 'key'",
            plugin_config.tag
        )));
    }
    if matches!(config.idle_timeout_ms, Some(0)) {
        return Err(DnsError::plugin(
            "QUIC Server 'idle_timeout_ms' must be greater than zero",
        ));
    }
    Ok(())
}

/// Factory for `quic_server` (DoQ over UDP)
#[derive(Debug)]
pub struct QuicServerFactory {}

impl PluginFactory for QuicServerFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        validate_server(plugin_config, &UdpPacketConn)
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        create_server(plugin_config, registry, Arc::new(UdpPacketConn))
    }
}

/// Factory for `squic_server` (DoQ over SCION)
#[derive(Debug)]
pub struct SquicServerFactory {}

impl PluginFactory for SquicServerFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        validate_server(plugin_config, &ScionPacketConn)
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        create_server(plugin_config, registry, Arc::new(ScionPacketConn))
    }
}
