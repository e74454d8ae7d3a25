/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS forwarding plugin
//!
//! Relays every request to one upstream through a pooled [`Proxy`]. A reply
//! lost to a connection the upstream closed while it sat in the pool is
//! retried once on a new exchange.

use crate::config::types::PluginConfig;
use crate::core::context::DnsContext;
use crate::core::error::{DnsError, Result};
use crate::network::tls_config::UpstreamTls;
use crate::network::upstream::broker::{BrokerOptions, DEFAULT_EXPIRE, DEFAULT_MAX_IDLE_CONNS};
use crate::network::upstream::dialer::{Dialer, NetDialer};
use crate::network::upstream::health::{DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_MAX_FAILS};
use crate::network::upstream::{
    Options, Protocol, Proxy, ProxyConfig, RequestState, UpstreamAddr,
};
use crate::plugin::executor::Executor;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
struct ForwardConfig {
    upstream: UpstreamConfig,

    /// Always relay over TCP
    #[serde(default)]
    force_tcp: bool,

    /// Relay over UDP even when the client came in over a stream transport
    #[serde(default)]
    prefer_udp: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct UpstreamConfig {
    /// `[scheme://]host[:port]` or a SCION address
    addr: String,

    /// TLS server name; setting it forces DNS-over-TLS
    server_name: Option<String>,

    #[serde(default)]
    insecure_skip_verify: bool,

    read_timeout_ms: Option<u64>,
    expire_ms: Option<u64>,
    max_idle_conns: Option<usize>,

    /// Periodic health checking, off unless an interval is given
    health_check_interval_ms: Option<u64>,
    max_fails: Option<u32>,
}

impl ForwardConfig {
    fn parse(plugin_config: &PluginConfig) -> Result<Self> {
        let args = plugin_config.args.clone().ok_or_else(|| {
            DnsError::plugin(format!(
                "forward [{}] requires an 'upstream' argument",
                plugin_config.tag
            ))
        })?;
        serde_yml::from_value(args)
            .map_err(|e| DnsError::plugin(format!("failed to parse forward config: {}", e)))
    }
}

impl UpstreamConfig {
    fn tls(&self, addr: &UpstreamAddr) -> Result<Option<UpstreamTls>> {
        if addr.scheme() != Some(Protocol::TcpTls) && self.server_name.is_none() {
            return Ok(None);
        }
        let server_name = self
            .server_name
            .clone()
            .unwrap_or_else(|| addr.host_name());
        UpstreamTls::new(&server_name, self.insecure_skip_verify).map(Some)
    }

    fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            read_timeout: self
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(ProxyConfig::default().read_timeout),
            broker: BrokerOptions {
                expire: self
                    .expire_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_EXPIRE),
                max_idle_conns: self.max_idle_conns.unwrap_or(DEFAULT_MAX_IDLE_CONNS),
            },
        }
    }
}

/// Single-upstream DNS forwarder
#[derive(Debug)]
pub struct Forward {
    tag: String,
    proxy: Arc<Proxy>,
    options: Options,
    health_check_interval: Option<Duration>,
    max_fails: u32,
}

impl Forward {
    fn new(
        tag: String,
        config: ForwardConfig,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let addr: UpstreamAddr = config.upstream.addr.parse()?;
        let tls = config.upstream.tls(&addr)?;
        let proxy = Proxy::new(addr, tls, dialer, config.upstream.proxy_config());

        Ok(Self {
            tag,
            proxy,
            options: Options {
                force_tcp: config.force_tcp,
                prefer_udp: config.prefer_udp,
            },
            health_check_interval: config
                .upstream
                .health_check_interval_ms
                .map(Duration::from_millis),
            max_fails: config.upstream.max_fails.unwrap_or(DEFAULT_MAX_FAILS),
        })
    }
}

#[async_trait]
impl Plugin for Forward {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        if let Some(interval) = self.health_check_interval {
            let interval = if interval.is_zero() {
                DEFAULT_HEALTH_CHECK_INTERVAL
            } else {
                interval
            };
            self.proxy.start(interval);
        }
        info!(
            tag = %self.tag,
            upstream = %self.proxy.addr(),
            force_tcp = self.options.force_tcp,
            prefer_udp = self.options.prefer_udp,
            "DNS forwarder initialized"
        );
        Ok(())
    }

    async fn destroy(&self) {
        self.proxy.stop().await;
        debug!(tag = %self.tag, metrics = ?self.proxy.metrics(), "DNS forwarder stopped");
    }
}

#[async_trait]
impl Executor for Forward {
    async fn execute(&self, context: &mut DnsContext) -> Result<()> {
        if self.proxy.down(self.max_fails) {
            warn!(
                upstream = %self.proxy.addr(),
                fails = self.proxy.fails(),
                "Relaying to an upstream that fails its health checks"
            );
        }

        let proto = context.protocol;
        let first = self
            .proxy
            .connect(RequestState::new(&mut context.request, proto), self.options)
            .await;
        let result = match first {
            Err(DnsError::CachedClosed) => {
                debug!(upstream = %self.proxy.addr(), "Pooled connection was closed by upstream, retrying");
                self.proxy
                    .connect(RequestState::new(&mut context.request, proto), self.options)
                    .await
            }
            other => other,
        };

        match result {
            Ok(response) => {
                context.response = Some(response);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "DNS query failed - source: {}, queries: {:?}, id: {}, upstream: {}, reason: {}",
                    context.src_addr,
                    context.request.queries(),
                    context.request.id(),
                    self.proxy.addr(),
                    e
                );
                Err(e)
            }
        }
    }
}

#[derive(Debug)]
pub struct ForwardFactory {}

impl PluginFactory for ForwardFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let config = ForwardConfig::parse(plugin_config)?;
        let addr: UpstreamAddr = config.upstream.addr.parse()?;
        if config.force_tcp && config.prefer_udp {
            warn!(
                tag = %plugin_config.tag,
                "forward has both force_tcp and prefer_udp set, force_tcp wins"
            );
        }
        if matches!(config.upstream.max_idle_conns, Some(0)) {
            return Err(DnsError::plugin(format!(
                "forward [{}] max_idle_conns must be greater than zero",
                plugin_config.tag
            )));
        }
        if let Some(server_name) = &config.upstream.server_name {
            if server_name.is_empty() {
                return Err(DnsError::plugin(format!(
                    "forward [{}] server_name cannot be empty",
                    plugin_config.tag
                )));
            }
        }
        config.upstream.tls(&addr)?;
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let config = ForwardConfig::parse(plugin_config)?;
        Ok(UninitializedPlugin::Executor(Box::new(Forward::new(
            plugin_config.tag.clone(),
            config,
            Arc::new(NetDialer),
        )?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dns_utils::build_query;
    use crate::network::upstream::mock::{MockDialer, Read, ScriptedConn};
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn plugin_config(args: &str) -> PluginConfig {
        PluginConfig {
            tag: "forward_main".to_string(),
            plugin_type: "forward".to_string(),
            args: Some(serde_yml::from_str(args).unwrap()),
        }
    }

    fn context(id: u16) -> DnsContext {
        let mut request = build_query(Name::from_str("example.org.").unwrap(), RecordType::AAAA);
        request.set_id(id);
        DnsContext::new(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:8853".parse().unwrap(),
            Protocol::Udp,
            request,
        )
    }

    fn forward(dialer: Arc<MockDialer>) -> Forward {
        let config = ForwardConfig::parse(&plugin_config("upstream: { addr: '192.0.2.53:53' }"))
            .unwrap();
        Forward::new("forward_main".to_string(), config, dialer).unwrap()
    }

    #[tokio::test]
    async fn test_response_stored_in_context() {
        let forward = forward(MockDialer::with_scripts([]));
        let mut ctx = context(4242);
        forward.execute(&mut ctx).await.unwrap();

        let response = ctx.response.unwrap();
        assert_eq!(response.id(), 4242);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(ctx.request.id(), 4242);
    }

    #[tokio::test]
    async fn test_retry_once_after_stale_connection() {
        let dialer = MockDialer::with_scripts([
            ScriptedConn::new(
                Protocol::Udp,
                [Read::Matching(ResponseCode::NoError), Read::Closed],
            ),
            ScriptedConn::new(Protocol::Udp, [Read::Matching(ResponseCode::NXDomain)]),
        ]);
        let forward = forward(dialer.clone());

        forward.execute(&mut context(1)).await.unwrap();
        let mut ctx = context(2);
        forward.execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.response.unwrap().response_code(), ResponseCode::NXDomain);
        assert_eq!(dialer.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_fresh_failure_not_retried() {
        let dialer = MockDialer::with_scripts([ScriptedConn::new(Protocol::Udp, [Read::Closed])]);
        let forward = forward(dialer.clone());

        let mut ctx = context(3);
        assert!(forward.execute(&mut ctx).await.is_err());
        assert!(ctx.response.is_none());
        assert_eq!(dialer.dial_count(), 1);
    }

    #[test]
    fn test_config_durations_and_tls() {
        let config = ForwardConfig::parse(&plugin_config(
            "upstream:\n  addr: tls://1.1.1.1:853\n  server_name: cloudflare-dns.com\n  read_timeout_ms: 700\n  expire_ms: 3000\n  max_idle_conns: 8\nforce_tcp: true\n",
        ))
        .unwrap();
        assert!(config.force_tcp);
        assert!(!config.prefer_udp);

        let proxy_config = config.upstream.proxy_config();
        assert_eq!(proxy_config.read_timeout, Duration::from_millis(700));
        assert_eq!(proxy_config.broker.expire, Duration::from_secs(3));
        assert_eq!(proxy_config.broker.max_idle_conns, 8);

        let addr: UpstreamAddr = config.upstream.addr.parse().unwrap();
        assert!(config.upstream.tls(&addr).unwrap().is_some());
    }

    #[test]
    fn test_plain_upstream_has_no_tls() {
        let config =
            ForwardConfig::parse(&plugin_config("upstream: { addr: 'tcp://9.9.9.9' }")).unwrap();
        let addr: UpstreamAddr = config.upstream.addr.parse().unwrap();
        assert!(config.upstream.tls(&addr).unwrap().is_none());
        assert_eq!(config.upstream.proxy_config().broker.expire, DEFAULT_EXPIRE);
    }

    #[test]
    fn test_validate_config() {
        let factory = ForwardFactory {};
        assert!(
            factory
                .validate_config(&plugin_config("upstream: { addr: '8.8.8.8' }"))
                .is_ok()
        );
        assert!(
            factory
                .validate_config(&plugin_config("upstream: { addr: 'ftp://8.8.8.8' }"))
                .is_err()
        );
        assert!(
            factory
                .validate_config(&plugin_config(
                    "upstream: { addr: '8.8.8.8', max_idle_conns: 0 }"
                ))
                .is_err()
        );

        let no_args = PluginConfig {
            tag: "f".to_string(),
            plugin_type: "forward".to_string(),
            args: None,
        };
        assert!(factory.validate_config(&no_args).is_err());
    }
}
