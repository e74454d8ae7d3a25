/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::network::tls_config::UpstreamTls;
use crate::network::upstream::Protocol;
use crate::network::upstream::addr::UpstreamAddr;
use crate::network::upstream::broker::{BrokerOptions, Transport};
use crate::network::upstream::dialer::Dialer;
use crate::network::upstream::health::{HEALTH_CHECK_TIMEOUT, HealthCheck};
use crate::network::upstream::metrics::{UpstreamMetrics, UpstreamMetricsSnapshot};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default deadline for reading a reply
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
pub struct ProxyConfig {
    pub read_timeout: Duration,
    pub broker: BrokerOptions,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            broker: BrokerOptions::default(),
        }
    }
}

/// Relay towards one upstream address
#[derive(Debug)]
pub struct Proxy {
    pub(super) transport: Transport,
    pub(super) read_timeout: Duration,
    pub(super) metrics: Arc<UpstreamMetrics>,
    tls: Option<UpstreamTls>,
    dialer: Arc<dyn Dialer>,
    health: HealthCheck,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Proxy {
    pub fn new(
        addr: UpstreamAddr,
        tls: Option<UpstreamTls>,
        dialer: Arc<dyn Dialer>,
        config: ProxyConfig,
    ) -> Arc<Self> {
        let metrics = Arc::new(UpstreamMetrics::default());
        let health_proto = if tls.is_some() {
            Protocol::TcpTls
        } else {
            addr.scheme().unwrap_or(Protocol::Udp)
        };
        Arc::new(Self {
            transport: Transport::new(
                addr,
                tls.clone(),
                dialer.clone(),
                config.broker,
                metrics.clone(),
            ),
            read_timeout: config.read_timeout,
            metrics,
            tls,
            dialer,
            health: HealthCheck::new(health_proto, HEALTH_CHECK_TIMEOUT),
            health_task: Mutex::new(None),
        })
    }

    pub fn addr(&self) -> &UpstreamAddr {
        self.transport.addr()
    }

    pub fn metrics(&self) -> UpstreamMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Consecutive failed health checks
    pub fn fails(&self) -> u32 {
        self.health.fails()
    }

    /// Whether the upstream failed more than `max_fails` health checks in a
    /// row. Zero disables the verdict.
    pub fn down(&self, max_fails: u32) -> bool {
        max_fails != 0 && self.fails() > max_fails
    }

    /// Run one health check now
    pub async fn health_check(&self) {
        if let Err(e) = self
            .health
            .check(self.dialer.as_ref(), self.addr(), self.tls.as_ref())
            .await
        {
            debug!(upstream = %self.addr(), fails = self.fails(), "Health check failed: {}", e);
        }
    }

    /// Start periodic health checking
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(proxy) = weak.upgrade() else {
                    break;
                };
                proxy.health_check().await;
            }
        });
        if let Ok(mut slot) = self.health_task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
        info!(upstream = %self.addr(), ?interval, "Upstream health checking started");
    }

    /// Stop health checking and close all pooled connections
    pub async fn stop(&self) {
        let task = self.health_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            task.abort();
        }
        self.transport.stop().await;
        if self.fails() > 0 {
            warn!(upstream = %self.addr(), fails = self.fails(), "Upstream stopped while unhealthy");
        }
    }
}
