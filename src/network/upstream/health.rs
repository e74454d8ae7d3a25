/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! In-band upstream health checking
//!
//! A probe sends `. IN NS` over a fresh connection (never a pooled one) and
//! counts any reply carrying the probe's ID as healthy, whatever its rcode.
//! Consecutive failures are counted; one success resets the count.

use crate::core::dns_utils::build_query;
use crate::core::error::{DnsError, Result};
use crate::network::tls_config::UpstreamTls;
use crate::network::upstream::Protocol;
use crate::network::upstream::addr::UpstreamAddr;
use crate::network::upstream::dialer::Dialer;
use hickory_proto::rr::{Name, RecordType};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::{Instant, timeout, timeout_at};

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_FAILS: u32 = 2;
/// Budget for one probe, dial included
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct HealthCheck {
    proto: Protocol,
    timeout: Duration,
    fails: AtomicU32,
}

impl HealthCheck {
    pub fn new(proto: Protocol, timeout: Duration) -> Self {
        Self {
            proto,
            timeout,
            fails: AtomicU32::new(0),
        }
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// Probe once and update the failure count
    pub async fn check(
        &self,
        dialer: &dyn Dialer,
        addr: &UpstreamAddr,
        tls: Option<&UpstreamTls>,
    ) -> Result<()> {
        let result = probe(dialer, self.proto, addr, tls, self.timeout).await;
        match result {
            Ok(()) => self.fails.store(0, Ordering::Relaxed),
            Err(_) => {
                self.fails.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }
}

async fn probe(
    dialer: &dyn Dialer,
    proto: Protocol,
    addr: &UpstreamAddr,
    tls: Option<&UpstreamTls>,
    budget: Duration,
) -> Result<()> {
    let deadline = Instant::now() + budget;
    let timed_out = || DnsError::timeout(format!("health check of {addr} timed out"));

    let mut conn = timeout(budget, dialer.dial(proto, addr, tls))
        .await
        .map_err(|_| timed_out())??;

    let mut ping = build_query(Name::root(), RecordType::NS);
    ping.set_recursion_desired(false);
    ping.set_id(rand::random());
    timeout_at(deadline, conn.write_msg(&ping))
        .await
        .map_err(|_| timed_out())??;

    loop {
        let reply = timeout_at(deadline, conn.read_msg())
            .await
            .map_err(|_| timed_out())??;
        if reply.id() == ping.id() {
            return Ok(());
        }
    }
}
