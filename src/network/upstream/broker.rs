/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Connection pool broker for one upstream
//!
//! The idle cache is owned by a single coordinator task. Callers talk to it
//! through an mpsc command channel and receive cached connections over a
//! oneshot reply, so a cached connection is handed to at most one caller.
//! On a miss the caller dials outside the coordinator, bounded by a timeout
//! derived from a moving average of past dial latencies.
//!
//! Per protocol the cache is a LIFO stack ordered by last use. If the most
//! recently used connection has already expired, the whole stack has and is
//! dropped. A periodic sweep closes expired connections as well.

use crate::core::error::{DnsError, Result};
use crate::network::tls_config::UpstreamTls;
use crate::network::upstream::Protocol;
use crate::network::upstream::addr::UpstreamAddr;
use crate::network::upstream::conn::PersistConn;
use crate::network::upstream::dialer::Dialer;
use crate::network::upstream::metrics::UpstreamMetrics;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, trace};

pub const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
pub const MAX_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
/// Weight of the moving average: each sample moves it by 1/weight
pub const CUMULATIVE_AVG_WEIGHT: i64 = 4;
/// Idle connections older than this are not reused
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_IDLE_CONNS: usize = 64;

const COMMAND_QUEUE_SIZE: usize = 256;

/// Next timeout from the current average: at least `min`, twice the average
/// while that stays below `max`, else `max`
pub fn limit_timeout(current_avg: &AtomicI64, min: Duration, max: Duration) -> Duration {
    let avg = Duration::from_nanos(current_avg.load(Ordering::Relaxed).max(0) as u64);
    if avg < min {
        return min;
    }
    if avg < max / 2 {
        return avg * 2;
    }
    max
}

/// Move the average towards `observed` by `1/weight` of the difference
pub fn average_timeout(current_avg: &AtomicI64, observed: Duration, weight: i64) {
    let observed = i64::try_from(observed.as_nanos()).unwrap_or(i64::MAX);
    let current = current_avg.load(Ordering::Relaxed);
    current_avg.fetch_add(observed.saturating_sub(current) / weight, Ordering::Relaxed);
}

enum Command {
    Dial {
        proto: Protocol,
        reply: oneshot::Sender<Option<PersistConn>>,
    },
    Yield(PersistConn),
    Stop,
}

#[derive(Clone, Copy, Debug)]
pub struct BrokerOptions {
    pub expire: Duration,
    pub max_idle_conns: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            expire: DEFAULT_EXPIRE,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
        }
    }
}

/// Upstream transport state: idle cache handle, dialer, dial latency average
#[derive(Debug)]
pub struct Transport {
    addr: UpstreamAddr,
    tls: Option<UpstreamTls>,
    dialer: Arc<dyn Dialer>,
    /// Moving average of dial durations in nanoseconds
    avg_dial_time: AtomicI64,
    commands: mpsc::Sender<Command>,
    metrics: Arc<UpstreamMetrics>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Dial { proto, .. } => write!(f, "Dial({proto})"),
            Command::Yield(pc) => write!(f, "Yield({})", pc.id),
            Command::Stop => write!(f, "Stop"),
        }
    }
}

impl Transport {
    /// Create the transport and spawn its coordinator task
    pub fn new(
        addr: UpstreamAddr,
        tls: Option<UpstreamTls>,
        dialer: Arc<dyn Dialer>,
        options: BrokerOptions,
        metrics: Arc<UpstreamMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        tokio::spawn(run_coordinator(addr.to_string(), rx, options));

        Self {
            addr,
            tls,
            dialer,
            avg_dial_time: AtomicI64::new((MAX_DIAL_TIMEOUT / 2).as_nanos() as i64),
            commands: tx,
            metrics,
        }
    }

    pub fn addr(&self) -> &UpstreamAddr {
        &self.addr
    }

    /// Timeout for the next fresh dial
    pub fn dial_timeout(&self) -> Duration {
        limit_timeout(&self.avg_dial_time, MIN_DIAL_TIMEOUT, MAX_DIAL_TIMEOUT)
    }

    fn update_dial_timeout(&self, observed: Duration) {
        average_timeout(&self.avg_dial_time, observed, CUMULATIVE_AVG_WEIGHT);
    }

    /// Borrow a cached connection for `proto` or dial a fresh one
    ///
    /// TLS is used whenever TLS material is configured. The flag tells
    /// whether the connection came from the cache.
    pub async fn dial(&self, proto: Protocol) -> Result<(PersistConn, bool)> {
        let proto = if self.tls.is_some() {
            Protocol::TcpTls
        } else {
            proto
        };

        let (reply, cached) = oneshot::channel();
        self.commands
            .send(Command::Dial { proto, reply })
            .await
            .map_err(|_| DnsError::runtime(format!("upstream {} is stopped", self.addr)))?;
        let cached = cached
            .await
            .map_err(|_| DnsError::runtime(format!("upstream {} is stopped", self.addr)))?;

        if let Some(pc) = cached {
            self.metrics.cache_hit();
            trace!(conn_id = pc.id, upstream = %self.addr, %proto, "Reusing cached connection");
            return Ok((pc, true));
        }
        self.metrics.cache_miss();

        let started = Instant::now();
        let dial_timeout = self.dial_timeout();
        let result = timeout(
            dial_timeout,
            self.dialer.dial(proto, &self.addr, self.tls.as_ref()),
        )
        .await;
        self.update_dial_timeout(started.elapsed());

        match result {
            Ok(Ok(conn)) => {
                let pc = PersistConn::new(conn);
                debug!(
                    conn_id = pc.id,
                    upstream = %self.addr,
                    %proto,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Dialed new upstream connection"
                );
                Ok((pc, false))
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DnsError::timeout(format!(
                "dial {} ({}) timed out after {:?}",
                self.addr, proto, dial_timeout
            ))),
        }
    }

    /// Return a connection after a fully successful exchange
    ///
    /// Never blocks: if the coordinator is backlogged the connection is closed.
    pub fn yield_conn(&self, mut pc: PersistConn) {
        pc.used = Instant::now();
        if let Err(e) = self.commands.try_send(Command::Yield(pc)) {
            trace!(upstream = %self.addr, "Dropping yielded connection: {}", e);
        }
    }

    /// Close all idle connections and terminate the coordinator
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }
}

type Stacks = HashMap<Protocol, VecDeque<PersistConn>>;

async fn run_coordinator(addr: String, mut rx: mpsc::Receiver<Command>, options: BrokerOptions) {
    let mut conns: Stacks = HashMap::new();
    let mut ticker = tokio::time::interval(options.expire);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Dial { proto, reply }) => {
                    let pc = take(&mut conns, proto, options.expire);
                    // A caller that gave up leaves the connection with us
                    if let Err(Some(pc)) = reply.send(pc) {
                        conns.entry(proto).or_default().push_back(pc);
                    }
                }
                Some(Command::Yield(pc)) => {
                    let stack = conns.entry(pc.protocol()).or_default();
                    if stack.len() >= options.max_idle_conns {
                        if let Some(oldest) = stack.pop_front() {
                            trace!(conn_id = oldest.id, "Idle cache full, closing oldest connection");
                        }
                    }
                    stack.push_back(pc);
                }
                Some(Command::Stop) | None => break,
            },
            _ = ticker.tick() => {
                let closed = sweep(&mut conns, options.expire);
                if closed > 0 {
                    debug!(upstream = %addr, closed, "Closed expired idle connections");
                }
            }
        }
    }

    let idle: usize = conns.values().map(VecDeque::len).sum();
    debug!(upstream = %addr, idle, "Upstream transport stopped, closing idle connections");
}

/// Pop the most recently used connection unless it has expired
fn take(conns: &mut Stacks, proto: Protocol, expire: Duration) -> Option<PersistConn> {
    let stack = conns.get_mut(&proto)?;
    let pc = stack.pop_back()?;
    if pc.used.elapsed() < expire {
        return Some(pc);
    }
    // The newest one expired, so did every older one
    stack.clear();
    None
}

/// Drop expired connections, returning how many were closed
fn sweep(conns: &mut Stacks, expire: Duration) -> usize {
    let mut closed = 0;
    for stack in conns.values_mut() {
        // Stacks are ordered oldest first
        let fresh_from = stack
            .iter()
            .position(|pc| pc.used.elapsed() < expire)
            .unwrap_or(stack.len());
        closed += stack.drain(..fresh_from).count();
    }
    closed
}
