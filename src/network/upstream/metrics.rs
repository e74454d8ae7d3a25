/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! In-process counters for one upstream

use dashmap::DashMap;
use hickory_proto::op::ResponseCode;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct UpstreamMetrics {
    requests: AtomicU64,
    duration_micros: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// Replies dropped because their ID did not match the query in flight
    mismatched_replies: AtomicU64,
    rcodes: DashMap<String, u64>,
}

/// Point-in-time copy of [`UpstreamMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamMetricsSnapshot {
    pub requests: u64,
    pub duration: Duration,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub mismatched_replies: u64,
    pub rcodes: BTreeMap<String, u64>,
}

impl UpstreamMetrics {
    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mismatched_reply(&self) {
        self.mismatched_replies.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one completed exchange
    pub fn record_request(&self, rcode: ResponseCode, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.duration_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        *self.rcodes.entry(rcode.to_str().to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> UpstreamMetricsSnapshot {
        UpstreamMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            duration: Duration::from_micros(self.duration_micros.load(Ordering::Relaxed)),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            mismatched_replies: self.mismatched_replies.load(Ordering::Relaxed),
            rcodes: self
                .rcodes
                .iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect(),
        }
    }
}
