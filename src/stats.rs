//! Statistics tracking for the proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// IPv4 + UDP header bytes added to every DNS datagram on the wire.
pub const UDP_OVERHEAD: usize = 28;

/// Atomic counters for proxy activity.
pub struct Stats {
    started: Instant,
    pub requests: AtomicU64,
    pub cached: AtomicU64,
    pub answered: AtomicU64,
    pub relayed: AtomicU64,
    pub unanswered: AtomicU64,
    pub dropped: AtomicU64,
    pub probe_commits: AtomicU64,
    /// Upstream DNS traffic in bytes, including IP/UDP overhead.
    pub dns_traffic_bytes: AtomicU64,
    /// SYN probe traffic in bytes (sent packets and accepted replies).
    pub probe_traffic_bytes: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            answered: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            unanswered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            probe_commits: AtomicU64::new(0),
            dns_traffic_bytes: AtomicU64::new(0),
            probe_traffic_bytes: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_cached(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.cached.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(response_time_ms);
    }

    pub fn record_answered(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.answered.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(response_time_ms);
    }

    pub fn record_relayed(&self, response_time_ms: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.relayed.fetch_add(1, Ordering::Relaxed);
        self.add_response_time(response_time_ms);
    }

    pub fn record_unanswered(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.unanswered.fetch_add(1, Ordering::Relaxed);
    }

    /// A client datagram that could not be served (malformed or unsupported).
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe_commit(&self) {
        self.probe_commits.fetch_add(1, Ordering::Relaxed);
    }

    /// One upstream DNS datagram of `payload_len` bytes, sent or received.
    pub fn record_dns_traffic(&self, payload_len: usize) {
        self.dns_traffic_bytes
            .fetch_add((payload_len + UDP_OVERHEAD) as u64, Ordering::Relaxed);
    }

    pub fn record_probe_traffic(&self, packet_len: usize) {
        self.probe_traffic_bytes
            .fetch_add(packet_len as u64, Ordering::Relaxed);
    }

    fn add_response_time(&self, response_time_ms: f64) {
        self.total_response_time_us
            .fetch_add((response_time_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let cached = self.cached.swap(0, Ordering::Relaxed);
        let answered = self.answered.swap(0, Ordering::Relaxed);
        let relayed = self.relayed.swap(0, Ordering::Relaxed);
        let unanswered = self.unanswered.swap(0, Ordering::Relaxed);
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        let probe_commits = self.probe_commits.swap(0, Ordering::Relaxed);
        let dns_traffic_bytes = self.dns_traffic_bytes.swap(0, Ordering::Relaxed);
        let probe_traffic_bytes = self.probe_traffic_bytes.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let responded = cached + answered + relayed;
        let avg_response_ms = if responded > 0 {
            (total_us as f64 / responded as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            requests,
            cached,
            answered,
            relayed,
            unanswered,
            dropped,
            probe_commits,
            dns_traffic_bytes,
            probe_traffic_bytes,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub requests: u64,
    pub cached: u64,
    pub answered: u64,
    pub relayed: u64,
    pub unanswered: u64,
    pub dropped: u64,
    pub probe_commits: u64,
    pub dns_traffic_bytes: u64,
    pub probe_traffic_bytes: u64,
    pub avg_response_ms: f64,
}
