//! Transport layer for the DNS proxy.
//!
//! Receives client queries over UDP, answers warm hits inline and spawns a
//! race per cache miss.

pub mod udp;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tracing::debug;

/// Per-query log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryLogger;

impl QueryLogger {
    pub fn cached(&self, domain: &str, client: SocketAddr, elapsed: Duration) {
        debug!(
            domain,
            %client,
            total_ms = ms(elapsed),
            "CACHED"
        );
    }

    pub fn answered(
        &self,
        domain: &str,
        address: IpAddr,
        total: Duration,
        upstream: Duration,
        from: SocketAddr,
    ) {
        debug!(
            domain,
            %address,
            total_ms = ms(total),
            upstream_ms = ms(upstream),
            %from,
            "RACED"
        );
    }

    pub fn relayed(&self, domain: &str, total: Duration, from: SocketAddr) {
        debug!(domain, total_ms = ms(total), %from, "RELAYED");
    }

    pub fn unanswered(&self, domain: &str, reason: &dyn std::fmt::Display) {
        debug!(domain, %reason, "UNANSWERED");
    }

    pub fn ignored(&self, domain: &str, qtype: u16, client: SocketAddr) {
        debug!(domain, qtype, %client, "IGNORED");
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}
