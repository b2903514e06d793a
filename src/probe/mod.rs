//! Background RTT probing of candidate addresses.
//!
//! After a cold answer has been sent, every IPv4 candidate gathered from the
//! upstream replies gets a SYN on each probe port. The first reply from a
//! candidate yields its RTT; whenever an RTT beats the best seen so far for
//! the domain, the cached answer is pointed at that candidate.

pub mod packet;
pub mod socket;

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::AnswerCache;
use crate::dns::CacheKey;
use crate::stats::Stats;
use packet::{SYN_PACKET_LEN, TcpReply, build_syn_packet};
use socket::{ProbeSocket, SocketProvider};

/// Errors for a single candidate's probing session.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("raw sockets require CAP_NET_RAW")]
    PermissionDenied,
    #[error("raw socket error: {0}")]
    Socket(#[source] io::Error),
    #[error("failed to send SYN to {address}: {source}")]
    Send {
        address: Ipv4Addr,
        #[source]
        source: io::Error,
    },
    #[error("failed to receive from {address}: {source}")]
    Recv {
        address: Ipv4Addr,
        #[source]
        source: io::Error,
    },
    #[error("no reply from {address} within {timeout:?}")]
    Timeout { address: Ipv4Addr, timeout: Duration },
}

/// Static probe parameters.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Source address written into probe packets.
    pub source: Ipv4Addr,
    /// Fixed source port; replies are recognised by this destination port.
    pub source_port: u16,
    /// Destination ports probed on every candidate.
    pub ports: Vec<u16>,
    /// How long a candidate's socket stays open waiting for a reply.
    pub timeout: Duration,
}

/// Running minimum over RTT samples. Ties keep the incumbent.
#[derive(Debug, Default)]
pub struct RttTracker {
    best: Option<(Ipv4Addr, Duration)>,
}

impl RttTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample, returning true if it is the new minimum.
    pub fn observe(&mut self, address: Ipv4Addr, rtt: Duration) -> bool {
        match self.best {
            Some((_, best)) if rtt >= best => false,
            _ => {
                self.best = Some((address, rtt));
                true
            }
        }
    }

    pub fn best(&self) -> Option<(Ipv4Addr, Duration)> {
        self.best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSample {
    pub address: Ipv4Addr,
    pub rtt: Duration,
}

/// Outcome of one probing round for a domain.
#[derive(Debug, Default)]
pub struct ProbeReport {
    /// Samples in arrival order.
    pub samples: Vec<ProbeSample>,
    pub failures: usize,
    /// Every address committed to the cache, in order.
    pub commits: Vec<Ipv4Addr>,
}

impl ProbeReport {
    pub fn winner(&self) -> Option<Ipv4Addr> {
        self.commits.last().copied()
    }
}

/// Sends SYN probes and commits the fastest candidate to the cache.
pub struct Prober {
    provider: Arc<dyn SocketProvider>,
    settings: ProbeSettings,
    cache: Arc<AnswerCache>,
    stats: Arc<Stats>,
}

impl Prober {
    pub fn new(
        provider: Arc<dyn SocketProvider>,
        settings: ProbeSettings,
        cache: Arc<AnswerCache>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            provider,
            settings,
            cache,
            stats,
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Probe `candidates` for `key` on a background task.
    pub fn spawn(
        self: &Arc<Self>,
        key: CacheKey,
        domain: String,
        candidates: Vec<IpAddr>,
    ) -> JoinHandle<ProbeReport> {
        let prober = Arc::clone(self);
        tokio::spawn(async move {
            let report = prober.probe(&key, &candidates).await;
            match report.winner() {
                Some(address) => info!(
                    domain = %domain,
                    %address,
                    probed = report.samples.len(),
                    failed = report.failures,
                    "closest address selected"
                ),
                None => debug!(
                    domain = %domain,
                    failed = report.failures,
                    "probing produced no replies"
                ),
            }
            report
        })
    }

    /// Probe every unique IPv4 candidate concurrently and update the cached
    /// answer for `key` as faster candidates reply.
    pub async fn probe(&self, key: &CacheKey, candidates: &[IpAddr]) -> ProbeReport {
        let mut targets: Vec<Ipv4Addr> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match candidate {
                IpAddr::V4(v4) if !targets.contains(v4) => targets.push(*v4),
                IpAddr::V4(_) => {}
                IpAddr::V6(v6) => debug!(address = %v6, "skipping IPv6 candidate"),
            }
        }

        let mut sessions: FuturesUnordered<_> = targets
            .iter()
            .map(|&address| async move { (address, self.probe_candidate(address).await) })
            .collect();

        let mut tracker = RttTracker::new();
        let mut report = ProbeReport::default();

        while let Some((address, result)) = sessions.next().await {
            match result {
                Ok(rtt) => {
                    debug!(%address, rtt_ms = rtt.as_secs_f64() * 1000.0, "probe reply");
                    report.samples.push(ProbeSample { address, rtt });
                    if tracker.observe(address, rtt)
                        && self.cache.update_address(key, IpAddr::V4(address))
                    {
                        self.stats.record_probe_commit();
                        report.commits.push(address);
                    }
                }
                Err(ProbeError::Timeout { address, timeout }) => {
                    debug!(%address, ?timeout, "probe timed out");
                    report.failures += 1;
                }
                Err(e) => {
                    warn!(%address, error = %e, "probe failed");
                    report.failures += 1;
                }
            }
        }

        report
    }

    /// One candidate's session. The socket lives exactly as long as this call.
    async fn probe_candidate(&self, address: Ipv4Addr) -> Result<Duration, ProbeError> {
        let socket = self.provider.open()?;
        let sent_at = Instant::now();

        for &port in &self.settings.ports {
            let packet =
                build_syn_packet(self.settings.source, address, self.settings.source_port, port);
            socket
                .send_to(&packet, address)
                .await
                .map_err(|source| ProbeError::Send { address, source })?;
            self.stats.record_probe_traffic(SYN_PACKET_LEN);
        }

        let timeout = self.settings.timeout;
        tokio::time::timeout(timeout, self.await_reply(socket.as_ref(), address, sent_at))
            .await
            .map_err(|_| ProbeError::Timeout { address, timeout })?
    }

    async fn await_reply(
        &self,
        socket: &dyn ProbeSocket,
        address: Ipv4Addr,
        sent_at: Instant,
    ) -> Result<Duration, ProbeError> {
        let mut buf = [0u8; 1500];
        loop {
            let len = socket
                .recv(&mut buf)
                .await
                .map_err(|source| ProbeError::Recv { address, source })?;
            let Some(reply) = TcpReply::parse(&buf[..len]) else {
                continue;
            };
            if self.accepts(&reply, address) {
                self.stats.record_probe_traffic(len);
                return Ok(sent_at.elapsed());
            }
        }
    }

    fn accepts(&self, reply: &TcpReply, address: Ipv4Addr) -> bool {
        reply.source == address
            && reply.destination_port == self.settings.source_port
            && self.settings.ports.contains(&reply.source_port)
    }
}
