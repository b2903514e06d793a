//! DNS proxy orchestration.
//!
//! Wires the cache, resolver, prober and UDP transport together and runs the
//! proxy server until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::AnswerCache;
use crate::config::ProxyConfig;
use crate::error::{Error, Result};
use crate::probe::socket::{RawSocketProvider, SocketProvider, discover_local_ipv4};
use crate::probe::{ProbeSettings, Prober};
use crate::resolver::{Resolver, ResolverSettings};
use crate::stats::Stats;
use crate::transport::udp::UdpTransport;

/// A running proxy.
pub struct Proxy {
    local_addr: SocketAddr,
    resolver: Arc<Resolver>,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
    listener: JoinHandle<()>,
}

impl Proxy {
    /// Start the proxy with raw-socket probing.
    pub async fn start(config: ProxyConfig) -> Result<Self> {
        Self::start_with_provider(config, Arc::new(RawSocketProvider::new())).await
    }

    /// Start the proxy with a custom probe socket provider.
    ///
    /// The provider is only used when `config.probe` is set. Opening one
    /// socket up front makes a missing `CAP_NET_RAW` fail here instead of on
    /// the first cold query.
    pub async fn start_with_provider(
        config: ProxyConfig,
        provider: Arc<dyn SocketProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(Stats::new());
        let cache = Arc::new(AnswerCache::new(config.cache_capacity, config.ttl_multiplier));

        let mut resolver = Resolver::new(
            cache.clone(),
            stats.clone(),
            ResolverSettings {
                upstreams: config.upstreams.clone(),
                race_timeout: config.race_timeout,
                response_delay: config.response_delay,
                default_ttl: config.default_ttl,
                answer_ttl: config.answer_ttl,
            },
        );

        if let Some(probe) = &config.probe {
            let source = match probe.source {
                Some(source) => source,
                None => discover_local_ipv4().map_err(|e| {
                    Error::config(format!("cannot determine probe source address: {e}"))
                })?,
            };

            drop(provider.open()?);

            let settings = ProbeSettings {
                source,
                source_port: probe.source_port,
                ports: probe.ports.clone(),
                timeout: probe.timeout,
            };
            info!(
                %source,
                source_port = settings.source_port,
                ports = ?settings.ports,
                "SYN probing enabled"
            );
            let prober = Prober::new(provider, settings, cache.clone(), stats.clone());
            resolver = resolver.with_prober(Arc::new(prober));
        } else {
            info!("SYN probing disabled");
        }

        let resolver = Arc::new(resolver);
        let udp = UdpTransport::bind(config.bind_addr).await?;
        let local_addr = udp.local_addr()?;

        let upstream_strs: Vec<_> = config.upstreams.iter().map(|a| a.to_string()).collect();
        info!(
            listen = %local_addr,
            upstreams = %upstream_strs.join(", "),
            cache_capacity = cache.capacity(),
            "DNS proxy listening"
        );

        let shutdown = CancellationToken::new();
        let listener = udp.start(resolver.clone(), shutdown.clone());

        if let Some(interval) = config.stats_interval {
            tokio::spawn(report_stats(
                resolver.clone(),
                interval,
                shutdown.clone(),
            ));
        }

        Ok(Self {
            local_addr,
            resolver,
            stats,
            shutdown,
            listener,
        })
    }

    /// Address the client-facing socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache(&self) -> &Arc<AnswerCache> {
        self.resolver.cache()
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Stop the listener, the stats task and every pending cache expiry.
    ///
    /// Races already in flight finish on their own.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.resolver.cache().shutdown();
        if let Err(e) = self.listener.await {
            warn!(error = %e, "UDP listener task failed");
        }
        debug!("proxy stopped");
    }
}

/// Print a stats line every `interval`.
async fn report_stats(resolver: Arc<Resolver>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip first immediate tick
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let stats = resolver.stats().snapshot_and_reset();
        info!(
            uptime_secs = stats.uptime_secs,
            cache = resolver.cache_len(),
            requests = stats.requests,
            cached = stats.cached,
            answered = stats.answered,
            relayed = stats.relayed,
            unanswered = stats.unanswered,
            dropped = stats.dropped,
            probe_commits = stats.probe_commits,
            dns_traffic_bytes = stats.dns_traffic_bytes,
            probe_traffic_bytes = stats.probe_traffic_bytes,
            avg_response_ms = format_args!("{:.2}", stats.avg_response_ms),
            "stats"
        );
    }
}

/// Run the DNS proxy until Ctrl-C.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let proxy = Proxy::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    proxy.shutdown().await;

    Ok(())
}
