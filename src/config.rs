//! Proxy configuration.
//!
//! Everything here is fixed at startup. `main.rs` builds a [`ProxyConfig`]
//! from the command line and the host's resolver file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};

pub const DNS_PORT: u16 = 53;
pub const DEFAULT_UPSTREAMS: [Ipv4Addr; 4] = [
    Ipv4Addr::new(4, 2, 2, 5),
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(208, 67, 222, 222),
    Ipv4Addr::new(209, 244, 0, 3),
];
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
/// Roughly a 10 MB budget at ~500 bytes per entry.
pub const DEFAULT_CACHE_CAPACITY: usize = 20_000;
pub const DEFAULT_RESPONSE_DELAY: Duration = Duration::from_millis(40);
pub const DEFAULT_RACE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_TTL: u32 = 300;
pub const DEFAULT_ANSWER_TTL: u32 = 4;
pub const DEFAULT_TTL_MULTIPLIER: u32 = 8;
pub const DEFAULT_PROBE_PORTS: [u16; 2] = [80, 443];
pub const DEFAULT_PROBE_SOURCE_PORT: u16 = 56591;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 0.0.0.0:53)
    pub bind_addr: SocketAddr,
    /// Upstream DNS servers (races all, uses first usable response)
    pub upstreams: Vec<SocketAddr>,
    /// Maximum number of cached answers
    pub cache_capacity: usize,
    /// Delay between the winning reply and the client response on a miss
    pub response_delay: Duration,
    /// Hard deadline for an upstream race
    pub race_timeout: Duration,
    /// Cache TTL (seconds) of freshly raced answers
    pub default_ttl: u32,
    /// TTL written into synthesized answers
    pub answer_ttl: u32,
    /// Cache entries live for `ttl * ttl_multiplier` seconds
    pub ttl_multiplier: u32,
    /// `None` disables background probing
    pub probe: Option<ProbeConfig>,
    /// Interval for the periodic stats line; `None` disables it
    pub stats_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Source address for SYN packets; discovered when `None`
    pub source: Option<Ipv4Addr>,
    pub source_port: u16,
    pub ports: Vec<u16>,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            source: None,
            source_port: DEFAULT_PROBE_SOURCE_PORT,
            ports: DEFAULT_PROBE_PORTS.to_vec(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    /// Defaults for everything except the bind address and upstreams.
    pub fn new(bind_addr: SocketAddr, upstreams: Vec<SocketAddr>) -> Self {
        Self {
            bind_addr,
            upstreams,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            response_delay: DEFAULT_RESPONSE_DELAY,
            race_timeout: DEFAULT_RACE_TIMEOUT,
            default_ttl: DEFAULT_TTL,
            answer_ttl: DEFAULT_ANSWER_TTL,
            ttl_multiplier: DEFAULT_TTL_MULTIPLIER,
            probe: Some(ProbeConfig::default()),
            stats_interval: Some(DEFAULT_STATS_INTERVAL),
        }
    }

    /// Check invariants the proxy relies on.
    pub fn validate(&self) -> Result<()> {
        if self.upstreams.is_empty() {
            return Err(Error::config("at least one upstream resolver is required"));
        }
        if self.cache_capacity == 0 {
            return Err(Error::config("cache capacity must be positive"));
        }
        if self.ttl_multiplier == 0 {
            return Err(Error::config("TTL multiplier must be positive"));
        }
        if self.race_timeout.is_zero() {
            return Err(Error::config("race timeout must be positive"));
        }
        if let Some(probe) = &self.probe {
            if probe.ports.is_empty() {
                return Err(Error::config("at least one probe port is required"));
            }
        }
        Ok(())
    }

    /// Append resolvers found in `path`, skipping ones already configured.
    ///
    /// A missing or unreadable file is not an error.
    pub fn add_system_resolvers(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let found = match load_resolv_conf(path) {
            Ok(found) => found,
            Err(e) => {
                info!(path = %path.display(), error = %e, "no local resolver file, moving on");
                return;
            }
        };

        for ip in found {
            let addr = SocketAddr::new(IpAddr::V4(ip), DNS_PORT);
            if self.upstreams.contains(&addr) {
                continue;
            }
            debug!(upstream = %addr, "adding resolver from {}", path.display());
            self.upstreams.push(addr);
        }
    }
}

/// Read nameserver addresses from a resolv.conf style file.
pub fn load_resolv_conf(path: &Path) -> Result<Vec<Ipv4Addr>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_resolv_conf(&content))
}

/// Every line mentioning `nameserver` contributes its first IPv4 address.
pub fn parse_resolv_conf(content: &str) -> Vec<Ipv4Addr> {
    content
        .lines()
        .filter(|line| line.to_ascii_lowercase().contains("nameserver"))
        .filter_map(|line| {
            line.split(|c: char| !(c.is_ascii_digit() || c == '.'))
                .find_map(|token| token.parse::<Ipv4Addr>().ok())
        })
        .collect()
}

/// Parse an upstream given as `ip` or `ip:port`.
pub fn parse_upstream(value: &str) -> Result<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| Error::config(format!("invalid upstream address: {value}")))
}
